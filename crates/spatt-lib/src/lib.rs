pub mod annotations;
pub mod baseline;
pub mod bids;
pub mod config;
pub mod detectors;
pub mod epochs;
pub mod error;
pub mod filter;
pub mod ica;
pub mod io;
pub mod metrics;
pub mod plot;
pub mod reject;
pub mod report;
pub mod signal;
pub mod tfr;

pub use annotations::{Annotation, Annotations, Event, EventId};
pub use baseline::BaselineMode;
pub use bids::BidsPath;
pub use config::StudyConfig;
pub use epochs::{EpochParams, Epochs, Evoked};
pub use error::{AnalysisError, AnalysisResult};
pub use report::Report;
pub use signal::*;
pub use tfr::{AverageTfr, TfrParams};
