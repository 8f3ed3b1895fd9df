pub mod alpha;
pub mod psd;
pub mod quality;
