use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use spatt_lib::{
    annotations::{
        annotate_break, annotations_from_events, event_id_from_labels, events_from_annotations,
        Annotations, Event,
    },
    bids::{ensure_parent, BidsPath},
    config::{segment_pairs, PlatformConfig, StudyConfig, SubjectConfig},
    detectors::eog::{annotate_blinks, EogConfig},
    epochs::{Epochs, Evoked},
    error::AnalysisError,
    ica::{fit_ica, Ica},
    io::{
        self as spatt_io,
        lfp::read_lfp_csv,
        text::{parse_channel_list, read_events, write_events},
        tsv::{read_bids_events, write_bids_events},
    },
    metrics::{
        alpha::{compute_mi, estimate_paf, stim_effect, write_mi_csv, write_mi_series_csv, PeakAlpha},
        psd::{psd_epochs, psd_raw, WelchParams},
        quality::channel_quality,
    },
    plot::{
        figure_from_drop_log, figure_from_evoked, figure_from_evoked_comparison, figure_from_lfp, figure_from_mi, figure_from_paf,
        figure_from_psd, figure_from_tag_histogram, figure_from_tfr, Figure,
    },
    reject::{bad_channel_counts, estimate_thresholds, suggest_bads},
    report::{ItemMeta, Report},
    signal::{common_channels, ChannelKind, Raw},
    tfr::{tfr_multitaper, AverageTfr, TfrParams},
};
use std::{
    collections::BTreeMap,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
};

/// Recording segments written by `segment-stim`, in processing order.
const SEGMENTS: [&str; 2] = ["no-stim", "stim"];

/// Z-score above which an ICA component's EOG correlation is flagged.
const EOG_SCORE_Z: f64 = 3.0;

/// Share of candidate epochs a channel must spoil before it is suggested as bad.
const BAD_CHANNEL_FRACTION: f64 = 0.2;

#[derive(Parser)]
#[command(
    name = "spatt",
    version,
    about = "SpAtt: EEG/LFP spatial-attention analysis pipeline"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every per-subject stage.
#[derive(Args, Debug, Clone)]
struct StudyArgs {
    /// Study configuration (TOML)
    #[arg(long)]
    config: PathBuf,
    #[arg(long)]
    subject: String,
    /// Platform name from the config; falls back to SPATT_PLATFORM and default_platform
    #[arg(long)]
    platform: Option<String>,
    /// Extra bad channels, whitespace or comma separated
    #[arg(long)]
    bads: Option<String>,
    /// Answer every console prompt with its default
    #[arg(long)]
    yes: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Load raw recordings, relabel events, mark bads and write the BIDS copy
    FirstLook {
        #[command(flatten)]
        study: StudyArgs,
        /// Recordings to load instead of the subject's brainvision_files
        #[arg(long)]
        input: Vec<PathBuf>,
        /// Sampling rate to force on EDF input (logged as a warning)
        #[arg(long)]
        sfreq_override: Option<f64>,
        /// Events to use instead of the recording's markers (events.tsv or `sample prev code` text)
        #[arg(long)]
        events: Option<PathBuf>,
    },
    /// Add break and blink annotations
    Annotate {
        #[command(flatten)]
        study: StudyArgs,
    },
    /// Fit ICA, remove the excluded components and write the cleaned recording
    Ica {
        #[command(flatten)]
        study: StudyArgs,
        /// Components to remove; overrides the subject's ica_exclude
        #[arg(long, value_delimiter = ',')]
        exclude: Option<Vec<usize>>,
    },
    /// Cut the cleaned recording into stimulation and no-stimulation segments
    SegmentStim {
        #[command(flatten)]
        study: StudyArgs,
    },
    /// Epoch each segment, review bad channels and save the epochs
    Epoch {
        #[command(flatten)]
        study: StudyArgs,
        /// Epoching type from the config's epoching.conditions
        #[arg(long, default_value = "cue")]
        epoching: String,
        /// Drop epochs above the estimated peak-to-peak thresholds
        #[arg(long)]
        autoreject: bool,
    },
    /// Average epochs into evoked responses
    Erp {
        #[command(flatten)]
        study: StudyArgs,
        #[arg(long, default_value = "cue")]
        epoching: String,
    },
    /// Grand-average subject evokeds and pool occipital epochs per segment
    GroupErp {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        platform: Option<String>,
        /// Subjects to include; defaults to every subject in the config
        #[arg(long, value_delimiter = ',')]
        subjects: Option<Vec<String>>,
        #[arg(long, default_value = "cue")]
        epoching: String,
    },
    /// Multitaper TFRs, peak alpha frequency and modulation index per segment
    TfrMi {
        #[command(flatten)]
        study: StudyArgs,
        #[arg(long, default_value = "cue")]
        epoching: String,
    },
    /// Grand-average subject TFRs, group PAF/MI and the stimulation effect
    GroupTfr {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        platform: Option<String>,
        /// Subjects to include; defaults to every subject in the config
        #[arg(long, value_delimiter = ',')]
        subjects: Option<Vec<String>>,
        #[arg(long, default_value = "cue")]
        epoching: String,
    },
    /// Summarise a stimulation-device LFP export
    LfpInspect {
        #[arg(long)]
        input: PathBuf,
        /// Sampling rate of the export in Hz (not stored in the file);
        /// defaults to the subject's lfp_sfreq when --config is given
        #[arg(long)]
        sfreq: Option<f64>,
        #[arg(long, requires = "subject")]
        config: Option<PathBuf>,
        #[arg(long, requires = "config")]
        subject: Option<String>,
        #[arg(long, default_value = "LFP")]
        channel: String,
        /// Write the trace as a BrainVision recording
        #[arg(long)]
        out: Option<PathBuf>,
        /// Append figures to this JSON report
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Export a JSON report to a single HTML page
    ReportHtml {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Validate a study configuration
    ConfigCheck {
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::FirstLook {
            study,
            input,
            sfreq_override,
            events,
        } => cmd_first_look(&study, &input, sfreq_override, events.as_deref())?,
        Commands::Annotate { study } => cmd_annotate(&study)?,
        Commands::Ica { study, exclude } => cmd_ica(&study, exclude)?,
        Commands::SegmentStim { study } => cmd_segment_stim(&study)?,
        Commands::Epoch {
            study,
            epoching,
            autoreject,
        } => cmd_epoch(&study, &epoching, autoreject)?,
        Commands::Erp { study, epoching } => cmd_erp(&study, &epoching)?,
        Commands::GroupErp {
            config,
            platform,
            subjects,
            epoching,
        } => cmd_group_erp(&config, platform.as_deref(), subjects, &epoching)?,
        Commands::TfrMi { study, epoching } => cmd_tfr_mi(&study, &epoching)?,
        Commands::GroupTfr {
            config,
            platform,
            subjects,
            epoching,
        } => cmd_group_tfr(&config, platform.as_deref(), subjects, &epoching)?,
        Commands::LfpInspect {
            input,
            sfreq,
            config,
            subject,
            channel,
            out,
            report,
        } => {
            let sfreq = lfp_rate(sfreq, config.as_deref(), subject.as_deref())?;
            cmd_lfp_inspect(&input, sfreq, &channel, out.as_deref(), report.as_deref())?
        }
        Commands::ReportHtml { input, out } => cmd_report_html(&input, out.as_deref())?,
        Commands::ConfigCheck { config } => cmd_config_check(&config)?,
    }
    Ok(())
}

/// Everything a per-subject stage needs to find its inputs and outputs.
struct Study {
    args: StudyArgs,
    config: StudyConfig,
    subject: SubjectConfig,
    platform: PlatformConfig,
    bids: BidsPath,
}

impl Study {
    fn open(args: &StudyArgs) -> Result<Self> {
        let config = StudyConfig::load(&args.config)?;
        let subject = config.subject(&args.subject);
        let platform = config.platform(args.platform.as_deref())?.clone();
        let bids = BidsPath::new(&platform.bids_root, &args.subject, &config.task)
            .with_session(config.session.as_deref())
            .with_run(config.run.as_deref());
        Ok(Self {
            args: args.clone(),
            config,
            subject,
            platform,
            bids,
        })
    }

    fn report_path(&self) -> PathBuf {
        self.bids.report(&self.platform.report_root, "json")
    }

    fn open_report(&self) -> Result<Report> {
        Report::open_or_create(&self.report_path(), &format!("Subject {}", self.args.subject))
    }

    /// BrainVision derivative `<basename>_<parts>_eeg.vhdr`.
    fn raw_derivative(&self, parts: &[&str]) -> PathBuf {
        let mut parts: Vec<&str> = parts.to_vec();
        parts.push("eeg");
        self.bids.derivative(&parts, "vhdr")
    }

    fn read_derivative(&self, parts: &[&str]) -> Result<Raw> {
        let path = self.raw_derivative(parts);
        spatt_io::read_raw(&path, None)
            .with_context(|| format!("reading the {} derivative", parts.join("_")))
    }
}

fn prompt(question: &str) -> Result<String> {
    print!("{} ", question);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// Bad channels from `--bads` plus, unless `--yes`, a console prompt.
fn requested_bads(args: &StudyArgs, question: &str) -> Result<Vec<String>> {
    let mut bads = args.bads.as_deref().map(parse_channel_list).unwrap_or_default();
    if !args.yes {
        bads.extend(parse_channel_list(&prompt(question)?));
    }
    bads.sort();
    bads.dedup();
    Ok(bads)
}

fn welch_for(sfreq: f64) -> WelchParams {
    let mut params = WelchParams::default();
    params.n_fft = params.n_fft.min((2.0 * sfreq) as usize).max(16);
    params.n_overlap = params.n_fft / 2;
    params.fmax = params.fmax.min(sfreq / 2.0);
    params
}

fn good_eeg_picks(epochs: &Epochs) -> Vec<usize> {
    epochs
        .ch_kinds
        .iter()
        .enumerate()
        .filter(|(i, kind)| **kind == ChannelKind::Eeg && !epochs.bads.contains(&epochs.ch_names[*i]))
        .map(|(i, _)| i)
        .collect()
}

fn add_raw_psd(report: &mut Report, raw: &Raw, title: &str, section: &str) -> Result<()> {
    let picks = raw.good_eeg_indices();
    if picks.is_empty() {
        warn!("{}: no good EEG channels for a PSD", title);
        return Ok(());
    }
    let psd = psd_raw(raw, &picks, &welch_for(raw.sfreq))?;
    report.add_figure(
        &figure_from_psd(title, &psd),
        ItemMeta::new(title).section(section).tags(&["psd"]),
    )
}

/// Events from a sidecar file. TSV onsets count from the first retained sample.
fn load_events_file(path: &Path, raw: &Raw) -> Result<Vec<Event>> {
    let is_tsv = path
        .extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| e.eq_ignore_ascii_case("tsv"));
    if !is_tsv {
        return read_events(path);
    }
    let mut events: Vec<Event> = read_bids_events(path)?
        .iter()
        .filter_map(|row| {
            let code = row.value?;
            let sample = row
                .sample
                .unwrap_or_else(|| (row.onset * raw.sfreq).round().max(0.0) as usize);
            Some(Event { sample, prev: 0, code })
        })
        .filter(|e| e.sample < raw.n_times())
        .collect();
    events.sort_by_key(|e| e.sample);
    if events.is_empty() {
        bail!("no events with a value in {}", path.display());
    }
    Ok(events)
}

fn cmd_first_look(
    args: &StudyArgs,
    input: &[PathBuf],
    sfreq_override: Option<f64>,
    events_file: Option<&Path>,
) -> Result<()> {
    let study = Study::open(args)?;
    let files: Vec<PathBuf> = if input.is_empty() {
        study
            .subject
            .brainvision_files
            .iter()
            .map(|f| study.platform.data_root.join(f))
            .collect()
    } else {
        input.to_vec()
    };
    if files.is_empty() {
        bail!(
            "no recordings for subject {}: pass --input or set brainvision_files",
            args.subject
        );
    }
    let mut parts = Vec::with_capacity(files.len());
    for file in &files {
        parts.push(spatt_io::read_raw(file, sfreq_override)?);
    }
    let mut raw = if parts.len() == 1 {
        parts.remove(0)
    } else {
        info!("concatenating {} recordings", parts.len());
        Raw::concatenate(parts)?
    };
    if let Some(tmin) = study.subject.crop_tmin {
        raw = raw.crop(tmin, None)?;
    }

    // trigger codes -> study labels; rejected segments and boundaries survive
    let events = match events_file {
        Some(path) => {
            let events = load_events_file(path, &raw)?;
            info!("using {} events from {}", events.len(), path.display());
            events
        }
        None => events_from_annotations(&raw, None).0,
    };
    let labels = study.config.event_labels(&args.subject)?;
    let relabelled = annotations_from_events(&events, &labels, raw.sfreq, raw.first_time);
    let mut annotations = Annotations::new(
        raw.annotations
            .iter()
            .filter(|a| a.is_bad() || a.is_edge())
            .cloned()
            .collect(),
    );
    annotations.extend(&relabelled);
    raw.annotations = annotations;
    let event_id = event_id_from_labels(&labels);
    let mapped: Vec<_> = events
        .iter()
        .filter(|e| labels.contains_key(&e.code))
        .copied()
        .collect();

    let quality = channel_quality(&raw);
    let suspects: Vec<&str> = quality
        .iter()
        .filter(|q| q.is_suspect(3.0))
        .map(|q| q.name.as_str())
        .collect();
    if !suspects.is_empty() {
        println!("channels with unusual variance: {}", suspects.join(" "));
    }
    let mut bads = study.subject.bads.clone();
    bads.extend(requested_bads(
        args,
        "Bad channels (e.g. FT10 T9, separated by spaces) or return:",
    )?);
    raw.mark_bads(bads.as_slice())?;
    raw.set_average_reference()?;

    let vhdr = study.bids.file("eeg", "vhdr");
    spatt_io::write_raw(&raw, &vhdr)?;
    let events_tsv = study.bids.file("events", "tsv");
    write_bids_events(&events_tsv, &mapped, &event_id, raw.sfreq)?;
    let eve = study.bids.derivative(&["eve"], "txt");
    ensure_parent(&eve)?;
    write_events(&eve, &mapped)?;
    info!("wrote {}, {} and {}", vhdr.display(), events_tsv.display(), eve.display());

    let mut report = study.open_report()?;
    let counts = raw.annotations.counts();
    report.add_table(
        &["annotation", "count"],
        counts
            .iter()
            .map(|(label, n)| vec![label.clone(), n.to_string()])
            .collect(),
        ItemMeta::new("Events after relabelling").section("raw").tags(&["eve"]),
    );
    report.add_table(
        &["channel", "std (µV)", "kurtosis", "robust z", "status"],
        quality
            .iter()
            .map(|q| {
                vec![
                    q.name.clone(),
                    format!("{:.2}", q.std * 1e6),
                    format!("{:.2}", q.kurtosis),
                    format!("{:.2}", q.std_z),
                    if raw.is_bad(&q.name) { "bad" } else { "good" }.to_string(),
                ]
            })
            .collect(),
        ItemMeta::new("Channel quality").section("raw").tags(&["raw"]),
    );
    add_raw_psd(&mut report, &raw, "raw with bad channels", "raw")?;
    report.save(&study.report_path())?;
    Ok(())
}

fn cmd_annotate(args: &StudyArgs) -> Result<()> {
    let study = Study::open(args)?;
    let mut raw = spatt_io::read_raw(&study.bids.file("eeg", "vhdr"), None)?;
    let start = raw.first_time;
    let end = raw.first_time + raw.duration();
    let breaks = annotate_break(&raw.annotations, start, end, &study.config.breaks);
    info!("{} break annotations", breaks.len());
    raw.annotations.extend(&breaks);

    let eog = EogConfig {
        threshold: study.subject.eog_threshold.or(study.config.eog.threshold),
        ..study.config.eog
    };
    let blinks = match annotate_blinks(&mut raw, study.subject.eog_channel.as_deref(), &eog) {
        Ok(n) => n,
        Err(AnalysisError::EmptySelection(msg)) => {
            warn!("skipping blink detection: {}", msg);
            0
        }
        Err(e) => return Err(e.into()),
    };
    spatt_io::write_raw(&raw, &study.raw_derivative(&["ann"]))?;

    let mut report = study.open_report()?;
    let break_time: f64 = breaks.iter().map(|a| a.duration).sum();
    report.add_table(
        &["annotation", "count"],
        vec![
            vec!["BAD_break".into(), breaks.len().to_string()],
            vec!["blink".into(), blinks.to_string()],
        ],
        ItemMeta::new("Artifact annotations")
            .caption(format!("{:.1} s of breaks marked bad", break_time))
            .section("annotations")
            .tags(&["ann"]),
    );
    report.save(&study.report_path())?;
    Ok(())
}

fn parse_component_list(text: &str) -> Result<Vec<usize>> {
    parse_channel_list(text)
        .iter()
        .map(|s| {
            s.parse::<usize>()
                .with_context(|| format!("'{}' is not a component index", s))
        })
        .collect()
}

fn cmd_ica(args: &StudyArgs, exclude: Option<Vec<usize>>) -> Result<()> {
    let study = Study::open(args)?;
    let mut raw = study.read_derivative(&["ann"])?;
    let mut ica = fit_ica(&raw, &study.config.ica)?;

    let eog_channels = raw.pick_kind(ChannelKind::Eog).ch_names;
    let mut suggested = Vec::new();
    for channel in &eog_channels {
        let scores = ica.channel_scores(&raw, channel)?;
        let flagged = Ica::find_outlier_components(&scores, EOG_SCORE_Z);
        if !flagged.is_empty() {
            println!("components correlated with {}: {:?}", channel, flagged);
        }
        suggested.extend(flagged);
    }
    suggested.sort_unstable();
    suggested.dedup();

    let exclude = match exclude {
        Some(list) => list,
        None if !study.subject.ica_exclude.is_empty() => study.subject.ica_exclude.clone(),
        None if args.yes => suggested,
        None => {
            let answer = prompt(&format!(
                "Components to remove (suggested {:?}), separated by spaces:",
                suggested
            ))?;
            if answer.is_empty() {
                suggested
            } else {
                parse_component_list(&answer)?
            }
        }
    };
    ica.set_exclude(&exclude)?;
    ica.apply(&mut raw)?;

    let ica_json = study.bids.derivative(&["ica"], "json");
    ensure_parent(&ica_json)?;
    ica.save_json(&ica_json)?;
    spatt_io::write_raw(&raw, &study.raw_derivative(&["ica"]))?;

    let mut report = study.open_report()?;
    report.add_table(
        &["component", "kurtosis", "variance explained (%)", "removed"],
        ica.components
            .iter()
            .map(|c| {
                vec![
                    c.index.to_string(),
                    format!("{:.2}", c.kurtosis),
                    format!("{:.1}", c.variance_explained),
                    if ica.exclude.contains(&c.index) { "yes" } else { "" }.to_string(),
                ]
            })
            .collect(),
        ItemMeta::new("ICA components").section("ica").tags(&["ica"]),
    );
    add_raw_psd(&mut report, &raw, "raw after ICA (avg reference)", "ica")?;
    report.save(&study.report_path())?;
    Ok(())
}

fn cmd_segment_stim(args: &StudyArgs) -> Result<()> {
    let study = Study::open(args)?;
    let raw = study.read_derivative(&["ica"])?;
    let mut report = study.open_report()?;
    for segment in SEGMENTS {
        let flat = match segment {
            "stim" => &study.subject.stim_segments,
            _ => &study.subject.no_stim_segments,
        };
        let pairs = segment_pairs(flat)?;
        if pairs.is_empty() {
            warn!("subject {} has no {} segments configured", args.subject, segment);
            continue;
        }
        let mut fragments = Vec::with_capacity(pairs.len());
        for (start, stop) in pairs {
            fragments.push(raw.crop(start, Some(stop))?);
        }
        let cut = if fragments.len() == 1 {
            fragments.remove(0)
        } else {
            Raw::concatenate(fragments)?
        };
        info!("{} segment: {:.1} s", segment, cut.duration());
        spatt_io::write_raw(&cut, &study.raw_derivative(&[segment, "ica"]))?;
        add_raw_psd(&mut report, &cut, &format!("{} psd", segment), "stim")?;
    }
    report.save(&study.report_path())?;
    Ok(())
}

fn epochs_path(study: &Study, segment: &str, epoching: &str) -> PathBuf {
    study
        .bids
        .derivative(&[segment, &format!("epo-{}", epoching)], "json")
}

fn cmd_epoch(args: &StudyArgs, epoching: &str, autoreject: bool) -> Result<()> {
    let study = Study::open(args)?;
    let conditions = study.config.conditions(epoching)?.to_vec();
    let labels = study.config.event_labels(&args.subject)?;
    let event_id = event_id_from_labels(&labels);
    let mut report = study.open_report()?;

    for segment in SEGMENTS {
        let path = study.raw_derivative(&[segment, "ica"]);
        if !path.exists() {
            warn!("{} does not exist, skipping the {} segment", path.display(), segment);
            continue;
        }
        let mut raw = spatt_io::read_raw(&path, None)?;
        raw.filter(study.config.epoching.l_freq, study.config.epoching.h_freq)?;
        let (events, _) = events_from_annotations(&raw, Some(&event_id));
        let epochs = Epochs::from_raw(&raw, &events, &event_id, &study.config.epoch_params())?;
        let mut epochs = epochs.select(conditions.as_slice())?;

        let thresholds = estimate_thresholds(&epochs, &study.config.reject)?;
        let counts = bad_channel_counts(&epochs, &thresholds);
        let suggested = suggest_bads(&counts, epochs.len(), BAD_CHANNEL_FRACTION);
        let mut preview = epochs.clone();
        preview.drop_bad(&thresholds);
        println!(
            "{}: {} epochs, {:.1}% above threshold, suggested bad channels: {}",
            segment,
            epochs.len(),
            preview.drop_percentage(),
            if suggested.is_empty() { "none".to_string() } else { suggested.join(" ") }
        );
        let bads = requested_bads(
            args,
            "Any other bad channels from the drop log? (names separated by spaces) or return:",
        )?;
        epochs.mark_bads(bads.as_slice())?;

        if autoreject {
            let thresholds = estimate_thresholds(&epochs, &study.config.reject)?;
            let dropped = epochs.drop_bad(&thresholds);
            info!("{}: dropped {} epochs above {:?}", segment, dropped, thresholds);
        }
        if let [a, b] = conditions.as_slice() {
            let dropped = epochs.equalize_counts(a, b)?;
            info!("{}: equalised {} / {} (dropped {})", segment, a, b, dropped);
        }
        let out = epochs_path(&study, segment, epoching);
        ensure_parent(&out)?;
        epochs.save_json(&out)?;

        report.add_figure(
            &figure_from_drop_log(&format!("{} dropped epochs", segment), &epochs),
            ItemMeta::new(format!("stim: {}, dropped epochs", segment))
                .caption(format!("{} epochs kept, {}=0", epochs.len(), epoching))
                .section("epochs")
                .tags(&["epochs"]),
        )?;
        report.add_table(
            &["channel", "epochs above threshold"],
            counts
                .iter()
                .map(|(ch, n)| vec![ch.clone(), n.to_string()])
                .collect(),
            ItemMeta::new(format!("stim: {}, channel rejection counts", segment)).section("epochs"),
        );
        let picks = good_eeg_picks(&epochs);
        if !picks.is_empty() {
            let psd = psd_epochs(&epochs, &picks, &welch_for(epochs.sfreq))?;
            report.add_figure(
                &figure_from_psd(&format!("{} psd after drop", segment), &psd),
                ItemMeta::new(format!("stim: {}, psd after dropped", segment))
                    .section("epochs")
                    .tags(&["psd"]),
            )?;
        }
    }
    report.save(&study.report_path())?;
    Ok(())
}

fn cmd_erp(args: &StudyArgs, epoching: &str) -> Result<()> {
    let study = Study::open(args)?;
    let mut report = study.open_report()?;
    let mut evokeds: Vec<Evoked> = Vec::new();
    for segment in SEGMENTS {
        let path = epochs_path(&study, segment, epoching);
        if !path.exists() {
            warn!("{} does not exist, skipping", path.display());
            continue;
        }
        let epochs = Epochs::load_json(&path)?;
        let mut evoked = epochs.average()?;
        evoked.filter(None, Some(30.0))?;
        let mut evoked = evoked.crop(-0.1, 1.0)?;
        evoked.apply_baseline(Some(-0.1), Some(0.0))?;
        evoked.comment = format!("stim:{}, {} onset", segment, epoching);
        let out = study
            .bids
            .derivative(&[segment, &format!("evo-{}", epoching)], "json");
        evoked.save_json(&out)?;
        report.add_figure(
            &figure_from_evoked(&evoked.comment, &evoked),
            ItemMeta::new(format!("stim:{}, evoked response", segment))
                .caption(format!("evoked response for {}, baseline=(-100,0) ms, low-pass 30 Hz", epoching))
                .section("stim")
                .tags(&["evo"]),
        )?;
        evokeds.push(evoked);
    }
    if evokeds.is_empty() {
        bail!("no epochs found for subject {}", args.subject);
    }
    report.save(&study.report_path())?;
    Ok(())
}

fn cmd_group_erp(
    config_path: &Path,
    platform: Option<&str>,
    subjects: Option<Vec<String>>,
    epoching: &str,
) -> Result<()> {
    let config = StudyConfig::load(config_path)?;
    let platform = config.platform(platform)?.clone();
    let subjects = subjects.unwrap_or_else(|| config.subjects.keys().cloned().collect());
    let group_dir = platform.bids_root.join("derivatives").join("group");
    let report_path = platform.report_root.join("group").join("group_report.json");
    let mut report = Report::open_or_create(&report_path, "Group TFR and PAF Report")?;

    let mut grand: BTreeMap<&str, Evoked> = BTreeMap::new();
    for segment in SEGMENTS {
        let mut evokeds = Vec::new();
        let mut epochs = Vec::new();
        for subject in &subjects {
            let bids = BidsPath::new(&platform.bids_root, subject, &config.task)
                .with_session(config.session.as_deref())
                .with_run(config.run.as_deref());
            let evo = bids.derivative(&[segment, &format!("evo-{}", epoching)], "json");
            if !evo.exists() {
                warn!("subject {}: {} is missing, excluded from {}", subject, evo.display(), segment);
                continue;
            }
            let mut evoked = Evoked::load_json(&evo)?;
            evoked.comment = format!("sub-{} {}", subject, segment);
            evokeds.push(evoked);
            let epo = bids.derivative(&[segment, &format!("epo-{}", epoching)], "json");
            if epo.exists() {
                epochs.push(Epochs::load_json(&epo)?);
            }
        }
        if evokeds.is_empty() {
            warn!("no subject has {} evokeds", segment);
            continue;
        }
        info!("{}: grand-average evoked over {} subjects", segment, evokeds.len());
        let mut average = Evoked::grand_average(&evokeds)?;
        average.comment = format!("stim:{}, {} onset", segment, epoching);
        let out = group_dir.join(format!(
            "group_task-{}_{}_evo-{}.json",
            config.task, segment, epoching
        ));
        ensure_parent(&out)?;
        average.save_json(&out)?;

        if !epochs.is_empty() {
            let shared = common_channels(epochs.iter().map(|e| e.ch_names.as_slice()));
            let occipital: Vec<&String> = config.erp_channels.iter().filter(|c| shared.contains(c)).collect();
            if occipital.is_empty() {
                warn!("{}: no occipital channel is shared by every subject, epochs not pooled", segment);
            } else {
                let picked = epochs
                    .iter()
                    .map(|e| e.pick(occipital.as_slice()))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                let pooled = Epochs::concatenate(picked)?;
                let out = group_dir.join(format!(
                    "group_task-{}_{}_epo-{}.json",
                    config.task, segment, epoching
                ));
                pooled.save_json(&out)?;
                info!("{}: pooled {} epochs on {:?}", segment, pooled.len(), occipital);
            }
        }
        grand.insert(segment, average);
    }
    if grand.is_empty() {
        bail!("no evoked responses found for {:?}", subjects);
    }

    let items: Vec<(&str, &Evoked)> = grand.iter().map(|(segment, ev)| (*segment, ev)).collect();
    report.add_figure(
        &figure_from_evoked_comparison(
            &format!("Group evoked, {} onset", epoching),
            &items,
            config.erp_channels.as_slice(),
        ),
        ItemMeta::new("Group evoked responses, stim vs no stim")
            .caption(format!(
                "mean over {}, baseline=(-100,0) ms, low-pass 30 Hz",
                config.erp_channels.join(" ")
            ))
            .section("group")
            .tags(&["evo", "stim"]),
    )?;
    for (segment, ev) in &grand {
        report.add_figure(
            &figure_from_evoked(&ev.comment, &ev.pick(erp_picks(ev, &config).as_slice())?),
            ItemMeta::new(format!("stim:{}, group evoked (occipital sensors)", segment))
                .section("group")
                .tags(&["evo"]),
        )?;
    }
    report.save(&report_path)?;
    Ok(())
}

fn erp_picks(evoked: &Evoked, config: &StudyConfig) -> Vec<String> {
    let present: Vec<String> = config
        .erp_channels
        .iter()
        .filter(|c| evoked.ch_names.contains(c))
        .cloned()
        .collect();
    if present.is_empty() {
        evoked.ch_names.clone()
    } else {
        present
    }
}

fn tfr_path(bids: &BidsPath, segment: &str, condition: &str) -> PathBuf {
    bids.derivative(&[segment, &format!("tfr-{}", condition)], "json")
}

fn two_conditions(config: &StudyConfig, epoching: &str) -> Result<(String, String)> {
    match config.conditions(epoching)? {
        [right, left] => Ok((right.clone(), left.clone())),
        other => Err(anyhow!(
            "epoching type '{}' needs exactly two conditions for MI, found {}",
            epoching,
            other.len()
        )),
    }
}

fn baselined(tfr: &AverageTfr, config: &StudyConfig) -> Result<AverageTfr> {
    let mut out = tfr.clone();
    let [bmin, bmax] = config.tfr.baseline;
    out.apply_baseline(Some(bmin), Some(bmax), config.tfr.mode)?;
    Ok(out)
}

fn add_alpha_figures(report: &mut Report, label: &str, paf: &PeakAlpha, mi_fig: Option<&Figure>) -> Result<()> {
    report.add_figure(
        &figure_from_paf(&format!("{} PAF", label), paf),
        ItemMeta::new(format!("{}, PSD and PAF", label))
            .caption(format!(
                "peak alpha {:.1} Hz, range {:?} Hz",
                paf.peak, paf.range
            ))
            .section("alpha")
            .tags(&["paf"]),
    )?;
    if let Some(fig) = mi_fig {
        report.add_figure(
            fig,
            ItemMeta::new(format!("{}, MI over time", label))
                .section("alpha")
                .tags(&["mi"]),
        )?;
    }
    Ok(())
}

fn cmd_tfr_mi(args: &StudyArgs, epoching: &str) -> Result<()> {
    let study = Study::open(args)?;
    let (right_label, left_label) = two_conditions(&study.config, epoching)?;
    let params = study.config.tfr_params()?;
    let alpha = &study.config.alpha;
    let mut report = study.open_report()?;
    let mut done = 0;

    for segment in SEGMENTS {
        let path = epochs_path(&study, segment, epoching);
        if !path.exists() {
            warn!("{} does not exist, skipping", path.display());
            continue;
        }
        let epochs = Epochs::load_json(&path)?;
        let picks = good_eeg_picks(&epochs);
        let right_epochs = epochs.select(&[right_label.as_str()])?;
        let left_epochs = epochs.select(&[left_label.as_str()])?;
        let right = tfr_multitaper(&right_epochs, &picks, &params)?;
        let left = tfr_multitaper(&left_epochs, &picks, &params)?;
        let both = tfr_multitaper(&epochs, &picks, &params)?;
        for (name, tfr) in [("right", &right), ("left", &left), ("both", &both)] {
            tfr.save_json(&tfr_path(&study.bids, segment, name))?;
        }

        let paf = estimate_paf(&right, &left, Some(&both), alpha)?;
        let paf_json = study.bids.derivative(&[segment, "paf"], "json");
        std::fs::write(&paf_json, serde_json::to_string_pretty(&paf)?)
            .with_context(|| format!("failed to write {}", paf_json.display()))?;

        // MI is computed on power at the subject's own alpha range
        let mut mi_params = TfrParams::with_freqs(paf.range.clone());
        mi_params.time_bandwidth = params.time_bandwidth;
        mi_params.decim = params.decim;
        let right_alpha = tfr_multitaper(&right_epochs, &picks, &mi_params)?;
        let left_alpha = tfr_multitaper(&left_epochs, &picks, &mi_params)?;
        let (fmin, fmax) = match (paf.range.first(), paf.range.last()) {
            (Some(lo), Some(hi)) => (*lo, *hi),
            _ => bail!("empty alpha range"),
        };
        let mi = compute_mi(&right_alpha, &left_alpha, fmin, fmax, alpha)?;
        write_mi_csv(&study.bids.derivative(&[segment, "mi"], "csv"), &mi)?;
        write_mi_series_csv(&study.bids.derivative(&[segment, "mi-series"], "csv"), &mi)?;
        println!("{}: PAF {:.1} Hz, mean MI {:.4}", segment, paf.peak, mi.mean());

        let label = format!("stim:{}", segment);
        let both_bl = baselined(&both, &study.config)?;
        let occipital = both_bl.pick(alpha.channels.as_slice())?;
        report.add_figure(
            &figure_from_tfr(&format!("{} TFR (alpha channels)", label), &occipital, None),
            ItemMeta::new(format!("{}, TFR on alpha channels", label))
                .caption(format!("baseline {:?} s, mode {:?}", study.config.tfr.baseline, study.config.tfr.mode))
                .section("tfr")
                .tags(&["tfr"]),
        )?;
        let mi_fig = figure_from_mi(&format!("{} MI", label), &mi);
        add_alpha_figures(&mut report, &label, &paf, Some(&mi_fig))?;
        report.add_table(
            &["channel", "MI"],
            mi.ch_names
                .iter()
                .zip(&mi.per_channel)
                .map(|(ch, v)| vec![ch.clone(), format!("{:.4}", v)])
                .collect(),
            ItemMeta::new(format!("{}, MI per channel", label)).section("alpha"),
        );
        done += 1;
    }
    if done == 0 {
        bail!("no epochs found for subject {}", args.subject);
    }
    report.save(&study.report_path())?;
    Ok(())
}

fn cmd_group_tfr(
    config_path: &Path,
    platform: Option<&str>,
    subjects: Option<Vec<String>>,
    epoching: &str,
) -> Result<()> {
    let config = StudyConfig::load(config_path)?;
    let platform = config.platform(platform)?.clone();
    let subjects = subjects.unwrap_or_else(|| config.subjects.keys().cloned().collect());
    let (right_label, left_label) = two_conditions(&config, epoching)?;
    let group_dir = platform.bids_root.join("derivatives").join("group");
    let report_path = platform.report_root.join("group").join("group_report.json");
    let mut report = Report::open_or_create(&report_path, "Group TFR and PAF Report")?;

    let mut baselined_both: BTreeMap<&str, AverageTfr> = BTreeMap::new();
    for segment in SEGMENTS {
        let mut grand: BTreeMap<&str, Vec<AverageTfr>> = BTreeMap::new();
        let mut included = Vec::new();
        for subject in &subjects {
            let bids = BidsPath::new(&platform.bids_root, subject, &config.task)
                .with_session(config.session.as_deref())
                .with_run(config.run.as_deref());
            let paths: Vec<(&str, PathBuf)> = ["right", "left", "both"]
                .into_iter()
                .map(|c| (c, tfr_path(&bids, segment, c)))
                .collect();
            if let Some((_, missing)) = paths.iter().find(|(_, p)| !p.exists()) {
                warn!("subject {}: {} is missing, excluded from {}", subject, missing.display(), segment);
                continue;
            }
            for (cond, path) in paths {
                grand.entry(cond).or_default().push(AverageTfr::load_json(&path)?);
            }
            included.push(subject.clone());
        }
        if included.is_empty() {
            warn!("no subject has {} TFRs", segment);
            continue;
        }
        info!("{}: grand average over {:?}", segment, included);

        let mut averages: BTreeMap<&str, AverageTfr> = BTreeMap::new();
        for (cond, items) in &grand {
            let mut avg = AverageTfr::grand_average(items)?;
            avg.comment = format!("{} {} ({})", segment, cond, epoching);
            let out = group_dir.join(format!(
                "group_task-{}_{}_tfr-{}.json",
                config.task, segment, cond
            ));
            ensure_parent(&out)?;
            avg.save_json(&out)?;
            averages.insert(cond, avg);
        }
        let (Some(right), Some(left), Some(both)) =
            (averages.get("right"), averages.get("left"), averages.get("both"))
        else {
            continue;
        };
        let paf = estimate_paf(right, left, Some(both), &config.alpha)?;
        let (fmin, fmax) = match (paf.range.first(), paf.range.last()) {
            (Some(lo), Some(hi)) => (*lo, *hi),
            _ => bail!("empty alpha range"),
        };
        let mi = compute_mi(right, left, fmin, fmax, &config.alpha)?;
        write_mi_csv(
            &group_dir.join(format!("group_task-{}_{}_mi.csv", config.task, segment)),
            &mi,
        )?;
        let label = format!("Group stim:{} ({} n={})", segment, right_label.replace('_', " "), included.len());
        let bl = baselined(both, &config)?;
        report.add_figure(
            &figure_from_tfr(
                &format!("{} TFR (alpha channels)", label),
                &bl.pick(config.alpha.channels.as_slice())?,
                None,
            ),
            ItemMeta::new(format!("{}, group TFR (occipital sensors)", label))
                .caption(format!("{} vs {}", right_label, left_label))
                .section("group")
                .tags(&["tfr"]),
        )?;
        let mi_fig = figure_from_mi(&format!("{} MI", label), &mi);
        add_alpha_figures(&mut report, &label, &paf, Some(&mi_fig))?;
        baselined_both.insert(segment, bl);
    }

    if let (Some(no_stim), Some(stim)) = (baselined_both.get("no-stim"), baselined_both.get("stim")) {
        let shared = common_channels([no_stim.ch_names.as_slice(), stim.ch_names.as_slice()]);
        let effect = stim_effect(
            &no_stim.pick(shared.as_slice())?,
            &stim.pick(shared.as_slice())?,
            config.alpha.epsilon,
        )?;
        for (name, tfr) in [("difference", &effect.difference), ("ratio", &effect.ratio)] {
            let picked = tfr.pick(config.alpha.channels.as_slice())?;
            report.add_figure(
                &figure_from_tfr(&format!("no-stim vs stim {}", name), &picked, None),
                ItemMeta::new(format!("Group TFR, stim vs no stim ({})", name))
                    .section("group")
                    .tags(&["stim"]),
            )?;
        }
    } else {
        warn!("stimulation effect needs both no-stim and stim group TFRs");
    }
    report.save(&report_path)?;
    Ok(())
}

#[derive(serde::Serialize)]
struct LfpSummary {
    samples: usize,
    sfreq: f64,
    duration_s: f64,
    tags: BTreeMap<i32, usize>,
}

/// `--sfreq` wins; otherwise the subject's `lfp_sfreq`. There is no default rate.
fn lfp_rate(sfreq: Option<f64>, config: Option<&Path>, subject: Option<&str>) -> Result<f64> {
    let configured = match (config, subject) {
        (Some(path), Some(subject)) => Some(StudyConfig::load(path)?.lfp_sfreq(subject)),
        _ => None,
    };
    match (sfreq, configured) {
        (Some(rate), Some(Ok(from_config))) if (rate - from_config).abs() > 1e-9 => {
            warn!("--sfreq {} overrides the configured lfp_sfreq {}", rate, from_config);
            Ok(rate)
        }
        (Some(rate), _) => Ok(rate),
        (None, Some(from_config)) => {
            let rate = from_config?;
            info!("LFP sampling rate {} Hz from the config", rate);
            Ok(rate)
        }
        (None, None) => bail!("the LFP sampling rate is not stored in the export: pass --sfreq or --config with --subject"),
    }
}

fn cmd_lfp_inspect(
    input: &Path,
    sfreq: f64,
    channel: &str,
    out: Option<&Path>,
    report_path: Option<&Path>,
) -> Result<()> {
    let lfp = read_lfp_csv(input, sfreq)?;
    let summary = LfpSummary {
        samples: lfp.len(),
        sfreq,
        duration_s: lfp.len() as f64 / sfreq,
        tags: lfp.tag_histogram(),
    };
    println!("{}", serde_json::to_string(&summary)?);
    let raw = lfp.to_raw(channel)?;
    if let Some(out) = out {
        spatt_io::write_raw(&raw, out)?;
    }
    if let Some(path) = report_path {
        let mut report = Report::open_or_create(path, "LFP inspection")?;
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        report.add_figure(
            &figure_from_lfp(&format!("{} trace", name), &lfp, 4000),
            ItemMeta::new(format!("{} trace", name))
                .caption("shaded spans mark tagged samples")
                .section("lfp")
                .tags(&["lfp"]),
        )?;
        report.add_figure(
            &figure_from_tag_histogram(&format!("{} tags", name), &lfp),
            ItemMeta::new(format!("{} tag histogram", name)).section("lfp"),
        )?;
        if lfp.len() >= 16 {
            let psd = psd_raw(&raw, &[0], &welch_for(sfreq))?;
            report.add_figure(
                &figure_from_psd(&format!("{} psd", name), &psd),
                ItemMeta::new(format!("{} psd", name)).section("lfp").tags(&["psd"]),
            )?;
        }
        report.save(path)?;
    }
    Ok(())
}

fn cmd_report_html(input: &Path, out: Option<&Path>) -> Result<()> {
    if !input.exists() {
        bail!("report {} does not exist", input.display());
    }
    let report = Report::open_or_create(input, "")?;
    let out = out
        .map(Path::to_path_buf)
        .unwrap_or_else(|| input.with_extension("html"));
    report.save_html(&out)?;
    println!("{}", out.display());
    Ok(())
}

fn cmd_config_check(path: &Path) -> Result<()> {
    let config = StudyConfig::load(path)?;
    let problems = config.validate();
    if problems.is_empty() {
        println!(
            "{}: ok ({} subjects, {} platforms)",
            config.project,
            config.subjects.len(),
            config.platforms.len()
        );
        return Ok(());
    }
    for problem in &problems {
        eprintln!("- {}", problem);
    }
    bail!("{} problem(s) in {}", problems.len(), path.display())
}
