//! Backend-neutral figure descriptions for the analysis outputs.
//!
//! Builders in this module turn analysis results into a [`Figure`]; the
//! [`render`] submodule draws a figure to SVG with plotters so it can be
//! embedded in a report.
use crate::epochs::{Epochs, Evoked};
use crate::io::lfp::LfpRecording;
use crate::metrics::alpha::{MiResult, PeakAlpha};
use crate::metrics::psd::Psd;
use crate::signal::TimeSeries;
use crate::tfr::AverageTfr;
use serde::{Deserialize, Serialize};

pub mod render;

pub use render::render_svg;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Axis {
    pub label: Option<String>,
    pub log: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Style {
    pub width: f32,
    pub color: Color,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color(pub u32);

impl Color {
    pub fn rgb(self) -> (u8, u8, u8) {
        (
            ((self.0 >> 16) & 0xFF) as u8,
            ((self.0 >> 8) & 0xFF) as u8,
            (self.0 & 0xFF) as u8,
        )
    }
}

/// Matplotlib's tab10 cycle.
pub const PALETTE: [Color; 10] = [
    Color(0x1F77B4),
    Color(0xFF7F0E),
    Color(0x2CA02C),
    Color(0xD62728),
    Color(0x9467BD),
    Color(0x8C564B),
    Color(0xE377C2),
    Color(0x7F7F7F),
    Color(0xBCBD22),
    Color(0x17BECF),
];

pub fn palette(i: usize) -> Color {
    PALETTE[i % PALETTE.len()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineSeries {
    pub name: String,
    pub points: Vec<[f64; 2]>,
    pub style: Style,
}

/// Shaded region between `lower` and `upper` sharing one x grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandSeries {
    pub name: String,
    pub x: Vec<f64>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
    pub color: Color,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarSeries {
    pub labels: Vec<String>,
    pub values: Vec<f64>,
    pub color: Color,
}

/// Values on a regular grid, `values[row][col]` at `(x[col], y[row])`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeatmapSeries {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub values: Vec<Vec<f64>>,
    /// Symmetric colour limit; computed from the data when `None`.
    pub vlim: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Series {
    Line(LineSeries),
    Band(BandSeries),
    Bars(BarSeries),
    Heatmap(HeatmapSeries),
}

/// Highlighted x interval such as an alpha range or a stimulation block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub start: f64,
    pub end: f64,
    pub color: Color,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Figure {
    pub title: Option<String>,
    pub x: Axis,
    pub y: Axis,
    pub series: Vec<Series>,
    pub spans: Vec<Span>,
}

impl Figure {
    pub fn new(title: impl Into<Option<String>>) -> Self {
        Self {
            title: title.into(),
            x: Axis::default(),
            y: Axis::default(),
            series: Vec::new(),
            spans: Vec::new(),
        }
    }

    pub fn with_labels(mut self, x: &str, y: &str) -> Self {
        self.x.label = Some(x.to_string());
        self.y.label = Some(y.to_string());
        self
    }

    pub fn add_series(&mut self, series: Series) {
        self.series.push(series);
    }

    pub fn add_span(&mut self, start: f64, end: f64, color: Color) {
        self.spans.push(Span { start, end, color });
    }

    /// Data extent over all series, `None` for an empty figure.
    pub fn bounds(&self) -> Option<([f64; 2], [f64; 2])> {
        let mut xs = [f64::INFINITY, f64::NEG_INFINITY];
        let mut ys = [f64::INFINITY, f64::NEG_INFINITY];
        let mut grow = |x: f64, y: f64| {
            if x.is_finite() && y.is_finite() {
                xs = [xs[0].min(x), xs[1].max(x)];
                ys = [ys[0].min(y), ys[1].max(y)];
            }
        };
        for series in &self.series {
            match series {
                Series::Line(line) => line.points.iter().for_each(|p| grow(p[0], p[1])),
                Series::Band(band) => {
                    for (i, &x) in band.x.iter().enumerate() {
                        grow(x, band.lower[i]);
                        grow(x, band.upper[i]);
                    }
                }
                Series::Bars(bars) => {
                    for (i, &v) in bars.values.iter().enumerate() {
                        grow(i as f64 - 0.5, 0.0);
                        grow(i as f64 + 0.5, v);
                    }
                }
                Series::Heatmap(map) => {
                    let (x0, x1) = cell_edges(&map.x);
                    let (y0, y1) = cell_edges(&map.y);
                    grow(x0, y0);
                    grow(x1, y1);
                }
            }
        }
        if xs[0] > xs[1] {
            None
        } else {
            Some((xs, ys))
        }
    }
}

pub(crate) fn cell_edges(centers: &[f64]) -> (f64, f64) {
    match centers {
        [] => (0.0, 1.0),
        [c] => (c - 0.5, c + 0.5),
        _ => {
            let first = centers[1] - centers[0];
            let last = centers[centers.len() - 1] - centers[centers.len() - 2];
            (centers[0] - first / 2.0, centers[centers.len() - 1] + last / 2.0)
        }
    }
}

pub fn decimate_points(points: &[[f64; 2]], max_points: usize) -> Vec<[f64; 2]> {
    if points.len() <= max_points || max_points == 0 {
        return points.to_vec();
    }
    let bucket_size = points.len() as f64 / max_points as f64;
    let mut result = Vec::with_capacity(max_points);
    for i in 0..max_points {
        let start = (i as f64 * bucket_size).floor() as usize;
        if start >= points.len() {
            break;
        }
        result.push(points[start]);
    }
    result
}

fn line(name: &str, points: Vec<[f64; 2]>, color: Color) -> Series {
    Series::Line(LineSeries {
        name: name.to_string(),
        points,
        style: Style { width: 1.4, color },
    })
}

/// One log-scaled spectrum per channel.
pub fn figure_from_psd(title: &str, psd: &Psd) -> Figure {
    let mut fig = Figure::new(Some(title.to_string())).with_labels("Frequency (Hz)", "PSD (V²/Hz)");
    fig.y.log = true;
    for (i, name) in psd.ch_names.iter().enumerate() {
        let points = psd
            .freqs
            .iter()
            .zip(psd.data.row(i).iter())
            .map(|(&f, &p)| [f, p])
            .collect();
        fig.add_series(line(name, points, palette(i)));
    }
    fig
}

/// Alpha-band spectrum with the selected peak range shaded.
pub fn figure_from_paf(title: &str, paf: &PeakAlpha) -> Figure {
    let mut fig = Figure::new(Some(format!("{} (PAF {:.1} Hz)", title, paf.peak)))
        .with_labels("Frequency (Hz)", "Power");
    let points = paf
        .freqs
        .iter()
        .zip(paf.spectrum.iter())
        .map(|(&f, &p)| [f, p])
        .collect();
    fig.add_series(line("alpha power", points, palette(0)));
    if let (Some(lo), Some(hi)) = (paf.range.first(), paf.range.last()) {
        fig.add_span(*lo, *hi, Color(0xFFD54F));
    }
    fig
}

/// Channel-averaged MI over time with a ±1 std band.
pub fn figure_from_mi(title: &str, mi: &MiResult) -> Figure {
    let mut fig = Figure::new(Some(title.to_string())).with_labels("Time (s)", "MI");
    fig.add_series(Series::Band(BandSeries {
        name: "±1 std".into(),
        x: mi.times.clone(),
        lower: mi.series.iter().zip(&mi.std).map(|(m, s)| m - s).collect(),
        upper: mi.series.iter().zip(&mi.std).map(|(m, s)| m + s).collect(),
        color: palette(0),
    }));
    let points = mi
        .times
        .iter()
        .zip(mi.series.iter())
        .map(|(&t, &m)| [t, m])
        .collect();
    fig.add_series(line("MI", points, palette(0)));
    fig
}

/// Time-frequency map of one channel, or the channel mean when `channel` is `None`.
pub fn figure_from_tfr(title: &str, tfr: &AverageTfr, channel: Option<usize>) -> Figure {
    let (n_ch, n_freqs, n_times) = tfr.data.dim();
    let values = (0..n_freqs)
        .map(|fi| {
            (0..n_times)
                .map(|ti| match channel {
                    Some(ch) => tfr.data[[ch, fi, ti]],
                    None => (0..n_ch).map(|ch| tfr.data[[ch, fi, ti]]).sum::<f64>() / n_ch.max(1) as f64,
                })
                .collect()
        })
        .collect();
    let mut fig = Figure::new(Some(title.to_string())).with_labels("Time (s)", "Frequency (Hz)");
    fig.add_series(Series::Heatmap(HeatmapSeries {
        x: tfr.times.clone(),
        y: tfr.freqs.clone(),
        values,
        vlim: None,
    }));
    fig
}

/// Butterfly plot of an evoked response in µV.
pub fn figure_from_evoked(title: &str, evoked: &Evoked) -> Figure {
    let times = evoked.times();
    let mut fig = Figure::new(Some(format!("{} (N={})", title, evoked.nave)))
        .with_labels("Time (s)", "Amplitude (µV)");
    for (i, name) in evoked.ch_names.iter().enumerate() {
        if evoked.bads.contains(name) {
            continue;
        }
        let points = times
            .iter()
            .zip(evoked.data.row(i).iter())
            .map(|(&t, &v)| [t, v * 1e6])
            .collect();
        fig.add_series(line(name, points, palette(i)));
    }
    fig
}

/// One line per labelled evoked: the mean over those of `channels` it has.
pub fn figure_from_evoked_comparison<S: AsRef<str>>(
    title: &str,
    items: &[(&str, &Evoked)],
    channels: &[S],
) -> Figure {
    let mut fig = Figure::new(Some(title.to_string())).with_labels("Time (s)", "Amplitude (µV)");
    for (i, (label, evoked)) in items.iter().enumerate() {
        let rows: Vec<usize> = channels
            .iter()
            .filter_map(|c| evoked.ch_names.iter().position(|n| n == c.as_ref()))
            .filter(|&r| !evoked.bads.contains(&evoked.ch_names[r]))
            .collect();
        if rows.is_empty() {
            continue;
        }
        let points = evoked
            .times()
            .iter()
            .enumerate()
            .map(|(t, &time)| {
                let mean = rows.iter().map(|&r| evoked.data[[r, t]]).sum::<f64>() / rows.len() as f64;
                [time, mean * 1e6]
            })
            .collect();
        fig.add_series(line(&format!("{} (N={})", label, evoked.nave), points, palette(i)));
    }
    fig
}

/// Bar chart of drop reasons as percentages of all epochs.
pub fn figure_from_drop_log(title: &str, epochs: &Epochs) -> Figure {
    let counts = epochs.drop_log_counts();
    let total = epochs.drop_log.len().max(1) as f64;
    let mut fig = Figure::new(Some(format!(
        "{} ({:.1}% dropped)",
        title,
        epochs.drop_percentage()
    )))
    .with_labels("Reason", "% of epochs");
    fig.add_series(Series::Bars(BarSeries {
        labels: counts.keys().cloned().collect(),
        values: counts.values().map(|&c| 100.0 * c as f64 / total).collect(),
        color: palette(3),
    }));
    fig
}

pub fn figure_from_timeseries(title: &str, series: &TimeSeries, max_points: usize, color: u32) -> Figure {
    let dt = 1.0 / series.fs.max(1.0);
    let points: Vec<[f64; 2]> = series
        .data
        .iter()
        .enumerate()
        .map(|(i, value)| [i as f64 * dt, *value])
        .collect();
    let mut fig = Figure::new(Some(title.into())).with_labels("Time (s)", "Amplitude");
    fig.add_series(line(title, decimate_points(&points, max_points), Color(color)));
    fig
}

/// LFP trace with each run of tagged samples shaded.
pub fn figure_from_lfp(title: &str, lfp: &LfpRecording, max_points: usize) -> Figure {
    let mut fig = figure_from_timeseries(title, &lfp.to_timeseries(), max_points, 0x1F77B4);
    let mut run: Option<(usize, usize)> = None;
    for &(index, _) in &lfp.tags {
        run = match run {
            Some((start, end)) if index == end + 1 => Some((start, index)),
            Some((start, end)) => {
                fig.add_span(start as f64 / lfp.sfreq, (end + 1) as f64 / lfp.sfreq, Color(0xD62728));
                Some((index, index))
            }
            None => Some((index, index)),
        };
    }
    if let Some((start, end)) = run {
        fig.add_span(start as f64 / lfp.sfreq, (end + 1) as f64 / lfp.sfreq, Color(0xD62728));
    }
    fig
}

/// Sample counts per LFP tag value.
pub fn figure_from_tag_histogram(title: &str, lfp: &LfpRecording) -> Figure {
    let hist = lfp.tag_histogram();
    let mut fig = Figure::new(Some(title.to_string())).with_labels("Tag", "Samples");
    fig.add_series(Series::Bars(BarSeries {
        labels: hist.keys().map(|k| k.to_string()).collect(),
        values: hist.values().map(|&c| c as f64).collect(),
        color: palette(2),
    }));
    fig
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn decimation_keeps_first_point_of_each_bucket() {
        let points: Vec<[f64; 2]> = (0..10).map(|i| [i as f64, 0.0]).collect();
        let out = decimate_points(&points, 5);
        assert_eq!(out.len(), 5);
        assert_eq!(out[1], [2.0, 0.0]);
        assert_eq!(decimate_points(&points, 20).len(), 10);
    }

    #[test]
    fn bounds_cover_heatmap_cells() {
        let tfr = AverageTfr {
            data: Array3::zeros((1, 3, 4)),
            ch_names: vec!["Oz".into()],
            freqs: vec![8.0, 9.0, 10.0],
            times: vec![0.0, 0.1, 0.2, 0.3],
            nave: 1,
            comment: String::new(),
        };
        let fig = figure_from_tfr("tfr", &tfr, None);
        let (xs, ys) = fig.bounds().unwrap();
        assert!((xs[0] + 0.05).abs() < 1e-12 && (xs[1] - 0.35).abs() < 1e-12);
        assert_eq!(ys, [7.5, 10.5]);
        assert!(Figure::new(None).bounds().is_none());
    }

    #[test]
    fn lfp_tag_runs_become_spans() {
        let lfp = LfpRecording {
            sfreq: 10.0,
            samples: (0..20).map(|i| i as f64).collect(),
            amplitude: vec![0.0; 20],
            tags: vec![(2, 1), (3, 1), (4, 1), (10, 2)],
        };
        let fig = figure_from_lfp("lfp", &lfp, 100);
        assert_eq!(fig.spans.len(), 2);
        assert!((fig.spans[0].start - 0.2).abs() < 1e-12);
        assert!((fig.spans[0].end - 0.5).abs() < 1e-12);
        assert!((fig.spans[1].start - 1.0).abs() < 1e-12);
    }

    #[test]
    fn evoked_comparison_averages_the_requested_channels() {
        let evoked = |offset: f64| Evoked {
            data: ndarray::Array2::from_shape_fn((3, 4), |(c, t)| (c as f64 + offset + t as f64) * 1e-6),
            ch_names: vec!["PO3".into(), "Oz".into(), "Cz".into()],
            ch_kinds: vec![crate::signal::ChannelKind::Eeg; 3],
            bads: Vec::new(),
            tmin: -0.1,
            sfreq: 10.0,
            nave: 12,
            comment: String::new(),
        };
        let no_stim = evoked(0.0);
        let mut stim = evoked(10.0);
        stim.ch_names[1] = "POz".into();
        let fig = figure_from_evoked_comparison(
            "erp",
            &[("no-stim", &no_stim), ("stim", &stim)],
            &["PO3", "Oz", "O1"],
        );
        assert_eq!(fig.series.len(), 2);
        let Series::Line(first) = &fig.series[0] else {
            panic!("expected a line");
        };
        assert_eq!(first.name, "no-stim (N=12)");
        assert!((first.points[0][0] + 0.1).abs() < 1e-12);
        assert!((first.points[0][1] - 0.5).abs() < 1e-9);
        let Series::Line(second) = &fig.series[1] else {
            panic!("expected a line");
        };
        assert!((second.points[3][1] - 13.0).abs() < 1e-9);
    }

    #[test]
    fn color_splits_into_channels() {
        assert_eq!(Color(0x1F77B4).rgb(), (0x1F, 0x77, 0xB4));
        assert_eq!(palette(11), PALETTE[1]);
    }
}
