//! Annotations, event triplets and the conversions between them.
//!
//! Onsets are recording times in seconds. Event samples are indices into the
//! data currently held by a [`Raw`], so they shift when the recording is cropped.
use crate::signal::Raw;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label → code map used when epoching.
pub type EventId = BTreeMap<String, i32>;

/// Code → label map used to relabel trigger codes.
pub type EventLabels = BTreeMap<i32, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub onset: f64,
    pub duration: f64,
    pub description: String,
}

impl Annotation {
    pub fn new(onset: f64, duration: f64, description: &str) -> Self {
        Self {
            onset,
            duration,
            description: description.to_string(),
        }
    }

    pub fn end(&self) -> f64 {
        self.onset + self.duration
    }

    /// Segments whose description starts with "bad" are excluded from epochs.
    pub fn is_bad(&self) -> bool {
        starts_with_ignore_case(&self.description, "bad")
    }

    pub fn is_edge(&self) -> bool {
        starts_with_ignore_case(&self.description, "edge")
    }
}

fn starts_with_ignore_case(text: &str, prefix: &str) -> bool {
    text.get(..prefix.len())
        .map_or(false, |head| head.eq_ignore_ascii_case(prefix))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Annotations {
    items: Vec<Annotation>,
}

impl Annotations {
    pub fn new(items: Vec<Annotation>) -> Self {
        let mut out = Self { items };
        out.sort();
        out
    }

    pub fn push(&mut self, annotation: Annotation) {
        self.items.push(annotation);
        self.sort();
    }

    pub fn extend(&mut self, other: &Annotations) {
        self.items.extend(other.items.iter().cloned());
        self.sort();
    }

    fn sort(&mut self) {
        self.items.sort_by(|a, b| a.onset.total_cmp(&b.onset));
    }

    pub fn iter(&self) -> impl Iterator<Item = &Annotation> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Keep the parts of annotations that fall inside `[start, end]`.
    pub fn clipped(&self, start: f64, end: f64) -> Annotations {
        let items = self
            .items
            .iter()
            .filter(|a| a.end() >= start && a.onset <= end)
            .map(|a| {
                let onset = a.onset.max(start);
                let stop = a.end().min(end);
                Annotation::new(onset, (stop - onset).max(0.0), &a.description)
            })
            .collect();
        Annotations { items }
    }

    /// Number of annotations per description.
    pub fn counts(&self) -> BTreeMap<String, usize> {
        let mut out = BTreeMap::new();
        for a in &self.items {
            *out.entry(a.description.clone()).or_insert(0) += 1;
        }
        out
    }

    /// True when `[start, end]` touches any bad-prefixed annotation.
    pub fn overlaps_bad(&self, start: f64, end: f64) -> Option<&Annotation> {
        self.items
            .iter()
            .find(|a| a.is_bad() && a.onset <= end && a.end() >= start)
    }

    /// Drop annotations whose description matches one of `descriptions` exactly.
    pub fn without(&self, descriptions: &[&str]) -> Annotations {
        Annotations {
            items: self
                .items
                .iter()
                .filter(|a| !descriptions.contains(&a.description.as_str()))
                .cloned()
                .collect(),
        }
    }
}

/// Event triplet: sample index, previous trigger value, code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub sample: usize,
    pub prev: i32,
    pub code: i32,
}

/// Trigger code embedded in BrainVision style descriptions (`Stimulus/S  1` → 1).
pub fn trailing_code(description: &str) -> Option<i32> {
    let digits: String = description
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if digits.is_empty() {
        return None;
    }
    let prefix = &description[..description.len() - digits.len()];
    if prefix.is_empty() || prefix.ends_with(' ') || prefix.ends_with('/') || prefix.ends_with('S') || prefix.ends_with('R') {
        digits.parse().ok()
    } else {
        None
    }
}

/// Build an automatic label → code map: trailing trigger numbers when every
/// description carries one, otherwise sorted descriptions numbered from 1.
pub fn auto_event_id(annotations: &Annotations) -> EventId {
    let descriptions: Vec<String> = annotations
        .iter()
        .filter(|a| !a.is_bad() && !a.is_edge())
        .map(|a| a.description.clone())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();
    let coded: Option<EventId> = descriptions
        .iter()
        .map(|d| trailing_code(d).map(|code| (d.clone(), code)))
        .collect();
    match coded {
        Some(map) if !map.is_empty() => map,
        _ => descriptions
            .into_iter()
            .enumerate()
            .map(|(i, d)| (d, i as i32 + 1))
            .collect(),
    }
}

/// Convert annotations to events. Descriptions absent from `event_id` are skipped.
pub fn events_from_annotations(raw: &Raw, event_id: Option<&EventId>) -> (Vec<Event>, EventId) {
    let event_id = match event_id {
        Some(map) => map.clone(),
        None => auto_event_id(&raw.annotations),
    };
    let mut events = Vec::new();
    let mut skipped = 0usize;
    for ann in raw.annotations.iter() {
        let Some(&code) = event_id.get(&ann.description) else {
            if !ann.is_bad() && !ann.is_edge() {
                skipped += 1;
            }
            continue;
        };
        let offset = ann.onset - raw.first_time;
        if offset < 0.0 {
            continue;
        }
        let sample = (offset * raw.sfreq).round() as usize;
        if sample >= raw.n_times() {
            continue;
        }
        events.push(Event {
            sample,
            prev: 0,
            code,
        });
    }
    if skipped > 0 {
        debug!("{} annotations had no event code and were skipped", skipped);
    }
    events.sort_by_key(|e| e.sample);
    (events, event_id)
}

/// Relabel events as annotations using a code → label table.
/// Codes without a label are dropped with a warning.
pub fn annotations_from_events(
    events: &[Event],
    labels: &EventLabels,
    sfreq: f64,
    first_time: f64,
) -> Annotations {
    let mut unmapped: BTreeMap<i32, usize> = BTreeMap::new();
    let mut items = Vec::with_capacity(events.len());
    for event in events {
        match labels.get(&event.code) {
            Some(label) => items.push(Annotation::new(
                first_time + event.sample as f64 / sfreq,
                0.0,
                label,
            )),
            None => *unmapped.entry(event.code).or_insert(0) += 1,
        }
    }
    for (code, count) in unmapped {
        warn!("event code {} has no label; dropped {} events", code, count);
    }
    Annotations::new(items)
}

/// Invert a code → label table into the label → code form epoching uses.
pub fn event_id_from_labels(labels: &EventLabels) -> EventId {
    labels.iter().map(|(code, label)| (label.clone(), *code)).collect()
}

/// Parameters for marking long gaps between task events as `BAD_break`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakParams {
    pub min_break_duration: f64,
    pub t_start_after_previous: f64,
    pub t_stop_before_next: f64,
    /// Description prefixes (case-insensitive) that do not count as task events.
    pub ignore: Vec<String>,
}

impl Default for BreakParams {
    fn default() -> Self {
        Self {
            min_break_duration: 20.0,
            t_start_after_previous: 5.0,
            t_stop_before_next: 2.0,
            ignore: vec!["bad".into(), "edge".into(), "blink".into()],
        }
    }
}

/// Annotate breaks in a recording spanning `[start, end]` seconds.
pub fn annotate_break(annotations: &Annotations, start: f64, end: f64, params: &BreakParams) -> Annotations {
    let task: Vec<&Annotation> = annotations
        .iter()
        .filter(|a| {
            !params
                .ignore
                .iter()
                .any(|prefix| starts_with_ignore_case(&a.description, prefix))
        })
        .collect();
    let Some(first) = task.first() else {
        return Annotations::default();
    };
    let min = params.min_break_duration;
    let mut items: Vec<(f64, f64)> = Vec::new();
    if first.onset - start >= min {
        items.push((start, first.onset - params.t_stop_before_next));
    }
    let mut prev_end = first.end();
    for ann in task.iter().skip(1) {
        if ann.onset - prev_end >= min {
            items.push((
                prev_end + params.t_start_after_previous,
                ann.onset - params.t_stop_before_next,
            ));
        }
        prev_end = prev_end.max(ann.end());
    }
    if end - prev_end >= min {
        items.push((prev_end + params.t_start_after_previous, end));
    }
    let items = items
        .into_iter()
        .filter(|(from, to)| to > from)
        .map(|(from, to)| Annotation::new(from, to - from, "BAD_break"))
        .collect();
    Annotations::new(items)
}

/// Blink annotations around detected EOG peaks (0.25 s before, 0.5 s long).
pub fn blink_annotations(peaks: &[usize], sfreq: f64, first_time: f64) -> Annotations {
    Annotations::new(
        peaks
            .iter()
            .map(|&p| Annotation::new(first_time + p as f64 / sfreq - 0.25, 0.5, "blink"))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn raw_with(annotations: Vec<Annotation>) -> Raw {
        let mut raw = Raw::new(vec!["Cz".into()], 100.0, Array2::zeros((1, 10_000))).unwrap();
        raw.annotations = Annotations::new(annotations);
        raw
    }

    #[test]
    fn trailing_codes_from_brainvision_descriptions() {
        assert_eq!(trailing_code("Stimulus/S  1"), Some(1));
        assert_eq!(trailing_code("Stimulus/S 20"), Some(20));
        assert_eq!(trailing_code("99999"), Some(99999));
        assert_eq!(trailing_code("cue_onset_right"), None);
        assert_eq!(trailing_code("FT10"), None);
    }

    #[test]
    fn auto_event_id_uses_trigger_numbers() {
        let raw = raw_with(vec![
            Annotation::new(1.0, 0.0, "Stimulus/S  2"),
            Annotation::new(2.0, 0.0, "Stimulus/S  1"),
            Annotation::new(3.0, 5.0, "BAD_break"),
        ]);
        let (events, ids) = events_from_annotations(&raw, None);
        assert_eq!(ids.len(), 2);
        assert_eq!(events[0], Event { sample: 100, prev: 0, code: 2 });
        assert_eq!(events[1].code, 1);
    }

    #[test]
    fn relabel_drops_unmapped_codes() {
        let events = vec![
            Event { sample: 10, prev: 0, code: 1 },
            Event { sample: 20, prev: 0, code: 31 },
        ];
        let mut labels = EventLabels::new();
        labels.insert(1, "cue_onset_right".into());
        let anns = annotations_from_events(&events, &labels, 100.0, 2.0);
        assert_eq!(anns.len(), 1);
        let first = anns.iter().next().unwrap();
        assert_eq!(first.description, "cue_onset_right");
        assert!((first.onset - 2.1).abs() < 1e-12);
    }

    #[test]
    fn events_follow_cropping() {
        let raw = raw_with(vec![Annotation::new(5.0, 0.0, "cue")]);
        let cropped = raw.crop(2.0, None).unwrap();
        let mut ids = EventId::new();
        ids.insert("cue".into(), 1);
        let (events, _) = events_from_annotations(&cropped, Some(&ids));
        assert_eq!(events[0].sample, 300);
    }

    #[test]
    fn break_between_distant_events() {
        let anns = Annotations::new(vec![
            Annotation::new(10.0, 0.0, "trial_onset"),
            Annotation::new(11.0, 0.0, "blink"),
            Annotation::new(60.0, 0.0, "trial_onset"),
        ]);
        let breaks = annotate_break(&anns, 0.0, 70.0, &BreakParams::default());
        let spans: Vec<(f64, f64)> = breaks.iter().map(|a| (a.onset, a.end())).collect();
        // leading gap is 8 s (< 20), trailing gap is 5 s
        assert_eq!(spans, vec![(15.0, 58.0)]);
    }

    #[test]
    fn bad_overlap_detection() {
        let anns = Annotations::new(vec![
            Annotation::new(3.0, 1.0, "BAD_break"),
            Annotation::new(8.0, 0.5, "blink"),
        ]);
        assert!(anns.overlaps_bad(2.5, 3.2).is_some());
        assert!(anns.overlaps_bad(7.9, 8.6).is_none());
    }
}
