use crate::annotations::Event;
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::Path;

/// Parse an events text file: one `sample prev code` triplet per line,
/// blank lines and `#` comments ignored.
pub fn parse_events(text: &str) -> Result<Vec<Event>> {
    let mut out = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        if fields.len() != 3 {
            anyhow::bail!("line {} needs three columns: {}", idx + 1, trimmed);
        }
        let sample: usize = fields[0]
            .parse()
            .with_context(|| format!("line {} has a bad sample index: {}", idx + 1, fields[0]))?;
        let prev: i32 = fields[1]
            .parse()
            .with_context(|| format!("line {} has a bad previous value: {}", idx + 1, fields[1]))?;
        let code: i32 = fields[2]
            .parse()
            .with_context(|| format!("line {} has a bad event code: {}", idx + 1, fields[2]))?;
        out.push(Event { sample, prev, code });
    }
    if out.is_empty() {
        anyhow::bail!("no events found");
    }
    Ok(out)
}

/// Read an events text file from disk.
pub fn read_events(path: &Path) -> Result<Vec<Event>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_events(&text).with_context(|| format!("parsing {}", path.display()))
}

pub fn write_events(path: &Path, events: &[Event]) -> Result<()> {
    let mut text = String::new();
    for e in events {
        let _ = writeln!(text, "{} {} {}", e.sample, e.prev, e.code);
    }
    std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
}

/// Split a typed channel list ("FT10 TP9, Fp1") into names.
pub fn parse_channel_list(text: &str) -> Vec<String> {
    text.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_triplets_and_skips_comments() {
        let events = parse_events("# sample prev code\n100 0 1\n\n250 0 20\n").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], Event { sample: 250, prev: 0, code: 20 });
    }

    #[test]
    fn rejects_short_lines() {
        let err = parse_events("100 1\n").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn events_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub-01-eve.txt");
        let events = vec![Event { sample: 3, prev: 0, code: 7 }];
        write_events(&path, &events).unwrap();
        assert_eq!(read_events(&path).unwrap(), events);
    }

    #[test]
    fn channel_lists_accept_spaces_and_commas() {
        assert_eq!(parse_channel_list(" FT10  TP9,Fp1 "), vec!["FT10", "TP9", "Fp1"]);
        assert!(parse_channel_list("   ").is_empty());
    }
}
