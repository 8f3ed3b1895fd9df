//! Append-only analysis report persisted as JSON and exported to one HTML page.
use crate::bids::ensure_parent;
use crate::plot::{render_svg, Figure};
use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const FIGURE_SIZE: (u32, u32) = (900, 540);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemContent {
    Figure { svg: String },
    Table { header: Vec<String>, rows: Vec<Vec<String>> },
    Html { html: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportItem {
    pub title: String,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub section: Option<String>,
    pub content: ItemContent,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub title: String,
    pub items: Vec<ReportItem>,
}

/// Title, caption, tags and section shared by every `add_*` call.
#[derive(Debug, Clone, Default)]
pub struct ItemMeta {
    pub title: String,
    pub caption: Option<String>,
    pub tags: Vec<String>,
    pub section: Option<String>,
}

impl ItemMeta {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }

    pub fn tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }
}

impl Report {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            items: Vec::new(),
        }
    }

    /// Load the report at `path`, or start an empty one titled `title`.
    pub fn open_or_create(path: &Path, title: &str) -> Result<Self> {
        if path.exists() {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read report {}", path.display()))?;
            let report: Report = serde_json::from_str(&text)
                .with_context(|| format!("failed to parse report {}", path.display()))?;
            debug!("opened report {} with {} items", path.display(), report.items.len());
            Ok(report)
        } else {
            debug!("creating report {}", path.display());
            Ok(Self::new(title))
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn push(&mut self, meta: ItemMeta, content: ItemContent) {
        self.items.push(ReportItem {
            title: meta.title,
            caption: meta.caption,
            tags: meta.tags,
            section: meta.section,
            content,
        });
    }

    pub fn add_figure(&mut self, figure: &Figure, meta: ItemMeta) -> Result<()> {
        let svg = render_svg(figure, FIGURE_SIZE)
            .with_context(|| format!("failed to render figure '{}'", meta.title))?;
        self.push(meta, ItemContent::Figure { svg });
        Ok(())
    }

    pub fn add_table(&mut self, header: &[&str], rows: Vec<Vec<String>>, meta: ItemMeta) {
        let header = header.iter().map(|h| h.to_string()).collect();
        self.push(meta, ItemContent::Table { header, rows });
    }

    pub fn add_html(&mut self, html: &str, meta: ItemMeta) {
        self.push(
            meta,
            ItemContent::Html {
                html: html.to_string(),
            },
        );
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        ensure_parent(path)?;
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).with_context(|| format!("failed to write report {}", path.display()))?;
        info!("saved report {} ({} items)", path.display(), self.items.len());
        Ok(())
    }

    pub fn to_html(&self) -> String {
        let mut html = String::new();
        html.push_str("<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">");
        html.push_str(&format!("<title>{}</title>", escape(&self.title)));
        html.push_str(STYLE);
        html.push_str("</head><body>\n");
        html.push_str(&format!("<h1>{}</h1>\n<nav><ol>", escape(&self.title)));
        for (i, item) in self.items.iter().enumerate() {
            html.push_str(&format!(
                "<li><a href=\"#item-{}\">{}</a></li>",
                i,
                escape(&item.title)
            ));
        }
        html.push_str("</ol></nav>\n");

        let mut section: Option<&str> = None;
        for (i, item) in self.items.iter().enumerate() {
            let current = item.section.as_deref();
            if current.is_some() && current != section {
                html.push_str(&format!("<h2>{}</h2>\n", escape(current.unwrap_or_default())));
            }
            section = current;
            html.push_str(&format!("<section id=\"item-{}\"><h3>{}</h3>", i, escape(&item.title)));
            if !item.tags.is_empty() {
                html.push_str("<p class=\"tags\">");
                for tag in &item.tags {
                    html.push_str(&format!("<span>{}</span>", escape(tag)));
                }
                html.push_str("</p>");
            }
            match &item.content {
                ItemContent::Figure { svg } => {
                    html.push_str("<figure>");
                    html.push_str(strip_xml_declaration(svg));
                    html.push_str("</figure>");
                }
                ItemContent::Table { header, rows } => {
                    html.push_str("<table><thead><tr>");
                    for cell in header {
                        html.push_str(&format!("<th>{}</th>", escape(cell)));
                    }
                    html.push_str("</tr></thead><tbody>");
                    for row in rows {
                        html.push_str("<tr>");
                        for cell in row {
                            html.push_str(&format!("<td>{}</td>", escape(cell)));
                        }
                        html.push_str("</tr>");
                    }
                    html.push_str("</tbody></table>");
                }
                ItemContent::Html { html: body } => html.push_str(body),
            }
            if let Some(caption) = &item.caption {
                html.push_str(&format!("<p class=\"caption\">{}</p>", escape(caption)));
            }
            html.push_str("</section>\n");
        }
        html.push_str("</body></html>\n");
        html
    }

    pub fn save_html(&self, path: &Path) -> Result<()> {
        ensure_parent(path)?;
        fs::write(path, self.to_html())
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("wrote HTML report {}", path.display());
        Ok(())
    }
}

const STYLE: &str = "<style>\
body{font-family:sans-serif;max-width:1000px;margin:auto;padding:1em}\
table{border-collapse:collapse}td,th{border:1px solid #ccc;padding:2px 8px}\
.tags span{background:#eef;border-radius:3px;margin-right:4px;padding:0 4px;font-size:80%}\
.caption{color:#555}\
</style>";

fn strip_xml_declaration(svg: &str) -> &str {
    match svg.find("<svg") {
        Some(start) => &svg[start..],
        None => svg,
    }
}

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Report {
        let mut report = Report::new("Subject 107");
        report.add_table(
            &["reason", "count"],
            vec![vec!["NO_DATA".into(), "2".into()]],
            ItemMeta::new("Drop log").section("epochs").tags(&["epochs"]),
        );
        report.add_html(
            "<p>ICA excluded: 0, 3</p>",
            ItemMeta::new("ICA <summary>").caption("components & scores"),
        );
        report
    }

    #[test]
    fn open_or_create_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub-107/report.json");
        let fresh = Report::open_or_create(&path, "Subject 107").unwrap();
        assert!(fresh.is_empty());

        let report = sample();
        report.save(&path).unwrap();
        let mut loaded = Report::open_or_create(&path, "ignored").unwrap();
        assert_eq!(loaded, report);
        loaded.add_html("<p>more</p>", ItemMeta::new("appended"));
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.items[0].title, "Drop log");
    }

    #[test]
    fn html_export_escapes_text_and_keeps_raw_html() {
        let html = sample().to_html();
        assert!(html.contains("<h2>epochs</h2>"));
        assert!(html.contains("<td>NO_DATA</td>"));
        assert!(html.contains("ICA &lt;summary&gt;"));
        assert!(html.contains("components &amp; scores"));
        assert!(html.contains("<p>ICA excluded: 0, 3</p>"));
        assert!(html.contains("href=\"#item-1\""));
    }

    #[test]
    fn xml_declaration_is_removed_from_inline_svg() {
        assert_eq!(strip_xml_declaration("<?xml version=\"1.0\"?><svg></svg>"), "<svg></svg>");
        assert_eq!(strip_xml_declaration("plain"), "plain");
    }
}
