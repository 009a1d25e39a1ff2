//! Batch input files: one `URL [PATH] [WEIGHT]` entry per line.
//!
//! Blank lines and lines starting with `#` are skipped. `-` as PATH keeps the
//! derived file name, so a weight can be given without a path.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub url: String,
    pub path: Option<PathBuf>,
    pub weight: Option<f64>,
}

impl Entry {
    pub fn url_only(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            path: None,
            weight: None,
        }
    }
}

pub fn read_entries(file: &Path) -> Result<Vec<Entry>> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading input file {}", file.display()))?;
    parse_entries(&text).with_context(|| format!("in {}", file.display()))
}

pub fn parse_entries(text: &str) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let entry = parse_line(line).with_context(|| format!("line {}", idx + 1))?;
        entries.push(entry);
    }
    Ok(entries)
}

fn parse_line(line: &str) -> Result<Entry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let (url, path, weight) = match fields.as_slice() {
        [url] => (*url, None, None),
        [url, path] => (*url, Some(*path), None),
        [url, path, weight] => (*url, Some(*path), Some(*weight)),
        _ => bail!("expected `URL [PATH] [WEIGHT]`, got {} fields", fields.len()),
    };
    let weight = match weight {
        Some(w) => {
            let w: f64 = w.parse().with_context(|| format!("invalid weight `{w}`"))?;
            if !(w.is_finite() && w > 0.0) {
                bail!("weight must be positive, got {w}");
            }
            Some(w)
        }
        None => None,
    };
    Ok(Entry {
        url: url.to_string(),
        path: path.filter(|p| *p != "-").map(PathBuf::from),
        weight,
    })
}
