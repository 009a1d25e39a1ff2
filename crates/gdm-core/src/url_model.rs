//! Local file names for URLs.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

const FALLBACK_NAME: &str = "download.bin";
const NAME_MAX: usize = 255;

/// File name to store `url` under: the last non-empty path segment,
/// percent-decoded and made safe for a Linux filesystem. Falls back to
/// `download.bin` when nothing usable remains.
pub fn file_name(url: &str) -> String {
    let segment = url::Url::parse(url).ok().and_then(|parsed| {
        parsed
            .path_segments()?
            .filter(|s| !s.is_empty())
            .last()
            .map(percent_decode)
    });
    match segment.map(|s| sanitize(&s)) {
        Some(name) if !name.is_empty() => name,
        _ => FALLBACK_NAME.to_string(),
    }
}

/// Destinations under `dir` for each URL, in order. Repeated names get a
/// `-N` suffix before the extension so two URLs never share a file.
pub fn destinations<'a>(dir: &Path, urls: impl IntoIterator<Item = &'a str>) -> Vec<PathBuf> {
    let mut taken = HashSet::new();
    urls.into_iter()
        .map(|url| {
            let base = file_name(url);
            let mut name = base.clone();
            let mut n = 1;
            while !taken.insert(name.clone()) {
                name = numbered(&base, n);
                n += 1;
            }
            dir.join(name)
        })
        .collect()
}

fn numbered(name: &str, n: usize) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}-{n}.{ext}"),
        _ => format!("{name}-{n}"),
    }
}

fn percent_decode(segment: &str) -> String {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(h), Some(l)) = (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                out.push(h << 4 | l);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

/// Replace separators, control characters and whitespace runs with a single
/// `_`, strip leading/trailing dots and underscores, cap at NAME_MAX bytes.
fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        let unsafe_char = c == '/' || c == '\\' || c.is_control() || c.is_whitespace();
        if unsafe_char {
            if !out.ends_with('_') {
                out.push('_');
            }
        } else {
            out.push(c);
        }
    }
    let trimmed = out.trim_matches(|c| c == '.' || c == '_');
    let mut end = trimmed.len().min(NAME_MAX);
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    trimmed[..end].to_string()
}
