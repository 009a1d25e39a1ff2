//! Parse raw response header lines into a [`ResponseHead`].

use super::ResponseHead;

/// Parsed `Content-Range: bytes start-end/total` (total `None` for `*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    /// `None` for the unsatisfied form `bytes */total`.
    pub range: Option<(u64, u64)>,
    pub total: Option<u64>,
}

impl ContentRange {
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.trim().strip_prefix("bytes")?.trim_start();
        let (span, total) = rest.split_once('/')?;
        let total = match total.trim() {
            "*" => None,
            t => Some(t.parse::<u64>().ok()?),
        };
        let range = match span.trim() {
            "*" => None,
            s => {
                let (a, b) = s.split_once('-')?;
                Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
            }
        };
        Some(ContentRange { range, total })
    }
}

/// Builds the head of the *last* response in `lines`. Redirects and
/// `100 Continue` produce several header blocks; each status line starts over.
pub fn parse_response_head(lines: &[String]) -> ResponseHead {
    let mut head = ResponseHead::default();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with("HTTP/") {
            head = ResponseHead {
                status: line
                    .split_whitespace()
                    .nth(1)
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(0),
                ..ResponseHead::default()
            };
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-length") {
                head.content_length = value.parse::<u64>().ok();
            } else if name.eq_ignore_ascii_case("content-range") {
                head.content_range = ContentRange::parse(value);
            }
        }
    }
    head
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn status_and_length() {
        let h = parse_response_head(&lines(&["HTTP/1.1 200 OK", "Content-Length: 12345", ""]));
        assert_eq!(h.status, 200);
        assert_eq!(h.content_length, Some(12345));
        assert!(h.content_range.is_none());
        assert!(h.is_success());
        assert!(!h.is_partial());
    }

    #[test]
    fn partial_content_range() {
        let h = parse_response_head(&lines(&[
            "HTTP/1.1 206 Partial Content",
            "Content-Length: 90",
            "Content-Range: bytes 10-99/100",
        ]));
        assert!(h.is_partial());
        assert_eq!(
            h.content_range,
            Some(ContentRange {
                range: Some((10, 99)),
                total: Some(100)
            })
        );
    }

    #[test]
    fn last_block_wins_after_redirect() {
        let h = parse_response_head(&lines(&[
            "HTTP/1.1 302 Found",
            "Location: /elsewhere",
            "Content-Length: 0",
            "",
            "HTTP/2 200",
            "content-length: 7",
        ]));
        assert_eq!(h.status, 200);
        assert_eq!(h.content_length, Some(7));
    }

    #[test]
    fn unsatisfied_range() {
        let r = ContentRange::parse("bytes */4096").unwrap();
        assert_eq!(r.range, None);
        assert_eq!(r.total, Some(4096));
        assert!(ContentRange::parse("items 1-2/3").is_none());
        assert_eq!(ContentRange::parse("bytes 0-0/*").unwrap().total, None);
    }
}
