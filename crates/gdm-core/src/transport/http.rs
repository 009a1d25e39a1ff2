//! libcurl implementation of [`Transport`].

use std::cell::{Cell, RefCell};
use std::str;
use std::time::Duration;

use super::parse::parse_response_head;
use super::{BodySink, FetchOutcome, Flow, Headers, ResponseHead, Transport};
use crate::config::GdmConfig;
use crate::error::TransportError;

/// Per-handle curl settings.
#[derive(Debug, Clone, Copy)]
pub struct CurlOptions {
    pub connect_timeout: Duration,
    /// Hard limit for the length probe.
    pub probe_timeout: Duration,
    /// Abort if throughput stays below `low_speed_limit` bytes/s for `low_speed_time`.
    pub low_speed_limit: u32,
    pub low_speed_time: Duration,
    pub buffer_size: Option<usize>,
}

impl Default for CurlOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(30),
            low_speed_limit: 1024,
            low_speed_time: Duration::from_secs(60),
            buffer_size: None,
        }
    }
}

impl CurlOptions {
    pub fn from_config(cfg: &GdmConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(cfg.connect_timeout_secs),
            low_speed_limit: cfg.low_speed_limit_bytes,
            low_speed_time: Duration::from_secs(cfg.low_speed_time_secs),
            buffer_size: cfg.buffer_size,
            ..Self::default()
        }
    }
}

/// Blocking HTTP transport backed by `curl::easy::Easy`. Each call uses its
/// own handle, so one transport can be shared by all worker threads.
#[derive(Debug, Clone, Default)]
pub struct CurlTransport {
    opts: CurlOptions,
}

impl CurlTransport {
    pub fn new(opts: CurlOptions) -> Self {
        Self { opts }
    }

    fn easy(&self, url: &str, headers: &Headers) -> Result<curl::easy::Easy, TransportError> {
        let mut easy = curl::easy::Easy::new();
        easy.url(url)?;
        easy.follow_location(true)?;
        easy.max_redirections(10)?;
        easy.connect_timeout(self.opts.connect_timeout)?;

        let mut list = curl::easy::List::new();
        for (k, v) in headers {
            list.append(&format!("{}: {}", k.trim(), v.trim()))?;
        }
        if !headers.is_empty() {
            easy.http_headers(list)?;
        }
        Ok(easy)
    }

    /// HEAD request; returns the head of the final response.
    fn head(&self, url: &str, headers: &Headers) -> Result<ResponseHead, TransportError> {
        let mut lines: Vec<String> = Vec::new();
        let mut easy = self.easy(url, headers)?;
        easy.nobody(true)?;
        easy.timeout(self.opts.probe_timeout)?;
        {
            let mut transfer = easy.transfer();
            transfer.header_function(|data| {
                if let Ok(s) = str::from_utf8(data) {
                    lines.push(s.trim_end().to_string());
                }
                true
            })?;
            transfer.perform()?;
        }
        let mut head = parse_response_head(&lines);
        if head.status == 0 {
            head.status = easy.response_code()?;
        }
        Ok(head)
    }

    /// Fallback for servers that reject HEAD: GET the first byte and read the
    /// total from `Content-Range`.
    fn range_probe(&self, url: &str, headers: &Headers) -> Result<Option<u64>, TransportError> {
        struct FirstByte;
        impl BodySink for FirstByte {
            fn on_head(&mut self, _head: &ResponseHead) -> Flow {
                Flow::Continue
            }
            fn on_data(&mut self, _data: &[u8]) -> Flow {
                Flow::Stop
            }
        }
        let mut easy = self.easy(url, headers)?;
        easy.range("0-0")?;
        easy.timeout(self.opts.probe_timeout)?;
        let outcome = self.stream(easy, &mut FirstByte)?;
        let head = outcome.head;
        if !head.is_success() {
            return Err(TransportError::Status(head.status));
        }
        Ok(match head.content_range {
            Some(range) => range.total,
            // Range ignored: a plain 200 carries the full length.
            None if head.status == 200 => head.content_length,
            None => None,
        })
    }

    fn stream(
        &self,
        mut easy: curl::easy::Easy,
        sink: &mut dyn BodySink,
    ) -> Result<FetchOutcome, TransportError> {
        let lines: RefCell<Vec<String>> = RefCell::new(Vec::new());
        let head: RefCell<Option<ResponseHead>> = RefCell::new(None);
        let interrupted = Cell::new(false);

        let performed = {
            let mut transfer = easy.transfer();
            transfer.header_function(|data| {
                if let Ok(s) = str::from_utf8(data) {
                    lines.borrow_mut().push(s.trim_end().to_string());
                }
                true
            })?;
            transfer.write_function(|data| {
                if head.borrow().is_none() {
                    let parsed = parse_response_head(&lines.borrow());
                    let flow = sink.on_head(&parsed);
                    *head.borrow_mut() = Some(parsed);
                    if flow == Flow::Stop {
                        interrupted.set(true);
                        return Ok(0);
                    }
                }
                match sink.on_data(data) {
                    Flow::Continue => Ok(data.len()),
                    Flow::Stop => {
                        interrupted.set(true);
                        Ok(0)
                    }
                }
            })?;
            transfer.perform()
        };

        if let Err(e) = performed {
            if !(e.is_write_error() && interrupted.get()) {
                return Err(TransportError::Curl(e));
            }
        }

        let head = match head.into_inner() {
            Some(h) => h,
            None => {
                // Empty body: the sink has not seen the head yet.
                let mut parsed = parse_response_head(&lines.borrow());
                if parsed.status == 0 {
                    parsed.status = easy.response_code()?;
                }
                sink.on_head(&parsed);
                parsed
            }
        };
        Ok(FetchOutcome {
            head,
            interrupted: interrupted.get(),
        })
    }
}

impl Transport for CurlTransport {
    fn content_length(&self, url: &str, headers: &Headers) -> Result<Option<u64>, TransportError> {
        let head = self.head(url, headers)?;
        match head.status {
            200..=299 => Ok(head.content_length),
            405 | 501 => {
                tracing::debug!(url, status = head.status, "HEAD rejected, probing with a 1-byte range");
                self.range_probe(url, headers)
            }
            code => Err(TransportError::Status(code)),
        }
    }

    fn fetch_from(
        &self,
        url: &str,
        headers: &Headers,
        offset: u64,
        sink: &mut dyn BodySink,
    ) -> Result<FetchOutcome, TransportError> {
        let mut easy = self.easy(url, headers)?;
        // curl sends this as `Range: bytes=<offset>-`.
        easy.range(&format!("{offset}-"))?;
        easy.low_speed_limit(self.opts.low_speed_limit)?;
        easy.low_speed_time(self.opts.low_speed_time)?;
        if let Some(sz) = self.opts.buffer_size {
            easy.buffer_size(sz)?;
        }
        self.stream(easy, sink)
    }
}
