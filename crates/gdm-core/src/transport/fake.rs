//! In-memory [`Transport`] for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use super::{BodySink, ContentRange, FetchOutcome, Flow, Headers, ResponseHead, Transport};
use crate::error::TransportError;

/// Blocks transfers until opened.
#[derive(Default)]
pub(crate) struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cv.wait(open).unwrap();
        }
    }
}

#[derive(Clone)]
pub(crate) struct FakeFile {
    pub body: Vec<u8>,
    /// Length returned by the probe; defaults to `body.len()`.
    pub reported_len: Option<Option<u64>>,
    pub honor_range: bool,
    pub chunk: usize,
    pub chunk_delay: Duration,
    pub gate: Option<Arc<Gate>>,
}

impl FakeFile {
    pub(crate) fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            reported_len: None,
            honor_range: true,
            chunk: 256,
            chunk_delay: Duration::ZERO,
            gate: None,
        }
    }

    pub(crate) fn slow(mut self, chunk: usize, delay: Duration) -> Self {
        self.chunk = chunk;
        self.chunk_delay = delay;
        self
    }

    pub(crate) fn gated(mut self, gate: &Arc<Gate>) -> Self {
        self.gate = Some(Arc::clone(gate));
        self
    }

    pub(crate) fn reporting(mut self, len: Option<u64>) -> Self {
        self.reported_len = Some(len);
        self
    }

    pub(crate) fn ignoring_range(mut self) -> Self {
        self.honor_range = false;
        self
    }
}

#[derive(Default)]
pub(crate) struct FakeTransport {
    files: Mutex<HashMap<String, FakeFile>>,
    probes: AtomicUsize,
    fetch_log: Mutex<Vec<(String, u64)>>,
    accepted: Mutex<HashMap<String, u64>>,
    last_headers: Mutex<Option<Headers>>,
}

pub(crate) fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn serve(&self, url: &str, file: FakeFile) {
        self.files.lock().unwrap().insert(url.to_string(), file);
    }

    pub(crate) fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// `(url, offset)` for every ranged request, in order.
    pub(crate) fn fetches(&self) -> Vec<(String, u64)> {
        self.fetch_log.lock().unwrap().clone()
    }

    /// Body bytes the sink accepted for `url`, over all requests.
    pub(crate) fn accepted(&self, url: &str) -> u64 {
        self.accepted.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub(crate) fn last_headers(&self) -> Option<Headers> {
        self.last_headers.lock().unwrap().clone()
    }

    fn file(&self, url: &str) -> Option<FakeFile> {
        self.files.lock().unwrap().get(url).cloned()
    }
}

impl Transport for FakeTransport {
    fn content_length(&self, url: &str, headers: &Headers) -> Result<Option<u64>, TransportError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        *self.last_headers.lock().unwrap() = Some(headers.clone());
        let file = self.file(url).ok_or(TransportError::Status(404))?;
        Ok(file
            .reported_len
            .unwrap_or(Some(file.body.len() as u64)))
    }

    fn fetch_from(
        &self,
        url: &str,
        headers: &Headers,
        offset: u64,
        sink: &mut dyn BodySink,
    ) -> Result<FetchOutcome, TransportError> {
        self.fetch_log.lock().unwrap().push((url.to_string(), offset));
        *self.last_headers.lock().unwrap() = Some(headers.clone());
        let Some(file) = self.file(url) else {
            let head = ResponseHead {
                status: 404,
                ..ResponseHead::default()
            };
            sink.on_head(&head);
            return Ok(FetchOutcome {
                head,
                interrupted: true,
            });
        };
        if let Some(gate) = &file.gate {
            gate.wait();
        }

        let len = file.body.len() as u64;
        let (head, start) = if file.honor_range && offset > 0 {
            if offset >= len {
                let head = ResponseHead {
                    status: 416,
                    content_length: None,
                    content_range: Some(ContentRange {
                        range: None,
                        total: Some(len),
                    }),
                };
                sink.on_head(&head);
                return Ok(FetchOutcome {
                    head,
                    interrupted: true,
                });
            }
            (
                ResponseHead {
                    status: 206,
                    content_length: Some(len - offset),
                    content_range: Some(ContentRange {
                        range: Some((offset, len - 1)),
                        total: Some(len),
                    }),
                },
                offset,
            )
        } else {
            (
                ResponseHead {
                    status: 200,
                    content_length: Some(len),
                    content_range: None,
                },
                0,
            )
        };

        if sink.on_head(&head) == Flow::Stop {
            return Ok(FetchOutcome {
                head,
                interrupted: true,
            });
        }
        for chunk in file.body[start as usize..].chunks(file.chunk.max(1)) {
            if !file.chunk_delay.is_zero() {
                std::thread::sleep(file.chunk_delay);
            }
            if sink.on_data(chunk) == Flow::Stop {
                return Ok(FetchOutcome {
                    head,
                    interrupted: true,
                });
            }
            *self
                .accepted
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_insert(0) += chunk.len() as u64;
        }
        Ok(FetchOutcome {
            head,
            interrupted: false,
        })
    }
}
