//! HTTP collaborator used by the transfer state machine.
//!
//! Two operations: a length probe and a ranged streaming GET (`Range: bytes=N-`)
//! that pushes the body into a [`BodySink`]. The sink can stop the transfer
//! between chunks, which is how cooperative cancellation reaches the network.

#[cfg(test)]
pub(crate) mod fake;
mod http;
mod parse;

pub use http::{CurlOptions, CurlTransport};
pub use parse::{parse_response_head, ContentRange};

use crate::error::TransportError;
use std::collections::HashMap;

/// Request headers, name -> value.
pub type Headers = HashMap<String, String>;

/// Returned by a sink to continue or abort the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Status line and length-related headers of the final response (after redirects).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u32,
    pub content_length: Option<u64>,
    pub content_range: Option<ContentRange>,
}

impl ResponseHead {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// True if the server honoured the range request.
    pub fn is_partial(&self) -> bool {
        self.status == 206 && self.content_range.is_some()
    }
}

/// Receives a streamed response. `on_head` is called once before any body byte.
pub trait BodySink {
    fn on_head(&mut self, head: &ResponseHead) -> Flow;
    fn on_data(&mut self, data: &[u8]) -> Flow;
}

/// How a ranged fetch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub head: ResponseHead,
    /// The sink returned `Flow::Stop` and the transfer was cut short.
    pub interrupted: bool,
}

pub trait Transport: Send + Sync {
    /// Remote size in bytes, if the server reports one.
    fn content_length(&self, url: &str, headers: &Headers) -> Result<Option<u64>, TransportError>;

    /// GET `url` from byte `offset` to the end, streaming the body into `sink`.
    /// Non-2xx statuses are not errors here; the caller inspects `head.status`.
    fn fetch_from(
        &self,
        url: &str,
        headers: &Headers,
        offset: u64,
        sink: &mut dyn BodySink,
    ) -> Result<FetchOutcome, TransportError>;
}
