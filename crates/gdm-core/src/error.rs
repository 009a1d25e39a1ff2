//! Error taxonomy for transfers and the group registry.
//!
//! Task-level failures (`DownloadError`) travel on the task's progress and
//! state channels and never abort sibling tasks. Registry-level errors
//! (`GroupError`) are returned to the caller of the registry operation.

use std::path::PathBuf;

/// Failure talking to the remote server.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// libcurl reported an error (connect, DNS, timeout, aborted write...).
    #[error("{0}")]
    Curl(#[from] curl::Error),
    /// Server answered with a non-2xx status.
    #[error("HTTP {0}")]
    Status(u32),
    /// Response could not be interpreted.
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Why a single task run ended in `ERROR`.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    /// Length probe returned 0; nothing to download.
    #[error("server reported empty content for {url}")]
    EmptyContent { url: String },
    /// Length probe did not yield a usable Content-Length.
    #[error("server did not report a content length for {url}")]
    UnknownLength { url: String },
    /// Body ended before the remote length was reached and no stop was requested.
    #[error("partial transfer: expected {expected} bytes, got {received}")]
    PartialTransfer { expected: u64, received: u64 },
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Atomic finalize failed; the temp file is left in place.
    #[error("failed to rename {} to {}: {source}", from.display(), to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Worker pool had no free slot for this task.
    #[error("worker pool saturated ({max} threads busy)")]
    PoolSaturated { max: usize },
    #[error("failed to spawn worker thread: {0}")]
    PoolSpawn(#[source] std::io::Error),
    /// The owning group was destroyed before the task could run.
    #[error("worker pool is shut down")]
    PoolClosed,
}

impl DownloadError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DownloadError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors returned by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("invalid task: {0}")]
    InvalidTask(String),
    #[error("group has been destroyed")]
    Destroyed,
    /// A thread panicked while holding the registry lock.
    #[error("task registry lock poisoned")]
    LockPoisoned,
    #[error("failed to start group thread: {0}")]
    Thread(#[source] std::io::Error),
}

/// Errors from the process-wide group handle.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("a group with key `{0}` already exists")]
    DuplicateGroup(String),
}
