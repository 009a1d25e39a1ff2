//! Resumable single-connection transfer.
//!
//! Order of checks: local-only shortcut, remote length probe, existing
//! destination, existing temp file, then one ranged GET from the temp length.

use std::sync::PoisonError;

use super::{Task, TaskState};
use crate::error::{DownloadError, TransportError};
use crate::storage::{self, TempFile};
use crate::transport::{BodySink, Flow, Headers, ResponseHead, Transport};

impl Task {
    /// Execute one run on the calling thread and return the state it ended in.
    ///
    /// Never returns `PREPARE` or `DOWNLOADING`. Errors are not returned:
    /// they end the run in `ERROR` and fail both channels.
    pub fn run(&self, transport: &dyn Transport, default_headers: &Headers) -> TaskState {
        self.run_admitted(self.stop_epoch(), transport, default_headers)
    }

    /// Run on behalf of an admission that observed stop epoch `epoch`. A
    /// `stop()` issued since then ends the run as `STOPPED`.
    pub(crate) fn run_admitted(
        &self,
        epoch: u64,
        transport: &dyn Transport,
        default_headers: &Headers,
    ) -> TaskState {
        let _running = self.run_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.rearm_locked();
        if self.stopped_since(epoch) {
            tracing::debug!(url = %self.url, "stop requested before transfer started");
            self.finish_stopped();
            return TaskState::Stopped;
        }

        let mut headers = default_headers.clone();
        headers.extend(self.headers());

        match self.transfer(epoch, transport, &headers) {
            Ok(TaskState::Stopped) => {
                self.finish_stopped();
                TaskState::Stopped
            }
            Ok(_) => {
                self.finish_success();
                TaskState::Success
            }
            Err(e) => {
                self.fail(e);
                TaskState::Error
            }
        }
    }

    fn transfer(
        &self,
        epoch: u64,
        transport: &dyn Transport,
        headers: &Headers,
    ) -> Result<TaskState, DownloadError> {
        let dest = self.local_path.as_path();
        let io_err = |path: &std::path::Path| {
            let path = path.to_path_buf();
            move |e| DownloadError::io(path, e)
        };

        if self.check_local_only {
            if let Some(len) = storage::file_len(dest).map_err(io_err(dest))? {
                if len > 0 {
                    tracing::debug!(url = %self.url, path = %dest.display(), "local file present, skipping network check");
                    return Ok(TaskState::Success);
                }
            }
        }

        let remote = match transport.content_length(&self.url, headers)? {
            Some(0) => {
                return Err(DownloadError::EmptyContent {
                    url: self.url.clone(),
                })
            }
            Some(n) => n,
            None => {
                return Err(DownloadError::UnknownLength {
                    url: self.url.clone(),
                })
            }
        };

        if let Some(len) = storage::file_len(dest).map_err(io_err(dest))? {
            if len == remote {
                tracing::debug!(url = %self.url, bytes = len, "destination already complete");
                return Ok(TaskState::Success);
            }
            tracing::info!(
                path = %dest.display(),
                local = len,
                remote,
                "destination length mismatch, discarding"
            );
            storage::remove_if_exists(dest).map_err(io_err(dest))?;
        }

        let temp = storage::temp_path(dest);
        let file = TempFile::open(&temp).map_err(io_err(&temp))?;
        let mut offset = file.len().map_err(io_err(&temp))?;
        if offset == remote {
            drop(file);
            tracing::debug!(url = %self.url, bytes = offset, "temp file complete, finalizing without network read");
            return self.publish_file(&temp, remote);
        }
        if offset > remote {
            tracing::warn!(
                path = %temp.display(),
                local = offset,
                remote,
                "temp file longer than remote, restarting"
            );
            file.truncate(0).map_err(io_err(&temp))?;
            offset = 0;
        }

        tracing::debug!(url = %self.url, offset, remote, "starting ranged transfer");
        let mut sink = TransferSink {
            task: self,
            epoch,
            file: &file,
            remote,
            pos: offset,
            error: None,
            range_rejected: false,
            overflow_reported: false,
        };
        let outcome = transport.fetch_from(&self.url, headers, offset, &mut sink);
        let TransferSink {
            pos,
            error,
            range_rejected,
            ..
        } = sink;
        let outcome = outcome?;

        if let Some(e) = error {
            return Err(e);
        }
        if range_rejected {
            drop(file);
            storage::remove_if_exists(&temp).map_err(io_err(&temp))?;
            return Err(TransportError::Status(416).into());
        }
        if !outcome.head.is_success() {
            return Err(TransportError::Status(outcome.head.status).into());
        }

        file.sync().map_err(io_err(&temp))?;
        if pos == remote {
            drop(file);
            return self.publish_file(&temp, remote);
        }
        if outcome.interrupted {
            tracing::info!(url = %self.url, bytes = pos, remote, "transfer stopped, temp file kept for resume");
            return Ok(TaskState::Stopped);
        }
        if pos > remote {
            tracing::error!(
                url = %self.url,
                received = pos,
                remote,
                "received more bytes than the server announced, truncating"
            );
            file.truncate(remote).map_err(io_err(&temp))?;
            drop(file);
            return self.publish_file(&temp, remote);
        }
        Err(DownloadError::PartialTransfer {
            expected: remote,
            received: pos,
        })
    }

    /// Rename the complete temp file onto the destination.
    fn publish_file(&self, temp: &std::path::Path, remote: u64) -> Result<TaskState, DownloadError> {
        storage::finalize(temp, &self.local_path).map_err(|source| DownloadError::Rename {
            from: temp.to_path_buf(),
            to: self.local_path.clone(),
            source,
        })?;
        tracing::info!(url = %self.url, path = %self.local_path.display(), bytes = remote, "download complete");
        Ok(TaskState::Success)
    }
}

/// Writes the body into the temp file and reports progress per chunk.
struct TransferSink<'a> {
    task: &'a Task,
    epoch: u64,
    file: &'a TempFile,
    remote: u64,
    /// Next write offset; equals bytes on disk.
    pos: u64,
    error: Option<DownloadError>,
    range_rejected: bool,
    overflow_reported: bool,
}

impl BodySink for TransferSink<'_> {
    fn on_head(&mut self, head: &ResponseHead) -> Flow {
        if head.status == 416 {
            self.range_rejected = true;
            return Flow::Stop;
        }
        if !head.is_success() {
            return Flow::Stop;
        }
        if self.pos > 0 && !head.is_partial() {
            tracing::warn!(
                url = %self.task.url,
                status = head.status,
                "server ignored the range request, restarting from byte 0"
            );
            if let Err(e) = self.file.truncate(0) {
                self.error = Some(DownloadError::io(self.file.path(), e));
                return Flow::Stop;
            }
            self.pos = 0;
        }
        if self.task.stopped_since(self.epoch) {
            return Flow::Stop;
        }
        self.task.set_state(TaskState::Downloading);
        Flow::Continue
    }

    fn on_data(&mut self, data: &[u8]) -> Flow {
        if self.task.stopped_since(self.epoch) {
            return Flow::Stop;
        }
        if let Err(e) = self.file.write_at(self.pos, data) {
            self.error = Some(DownloadError::io(self.file.path(), e));
            return Flow::Stop;
        }
        self.pos += data.len() as u64;

        let mut progress = self.pos as f64 / self.remote as f64 * 100.0;
        if progress > 100.0 {
            if !self.overflow_reported {
                tracing::error!(
                    url = %self.task.url,
                    progress,
                    "progress exceeds 100%, server sent more than it announced"
                );
                self.overflow_reported = true;
            }
            progress = 100.0;
        }
        self.task.set_progress(progress);
        Flow::Continue
    }
}
