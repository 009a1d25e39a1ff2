//! One URL → local file transfer with its own progress and state channels.
//!
//! A task is shared as `Arc<Task>`. Its buses carry plain values; the
//! subscription helpers attach the task handle to every event. `run` executes
//! the resumable transfer on the calling thread (see `run.rs`).

mod run;
mod state;

pub use state::{TaskProgress, TaskState, TaskStateEvent};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, TryLockError, Weak};

use crate::error::DownloadError;
use crate::event::{EventBus, Notification, ObserverHandle, Subscription};
use crate::storage;
use crate::transport::Headers;

/// Called after every progress publish with the publishing task.
pub(crate) type ProgressHook = Arc<dyn Fn(&Weak<Task>, f64) + Send + Sync>;

pub struct Task {
    url: String,
    local_path: PathBuf,
    weight: f64,
    check_local_only: bool,
    state: AtomicU8,
    /// f64 bits of the last published progress.
    progress: AtomicU64,
    /// Bumped by every `stop()`. A run is stopped once this moves past the
    /// value it captured when it was admitted.
    stop_epoch: AtomicU64,
    /// Serializes runs of the same task. A run finishes (`finish_*`, `fail`)
    /// and the next one rearms only while holding it.
    run_lock: Mutex<()>,
    headers: Mutex<Headers>,
    progress_hook: Mutex<Option<ProgressHook>>,
    progress_bus: Arc<EventBus<f64>>,
    state_bus: Arc<EventBus<TaskState>>,
    this: Weak<Task>,
}

impl Task {
    /// New task in `PREPARE`. `weight` only affects aggregate progress.
    pub fn new(
        url: impl Into<String>,
        local_path: impl Into<PathBuf>,
        weight: f64,
        check_local_only: bool,
    ) -> Arc<Task> {
        let task = Arc::new_cyclic(|this| Task {
            url: url.into(),
            local_path: local_path.into(),
            weight,
            check_local_only,
            state: AtomicU8::new(TaskState::Prepare.to_u8()),
            progress: AtomicU64::new(0f64.to_bits()),
            stop_epoch: AtomicU64::new(0),
            run_lock: Mutex::new(()),
            headers: Mutex::new(Headers::new()),
            progress_hook: Mutex::new(None),
            progress_bus: Arc::new(EventBus::new()),
            state_bus: Arc::new(EventBus::new()),
            this: this.clone(),
        });
        task.state_bus.publish(TaskState::Prepare);
        task
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn check_local_only(&self) -> bool {
        self.check_local_only
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Last published progress, 0..=100.
    pub fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::Acquire))
    }

    /// Adds a request header for this task. Overrides a group default of the same name.
    pub fn add_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.headers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), value.into());
    }

    pub fn add_headers<I, K, V>(&self, headers: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut h = self.headers.lock().unwrap_or_else(PoisonError::into_inner);
        for (k, v) in headers {
            h.insert(k.into(), v.into());
        }
    }

    pub fn headers(&self) -> Headers {
        self.headers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Ask the current run to halt. Checked once per received chunk; a run
    /// started after this call is not affected.
    pub fn stop(&self) {
        self.stop_epoch.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn stop_epoch(&self) -> u64 {
        self.stop_epoch.load(Ordering::Acquire)
    }

    fn stopped_since(&self, epoch: u64) -> bool {
        self.stop_epoch() != epoch
    }

    /// Progress events for the current run; ends with the run's terminal.
    /// A late subscriber first receives the latest progress.
    pub fn progress_stream(&self) -> Subscription<TaskProgress> {
        let this = self.this.clone();
        self.progress_bus.subscribe_map(move |p| {
            this.upgrade().map(|task| TaskProgress {
                task,
                progress: *p,
            })
        })
    }

    /// State events for the current run; ends with the run's terminal.
    pub fn state_stream(&self) -> Subscription<TaskStateEvent> {
        let this = self.this.clone();
        self.state_bus
            .subscribe_map(move |s| this.upgrade().map(|task| TaskStateEvent { task, state: *s }))
    }

    /// Callback form of [`state_stream`](Self::state_stream). Runs on the
    /// publishing thread.
    pub fn observe_state<F>(&self, f: F) -> ObserverHandle
    where
        F: Fn(TaskState) + Send + Sync + 'static,
    {
        self.state_bus.observe(move |n| {
            if let Notification::Next(s) = n {
                f(*s);
            }
        })
    }

    pub(crate) fn progress_bus(&self) -> &Arc<EventBus<f64>> {
        &self.progress_bus
    }

    /// Install the hook every later progress update is reported to.
    pub(crate) fn set_progress_hook(&self, hook: ProgressHook) {
        *self
            .progress_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    /// Prepare a finished task for another run: reopens both channels and
    /// publishes `PREPARE`. Progress restarts at 0 unless a temp file holds a
    /// resumption point. No-op for a task that has not finished a run.
    ///
    /// Skipped while a run holds the task: that run finishes first, and the
    /// next run rearms before it starts.
    pub(crate) fn rearm(&self) {
        match self.run_lock.try_lock() {
            Ok(_idle) => self.rearm_locked(),
            Err(TryLockError::Poisoned(poisoned)) => {
                let _idle = poisoned.into_inner();
                self.rearm_locked();
            }
            Err(TryLockError::WouldBlock) => {
                tracing::trace!(url = %self.url, "run in progress, rearm deferred to the next run");
            }
        }
    }

    /// `rearm` for a caller that already holds `run_lock`.
    fn rearm_locked(&self) {
        if !self.state().is_finished() {
            return;
        }
        self.progress_bus.reopen();
        self.state_bus.reopen();
        if !storage::temp_path(&self.local_path).exists() {
            self.set_progress(0.0);
        }
        self.set_state(TaskState::Prepare);
    }

    fn set_state(&self, state: TaskState) {
        self.state.store(state.to_u8(), Ordering::Release);
        tracing::debug!(url = %self.url, state = %state, "task state");
        self.state_bus.publish(state);
    }

    fn set_progress(&self, progress: f64) {
        self.progress.store(progress.to_bits(), Ordering::Release);
        self.progress_bus.publish(progress);
        let hook = self
            .progress_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(&self.this, progress);
        }
    }

    fn finish_success(&self) {
        self.set_progress(100.0);
        self.set_state(TaskState::Success);
        self.progress_bus.complete();
        self.state_bus.complete();
    }

    fn finish_stopped(&self) {
        self.set_state(TaskState::Stopped);
        self.progress_bus.complete();
        self.state_bus.complete();
    }

    /// End a run that could not be started: waits for any earlier run of
    /// this task to finish, then fails the task with `err`.
    pub(crate) fn reject(&self, err: DownloadError) {
        let _running = self.run_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.rearm_locked();
        self.fail(err);
    }

    /// Moves the task to `ERROR` and terminates both channels with `err`.
    fn fail(&self, err: DownloadError) {
        tracing::warn!(url = %self.url, error = %err, "task failed");
        let err = Arc::new(err);
        self.set_state(TaskState::Error);
        self.progress_bus.fail(Arc::clone(&err));
        self.state_bus.fail(err);
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("url", &self.url)
            .field("local_path", &self.local_path)
            .field("weight", &self.weight)
            .field("state", &self.state())
            .field("progress", &self.progress())
            .finish()
    }
}
