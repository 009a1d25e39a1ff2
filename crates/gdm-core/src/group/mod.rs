//! Task registry: a bounded-concurrency batch of downloads.
//!
//! Submission records a task in *waiting* and *all* and signals the admission
//! queue. Once started, a dispatcher thread pulls one signal per credit, moves
//! the task to *in-flight* and hands its run to the worker pool; each finished
//! run returns one credit. `limit` credits exist per session, so at most
//! `limit` tasks are admitted at a time.
//!
//! Lock order: lifecycle mutex, state gate, task-set `RwLock`, sampler list.
//! Bus callbacks are never invoked while the task-set lock is held.

mod admission;
mod progress;
mod tasks;


pub use progress::GroupProgress;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::JoinHandle;

use admission::{Admission, Pull};
use progress::ProgressSampler;
use tasks::TaskSet;

use crate::config::GroupConfig;
use crate::error::GroupError;
use crate::event::{EventBus, Notification, ObserverHandle, Subscription};
use crate::pool::WorkerPool;
use crate::task::{Task, TaskState};
use crate::transport::{CurlTransport, Transport};

#[derive(Default)]
struct Lifecycle {
    dispatcher: Option<JoinHandle<()>>,
}

pub(crate) struct GroupInner {
    config: GroupConfig,
    transport: Arc<dyn Transport>,
    tasks: RwLock<TaskSet>,
    admission: Admission,
    pool: WorkerPool,
    lifecycle: Mutex<Lifecycle>,
    /// Bumped by every start and stop, always under the task-set write lock.
    /// Credits and completions from an older session are ignored.
    session: AtomicU64,
    started: AtomicBool,
    destroyed: AtomicBool,
    samplers: Mutex<Vec<ProgressSampler>>,
    state_bus: Arc<EventBus<TaskState>>,
    /// Serializes computing and publishing the group state.
    state_gate: Mutex<()>,
}

/// A batch of downloads sharing one concurrency limit and one weighted
/// progress view. Dropping the group destroys it.
pub struct DownloadGroup {
    inner: Arc<GroupInner>,
}

impl DownloadGroup {
    /// Group with default settings and the libcurl transport.
    pub fn new(limit: usize) -> Self {
        Self::with_transport(GroupConfig::new(limit), Arc::new(CurlTransport::default()))
    }

    pub fn with_transport(config: GroupConfig, transport: Arc<dyn Transport>) -> Self {
        let limit = config.limit.max(1);
        let pool = WorkerPool::new("gdm-worker", limit * 2, config.worker_idle_timeout);
        let admission = Admission::new(config.admission_buffer);
        let group = Self {
            inner: Arc::new(GroupInner {
                config: GroupConfig { limit, ..config },
                transport,
                tasks: RwLock::new(TaskSet::default()),
                admission,
                pool,
                lifecycle: Mutex::new(Lifecycle::default()),
                session: AtomicU64::new(0),
                started: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                samplers: Mutex::new(Vec::new()),
                state_bus: Arc::new(EventBus::new()),
                state_gate: Mutex::new(()),
            }),
        };
        group.inner.state_bus.publish(TaskState::Prepare);
        group
    }

    pub fn limit(&self) -> usize {
        self.inner.config.limit
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    pub fn submit(
        &self,
        url: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> Result<Arc<Task>, GroupError> {
        self.submit_with(url, local_path, 1.0, false)
    }

    pub fn submit_weighted(
        &self,
        url: impl Into<String>,
        local_path: impl Into<PathBuf>,
        weight: f64,
    ) -> Result<Arc<Task>, GroupError> {
        self.submit_with(url, local_path, weight, false)
    }

    /// Submit a task that counts as complete whenever the destination exists
    /// with non-zero length, without asking the server.
    pub fn submit_local_only(
        &self,
        url: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> Result<Arc<Task>, GroupError> {
        self.submit_with(url, local_path, 1.0, true)
    }

    /// Add a download, deduplicated by URL.
    ///
    /// Returns the existing task for a known URL. A task that finished but
    /// whose file has since disappeared is replaced by a new one. A stopped
    /// or failed task that is not queued is reset and queued again.
    pub fn submit_with(
        &self,
        url: impl Into<String>,
        local_path: impl Into<PathBuf>,
        weight: f64,
        check_local_only: bool,
    ) -> Result<Arc<Task>, GroupError> {
        let url = url.into();
        let local_path = local_path.into();
        if url.trim().is_empty() {
            return Err(GroupError::InvalidTask("empty url".into()));
        }
        if local_path.as_os_str().is_empty() {
            return Err(GroupError::InvalidTask(format!("empty local path for {url}")));
        }
        if !(weight.is_finite() && weight > 0.0) {
            return Err(GroupError::InvalidTask(format!(
                "weight must be positive, got {weight} for {url}"
            )));
        }
        if self.is_destroyed() {
            return Err(GroupError::Destroyed);
        }

        enum Outcome {
            Existing(Arc<Task>),
            Requeued(Arc<Task>),
            Created(Arc<Task>),
        }

        let outcome = {
            let mut set = self.inner.write_tasks()?;
            let existing = set.find(&url).cloned();
            match existing {
                Some(task)
                    if task.state() == TaskState::Success && !task.local_path().exists() =>
                {
                    tracing::info!(url = %url, "finished file is missing, replacing task");
                    set.remove(&task);
                    let task = self.new_task(url, local_path, weight, check_local_only);
                    set.insert(Arc::clone(&task));
                    Outcome::Created(task)
                }
                Some(task)
                    if matches!(task.state(), TaskState::Stopped | TaskState::Error)
                        && !set.is_waiting(&task)
                        && !set.is_in_flight(&task) =>
                {
                    set.requeue(Arc::clone(&task));
                    Outcome::Requeued(task)
                }
                Some(task) => Outcome::Existing(task),
                None => {
                    let task = self.new_task(url, local_path, weight, check_local_only);
                    set.insert(Arc::clone(&task));
                    Outcome::Created(task)
                }
            }
        };

        match outcome {
            Outcome::Existing(task) => {
                tracing::debug!(url = %task.url(), "task already submitted");
                Ok(task)
            }
            Outcome::Requeued(task) => {
                task.rearm();
                tracing::info!(url = %task.url(), "requeued stopped/failed task");
                self.inner.admission.publish(Arc::clone(&task));
                Ok(task)
            }
            Outcome::Created(task) => {
                tracing::debug!(url = %task.url(), path = %task.local_path().display(), weight, "task submitted");
                // Dropped while stopped; `start` seeds from *waiting*.
                self.inner.admission.publish(Arc::clone(&task));
                Ok(task)
            }
        }
    }

    /// New task reporting its progress to this group's aggregate streams.
    fn new_task(&self, url: String, local_path: PathBuf, weight: f64, check_local_only: bool) -> Arc<Task> {
        let task = Task::new(url, local_path, weight, check_local_only);
        task.set_progress_hook(progress::progress_hook(&self.inner));
        task
    }

    /// Begin admitting tasks. No-op while started or after destroy.
    pub fn start(&self) -> Result<(), GroupError> {
        let mut life = self.inner.lock_lifecycle();
        if self.is_destroyed() || self.is_started() {
            return Ok(());
        }
        let inner = &self.inner;
        let session = inner.session.load(Ordering::Acquire) + 1;
        // Open before the snapshot: a concurrent submit is either in the
        // snapshot or publishes into the open session.
        inner.admission.open(session);

        let seed: Vec<Arc<Task>> = {
            let mut set = match inner.write_tasks() {
                Ok(set) => set,
                Err(e) => {
                    inner.admission.cancel();
                    return Err(e);
                }
            };
            inner.session.store(session, Ordering::Release);
            let orphans: Vec<Arc<Task>> = set
                .all
                .iter()
                .filter(|t| matches!(t.state(), TaskState::Stopped | TaskState::Error))
                .filter(|t| !set.is_waiting(t) && !set.is_in_flight(t))
                .cloned()
                .collect();
            for t in orphans {
                set.requeue(t);
            }
            set.waiting.iter().cloned().collect()
        };
        for task in &seed {
            task.rearm();
        }
        let waiting = seed.len();
        inner.admission.refill(session, seed);
        inner.admission.request(session, inner.config.limit);

        let dispatcher = Arc::clone(inner);
        let handle = std::thread::Builder::new()
            .name("gdm-dispatch".into())
            .spawn(move || dispatch(dispatcher, session))
            .map_err(|e| {
                inner.admission.cancel();
                GroupError::Thread(e)
            })?;
        life.dispatcher = Some(handle);
        inner.started.store(true, Ordering::Release);
        tracing::info!(limit = inner.config.limit, waiting, "group started");
        Ok(())
    }

    /// Stop admitting, stop in-flight tasks and put every unfinished one back
    /// in *waiting*. A later `start` resumes them. Idempotent.
    pub fn stop_group(&self) -> Result<(), GroupError> {
        let mut life = self.inner.lock_lifecycle();
        self.inner.stop_locked(&mut life)
    }

    /// Stop, then forget every task. The group cannot be restarted.
    pub fn destroy_group(&self) -> Result<(), GroupError> {
        let mut life = self.inner.lock_lifecycle();
        let stopped = self.inner.stop_locked(&mut life);
        let mut set = self.inner.tasks.write().unwrap_or_else(|poisoned| {
            tracing::error!("task registry lock poisoned, clearing anyway");
            poisoned.into_inner()
        });
        set.clear();
        drop(set);
        if !self.inner.destroyed.swap(true, Ordering::AcqRel) {
            self.inner.pool.shutdown();
            self.inner.state_bus.complete();
            tracing::info!("group destroyed");
        }
        stopped
    }

    pub fn find_by_url(&self, url: &str) -> Option<Arc<Task>> {
        self.inner.read_tasks().find(url).cloned()
    }

    /// Weighted average progress over *all* in percent; 0 if the group is empty.
    pub fn total_progress(&self) -> f64 {
        self.inner.total_progress()
    }

    /// Highest state over *all* (`PREPARE < DOWNLOADING < SUCCESS < STOPPED
    /// < ERROR`); `PREPARE` for an empty group.
    pub fn state(&self) -> TaskState {
        self.inner.read_tasks().group_state()
    }

    /// Group state changes: `PREPARE` at creation, `DOWNLOADING` when a task
    /// is admitted, the highest task state when *in-flight* drains, and
    /// `STOPPED` when the group is stopped with tasks in flight. A late
    /// subscriber first receives the latest state. Completes on destroy.
    pub fn state_stream(&self) -> Subscription<TaskState> {
        self.inner.state_bus.subscribe()
    }

    /// Callback form of [`state_stream`](Self::state_stream). Runs on the
    /// publishing thread and must not start, stop or destroy the group.
    pub fn observe_state<F>(&self, f: F) -> ObserverHandle
    where
        F: Fn(TaskState) + Send + Sync + 'static,
    {
        self.inner.state_bus.observe(move |n| {
            if let Notification::Next(s) = n {
                f(*s);
            }
        })
    }

    /// Sampled aggregate progress over every task of the group, including
    /// tasks submitted after the call.
    pub fn total_progress_stream(&self) -> Result<Subscription<GroupProgress>, GroupError> {
        progress::total_progress_stream(&self.inner)
    }

    /// True if every task in *all* is in `SUCCESS` (vacuously true when empty).
    pub fn is_all_successful(&self) -> bool {
        self.inner
            .read_tasks()
            .all
            .iter()
            .all(|t| t.state() == TaskState::Success)
    }

    pub fn waiting_tasks(&self) -> Vec<Arc<Task>> {
        self.inner.read_tasks().waiting.iter().cloned().collect()
    }

    pub fn in_flight_tasks(&self) -> Vec<Arc<Task>> {
        self.inner.read_tasks().in_flight.clone()
    }

    pub fn all_tasks(&self) -> Vec<Arc<Task>> {
        self.inner.read_tasks().all.clone()
    }
}

impl std::fmt::Debug for DownloadGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set = self.inner.read_tasks();
        f.debug_struct("DownloadGroup")
            .field("limit", &self.limit())
            .field("started", &self.is_started())
            .field("destroyed", &self.is_destroyed())
            .field("waiting", &set.waiting.len())
            .field("in_flight", &set.in_flight.len())
            .field("all", &set.all.len())
            .finish()
    }
}

impl Drop for DownloadGroup {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_group() {
            tracing::warn!(error = %e, "destroying group on drop");
        }
    }
}

impl GroupInner {
    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_samplers(&self) -> MutexGuard<'_, Vec<ProgressSampler>> {
        self.samplers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Let every aggregate stream emit its last sample and complete. Called
    /// with the task-set write lock held, once nothing is waiting or in flight.
    fn close_samplers(&self) {
        let mut samplers = self.lock_samplers();
        if !samplers.is_empty() {
            tracing::debug!(streams = samplers.len(), "group drained, closing aggregate progress streams");
        }
        for sampler in samplers.drain(..) {
            sampler.close();
        }
    }

    fn publish_state(&self, state: TaskState) {
        if self.state_bus.latest() != Some(state) {
            tracing::debug!(state = %state, "group state");
            self.state_bus.publish(state);
        }
    }

    /// Publish `DOWNLOADING` while anything is in flight, otherwise the
    /// highest task state. Skipped once `session` has ended.
    fn refresh_state(&self, session: u64) {
        let _gate = self.state_gate.lock().unwrap_or_else(PoisonError::into_inner);
        if self.session.load(Ordering::Acquire) != session {
            return;
        }
        let state = {
            let set = self.read_tasks();
            if set.in_flight.is_empty() {
                set.group_state()
            } else {
                TaskState::Downloading
            }
        };
        self.publish_state(state);
    }

    /// Shared view of the task set. A poisoned lock still yields a snapshot.
    pub(crate) fn read_tasks(&self) -> RwLockReadGuard<'_, TaskSet> {
        self.tasks.read().unwrap_or_else(|poisoned| {
            tracing::warn!("task registry lock poisoned, reading anyway");
            poisoned.into_inner()
        })
    }

    fn write_tasks(&self) -> Result<RwLockWriteGuard<'_, TaskSet>, GroupError> {
        self.tasks.write().map_err(|_| {
            tracing::error!("task registry lock poisoned");
            GroupError::LockPoisoned
        })
    }

    /// Write access for worker-side bookkeeping, which has no caller to report to.
    fn write_tasks_logged(&self) -> RwLockWriteGuard<'_, TaskSet> {
        self.tasks.write().unwrap_or_else(|poisoned| {
            tracing::error!("task registry lock poisoned, continuing");
            poisoned.into_inner()
        })
    }

    fn total_progress(&self) -> f64 {
        self.read_tasks().weighted_progress()
    }

    fn stop_locked(&self, life: &mut Lifecycle) -> Result<(), GroupError> {
        self.admission.cancel();
        if let Some(handle) = life.dispatcher.take() {
            if handle.join().is_err() {
                tracing::error!("dispatcher thread panicked");
            }
        }

        let gate = self.state_gate.lock().unwrap_or_else(PoisonError::into_inner);
        let result = self.write_tasks().map(|mut set| {
            self.session.fetch_add(1, Ordering::AcqRel);
            let stopped = set.drain_in_flight();
            let had_in_flight = !stopped.is_empty();
            let mut requeued = 0usize;
            for task in stopped.into_iter().rev() {
                task.stop();
                if task.state() != TaskState::Success && !set.is_waiting(&task) {
                    set.waiting.push_front(task);
                    requeued += 1;
                }
            }
            (requeued, had_in_flight)
        });
        if let Ok((_, true)) = &result {
            self.publish_state(TaskState::Stopped);
        }
        drop(gate);

        for sampler in self.lock_samplers().drain(..) {
            sampler.cancel();
        }

        let was_started = self.started.swap(false, Ordering::AcqRel);
        match result {
            Ok((requeued, _)) => {
                if was_started {
                    tracing::info!(requeued, "group stopped");
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Move a pulled task to *in-flight* and hand its run to the pool.
    fn admit(self: &Arc<Self>, session: u64, task: Arc<Task>) {
        let epoch = {
            let mut set = self.write_tasks_logged();
            if self.session.load(Ordering::Acquire) != session {
                return;
            }
            if !set.admit(&task) {
                drop(set);
                tracing::trace!(url = %task.url(), "stale admission signal skipped");
                self.admission.request(session, 1);
                return;
            }
            // stop_group stops in-flight tasks under this lock
            task.stop_epoch()
        };
        tracing::debug!(url = %task.url(), "task admitted");
        self.refresh_state(session);

        let inner = Arc::clone(self);
        let job_task = Arc::clone(&task);
        let submitted = self.pool.execute(move || {
            if inner.session.load(Ordering::Acquire) != session {
                return;
            }
            let state = job_task.run_admitted(
                epoch,
                inner.transport.as_ref(),
                &inner.config.default_headers,
            );
            inner.on_task_finished(session, &job_task, state);
        });

        if let Err(e) = submitted {
            tracing::warn!(url = %task.url(), error = %e, "worker pool rejected task");
            {
                let mut set = self.write_tasks_logged();
                if self.session.load(Ordering::Acquire) == session {
                    set.release(&task);
                    if set.is_idle() {
                        self.close_samplers();
                    }
                }
            }
            task.reject(e);
            self.admission.request(session, 1);
            self.refresh_state(session);
        }
    }

    /// Completion hook run on the worker after `Task::run` returns.
    fn on_task_finished(&self, session: u64, task: &Arc<Task>, state: TaskState) {
        {
            let mut set = self.write_tasks_logged();
            if self.session.load(Ordering::Acquire) != session {
                // stop_group already moved it back to *waiting*.
                return;
            }
            set.release(task);
            if set.is_idle() {
                self.close_samplers();
            }
        }
        tracing::debug!(url = %task.url(), state = %state, "task finished, releasing credit");
        self.admission.request(session, 1);
        self.refresh_state(session);
    }
}

/// Dispatcher loop for one session. Exits when the admission queue closes.
fn dispatch(inner: Arc<GroupInner>, session: u64) {
    loop {
        match inner.admission.next(session) {
            Pull::Task(task) => inner.admit(session, task),
            Pull::Rescan => {
                let waiting: Vec<Arc<Task>> = inner.read_tasks().waiting.iter().cloned().collect();
                tracing::debug!(waiting = waiting.len(), "re-scanning waiting tasks after dropped signals");
                inner.admission.refill(session, waiting);
            }
            Pull::Closed => break,
        }
    }
    tracing::trace!(session, "dispatcher exiting");
}
