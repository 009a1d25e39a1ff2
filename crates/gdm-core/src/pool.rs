//! Bounded worker pool with rendezvous hand-off.
//!
//! No core threads: a job is accepted only if an idle worker is waiting for
//! it or a new worker can be started below `max_workers`. Otherwise it is
//! rejected. Idle workers retire after `idle_timeout`.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::DownloadError;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    live: usize,
    idle: usize,
    queue: VecDeque<Job>,
    shutdown: bool,
    spawned: usize,
}

struct PoolShared {
    state: Mutex<PoolState>,
    work: Condvar,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    max_workers: usize,
    idle_timeout: Duration,
    name: String,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, max_workers: usize, idle_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    live: 0,
                    idle: 0,
                    queue: VecDeque::new(),
                    shutdown: false,
                    spawned: 0,
                }),
                work: Condvar::new(),
            }),
            max_workers: max_workers.max(1),
            idle_timeout,
            name: name.into(),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Worker threads currently alive (busy or idle).
    pub fn live_workers(&self) -> usize {
        self.shared.lock().live
    }

    /// Hand `job` to a worker, starting one if needed.
    pub fn execute<F>(&self, job: F) -> Result<(), DownloadError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut st = self.shared.lock();
        if st.shutdown {
            return Err(DownloadError::PoolClosed);
        }
        if st.idle > st.queue.len() {
            st.queue.push_back(Box::new(job));
            self.shared.work.notify_one();
            return Ok(());
        }
        if st.live >= self.max_workers {
            return Err(DownloadError::PoolSaturated {
                max: self.max_workers,
            });
        }
        st.live += 1;
        st.spawned += 1;
        let thread_name = format!("{}-{}", self.name, st.spawned);
        drop(st);

        let shared = Arc::clone(&self.shared);
        let idle_timeout = self.idle_timeout;
        let first: Job = Box::new(job);
        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || worker_loop(shared, first, idle_timeout))
            .map(|_| ())
            .map_err(|e| {
                self.shared.lock().live -= 1;
                DownloadError::PoolSpawn(e)
            })
    }

    /// Stop accepting jobs. Running jobs finish; idle workers exit.
    pub fn shutdown(&self) {
        let mut st = self.shared.lock();
        st.shutdown = true;
        self.shared.work.notify_all();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Decrements the live count when a worker exits, including by panic.
struct LiveGuard(Arc<PoolShared>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.lock().live -= 1;
    }
}

fn worker_loop(shared: Arc<PoolShared>, first: Job, idle_timeout: Duration) {
    let _live = LiveGuard(Arc::clone(&shared));
    let mut next = Some(first);
    while let Some(job) = next.take() {
        job();

        let mut st = shared.lock();
        st.idle += 1;
        loop {
            if let Some(job) = st.queue.pop_front() {
                next = Some(job);
                break;
            }
            if st.shutdown {
                break;
            }
            let (guard, timeout) = shared
                .work
                .wait_timeout(st, idle_timeout)
                .unwrap_or_else(PoisonError::into_inner);
            st = guard;
            if timeout.timed_out() && st.queue.is_empty() {
                tracing::trace!("idle worker retiring");
                break;
            }
        }
        st.idle -= 1;
    }
}
