//! The three task views of a group and the cached total weight.
//!
//! Lives behind the group's `RwLock`: every mutation needs `&mut TaskSet`,
//! so membership changes are atomic with respect to readers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::task::{Task, TaskState};

pub(crate) struct TaskSet {
    pub(crate) waiting: VecDeque<Arc<Task>>,
    pub(crate) in_flight: Vec<Arc<Task>>,
    pub(crate) all: Vec<Arc<Task>>,
    total_weight: AtomicU64,
    weight_stale: AtomicBool,
}

impl Default for TaskSet {
    fn default() -> Self {
        Self {
            waiting: VecDeque::new(),
            in_flight: Vec::new(),
            all: Vec::new(),
            total_weight: AtomicU64::new(0f64.to_bits()),
            weight_stale: AtomicBool::new(false),
        }
    }
}

impl TaskSet {
    pub(crate) fn find(&self, url: &str) -> Option<&Arc<Task>> {
        self.all.iter().find(|t| t.url() == url)
    }

    /// New task: appended to *waiting* and *all*.
    pub(crate) fn insert(&mut self, task: Arc<Task>) {
        self.waiting.push_back(Arc::clone(&task));
        self.all.push(task);
        self.weight_stale.store(true, Ordering::Release);
    }

    /// Drops `task` from every view.
    pub(crate) fn remove(&mut self, task: &Arc<Task>) {
        self.waiting.retain(|t| !Arc::ptr_eq(t, task));
        self.in_flight.retain(|t| !Arc::ptr_eq(t, task));
        self.all.retain(|t| !Arc::ptr_eq(t, task));
        self.weight_stale.store(true, Ordering::Release);
    }

    pub(crate) fn is_waiting(&self, task: &Arc<Task>) -> bool {
        self.waiting.iter().any(|t| Arc::ptr_eq(t, task))
    }

    pub(crate) fn is_in_flight(&self, task: &Arc<Task>) -> bool {
        self.in_flight.iter().any(|t| Arc::ptr_eq(t, task))
    }

    /// Nothing waiting and nothing in flight.
    pub(crate) fn is_idle(&self) -> bool {
        self.waiting.is_empty() && self.in_flight.is_empty()
    }

    /// Highest state over *all* in the order `PREPARE < DOWNLOADING <
    /// SUCCESS < STOPPED < ERROR`; `PREPARE` when empty.
    pub(crate) fn group_state(&self) -> TaskState {
        self.all
            .iter()
            .map(|t| t.state())
            .max()
            .unwrap_or(TaskState::Prepare)
    }

    /// Move `task` from *waiting* to *in-flight*. False if it was not waiting.
    pub(crate) fn admit(&mut self, task: &Arc<Task>) -> bool {
        match self.waiting.iter().position(|t| Arc::ptr_eq(t, task)) {
            Some(i) => {
                if let Some(t) = self.waiting.remove(i) {
                    self.in_flight.push(t);
                }
                true
            }
            None => false,
        }
    }

    /// Remove `task` from *in-flight*. False if it was not there.
    pub(crate) fn release(&mut self, task: &Arc<Task>) -> bool {
        let before = self.in_flight.len();
        self.in_flight.retain(|t| !Arc::ptr_eq(t, task));
        self.in_flight.len() != before
    }

    /// Put `task` back at the end of *waiting* unless it is already queued.
    pub(crate) fn requeue(&mut self, task: Arc<Task>) -> bool {
        if self.is_waiting(&task) {
            return false;
        }
        self.waiting.push_back(task);
        true
    }

    /// Empty *in-flight*, returning its tasks in admission order.
    pub(crate) fn drain_in_flight(&mut self) -> Vec<Arc<Task>> {
        std::mem::take(&mut self.in_flight)
    }

    pub(crate) fn clear(&mut self) {
        self.waiting.clear();
        self.in_flight.clear();
        self.all.clear();
        self.weight_stale.store(true, Ordering::Release);
    }

    /// Sum of weights over *all*, recomputed on first read after a change.
    pub(crate) fn total_weight(&self) -> f64 {
        if self.weight_stale.swap(false, Ordering::AcqRel) {
            let sum: f64 = self.all.iter().map(|t| t.weight()).sum();
            self.total_weight.store(sum.to_bits(), Ordering::Release);
            tracing::trace!(total_weight = sum, "recomputed total weight");
            return sum;
        }
        f64::from_bits(self.total_weight.load(Ordering::Acquire))
    }

    /// Σ progress × weight / total weight over *all*; 0 when total weight is 0.
    pub(crate) fn weighted_progress(&self) -> f64 {
        let total = self.total_weight();
        if total <= 0.0 {
            return 0.0;
        }
        self.all
            .iter()
            .map(|t| t.progress() * (t.weight() / total))
            .sum()
    }
}
