//! Credit-gated admission channel.
//!
//! Submissions publish a signal into a bounded buffer; the dispatcher pulls
//! one signal per credit. A full buffer drops the signal (the task itself is
//! still in *waiting*) and raises `overflowed`. Once the buffer drains with
//! credits left over, the dispatcher is told to re-scan *waiting*, so a dropped
//! signal delays a task but never strands it.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::task::Task;

pub(crate) enum Pull {
    Task(Arc<Task>),
    /// Signals were dropped; refill from *waiting*.
    Rescan,
    /// Cancelled, or a newer session took over.
    Closed,
}

struct State {
    buffer: VecDeque<Arc<Task>>,
    credits: usize,
    session: u64,
    open: bool,
    overflowed: bool,
}

pub(crate) struct Admission {
    state: Mutex<State>,
    ready: Condvar,
    capacity: usize,
}

impl Admission {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                buffer: VecDeque::new(),
                credits: 0,
                session: 0,
                open: false,
                overflowed: false,
            }),
            ready: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a fresh session with an empty buffer and no credits.
    pub(crate) fn open(&self, session: u64) {
        let mut st = self.lock();
        st.buffer.clear();
        st.credits = 0;
        st.session = session;
        st.open = true;
        st.overflowed = false;
    }

    /// Drop buffered signals and wake the dispatcher so it exits.
    pub(crate) fn cancel(&self) {
        let mut st = self.lock();
        st.open = false;
        st.buffer.clear();
        st.credits = 0;
        self.ready.notify_all();
    }

    /// Offer a task. Returns false if the signal was dropped.
    pub(crate) fn publish(&self, task: Arc<Task>) -> bool {
        let mut st = self.lock();
        if !st.open {
            return false;
        }
        if st.buffer.len() >= self.capacity {
            st.overflowed = true;
            tracing::warn!(url = %task.url(), capacity = self.capacity, "admission buffer full, signal dropped");
            return false;
        }
        st.buffer.push_back(task);
        self.ready.notify_all();
        true
    }

    /// Refill an empty buffer from `waiting` (oldest first) up to capacity.
    pub(crate) fn refill<I>(&self, session: u64, waiting: I)
    where
        I: IntoIterator<Item = Arc<Task>>,
    {
        let mut st = self.lock();
        if !st.open || st.session != session {
            return;
        }
        let mut dropped = 0usize;
        for task in waiting {
            if st.buffer.len() < self.capacity {
                st.buffer.push_back(task);
            } else {
                dropped += 1;
            }
        }
        if dropped > 0 {
            st.overflowed = true;
            tracing::debug!(dropped, "admission buffer full during refill");
        }
        self.ready.notify_all();
    }

    /// Grant `n` more credits to `session`. Ignored for an old session.
    pub(crate) fn request(&self, session: u64, n: usize) {
        let mut st = self.lock();
        if !st.open || st.session != session {
            return;
        }
        st.credits += n;
        self.ready.notify_all();
    }

    /// Block until a credit and a signal are both available.
    pub(crate) fn next(&self, session: u64) -> Pull {
        let mut st = self.lock();
        loop {
            if !st.open || st.session != session {
                return Pull::Closed;
            }
            if st.credits > 0 {
                if let Some(task) = st.buffer.pop_front() {
                    st.credits -= 1;
                    return Pull::Task(task);
                }
                if st.overflowed {
                    st.overflowed = false;
                    return Pull::Rescan;
                }
            }
            st = self
                .ready
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    #[cfg(test)]
    pub(crate) fn credits(&self) -> usize {
        self.lock().credits
    }
}
