//! Push-based, multi-subscriber notification channel.
//!
//! A bus delivers `Next` values to every observer in publish order until a
//! terminal `Completed` or `Failed` arrives, after which the observer list is
//! dropped and further publishes are ignored. A task reopens its buses when it
//! starts a new run.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::error::DownloadError;

/// One item on a bus.
#[derive(Debug, Clone)]
pub enum Notification<T> {
    Next(T),
    Completed,
    Failed(Arc<DownloadError>),
}

impl<T> Notification<T> {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Notification::Next(_))
    }
}

type Observer<T> = Arc<dyn Fn(&Notification<T>) + Send + Sync>;

struct BusState<T> {
    observers: Vec<(u64, Observer<T>)>,
    latest: Option<T>,
    terminal: Option<Notification<T>>,
    next_id: u64,
}

pub struct EventBus<T> {
    state: Mutex<BusState<T>>,
}

impl<T: Clone + Send + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> EventBus<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BusState {
                observers: Vec::new(),
                latest: None,
                terminal: None,
                next_id: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState<T>> {
        // Observers never panic while holding this lock in our own code; a
        // poisoned bus still has consistent data.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver `value` to every observer. Ignored once the bus has terminated.
    pub fn publish(&self, value: T) {
        let mut state = self.lock();
        if state.terminal.is_some() {
            return;
        }
        let n = Notification::Next(value.clone());
        state.latest = Some(value);
        for (_, observer) in &state.observers {
            observer(&n);
        }
    }

    pub fn complete(&self) {
        self.terminate(Notification::Completed);
    }

    pub fn fail(&self, err: Arc<DownloadError>) {
        self.terminate(Notification::Failed(err));
    }

    fn terminate(&self, n: Notification<T>) {
        let mut state = self.lock();
        if state.terminal.is_some() {
            return;
        }
        for (_, observer) in &state.observers {
            observer(&n);
        }
        state.observers.clear();
        state.terminal = Some(n);
    }

    /// Make a terminated bus usable again for a new run. The latest value is kept.
    pub fn reopen(&self) {
        self.lock().terminal = None;
    }

    pub fn is_terminated(&self) -> bool {
        self.lock().terminal.is_some()
    }

    pub fn latest(&self) -> Option<T> {
        self.lock().latest.clone()
    }

    pub fn observer_count(&self) -> usize {
        self.lock().observers.len()
    }

    /// Register a callback. It immediately receives the latest value (if any)
    /// and, on a terminated bus, the terminal notification.
    ///
    /// Callbacks run on the publishing thread with the bus locked: they must
    /// not publish to or subscribe on the same bus.
    pub fn observe<F>(self: &Arc<Self>, f: F) -> ObserverHandle
    where
        F: Fn(&Notification<T>) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        if let Some(v) = &state.latest {
            f(&Notification::Next(v.clone()));
        }
        if let Some(t) = &state.terminal {
            f(t);
            return ObserverHandle::detached();
        }
        let id = state.next_id;
        state.next_id += 1;
        state.observers.push((id, Arc::new(f)));
        let bus: Weak<EventBus<T>> = Arc::downgrade(self);
        ObserverHandle {
            detach: Some(Box::new(move || {
                if let Some(bus) = bus.upgrade() {
                    bus.lock().observers.retain(|(i, _)| *i != id);
                }
            })),
        }
    }

    /// Channel-backed subscription, usable from threads or async code.
    pub fn subscribe(self: &Arc<Self>) -> Subscription<T> {
        self.subscribe_map(|v| Some(v.clone()))
    }

    /// Like [`subscribe`](Self::subscribe), converting each `Next` value.
    /// Values mapped to `None` are skipped; terminals pass through.
    pub fn subscribe_map<U, F>(self: &Arc<Self>, map: F) -> Subscription<U>
    where
        U: Send + 'static,
        F: Fn(&T) -> Option<U> + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let doorbell = Arc::new(Doorbell::default());
        let ring = Arc::clone(&doorbell);
        let handle = self.observe(move |n| {
            let mapped = match n {
                Notification::Next(v) => match map(v) {
                    Some(u) => Notification::Next(u),
                    None => return,
                },
                Notification::Completed => Notification::Completed,
                Notification::Failed(e) => Notification::Failed(Arc::clone(e)),
            };
            let _ = tx.send(mapped);
            ring.ring();
        });
        Subscription {
            rx,
            doorbell,
            _handle: handle,
        }
    }
}

/// Keeps an observer registered; dropping or disposing it unregisters.
#[must_use = "the observer is removed when the handle is dropped"]
pub struct ObserverHandle {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ObserverHandle {
    fn detached() -> Self {
        Self { detach: None }
    }

    pub fn dispose(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Counts deliveries so a thread can sleep until the next one.
#[derive(Default)]
struct Doorbell {
    rings: Mutex<u64>,
    cv: Condvar,
}

impl Doorbell {
    fn lock(&self) -> MutexGuard<'_, u64> {
        self.rings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ring(&self) {
        *self.lock() += 1;
        self.cv.notify_all();
    }

    fn rings(&self) -> u64 {
        *self.lock()
    }

    /// Block until the count moves past `seen` or `timeout` elapses.
    fn wait_past(&self, seen: u64, timeout: Duration) {
        let guard = self.lock();
        let _ = self
            .cv
            .wait_timeout_while(guard, timeout, |rings| *rings == seen)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

/// Receiving end of [`EventBus::subscribe`]. Yields `None` after the terminal
/// notification has been received (or once the subscription was disposed).
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<Notification<T>>,
    doorbell: Arc<Doorbell>,
    _handle: ObserverHandle,
}

impl<T> Subscription<T> {
    /// Block the current thread for the next notification.
    /// Must not be called from inside an async runtime.
    pub fn recv_blocking(&mut self) -> Option<Notification<T>> {
        self.rx.blocking_recv()
    }

    pub async fn recv(&mut self) -> Option<Notification<T>> {
        self.rx.recv().await
    }

    /// Next notification if one is queued. `Err(true)` means the stream ended.
    pub fn try_recv(&mut self) -> Result<Notification<T>, bool> {
        match self.rx.try_recv() {
            Ok(n) => Ok(n),
            Err(TryRecvError::Empty) => Err(false),
            Err(TryRecvError::Disconnected) => Err(true),
        }
    }

    /// Block up to `timeout` for the next notification. `None` on timeout or
    /// once the stream has ended.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<Notification<T>> {
        let deadline = Instant::now() + timeout;
        loop {
            // Read before try_recv: a delivery after the read moves the count.
            let seen = self.doorbell.rings();
            match self.try_recv() {
                Ok(n) => return Some(n),
                Err(true) => return None,
                Err(false) => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.doorbell.wait_past(seen, deadline - now);
        }
    }

    /// Collect everything up to and including the terminal notification.
    pub fn collect_blocking(mut self) -> Vec<Notification<T>> {
        let mut out = Vec::new();
        while let Some(n) = self.recv_blocking() {
            let end = n.is_terminal();
            out.push(n);
            if end {
                break;
            }
        }
        out
    }
}
