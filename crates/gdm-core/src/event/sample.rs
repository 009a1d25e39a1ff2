//! Fixed-interval sampling of pushed values.
//!
//! Producers `push` keyed values into one shared slot; later pushes overwrite
//! earlier ones. A sampler thread wakes each interval and, if the slot was
//! written since the last tick, emits `map(key, value)` on the output bus.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::bus::{EventBus, Subscription};

struct Slot<K, T> {
    latest: Option<(K, T)>,
    closing: bool,
    cancelled: bool,
    finished: bool,
}

struct Shared<K, T> {
    slot: Mutex<Slot<K, T>>,
    wake: Condvar,
}

impl<K, T> Shared<K, T> {
    fn lock(&self) -> MutexGuard<'_, Slot<K, T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Producer side of a running sampler.
pub struct Sampler<K, T> {
    shared: Arc<Shared<K, T>>,
}

impl<K, T> Sampler<K, T> {
    /// Offer a value for the next tick. Ignored once the sampler is closing.
    pub fn push(&self, key: K, value: T) {
        let mut slot = self.shared.lock();
        if slot.closing || slot.cancelled || slot.finished {
            return;
        }
        slot.latest = Some((key, value));
    }

    /// Emit the pending value, if any, then complete the output.
    pub fn close(&self) {
        self.shared.lock().closing = true;
        self.shared.wake.notify_all();
    }

    /// Complete the output without emitting the pending value.
    pub fn cancel(&self) {
        self.shared.lock().cancelled = true;
        self.shared.wake.notify_all();
    }

    /// True once the output has completed, including after every
    /// subscriber went away.
    pub fn is_finished(&self) -> bool {
        self.shared.lock().finished
    }
}

/// Start a sampler that ticks every `interval` and emits `map(key, latest)`
/// on a new bus. A `None` from `map` skips that tick.
///
/// The output completes after `close` (flushing the last pending value),
/// after `cancel`, or at the first tick with no subscriber left.
pub fn sampler<K, T, U, F>(
    interval: Duration,
    map: F,
) -> std::io::Result<(Sampler<K, T>, Subscription<U>)>
where
    K: Send + 'static,
    T: Send + 'static,
    U: Clone + Send + 'static,
    F: Fn(K, T) -> Option<U> + Send + 'static,
{
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot {
            latest: None,
            closing: false,
            cancelled: false,
            finished: false,
        }),
        wake: Condvar::new(),
    });

    let out: Arc<EventBus<U>> = Arc::new(EventBus::new());
    let subscription = out.subscribe();

    let worker_shared = Arc::clone(&shared);
    std::thread::Builder::new()
        .name("gdm-progress-sampler".into())
        .spawn(move || run_sampler(worker_shared, out, interval, map))?;

    Ok((Sampler { shared }, subscription))
}

fn run_sampler<K, T, U, F>(
    shared: Arc<Shared<K, T>>,
    out: Arc<EventBus<U>>,
    interval: Duration,
    map: F,
) where
    U: Clone + Send + 'static,
    F: Fn(K, T) -> Option<U>,
{
    let mut next_tick = Instant::now() + interval;
    loop {
        let mut slot = shared.lock();
        loop {
            let now = Instant::now();
            if slot.cancelled || slot.closing || now >= next_tick {
                break;
            }
            slot = shared
                .wake
                .wait_timeout(slot, next_tick - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        if slot.cancelled {
            break;
        }
        let pending = slot.latest.take();
        let closing = slot.closing;
        drop(slot);

        if let Some(u) = pending.and_then(|(k, v)| map(k, v)) {
            out.publish(u);
        }
        if closing || out.observer_count() == 0 {
            break;
        }
        next_tick += interval;
    }
    shared.lock().finished = true;
    out.complete();
}
