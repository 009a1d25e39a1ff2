//! Event delivery: per-task buses and the sampled group aggregate.

mod bus;
mod sample;

pub use bus::{EventBus, Notification, ObserverHandle, Subscription};
pub use sample::{sampler, Sampler};
