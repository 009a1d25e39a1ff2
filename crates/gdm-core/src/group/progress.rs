//! Aggregate progress across a group.
//!
//! Every task in the group reports its progress updates to the group's live
//! samplers. A sampler recomputes the weighted total once per tick and emits
//! it together with the task that reported last.

use std::sync::{Arc, Weak};

use super::GroupInner;
use crate::error::GroupError;
use crate::event::{self, EventBus, Sampler, Subscription};
use crate::task::{ProgressHook, Task};

/// Sampler feeding one aggregate stream.
pub(crate) type ProgressSampler = Sampler<Weak<Task>, f64>;

/// One sample of the weighted total: the task whose event triggered the
/// sample, and the group-wide progress in percent.
#[derive(Clone)]
pub struct GroupProgress {
    pub task: Arc<Task>,
    pub progress: f64,
}

impl std::fmt::Debug for GroupProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupProgress")
            .field("url", &self.task.url())
            .field("progress", &self.progress)
            .finish()
    }
}

/// Hook installed on every task of the group: forwards each progress update
/// to the samplers alive at that moment.
pub(super) fn progress_hook(inner: &Arc<GroupInner>) -> ProgressHook {
    let group = Arc::downgrade(inner);
    Arc::new(move |task: &Weak<Task>, progress: f64| {
        if let Some(group) = group.upgrade() {
            for sampler in group.lock_samplers().iter() {
                sampler.push(task.clone(), progress);
            }
        }
    })
}

/// Aggregate stream over every task the group holds now or receives later.
///
/// Completes when nothing is left waiting or in flight (after one last
/// sample), or when the group is stopped or destroyed. On a group that is
/// already idle the stream carries the current total once and completes.
pub(super) fn total_progress_stream(
    inner: &Arc<GroupInner>,
) -> Result<Subscription<GroupProgress>, GroupError> {
    let set = inner.read_tasks();
    if set.is_idle() {
        let last = set.all.last().cloned();
        let progress = set.weighted_progress();
        drop(set);
        let bus: Arc<EventBus<GroupProgress>> = Arc::new(EventBus::new());
        let subscription = bus.subscribe();
        if let Some(task) = last {
            bus.publish(GroupProgress { task, progress });
        }
        bus.complete();
        tracing::debug!("group idle, aggregate progress stream completed at once");
        return Ok(subscription);
    }

    let group = Arc::downgrade(inner);
    let (sampler, subscription) = event::sampler(
        inner.config.sample_interval,
        move |task: Weak<Task>, _progress: f64| {
            let task = task.upgrade()?;
            let group = group.upgrade()?;
            let progress = group.total_progress();
            Some(GroupProgress { task, progress })
        },
    )
    .map_err(GroupError::Thread)?;

    // Registered under the task-set lock: a drain after this point closes it.
    let mut samplers = inner.lock_samplers();
    samplers.retain(|s| !s.is_finished());
    samplers.push(sampler);
    tracing::debug!(streams = samplers.len(), tasks = set.all.len(), "aggregate progress stream started");
    Ok(subscription)
}
