use std::fmt;
use std::sync::Arc;

use super::Task;

/// Lifecycle of one task run.
///
/// `Prepare` is initial. `Success` and `Error` are terminal; `Stopped` ends
/// the current run only, and a later run starts again from `Prepare`.
///
/// Ordered by declaration: a group reports the highest state among its
/// tasks, so one failure outranks everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskState {
    Prepare,
    Downloading,
    Success,
    Stopped,
    Error,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Prepare => "PREPARE",
            TaskState::Downloading => "DOWNLOADING",
            TaskState::Success => "SUCCESS",
            TaskState::Stopped => "STOPPED",
            TaskState::Error => "ERROR",
        }
    }

    /// True for states that end a run.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Stopped | TaskState::Error
        )
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            TaskState::Prepare => 0,
            TaskState::Downloading => 1,
            TaskState::Success => 2,
            TaskState::Stopped => 3,
            TaskState::Error => 4,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => TaskState::Downloading,
            2 => TaskState::Success,
            3 => TaskState::Stopped,
            4 => TaskState::Error,
            _ => TaskState::Prepare,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress notification: the task and its completion in percent (0..=100).
#[derive(Clone)]
pub struct TaskProgress {
    pub task: Arc<Task>,
    pub progress: f64,
}

/// State transition notification.
#[derive(Clone)]
pub struct TaskStateEvent {
    pub task: Arc<Task>,
    pub state: TaskState,
}

impl fmt::Debug for TaskProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskProgress")
            .field("url", &self.task.url())
            .field("progress", &self.progress)
            .finish()
    }
}

impl fmt::Debug for TaskStateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskStateEvent")
            .field("url", &self.task.url())
            .field("state", &self.state)
            .finish()
    }
}
