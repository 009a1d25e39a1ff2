pub mod config;
pub mod error;
pub mod logging;

// Engine
pub mod event;
pub mod group;
pub mod manager;
pub mod pool;
pub mod task;

// Collaborators
pub mod storage;
pub mod transport;
pub mod url_model;

pub use error::{DownloadError, GroupError, ManagerError, TransportError};
pub use group::{DownloadGroup, GroupProgress};
pub use manager::GroupManager;
pub use task::{Task, TaskProgress, TaskState, TaskStateEvent};
