//! Process-wide handle over named download groups.
//!
//! Callers create one `GroupManager` and pass it by reference; there is no
//! hidden global.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::GroupConfig;
use crate::error::{GroupError, ManagerError};
use crate::group::DownloadGroup;
use crate::storage;
use crate::transport::{CurlTransport, Transport};

pub const DEFAULT_LIMIT: usize = 5;

pub struct GroupManager {
    template: GroupConfig,
    transport: Arc<dyn Transport>,
    groups: Mutex<HashMap<String, Arc<DownloadGroup>>>,
}

impl Default for GroupManager {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupManager {
    pub fn new() -> Self {
        Self::with_transport(
            GroupConfig::new(DEFAULT_LIMIT),
            Arc::new(CurlTransport::default()),
        )
    }

    /// Groups created here share `transport` and take every setting except
    /// the limit from `template`.
    pub fn with_transport(template: GroupConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            template,
            transport,
            groups: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<DownloadGroup>>> {
        self.groups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn build(&self, limit: usize) -> Arc<DownloadGroup> {
        let config = GroupConfig {
            limit,
            ..self.template.clone()
        };
        Arc::new(DownloadGroup::with_transport(config, Arc::clone(&self.transport)))
    }

    pub fn create_group(&self, key: &str, limit: usize) -> Result<Arc<DownloadGroup>, ManagerError> {
        let mut groups = self.lock();
        if groups.contains_key(key) {
            return Err(ManagerError::DuplicateGroup(key.to_string()));
        }
        let group = self.build(limit);
        groups.insert(key.to_string(), Arc::clone(&group));
        tracing::info!(key, limit, "group created");
        Ok(group)
    }

    pub fn find_group(&self, key: &str) -> Option<Arc<DownloadGroup>> {
        self.lock().get(key).cloned()
    }

    pub fn contains_group(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn group_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Existing group for `key`, or a new one with `limit`. The limit of an
    /// existing group is left as it is.
    pub fn find_or_create_group(&self, key: &str, limit: usize) -> Arc<DownloadGroup> {
        let mut groups = self.lock();
        if let Some(group) = groups.get(key) {
            return Arc::clone(group);
        }
        let group = self.build(limit);
        groups.insert(key.to_string(), Arc::clone(&group));
        tracing::info!(key, limit, "group created");
        group
    }

    pub fn start_group(&self, key: &str, limit: usize) -> Result<Arc<DownloadGroup>, GroupError> {
        let group = self.find_or_create_group(key, limit);
        group.start()?;
        Ok(group)
    }

    /// Stop the group under `key` if there is one.
    pub fn stop_group(&self, key: &str) -> Result<(), GroupError> {
        match self.find_group(key) {
            Some(group) => group.stop_group(),
            None => Ok(()),
        }
    }

    /// Destroy the group under `key` and forget it.
    pub fn destroy_group(&self, key: &str) -> Result<(), GroupError> {
        let removed = self.lock().remove(key);
        match removed {
            Some(group) => {
                tracing::info!(key, "destroying group");
                group.destroy_group()
            }
            None => Ok(()),
        }
    }

    /// Destroy every group. All are destroyed even if one reports an error;
    /// the first error is returned.
    pub fn destroy_all(&self) -> Result<(), GroupError> {
        let drained: Vec<(String, Arc<DownloadGroup>)> = self.lock().drain().collect();
        let mut first = None;
        for (key, group) in drained {
            if let Err(e) = group.destroy_group() {
                tracing::warn!(key = %key, error = %e, "destroying group");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Delete the partial download belonging to destination `local_path`.
    /// Returns whether a file was removed.
    pub fn delete_temp_file(local_path: &Path) -> std::io::Result<bool> {
        let temp = storage::temp_path(local_path);
        let removed = storage::remove_if_exists(&temp)?;
        if removed {
            tracing::debug!(path = %temp.display(), "temp file deleted");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::FakeTransport;

    fn manager() -> GroupManager {
        GroupManager::with_transport(GroupConfig::new(DEFAULT_LIMIT), FakeTransport::new())
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let m = manager();
        m.create_group("a", 2).unwrap();
        let err = m.create_group("a", 3).unwrap_err();
        assert!(matches!(err, ManagerError::DuplicateGroup(ref k) if k == "a"));
        assert_eq!(m.find_group("a").unwrap().limit(), 2);
    }

    #[test]
    fn find_or_create_returns_same_group() {
        let m = manager();
        let a = m.find_or_create_group("a", 1);
        let b = m.find_or_create_group("a", 4);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.limit(), 1);
        assert!(m.find_group("missing").is_none());
        assert_eq!(m.group_keys(), vec!["a".to_string()]);
    }

    #[test]
    fn start_and_stop_by_key() {
        let m = manager();
        let g = m.start_group("a", 2).unwrap();
        assert!(g.is_started());
        m.stop_group("a").unwrap();
        assert!(!g.is_started());
        m.stop_group("unknown").unwrap();
    }

    #[test]
    fn destroy_removes_group() {
        let m = manager();
        let g = m.start_group("a", 2).unwrap();
        m.destroy_group("a").unwrap();
        assert!(g.is_destroyed());
        assert!(!m.contains_group("a"));
        m.destroy_group("a").unwrap();
    }

    #[test]
    fn destroy_all_clears_every_group() {
        let m = manager();
        let a = m.create_group("a", 1).unwrap();
        let b = m.start_group("b", 1).unwrap();
        m.destroy_all().unwrap();
        assert!(a.is_destroyed() && b.is_destroyed());
        assert!(m.group_keys().is_empty());
    }

    #[test]
    fn delete_temp_file_removes_partial_only() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("file.bin");
        std::fs::write(&dest, b"done").unwrap();
        std::fs::write(storage::temp_path(&dest), b"par").unwrap();

        assert!(GroupManager::delete_temp_file(&dest).unwrap());
        assert!(!storage::temp_path(&dest).exists());
        assert!(dest.exists());
        assert!(!GroupManager::delete_temp_file(&dest).unwrap());
    }
}
