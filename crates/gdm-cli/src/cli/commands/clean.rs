//! `gdm clean` – delete a partial download.

use anyhow::{Context, Result};
use gdm_core::storage;
use gdm_core::GroupManager;
use std::path::Path;

pub fn run_clean(path: &Path) -> Result<()> {
    let temp = storage::temp_path(path);
    let removed = GroupManager::delete_temp_file(path)
        .with_context(|| format!("deleting {}", temp.display()))?;
    if removed {
        println!("Removed {}", temp.display());
    } else {
        println!("No partial download at {}", temp.display());
    }
    Ok(())
}
