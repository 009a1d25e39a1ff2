use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Global configuration loaded from `~/.config/gdm/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GdmConfig {
    /// Maximum number of tasks admitted into execution at once per group.
    pub max_concurrent_tasks: usize,
    /// Capacity of the admission signal buffer. Signals beyond it are dropped
    /// (the task stays in the waiting list and is picked up by a re-scan).
    pub admission_buffer: usize,
    /// Sampling interval of the aggregate progress stream, in milliseconds.
    pub progress_sample_ms: u64,
    /// Idle worker threads retire after this many seconds.
    pub worker_idle_timeout_secs: u64,
    /// curl connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Abort a transfer whose rate stays below this many bytes/s ...
    #[serde(default = "default_low_speed_limit")]
    pub low_speed_limit_bytes: u32,
    /// ... for this many seconds.
    #[serde(default = "default_low_speed_time")]
    pub low_speed_time_secs: u64,
    /// Optional curl receive buffer size in bytes (None = libcurl default).
    /// Smaller buffers mean more frequent stop checks.
    #[serde(default)]
    pub buffer_size: Option<usize>,
    /// Extra headers sent with every request (e.g. User-Agent).
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_low_speed_limit() -> u32 {
    1024
}

fn default_low_speed_time() -> u64 {
    60
}

impl Default for GdmConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 5,
            admission_buffer: 1024,
            progress_sample_ms: 200,
            worker_idle_timeout_secs: 60,
            connect_timeout_secs: 15,
            low_speed_limit_bytes: default_low_speed_limit(),
            low_speed_time_secs: default_low_speed_time(),
            buffer_size: None,
            headers: HashMap::new(),
        }
    }
}

impl GdmConfig {
    /// Engine settings for a group with this config's concurrency limit.
    pub fn group_config(&self) -> GroupConfig {
        GroupConfig {
            limit: self.max_concurrent_tasks.max(1),
            admission_buffer: self.admission_buffer.max(1),
            sample_interval: Duration::from_millis(self.progress_sample_ms.max(1)),
            worker_idle_timeout: Duration::from_secs(self.worker_idle_timeout_secs),
            default_headers: self.headers.clone(),
        }
    }
}

/// Settings a single `DownloadGroup` is built from.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Concurrency limit (credits). Immutable after construction.
    pub limit: usize,
    pub admission_buffer: usize,
    pub sample_interval: Duration,
    pub worker_idle_timeout: Duration,
    /// Headers applied to every task of the group; per-task headers win.
    pub default_headers: HashMap<String, String>,
}

impl GroupConfig {
    /// Defaults with the given concurrency limit (clamped to at least 1).
    pub fn new(limit: usize) -> Self {
        let mut cfg = GdmConfig::default().group_config();
        cfg.limit = limit.max(1);
        cfg
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("gdm")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<GdmConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = GdmConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)
            .with_context(|| format!("writing default config to {}", path.display()))?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let cfg: GdmConfig =
        toml::from_str(&data).with_context(|| format!("parsing config {}", path.display()))?;
    Ok(cfg)
}
