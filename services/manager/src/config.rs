//! Daemon configuration.
//!
//! Configuration is read from a JSON file (`--config`), with a handful of
//! environment fallbacks for values that are convenient to override in
//! deployment units (`AXLE_LOG_LEVEL`, `AXLE_WORKING_DIR`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration for the service manager.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for installed instances and unit files.
    pub working_dir: PathBuf,

    /// Path to the SQLite state database.
    pub state_db: PathBuf,

    /// Path to the host device declaration file.
    pub resources_file: PathBuf,

    /// Worker limit for the action queue.
    pub worker_count: usize,

    /// Default observation window for instance starts.
    pub start_interval: Duration,

    /// Per-call timeout for supervisor operations.
    pub supervisor_timeout: Duration,

    /// Capacity of the outbound status channel, in batches.
    pub status_channel_capacity: usize,

    /// Grace period before a retired service version is garbage collected.
    pub service_gc_grace: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("/var/lib/axle"),
            state_db: PathBuf::from("/var/lib/axle/manager.db"),
            resources_file: PathBuf::from("/etc/axle/resources.json"),
            worker_count: 32,
            start_interval: Duration::from_secs(5),
            supervisor_timeout: Duration::from_secs(30),
            status_channel_capacity: 32,
            service_gc_grace: Duration::from_secs(24 * 3600),
            log_level: "info".to_string(),
        }
    }
}

/// On-disk representation. Every field is optional; omitted fields fall
/// back to the defaults above.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConfigFile {
    working_dir: Option<PathBuf>,
    state_db: Option<PathBuf>,
    resources_file: Option<PathBuf>,
    worker_count: Option<usize>,
    start_interval_secs: Option<u64>,
    supervisor_timeout_secs: Option<u64>,
    status_channel_capacity: Option<usize>,
    service_gc_grace_secs: Option<u64>,
    log_level: Option<String>,
}

impl Config {
    /// Loads configuration from a JSON file, then applies environment
    /// fallbacks.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let file: ConfigFile = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        Ok(Self::from_file(file))
    }

    /// Builds configuration from defaults and environment only.
    pub fn from_env() -> Self {
        Self::from_file(ConfigFile::default())
    }

    fn from_file(file: ConfigFile) -> Self {
        let defaults = Self::default();

        let working_dir = std::env::var("AXLE_WORKING_DIR")
            .ok()
            .map(PathBuf::from)
            .or(file.working_dir)
            .unwrap_or(defaults.working_dir);

        let state_db = file
            .state_db
            .unwrap_or_else(|| working_dir.join("manager.db"));

        let log_level = std::env::var("AXLE_LOG_LEVEL")
            .ok()
            .or(file.log_level)
            .unwrap_or(defaults.log_level);

        Self {
            working_dir,
            state_db,
            resources_file: file.resources_file.unwrap_or(defaults.resources_file),
            worker_count: file.worker_count.unwrap_or(defaults.worker_count).max(1),
            start_interval: file
                .start_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.start_interval),
            supervisor_timeout: file
                .supervisor_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.supervisor_timeout),
            status_channel_capacity: file
                .status_channel_capacity
                .unwrap_or(defaults.status_channel_capacity)
                .max(32),
            service_gc_grace: file
                .service_gc_grace_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.service_gc_grace),
            log_level,
        }
    }

    /// Directory holding per-instance install dirs and unit files.
    pub fn instances_dir(&self) -> PathBuf {
        self.working_dir.join("instances")
    }

    /// Path of the unit template file inside the working directory.
    pub fn unit_template_file(&self) -> PathBuf {
        self.working_dir.join("template.service")
    }
}
