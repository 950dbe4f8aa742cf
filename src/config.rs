//! # Global runtime configuration.
//!
//! Provides [`Config`] centralized settings for the supervisor runtime, and
//! [`ConfigFile`] the on-disk JSON document the daemon loads at startup and
//! flushes application definitions back into.
//!
//! Config is used in two ways:
//! 1. **Supervisor creation**: `SupervisorBuilder::new(config)`
//! 2. **Ring/health defaults**: output capture and health engine read their
//!    knobs from here
//!
//! ## Sentinel values
//! - `grace = 0s` → no wait, force-terminate immediately on shutdown
//! - `config_path = None` → nothing is persisted on registry mutation
//!   (useful in tests)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RuntimeError;

/// Global configuration for the supervisor runtime.
///
/// ## Field semantics
/// - `schedule_interval`: period of the supervisor tick driving `evaluate()`
/// - `health_check_interval`: period of the health engine
/// - `health_check_timeout`: deadline for one health-check process
/// - `grace`: maximum wait for processes to stop on shutdown
/// - `bus_capacity`: event bus ring buffer size (min 1; clamped by Bus)
/// - `stdout_cache_num` / `stdout_cache_size`: output ring rotation bounds
/// - `output_dir`: directory holding per-application output rings
/// - `snapshot_path`: crash-recovery snapshot location
/// - `config_path`: configuration file to flush registered applications into
/// - `default_exec_user` / `default_work_dir`: fallbacks applied to specs
///   that leave those fields unset
#[derive(Clone, Debug)]
pub struct Config {
    /// Period of the supervisor tick.
    pub schedule_interval: Duration,
    /// Period of the health-check engine.
    pub health_check_interval: Duration,
    /// Deadline for a single health-check invocation.
    pub health_check_timeout: Duration,
    /// Maximum time to wait for graceful shutdown before force-terminating.
    pub grace: Duration,
    /// Capacity of the event bus broadcast channel.
    pub bus_capacity: usize,
    /// Number of rotated output files kept per application.
    pub stdout_cache_num: usize,
    /// Size cap of one output file, in bytes.
    pub stdout_cache_size: u64,
    /// Directory for output rings.
    pub output_dir: PathBuf,
    /// Snapshot file for crash recovery.
    pub snapshot_path: PathBuf,
    /// Configuration file to persist applications into (`None` = no flush).
    pub config_path: Option<PathBuf>,
    /// OS user applied to specs without `execution_user`.
    pub default_exec_user: Option<String>,
    /// Working directory applied to specs without `working_dir`.
    pub default_work_dir: Option<PathBuf>,
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `schedule_interval = 2s`, `health_check_interval = 10s`
    /// - `health_check_timeout = 5s`
    /// - `grace = 10s`
    /// - `bus_capacity = 1024`
    /// - `stdout_cache_num = 3`, `stdout_cache_size = 10 MiB`
    /// - paths under the current working directory
    fn default() -> Self {
        Self {
            schedule_interval: Duration::from_secs(2),
            health_check_interval: Duration::from_secs(10),
            health_check_timeout: Duration::from_secs(5),
            grace: Duration::from_secs(10),
            bus_capacity: 1024,
            stdout_cache_num: 3,
            stdout_cache_size: 10 * 1024 * 1024,
            output_dir: PathBuf::from("work"),
            snapshot_path: PathBuf::from(".appvisor.snapshot"),
            config_path: None,
            default_exec_user: None,
            default_work_dir: None,
        }
    }
}

impl Config {
    /// Bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }
}

/// Tunables section of the configuration file.
///
/// All fields are optional; unset fields keep the [`Config`] defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_cache_num: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_cache_size_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_exec_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_work_dir: Option<PathBuf>,
}

/// On-disk configuration document.
///
/// Top-level `Applications` holds the registered application specs; `daemon`
/// holds the tunables above. Every other top-level section (rest, security,
/// consul, …) belongs to external collaborators and is preserved verbatim
/// across flushes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(rename = "Applications", default)]
    pub applications: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemon: Option<DaemonSection>,
    #[serde(flatten)]
    pub external: serde_json::Map<String, Value>,
}

impl ConfigFile {
    /// Reads and parses the configuration file.
    ///
    /// Failure here is the one fatal error of the daemon.
    pub fn load(path: &Path) -> Result<Self, RuntimeError> {
        let text = std::fs::read_to_string(path).map_err(|e| RuntimeError::BadConfiguration {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| RuntimeError::BadConfiguration {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Writes the document atomically (temp file, then rename).
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let tmp = path.with_extension("tmp");
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, path)
    }

    /// Applies the `daemon` section on top of `base` and records the file
    /// location for future flushes.
    pub fn runtime_config(&self, path: &Path, base: Config) -> Config {
        let mut cfg = base;
        cfg.config_path = Some(path.to_path_buf());
        if let Some(d) = &self.daemon {
            if let Some(s) = d.schedule_interval {
                cfg.schedule_interval = Duration::from_secs(s.max(1));
            }
            if let Some(s) = d.health_check_interval {
                cfg.health_check_interval = Duration::from_secs(s.max(1));
            }
            if let Some(n) = d.stdout_cache_num {
                cfg.stdout_cache_num = n.max(1);
            }
            if let Some(mb) = d.stdout_cache_size_mb {
                cfg.stdout_cache_size = mb.max(1) * 1024 * 1024;
            }
            if let Some(p) = &d.output_dir {
                cfg.output_dir = p.clone();
            }
            if let Some(p) = &d.snapshot_path {
                cfg.snapshot_path = p.clone();
            }
            cfg.default_exec_user = d.default_exec_user.clone().or(cfg.default_exec_user);
            cfg.default_work_dir = d.default_work_dir.clone().or(cfg.default_work_dir);
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_sections_survive_round_trip() {
        let doc = r#"{
            "Applications": [],
            "daemon": { "schedule_interval": 5 },
            "rest": { "listen": "0.0.0.0:6060" },
            "consul": { "url": "http://consul:8500" }
        }"#;
        let parsed: ConfigFile = serde_json::from_str(doc).unwrap();
        assert!(parsed.external.contains_key("rest"));
        assert!(parsed.external.contains_key("consul"));

        let out = serde_json::to_value(&parsed).unwrap();
        assert_eq!(out["rest"]["listen"], "0.0.0.0:6060");
        assert_eq!(out["daemon"]["schedule_interval"], 5);
    }

    #[test]
    fn daemon_section_overrides_defaults() {
        let file = ConfigFile {
            daemon: Some(DaemonSection {
                schedule_interval: Some(7),
                stdout_cache_size_mb: Some(2),
                ..Default::default()
            }),
            ..Default::default()
        };
        let cfg = file.runtime_config(Path::new("/etc/appvisor.json"), Config::default());
        assert_eq!(cfg.schedule_interval, Duration::from_secs(7));
        assert_eq!(cfg.stdout_cache_size, 2 * 1024 * 1024);
        assert_eq!(
            cfg.config_path.as_deref(),
            Some(Path::new("/etc/appvisor.json"))
        );
    }
}
