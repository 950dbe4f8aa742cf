//! # Snapshot: crash-safe record of live processes, and boot re-attachment.
//!
//! Every supervisor tick persists `{ name → (pid, start_time) }` plus the
//! opaque cluster session id, written temp-file-then-rename so the file is
//! readable after any crash. On startup each record whose pid still exists
//! with a matching kernel start time is re-attached; the application enters
//! `Running` directly and skips its initial scheduling decision.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::apps::Application;
use crate::config::Config;
use crate::error::AppError;
use crate::registry::Registry;

/// One recoverable process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub pid: i32,
    /// Kernel start time, clock ticks since boot (`/proc/<pid>/stat`).
    pub start_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

/// The on-disk document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotFile {
    /// Pass-through for the cluster collaborator; the core never interprets it.
    #[serde(default)]
    pub consul_session_id: String,
    #[serde(default)]
    pub apps: BTreeMap<String, SnapshotEntry>,
}

/// Writes snapshots and drives boot-time recovery.
pub struct SnapshotManager {
    path: PathBuf,
    session_id: Mutex<String>,
}

impl SnapshotManager {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            session_id: Mutex::new(String::new()),
        }
    }

    /// Stores the cluster session id carried into the next snapshot.
    pub fn set_session_id(&self, id: impl Into<String>) {
        *self.session_id.lock().expect("session id poisoned") = id.into();
    }

    pub fn session_id(&self) -> String {
        self.session_id.lock().expect("session id poisoned").clone()
    }

    /// Persists the live-process map atomically.
    pub async fn persist(&self, apps: &[Arc<Application>]) -> Result<(), AppError> {
        let mut file = SnapshotFile {
            consul_session_id: self.session_id(),
            apps: BTreeMap::new(),
        };
        for app in apps {
            if let Some((pid, start_time, container_id)) = app.live_entry().await {
                file.apps.insert(
                    app.name().to_string(),
                    SnapshotEntry {
                        pid,
                        start_time,
                        container_id,
                    },
                );
            }
        }

        let tmp = self.path.with_extension("tmp");
        let text = serde_json::to_string_pretty(&file)?;
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Boot-time recovery: re-attach every record that still checks out.
    ///
    /// Returns the number of applications re-attached. A missing or
    /// unreadable snapshot is not an error; there is simply nothing to
    /// recover.
    pub async fn recover(&self, registry: &Arc<Registry>, cfg: &Config) -> usize {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(_) => return 0,
        };
        let file: SnapshotFile = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "snapshot unreadable, skipping recovery");
                return 0;
            }
        };
        self.set_session_id(file.consul_session_id.clone());

        let now = Utc::now();
        let mut attached = 0;
        for (name, entry) in &file.apps {
            let Ok(app) = registry.get(name) else {
                debug!(app = %name, "snapshot names an unregistered application");
                continue;
            };
            if app
                .try_attach(
                    entry.pid,
                    entry.start_time,
                    entry.container_id.clone(),
                    cfg,
                    now,
                )
                .await
            {
                attached += 1;
            }
        }
        if attached > 0 {
            info!(attached, "recovered running applications from snapshot");
        }
        attached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Bus;
    use crate::registry::RegisterOptions;
    use tempfile::TempDir;

    fn cfg(dir: &TempDir) -> Config {
        let mut cfg = Config::default();
        cfg.output_dir = dir.path().join("work");
        cfg.snapshot_path = dir.path().join("snapshot.json");
        cfg
    }

    #[test]
    fn wire_format_matches_contract() {
        let file = SnapshotFile {
            consul_session_id: "sess-1".into(),
            apps: BTreeMap::from([(
                "web".to_string(),
                SnapshotEntry {
                    pid: 4812,
                    start_time: 12_345_678,
                    container_id: None,
                },
            )]),
        };
        let v = serde_json::to_value(&file).unwrap();
        assert_eq!(v["consul_session_id"], "sess-1");
        assert_eq!(v["apps"]["web"]["pid"], 4812);
        assert_eq!(v["apps"]["web"]["start_time"], 12_345_678u64);
        assert!(v["apps"]["web"].get("container_id").is_none());
    }

    #[tokio::test]
    async fn persist_is_atomic_and_reloadable() {
        let dir = TempDir::new().unwrap();
        let cfg = cfg(&dir);
        let mgr = SnapshotManager::new(cfg.snapshot_path.clone());
        mgr.set_session_id("abc");
        mgr.persist(&[]).await.unwrap();

        let text = std::fs::read_to_string(&cfg.snapshot_path).unwrap();
        let file: SnapshotFile = serde_json::from_str(&text).unwrap();
        assert_eq!(file.consul_session_id, "abc");
        assert!(file.apps.is_empty());
        assert!(!cfg.snapshot_path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn recover_skips_stale_records() {
        let dir = TempDir::new().unwrap();
        let cfg = cfg(&dir);
        let registry = Registry::new(cfg.clone(), Bus::new(64));
        let spec = crate::apps::AppSpec::from_json(
            &serde_json::json!({"name": "ghost", "command": "sleep 5"}),
        )
        .unwrap();
        registry.add(spec, RegisterOptions::default()).await.unwrap();

        // A pid that cannot exist, and a start time that cannot match.
        let file = SnapshotFile {
            consul_session_id: String::new(),
            apps: BTreeMap::from([(
                "ghost".to_string(),
                SnapshotEntry {
                    pid: i32::MAX - 13,
                    start_time: 1,
                    container_id: None,
                },
            )]),
        };
        std::fs::write(
            &cfg.snapshot_path,
            serde_json::to_string(&file).unwrap(),
        )
        .unwrap();

        let mgr = SnapshotManager::new(cfg.snapshot_path.clone());
        assert_eq!(mgr.recover(&registry, &cfg).await, 0);
        assert!(!registry.get("ghost").unwrap().is_running().await);
    }
}
