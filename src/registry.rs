//! # Registry: the thread-safe name → application map.
//!
//! Owns every [`Application`] record, enforces the overwrite rules, and
//! flushes non-ephemeral definitions back to the configuration file on every
//! mutation.
//!
//! ## Rules
//! - `add` is an idempotent upsert; overwriting a cloud-managed application
//!   is always a conflict, overwriting a running one requires the caller to
//!   hold write access (decided by the control surface, carried in
//!   [`RegisterOptions`])
//! - every mutation schedules an asynchronous configuration flush, unless
//!   the application is ephemeral (run-once)
//! - the map lock is never held across process operations

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::apps::{AppKind, AppSpec, Application};
use crate::config::{Config, ConfigFile};
use crate::error::AppError;
use crate::events::{Bus, Event, EventKind};

/// Flags the control surface resolves before an upsert.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterOptions {
    /// Run-once registration: never persisted, auto-removed after retention.
    pub ephemeral: bool,
    /// Cloud-managed: local callers cannot overwrite it.
    pub cloud: bool,
    /// Force a kind instead of deriving it from the spec (`OneShot`).
    pub kind_override: Option<AppKind>,
    /// The caller may replace this application even while it runs.
    pub allow_overwrite_running: bool,
}

/// Thread-safe application store with persistence.
pub struct Registry {
    apps: RwLock<HashMap<String, Arc<Application>>>,
    cfg: Config,
    bus: Bus,
}

impl Registry {
    pub fn new(cfg: Config, bus: Bus) -> Arc<Self> {
        Arc::new(Self {
            apps: RwLock::new(HashMap::new()),
            cfg,
            bus,
        })
    }

    /// Idempotent upsert. Returns the freshly registered application.
    pub async fn add(
        self: &Arc<Self>,
        spec: AppSpec,
        opts: RegisterOptions,
    ) -> Result<Arc<Application>, AppError> {
        spec.validate()?;
        let name = spec.name.clone();

        let previous = self.get(&name).ok();
        if let Some(old) = &previous {
            if old.is_cloud() && !opts.cloud {
                return Err(AppError::Conflict(format!(
                    "application '{name}' is cloud-managed and cannot be overwritten"
                )));
            }
            if old.is_running().await && !opts.allow_overwrite_running {
                return Err(AppError::Conflict(format!(
                    "application '{name}' is running; overwrite requires write access"
                )));
            }
        }

        let app = Application::new(
            spec,
            opts.kind_override,
            opts.ephemeral,
            opts.cloud,
            Utc::now(),
        )?;

        // The replaced record's process dies with it.
        if let Some(old) = previous {
            old.shutdown_process().await;
        }

        self.apps
            .write()
            .expect("registry lock poisoned")
            .insert(name.clone(), Arc::clone(&app));
        self.bus
            .publish(Event::now(EventKind::AppRegistered).with_app(&name));
        if !app.is_ephemeral() {
            self.schedule_flush();
        }
        Ok(app)
    }

    /// Removes an application, killing its process first.
    pub async fn remove(self: &Arc<Self>, name: &str) -> Result<(), AppError> {
        let app = self.take(name)?;
        app.shutdown_process().await;
        self.bus
            .publish(Event::now(EventKind::AppRemoved).with_app(name));
        if !app.is_ephemeral() {
            self.schedule_flush();
        }
        Ok(())
    }

    /// Removal driven by the state machine (retention elapsed); the process
    /// is already gone.
    pub fn remove_expired(self: &Arc<Self>, name: &str) {
        if let Ok(app) = self.take(name) {
            debug!(app = name, "retention elapsed, reclaiming record");
            self.bus
                .publish(Event::now(EventKind::AppRemoved).with_app(name));
            if !app.is_ephemeral() {
                self.schedule_flush();
            }
        }
    }

    /// Replaces an un-initialized application with the definition it carried.
    pub async fn promote(self: &Arc<Self>, name: &str, payload: Value) -> Result<(), AppError> {
        let spec = AppSpec::from_json(&payload)?;
        debug!(app = name, promoted = %spec.name, "pre-start finished, installing real definition");
        let _ = self.take(name);
        self.add(spec, RegisterOptions::default()).await?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<Application>, AppError> {
        self.apps
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::NotFound(name.to_string()))
    }

    /// Sorted application names.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .apps
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort_unstable();
        names
    }

    /// Point-in-time copy of all records, for the supervisor tick.
    pub fn snapshot(&self) -> Vec<Arc<Application>> {
        self.apps
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub async fn enable(self: &Arc<Self>, name: &str) -> Result<(), AppError> {
        let app = self.get(name)?;
        app.enable(Utc::now(), &self.bus).await;
        if !app.is_ephemeral() {
            self.schedule_flush();
        }
        Ok(())
    }

    pub async fn disable(self: &Arc<Self>, name: &str) -> Result<(), AppError> {
        let app = self.get(name)?;
        app.disable(&self.bus).await;
        if !app.is_ephemeral() {
            self.schedule_flush();
        }
        Ok(())
    }

    fn take(&self, name: &str) -> Result<Arc<Application>, AppError> {
        self.apps
            .write()
            .expect("registry lock poisoned")
            .remove(name)
            .ok_or_else(|| AppError::NotFound(name.to_string()))
    }

    /// Queues an asynchronous flush of all non-ephemeral definitions.
    fn schedule_flush(self: &Arc<Self>) {
        let me = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = me.flush_now().await {
                warn!(error = %e, "configuration flush failed");
            }
        });
    }

    /// Writes the current definitions into the configuration file, keeping
    /// the external sections intact.
    pub async fn flush_now(&self) -> Result<(), AppError> {
        let Some(path) = self.cfg.config_path.clone() else {
            return Ok(());
        };
        let mut doc = if path.exists() {
            ConfigFile::load(&path).unwrap_or_default()
        } else {
            ConfigFile::default()
        };
        let mut apps = Vec::new();
        for app in self.snapshot() {
            if !app.is_ephemeral() {
                apps.push(app.spec_json().await);
            }
        }
        apps.sort_by(|a, b| {
            a.get("name")
                .and_then(Value::as_str)
                .cmp(&b.get("name").and_then(Value::as_str))
        });
        doc.applications = apps;
        doc.save(&path).map_err(|e| AppError::Transient(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spec(name: &str) -> AppSpec {
        AppSpec::from_json(&serde_json::json!({"name": name, "command": "sleep 5"})).unwrap()
    }

    fn registry(dir: &TempDir) -> Arc<Registry> {
        let mut cfg = Config::default();
        cfg.output_dir = dir.path().join("work");
        cfg.config_path = Some(dir.path().join("appvisor.json"));
        Registry::new(cfg, Bus::new(64))
    }

    #[tokio::test]
    async fn add_get_list_remove() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.add(spec("b"), RegisterOptions::default()).await.unwrap();
        reg.add(spec("a"), RegisterOptions::default()).await.unwrap();
        assert_eq!(reg.list(), vec!["a", "b"]);
        assert!(reg.get("a").is_ok());

        reg.remove("a").await.unwrap();
        assert!(matches!(reg.get("a"), Err(AppError::NotFound(_))));
        assert!(matches!(
            reg.remove("a").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn upsert_replaces_definition() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.add(spec("app"), RegisterOptions::default()).await.unwrap();
        let updated =
            AppSpec::from_json(&serde_json::json!({"name": "app", "command": "sleep 9"})).unwrap();
        reg.add(updated, RegisterOptions::default()).await.unwrap();
        let stored = reg.get("app").unwrap().spec_json().await;
        assert_eq!(stored["command"], "sleep 9");
    }

    #[tokio::test]
    async fn cloud_apps_resist_overwrite() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.add(
            spec("cloudy"),
            RegisterOptions {
                cloud: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let err = reg
            .add(spec("cloudy"), RegisterOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn flush_writes_non_ephemeral_only() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.add(spec("kept"), RegisterOptions::default()).await.unwrap();
        reg.add(
            spec("gone"),
            RegisterOptions {
                ephemeral: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        reg.flush_now().await.unwrap();

        let doc = ConfigFile::load(&dir.path().join("appvisor.json")).unwrap();
        let names: Vec<&str> = doc
            .applications
            .iter()
            .filter_map(|a| a["name"].as_str())
            .collect();
        assert_eq!(names, vec!["kept"]);
    }

    #[tokio::test]
    async fn promote_swaps_definition() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let uninit = AppSpec::from_json(&serde_json::json!({
            "name": "boot",
            "command": "true",
            "initial_application": {"name": "boot", "command": "sleep 5"}
        }))
        .unwrap();
        reg.add(uninit, RegisterOptions::default()).await.unwrap();
        assert_eq!(reg.get("boot").unwrap().kind(), AppKind::UnInitialized);

        let payload = serde_json::json!({"name": "boot", "command": "sleep 5"});
        reg.promote("boot", payload).await.unwrap();
        assert_eq!(reg.get("boot").unwrap().kind(), AppKind::LongRunning);
    }
}
