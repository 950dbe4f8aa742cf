//! # ControlSurface: operation dispatch with the permission gate.
//!
//! Transport-agnostic: an HTTP layer (out of scope here) maps routes onto
//! these methods one-to-one. Responses are application snapshots
//! (`serde_json::Value`) or operation-specific payloads; output streaming
//! returns bytes plus the cursor the caller echoes back.
//!
//! ## Run-once flow
//! ```text
//! run_async(spec, timeout, retention)
//!   ├─ register ephemeral OneShot app (+ fresh process uuid)
//!   ├─ launch immediately (spawn failure surfaces to the caller)
//!   ├─ timer at `timeout`             → kill_group if still running
//!   └─ timer at `timeout + retention` → unregister
//! run_sync(spec, timeout)
//!   └─ same, but holds the caller until exit or deadline, then removes
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use crate::apps::{AppKind, AppSpec, Application};
use crate::core::Supervisor;
use crate::error::AppError;
use crate::process::FetchChunk;
use crate::registry::RegisterOptions;
use crate::timer::TimerId;

use super::{Caller, APP_CONTROL, APP_DELETE, APP_REG, APP_RUN, APP_VIEW};

/// Outcome of a synchronous run.
#[derive(Debug)]
pub struct RunResult {
    pub output: Vec<u8>,
    /// `None` when the deadline fired before the process exited.
    pub exit_code: Option<i32>,
}

/// The public operation set over one supervisor.
pub struct ControlSurface {
    sup: Arc<Supervisor>,
    /// Pending self-destruct timers of ephemeral runs, cancelled when the
    /// caller unregisters explicitly.
    suicide_timers: DashMap<String, Vec<TimerId>>,
}

impl ControlSurface {
    pub fn new(sup: Arc<Supervisor>) -> Arc<Self> {
        Arc::new(Self {
            sup,
            suicide_timers: DashMap::new(),
        })
    }

    async fn authorize(
        &self,
        app: &Arc<Application>,
        caller: &Caller,
        write: bool,
    ) -> Result<(), AppError> {
        if app
            .permits(&caller.user, caller.group.as_deref(), write)
            .await
        {
            Ok(())
        } else {
            Err(AppError::Unauthorized {
                user: caller.user.clone(),
                app: app.name().to_string(),
            })
        }
    }

    /// Upsert an application definition.
    pub async fn register(&self, caller: &Caller, spec_json: &Value) -> Result<Value, AppError> {
        caller.require(APP_REG)?;
        let spec = AppSpec::from_json(spec_json)?;

        // Overwrite is a mutating operation on the existing record.
        let mut opts = RegisterOptions::default();
        if let Ok(existing) = self.sup.registry().get(&spec.name) {
            self.authorize(&existing, caller, true).await?;
            opts.allow_overwrite_running = true;
        }

        let app = self.sup.registry().add(spec, opts).await?;
        Ok(app.view().await)
    }

    /// Remove an application and kill its process.
    pub async fn unregister(&self, caller: &Caller, name: &str) -> Result<(), AppError> {
        caller.require(APP_DELETE)?;
        let app = self.sup.registry().get(name)?;
        self.authorize(&app, caller, true).await?;
        self.cancel_suicide(name);
        self.sup.registry().remove(name).await
    }

    pub async fn enable(&self, caller: &Caller, name: &str) -> Result<(), AppError> {
        caller.require(APP_CONTROL)?;
        let app = self.sup.registry().get(name)?;
        self.authorize(&app, caller, true).await?;
        self.sup.registry().enable(name).await
    }

    pub async fn disable(&self, caller: &Caller, name: &str) -> Result<(), AppError> {
        caller.require(APP_CONTROL)?;
        let app = self.sup.registry().get(name)?;
        self.authorize(&app, caller, true).await?;
        self.sup.registry().disable(name).await
    }

    /// Snapshot of one application.
    pub async fn view(&self, caller: &Caller, name: &str) -> Result<Value, AppError> {
        caller.require(APP_VIEW)?;
        let app = self.sup.registry().get(name)?;
        self.authorize(&app, caller, false).await?;
        Ok(app.view().await)
    }

    /// Snapshots of every application the caller may see.
    pub async fn list(&self, caller: &Caller) -> Result<Vec<Value>, AppError> {
        caller.require(APP_VIEW)?;
        let mut views = Vec::new();
        for name in self.sup.registry().list() {
            let Ok(app) = self.sup.registry().get(&name) else {
                continue;
            };
            if app
                .permits(&caller.user, caller.group.as_deref(), false)
                .await
            {
                views.push(app.view().await);
            }
        }
        Ok(views)
    }

    /// Positional output read; `process_uuid` scopes the read to one
    /// ephemeral run when supplied.
    pub async fn output(
        &self,
        caller: &Caller,
        name: &str,
        index: u64,
        position: u64,
        process_uuid: Option<&str>,
    ) -> Result<FetchChunk, AppError> {
        caller.require(APP_VIEW)?;
        let app = self.sup.registry().get(name)?;
        self.authorize(&app, caller, false).await?;
        app.fetch_output(index, position, process_uuid).await
    }

    /// Registers an ephemeral run-once application and launches it.
    ///
    /// Returns `(name, process_uuid)`; the caller polls [`Self::output`]
    /// with the uuid to stream results. The record self-destructs at
    /// `timeout + retention`.
    pub async fn run_async(
        &self,
        caller: &Caller,
        spec_json: &Value,
        timeout: Duration,
        retention: Duration,
    ) -> Result<(String, String), AppError> {
        caller.require(APP_RUN)?;
        let app = self.launch_ephemeral(caller, spec_json, retention).await?;
        let name = app.name().to_string();
        let uuid = Uuid::new_v4().to_string();
        app.set_process_uuid(uuid.clone()).await;

        let wheel = self.sup.timer_wheel();
        let unavailable = |_| AppError::Transient("timer wheel is shutting down".into());
        let mut timers = Vec::new();

        // Deadline: the run may not outlive `timeout`.
        let kill_app = Arc::clone(&app);
        timers.push(
            wheel
                .schedule(timeout, move || {
                    tokio::spawn(async move { kill_app.shutdown_process().await });
                })
                .map_err(unavailable)?,
        );

        // Suicide: the record disappears after retention.
        let registry = Arc::clone(self.sup.registry());
        let suicide_name = name.clone();
        timers.push(
            wheel
                .schedule(timeout + retention, move || {
                    let registry = Arc::clone(&registry);
                    tokio::spawn(async move {
                        let _ = registry.remove(&suicide_name).await;
                    });
                })
                .map_err(unavailable)?,
        );

        self.suicide_timers.insert(name.clone(), timers);
        Ok((name, uuid))
    }

    /// Run-once holding the caller until exit or `timeout`.
    ///
    /// The application is removed before returning either way.
    pub async fn run_sync(
        &self,
        caller: &Caller,
        spec_json: &Value,
        timeout: Duration,
    ) -> Result<RunResult, AppError> {
        caller.require(APP_RUN)?;
        let app = self
            .launch_ephemeral(caller, spec_json, Duration::ZERO)
            .await?;
        let name = app.name().to_string();

        let exit_code = app.wait_stopped(timeout).await;
        if exit_code.is_none() {
            app.shutdown_process().await;
        }
        app.fetch_output(0, 0, None).await.ok(); // pull container logs if any
        let output = app.read_all_output().await.unwrap_or_default();
        let _ = self.sup.registry().remove(&name).await;

        Ok(RunResult { output, exit_code })
    }

    /// Shared run-once preamble: register ephemeral + launch immediately.
    async fn launch_ephemeral(
        &self,
        caller: &Caller,
        spec_json: &Value,
        retention: Duration,
    ) -> Result<Arc<Application>, AppError> {
        let mut spec = AppSpec::from_json(spec_json)?;
        if self.sup.registry().get(&spec.name).is_ok() {
            return Err(AppError::Conflict(format!(
                "application '{}' already exists",
                spec.name
            )));
        }
        spec.retention = Some(crate::schedule::DurationField::Seconds(retention.as_secs()));
        if spec.owner.is_none() {
            spec.owner = Some(caller.user.clone());
        }

        let app = self
            .sup
            .registry()
            .add(
                spec,
                RegisterOptions {
                    ephemeral: true,
                    kind_override: Some(AppKind::OneShot),
                    ..Default::default()
                },
            )
            .await?;

        // Interactive: a failed spawn surfaces to the caller right here.
        match app
            .launch_now(Utc::now(), self.sup.config(), self.sup.bus())
            .await
        {
            Ok(()) => Ok(app),
            Err(e) => {
                let _ = self.sup.registry().remove(app.name()).await;
                Err(e)
            }
        }
    }

    fn cancel_suicide(&self, name: &str) {
        if let Some((_, timers)) = self.suicide_timers.remove(name) {
            for id in timers {
                self.sup.timer_wheel().cancel(id);
            }
        }
    }
}
