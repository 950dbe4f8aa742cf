//! # Application: the per-application lifecycle state machine.
//!
//! One [`Application`] owns everything mutable about a registered app behind
//! a single async mutex; `enable`, `disable`, `evaluate` and reap handling
//! are serialized by it, so observers see one total order per application.
//!
//! ## State machine (driven by `evaluate()` on every supervisor tick)
//! ```text
//! Enabled ──┬─ no process, instant due, window open ──► launch (C3/C4)
//!           ├─ process exited ──► reap: rc, starts_count, exit_behavior
//!           │      standby   → wait next instant
//!           │      restart   → relaunch now
//!           │      keepalive → relaunch now if rc ≠ 0, else standby
//!           │      remove    → cooldown, removed after retention
//!           │      (Periodic/Cron override standby with the next grid hit;
//!           │       OneShot always cools down; UnInitialized promotes its
//!           │       carried definition on rc = 0)
//!           └─ process running, Periodic/Cron instant due ──► replace:
//!                  old handle to a kill worker, relaunch once it is gone
//! Disabled ──► kill worker for any live process; nothing else happens
//! ```
//!
//! ## Rules
//! - At most one live child, ever: a pending kill blocks the next launch
//! - Kill escalation runs on a worker; `evaluate()` never blocks on it
//! - A spawn failure is recorded (`start_error`), published, and retried at
//!   the next eligible instant; it never unwinds the supervisor

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::AppError;
use crate::events::{Bus, Event, EventKind};
use crate::process::{
    AppProcess, DockerProcess, FetchChunk, OutputRing, ProcessHandle,
};
use crate::schedule::ScheduleTimer;

use super::kind::{AppKind, ExitBehavior};
use super::permission::{OwnerPermission, Relation};
use super::spec::{AppSpec, DesiredState};

/// Grace given to a replaced/disabled process before SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(3);

/// Externally visible lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppStatus {
    NotAvailable,
    Enabled,
    Disabled,
    Initializing,
}

/// What the registry must do after one `evaluate()`.
#[derive(Debug)]
pub enum EvalOutcome {
    /// Nothing; the application stays registered.
    Keep,
    /// Retention elapsed (OneShot / exit_behavior=remove): unregister.
    Remove,
    /// UnInitialized pre-start succeeded: replace with the carried spec.
    Promote(Box<Value>),
}

struct AppState {
    spec: AppSpec,
    timer: ScheduleTimer,
    status: AppStatus,
    process: Option<Arc<dyn ProcessHandle>>,
    /// Survives the process so output stays fetchable after exit.
    ring: Option<Arc<OutputRing>>,
    next_start: Option<DateTime<Utc>>,
    last_return_code: Option<i32>,
    starts_count: u64,
    healthy: bool,
    last_start_time: Option<DateTime<Utc>>,
    start_error: Option<String>,
    process_uuid: Option<String>,
    /// Cooldown deadline after which the registry reclaims the record.
    remove_at: Option<DateTime<Utc>>,
    /// Terminal for this registration: no further launches.
    no_requeue: bool,
    /// Set while a kill worker still owns the previous process.
    killing: Option<Arc<AtomicBool>>,
}

/// A registered application and its runtime state.
pub struct Application {
    name: String,
    kind: AppKind,
    ephemeral: bool,
    cloud: bool,
    registered_at: DateTime<Utc>,
    state: Mutex<AppState>,
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("ephemeral", &self.ephemeral)
            .field("cloud", &self.cloud)
            .field("registered_at", &self.registered_at)
            .finish()
    }
}

impl Application {
    /// Creates the runtime record for a validated spec.
    pub fn new(
        spec: AppSpec,
        kind_override: Option<AppKind>,
        ephemeral: bool,
        cloud: bool,
        now: DateTime<Utc>,
    ) -> Result<Arc<Self>, AppError> {
        spec.validate()?;
        let kind = kind_override.unwrap_or_else(|| spec.kind());
        let timer = spec.timer(now)?;
        let enabled = spec.desired_state == DesiredState::Enabled;
        let status = match (kind, enabled) {
            (AppKind::UnInitialized, true) => AppStatus::Initializing,
            (_, true) => AppStatus::Enabled,
            (_, false) => AppStatus::Disabled,
        };
        let next_start = enabled.then(|| timer.next_time(now)).flatten();

        Ok(Arc::new(Self {
            name: spec.name.clone(),
            kind,
            ephemeral,
            cloud,
            registered_at: now,
            state: Mutex::new(AppState {
                spec,
                timer,
                status,
                process: None,
                ring: None,
                next_start,
                last_return_code: None,
                starts_count: 0,
                healthy: false,
                last_start_time: None,
                start_error: None,
                process_uuid: None,
                remove_at: None,
                no_requeue: false,
                killing: None,
            }),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> AppKind {
        self.kind
    }

    /// Ephemeral run-once registrations are never flushed to the
    /// configuration file.
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// Cloud-managed applications cannot be overwritten locally.
    pub fn is_cloud(&self) -> bool {
        self.cloud
    }

    /// Ownership facts for the permission gate.
    pub async fn ownership(&self) -> (Option<String>, Option<String>, OwnerPermission) {
        let st = self.state.lock().await;
        (
            st.spec.owner.clone(),
            st.spec.owner_group.clone(),
            st.spec.owner_permission,
        )
    }

    /// Relation of `user`/`group` to this application's owner.
    pub async fn relation_of(&self, user: &str, group: Option<&str>) -> Relation {
        let st = self.state.lock().await;
        match &st.spec.owner {
            None => Relation::Owner, // unowned apps are unrestricted
            Some(owner) if owner == user => Relation::Owner,
            Some(_) => {
                if st.spec.owner_group.is_some() && st.spec.owner_group.as_deref() == group {
                    Relation::Group
                } else {
                    Relation::Other
                }
            }
        }
    }

    /// The ownership gate in one call: does `user`/`group` get the requested
    /// access level on this application?
    pub async fn permits(&self, user: &str, group: Option<&str>, write: bool) -> bool {
        let st = self.state.lock().await;
        let relation = match &st.spec.owner {
            None => Relation::Owner,
            Some(owner) if owner == user => Relation::Owner,
            Some(_) if st.spec.owner_group.is_some() && st.spec.owner_group.as_deref() == group => {
                Relation::Group
            }
            Some(_) => Relation::Other,
        };
        st.spec.owner_permission.allows(relation, write)
    }

    /// The raw (unredacted) spec, for configuration flushes.
    pub async fn spec_json(&self) -> Value {
        let st = self.state.lock().await;
        serde_json::to_value(&st.spec).expect("spec serializes")
    }

    /// True while the application's process (or spawn worker) is live.
    pub async fn is_running(&self) -> bool {
        let st = self.state.lock().await;
        st.process.as_ref().is_some_and(|p| p.running())
    }

    /// Current pid, if a live process is tracked.
    pub async fn current_pid(&self) -> Option<i32> {
        let st = self.state.lock().await;
        st.process.as_ref().and_then(|p| p.pid())
    }

    /// Snapshot entry `(pid, start_ticks, container_id)` for crash recovery.
    ///
    /// Synthetic pids (container spawn in flight) are not recoverable and
    /// yield `None`.
    pub async fn live_entry(&self) -> Option<(i32, u64, Option<String>)> {
        let st = self.state.lock().await;
        let p = st.process.as_ref()?;
        let pid = p.pid().filter(|pid| *pid > 1)?;
        Some((pid, p.start_time().unwrap_or(0), p.container_id()))
    }

    /// Stamps the ephemeral run uuid (`run_async` / `run_sync`).
    pub async fn set_process_uuid(&self, uuid: String) {
        self.state.lock().await.process_uuid = Some(uuid);
    }

    // ------------------------------------------------------------------
    // Lifecycle operations
    // ------------------------------------------------------------------

    /// Enables the application. Idempotent.
    pub async fn enable(&self, now: DateTime<Utc>, bus: &Bus) {
        let mut st = self.state.lock().await;
        if matches!(st.status, AppStatus::Enabled | AppStatus::Initializing) {
            return;
        }
        st.spec.desired_state = DesiredState::Enabled;
        st.status = if self.kind == AppKind::UnInitialized {
            AppStatus::Initializing
        } else {
            AppStatus::Enabled
        };
        st.no_requeue = false;
        st.remove_at = None;
        st.start_error = None;
        st.next_start = st.timer.next_time(now);
        bus.publish(Event::now(EventKind::AppEnabled).with_app(&self.name));
    }

    /// Disables the application, killing any live process. Idempotent.
    pub async fn disable(self: &Arc<Self>, bus: &Bus) {
        let mut st = self.state.lock().await;
        st.spec.desired_state = DesiredState::Disabled;
        if st.status == AppStatus::Disabled && st.process.is_none() {
            return;
        }
        st.status = AppStatus::Disabled;
        st.next_start = None;
        if let Some(old) = st.process.take() {
            self.kill_detached(&mut st, old);
        }
        bus.publish(Event::now(EventKind::AppDisabled).with_app(&self.name));
    }

    /// Kills any live process and waits for the worker to finish.
    ///
    /// Used on unregister, where the caller needs the process gone before
    /// the record disappears.
    pub async fn shutdown_process(self: &Arc<Self>) {
        let handle = {
            let mut st = self.state.lock().await;
            st.next_start = None;
            st.process.take()
        };
        if let Some(p) = handle {
            p.kill_group(KILL_GRACE).await;
        }
    }

    /// Hands a no-longer-wanted process to a kill worker.
    ///
    /// The `killing` flag keeps the launch path blocked until the old
    /// process group is confirmed gone (invariant: one live child).
    fn kill_detached(self: &Arc<Self>, st: &mut AppState, old: Arc<dyn ProcessHandle>) {
        let flag = Arc::new(AtomicBool::new(true));
        st.killing = Some(Arc::clone(&flag));
        let app = Arc::clone(self);
        tokio::spawn(async move {
            old.kill_group(KILL_GRACE).await;
            let mut st = app.state.lock().await;
            st.last_return_code = old.exit_code();
            st.starts_count += 1;
            flag.store(false, Ordering::Release);
        });
    }

    // ------------------------------------------------------------------
    // The tick
    // ------------------------------------------------------------------

    /// One scheduling decision. Called by the supervisor every tick; must
    /// stay bounded (kill escalation and container CLI live on workers).
    pub async fn evaluate(
        self: &Arc<Self>,
        now: DateTime<Utc>,
        cfg: &Config,
        bus: &Bus,
    ) -> EvalOutcome {
        let mut st = self.state.lock().await;

        if !matches!(st.status, AppStatus::Enabled | AppStatus::Initializing) {
            return EvalOutcome::Keep;
        }

        // A previous process is still being killed: hold every launch.
        if let Some(flag) = &st.killing {
            if flag.load(Ordering::Acquire) {
                return EvalOutcome::Keep;
            }
            st.killing = None;
        }

        // Reap, or replace a running Periodic/Cron process at its instant.
        if let Some(p) = st.process.clone() {
            if p.running() {
                if self.kind.replaces_at_next_instant()
                    && st.next_start.is_some_and(|t| now >= t)
                    && st.timer.in_window(now)
                {
                    let old = st.process.take().expect("checked above");
                    self.kill_detached(&mut st, old);
                    // Launch resumes on a later tick, once the kill worker
                    // clears the flag; next_start stays due.
                }
                return EvalOutcome::Keep;
            }
            if let Some(outcome) = self.reap(&mut st, p, now, bus) {
                return outcome;
            }
        }

        // Retention cooldown.
        if let Some(t) = st.remove_at {
            if now >= t {
                return EvalOutcome::Remove;
            }
        }
        if st.no_requeue {
            return EvalOutcome::Keep;
        }

        // Launch decision.
        if st.next_start.is_none() {
            st.next_start = st.timer.next_time(now);
        }
        let Some(due) = st.next_start else {
            return EvalOutcome::Keep; // idle: never eligible again
        };
        if now < due {
            return EvalOutcome::Keep;
        }
        if !st.timer.in_window(now) {
            // The instant came and went outside the window (daemon paused,
            // clock jump); fold forward.
            st.next_start = st.timer.next_time(now);
            return EvalOutcome::Keep;
        }
        self.launch(&mut st, now, cfg, bus).await;
        EvalOutcome::Keep
    }

    /// Post-exit bookkeeping and the per-kind "what next" decision.
    fn reap(
        self: &Arc<Self>,
        st: &mut AppState,
        p: Arc<dyn ProcessHandle>,
        now: DateTime<Utc>,
        bus: &Bus,
    ) -> Option<EvalOutcome> {
        let rc = p.exit_code().unwrap_or(-1);
        st.process = None;
        st.last_return_code = Some(rc);
        st.starts_count += 1;
        if let Some(e) = p.start_error() {
            st.start_error = Some(e);
        }
        bus.publish(
            Event::now(EventKind::AppExited)
                .with_app(&self.name)
                .with_exit_code(rc),
        );

        match self.kind {
            AppKind::UnInitialized => {
                if rc == 0 {
                    let payload = st
                        .spec
                        .initial_application
                        .clone()
                        .expect("uninitialized spec carries a payload");
                    return Some(EvalOutcome::Promote(payload));
                }
                warn!(app = %self.name, rc, "pre-start command failed; disabling");
                st.status = AppStatus::Disabled;
                st.next_start = None;
            }
            AppKind::OneShot => {
                st.no_requeue = true;
                st.remove_at = Some(now + self.retention(st));
            }
            _ => match st.spec.exit_behavior {
                ExitBehavior::Remove => {
                    st.no_requeue = true;
                    st.remove_at = Some(now + self.retention(st));
                }
                ExitBehavior::Restart => st.next_start = Some(now),
                ExitBehavior::Keepalive => {
                    st.next_start = if rc != 0 {
                        Some(now)
                    } else {
                        st.timer.next_time(now)
                    };
                }
                ExitBehavior::Standby => st.next_start = st.timer.next_time(now),
            },
        }
        None
    }

    fn retention(&self, st: &AppState) -> chrono::Duration {
        let d = st
            .spec
            .retention
            .as_ref()
            .and_then(|r| r.to_duration().ok())
            .unwrap_or(Duration::ZERO);
        chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
    }

    /// Starts the process for this spec; failures are recorded, never thrown.
    async fn launch(self: &Arc<Self>, st: &mut AppState, now: DateTime<Utc>, cfg: &Config, bus: &Bus) {
        bus.publish(Event::now(EventKind::AppStarting).with_app(&self.name));

        let ring = match OutputRing::create(
            cfg.output_dir.clone(),
            self.name.clone(),
            cfg.stdout_cache_num,
            cfg.stdout_cache_size,
        ) {
            Ok(r) => Arc::new(r),
            Err(e) => {
                warn!(app = %self.name, error = %e, "output ring unavailable");
                st.start_error = Some(e.to_string());
                st.next_start = st.timer.next_time(now + chrono::Duration::seconds(1));
                return;
            }
        };

        let ctx = st.spec.launch_context(
            cfg.default_exec_user.as_deref(),
            cfg.default_work_dir.as_ref(),
        );

        let spawned: Result<Arc<dyn ProcessHandle>, AppError> = if ctx.docker_image.is_some() {
            DockerProcess::spawn(&ctx, Arc::clone(&ring)).map(|p| Arc::new(p) as _)
        } else {
            AppProcess::spawn(&ctx, Arc::clone(&ring))
                .await
                .map(|p| Arc::new(p) as _)
        };

        match spawned {
            Ok(p) => {
                let pid = p.pid().unwrap_or(0);
                st.process = Some(p);
                st.ring = Some(ring);
                st.last_start_time = Some(now);
                st.start_error = None;
                // Periodic/Cron need the upcoming instant while running, for
                // the replace decision; everyone else re-queues at reap.
                st.next_start = if self.kind.replaces_at_next_instant() {
                    st.timer.next_time(now + chrono::Duration::seconds(1))
                } else {
                    None
                };
                bus.publish(
                    Event::now(EventKind::AppStarted)
                        .with_app(&self.name)
                        .with_pid(pid),
                );
            }
            Err(e) => {
                let msg = e.to_string();
                st.start_error = Some(msg.clone());
                bus.publish(
                    Event::now(EventKind::SpawnFailed)
                        .with_app(&self.name)
                        .with_error(msg),
                );
                if self.kind.reschedules_after_reap() {
                    st.next_start = st.timer.next_time(now + chrono::Duration::seconds(1));
                } else {
                    // OneShot / UnInitialized never retry a failed start.
                    st.no_requeue = true;
                    st.remove_at = Some(now + self.retention(st));
                }
            }
        }
    }

    /// Launches immediately, bypassing the schedule. Used by run-once.
    ///
    /// Returns `SpawnFailed` synchronously so interactive callers see it.
    pub async fn launch_now(
        self: &Arc<Self>,
        now: DateTime<Utc>,
        cfg: &Config,
        bus: &Bus,
    ) -> Result<(), AppError> {
        let mut st = self.state.lock().await;
        if st.process.as_ref().is_some_and(|p| p.running()) {
            return Err(AppError::Conflict(format!(
                "application '{}' is already running",
                self.name
            )));
        }
        st.next_start = Some(now);
        self.launch(&mut st, now, cfg, bus).await;
        match &st.start_error {
            Some(e) => Err(AppError::SpawnFailed(e.clone())),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Crash recovery
    // ------------------------------------------------------------------

    /// Re-attaches to a surviving process recorded in the snapshot.
    ///
    /// On success the application enters `Running` directly, skipping the
    /// initial scheduling decision.
    pub async fn try_attach(
        &self,
        pid: i32,
        start_ticks: u64,
        container_id: Option<String>,
        cfg: &Config,
        now: DateTime<Utc>,
    ) -> bool {
        let mut st = self.state.lock().await;
        if st.process.is_some() {
            return false;
        }
        let ring = match OutputRing::reopen(
            cfg.output_dir.clone(),
            self.name.clone(),
            cfg.stdout_cache_num,
            cfg.stdout_cache_size,
        ) {
            Ok(r) => Arc::new(r),
            Err(_) => return false,
        };

        let attached: Result<Arc<dyn ProcessHandle>, AppError> = match container_id {
            Some(id) if st.spec.docker_image.is_some() => {
                DockerProcess::attach(id, pid, Arc::clone(&ring)).map(|p| Arc::new(p) as _)
            }
            _ => AppProcess::attach(pid, start_ticks, Arc::clone(&ring)).map(|p| Arc::new(p) as _),
        };

        match attached {
            Ok(p) => {
                info!(app = %self.name, pid, "re-attached to surviving process");
                st.process = Some(p);
                st.ring = Some(ring);
                st.status = AppStatus::Enabled;
                st.last_start_time = Some(now);
                st.next_start = if self.kind.replaces_at_next_instant() {
                    st.timer.next_time(now + chrono::Duration::seconds(1))
                } else {
                    None
                };
                true
            }
            Err(e) => {
                warn!(app = %self.name, pid, error = %e, "re-attach failed");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Output & waiting
    // ------------------------------------------------------------------

    /// Positional output read; validates the run uuid when the caller
    /// supplies one.
    pub async fn fetch_output(
        &self,
        index: u64,
        position: u64,
        process_uuid: Option<&str>,
    ) -> Result<FetchChunk, AppError> {
        let (ring, process) = {
            let st = self.state.lock().await;
            if let Some(expected) = process_uuid {
                if st.process_uuid.as_deref() != Some(expected) {
                    return Err(AppError::NotFound(format!(
                        "process uuid '{expected}' does not match a run of '{}'",
                        self.name
                    )));
                }
            }
            (st.ring.clone(), st.process.clone())
        };
        let Some(ring) = ring else {
            return Err(AppError::NotFound(format!(
                "application '{}' has produced no output",
                self.name
            )));
        };
        // Container logs are pulled on demand; lock released first.
        if let Some(p) = process {
            p.refresh_output().await;
        }
        ring.fetch(index, position)
    }

    /// Everything currently captured, oldest first.
    pub async fn read_all_output(&self) -> Result<Vec<u8>, AppError> {
        let ring = self.state.lock().await.ring.clone();
        match ring {
            Some(r) => r.read_all(),
            None => Ok(Vec::new()),
        }
    }

    /// Waits until the tracked process stops, up to `timeout`.
    ///
    /// Returns the recorded exit code, or `None` on deadline.
    pub async fn wait_stopped(&self, timeout: Duration) -> Option<i32> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let st = self.state.lock().await;
                match &st.process {
                    None => return st.last_return_code,
                    // The container monitor records the code a beat after the
                    // init pid dies; keep polling until it lands.
                    Some(p) if !p.running() => {
                        if let Some(code) = p.exit_code() {
                            return Some(code);
                        }
                    }
                    Some(_) => {}
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    /// Runs the health check (or mirrors liveness) and stores the result.
    ///
    /// Returns `Some(healthy)` when the state flipped. The check command
    /// inherits the application's environment; the lock is not held while
    /// it runs.
    pub async fn check_health(&self, timeout: Duration) -> Option<bool> {
        let (cmd, env, running, active) = {
            let st = self.state.lock().await;
            (
                st.spec.health_check_command.clone(),
                st.spec.environment.clone(),
                st.process.as_ref().is_some_and(|p| p.running()),
                st.status == AppStatus::Enabled,
            )
        };

        let healthy = match cmd {
            Some(cmd) if active => run_health_command(&cmd, &env, timeout).await,
            Some(_) => false,
            None => running,
        };

        let mut st = self.state.lock().await;
        let flipped = st.healthy != healthy;
        st.healthy = healthy;
        flipped.then_some(healthy)
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    /// Serialized snapshot: the redacted spec plus runtime fields.
    pub async fn view(&self) -> Value {
        let st = self.state.lock().await;
        let mut v = st.spec.redacted_json();
        let obj = v.as_object_mut().expect("spec is an object");
        let rfc3339 =
            |t: &DateTime<Utc>| Value::String(t.to_rfc3339_opts(SecondsFormat::Secs, true));
        obj.insert("kind".into(), serde_json::to_value(self.kind).unwrap());
        obj.insert("status".into(), serde_json::to_value(st.status).unwrap());
        obj.insert(
            "health".into(),
            json!(if st.healthy { 0 } else { 1 }),
        );
        obj.insert(
            "current_pid".into(),
            st.process.as_ref().and_then(|p| p.pid()).map_or(Value::Null, |p| json!(p)),
        );
        obj.insert(
            "last_return_code".into(),
            st.last_return_code.map_or(Value::Null, |c| json!(c)),
        );
        obj.insert("starts_count".into(), json!(st.starts_count));
        obj.insert("registration_time".into(), rfc3339(&self.registered_at));
        obj.insert(
            "last_start_time".into(),
            st.last_start_time.as_ref().map_or(Value::Null, rfc3339),
        );
        obj.insert(
            "next_start_time".into(),
            st.next_start.as_ref().map_or(Value::Null, rfc3339),
        );
        obj.insert(
            "start_error".into(),
            st.start_error.as_ref().map_or(Value::Null, |e| json!(e)),
        );
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cfg(dir: &TempDir) -> Config {
        let mut cfg = Config::default();
        cfg.output_dir = dir.path().join("work");
        cfg
    }

    fn make(json: serde_json::Value) -> Arc<Application> {
        let spec = AppSpec::from_json(&json).unwrap();
        Application::new(spec, None, false, false, Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn spawn_failure_records_error_and_keeps_record() {
        let dir = TempDir::new().unwrap();
        let app = make(serde_json::json!({
            "name": "broken",
            "command": "/definitely/not/a/binary"
        }));
        let bus = Bus::new(16);
        let outcome = app.evaluate(Utc::now(), &cfg(&dir), &bus).await;
        assert!(matches!(outcome, EvalOutcome::Keep));

        let view = app.view().await;
        assert!(view["start_error"]
            .as_str()
            .unwrap()
            .contains("/definitely/not/a/binary"));
        assert!(view["current_pid"].is_null());
    }

    #[tokio::test]
    async fn one_shot_cools_down_then_requests_removal() {
        let dir = TempDir::new().unwrap();
        let spec = AppSpec::from_json(&serde_json::json!({
            "name": "once",
            "command": "echo done",
            "retention": 0
        }))
        .unwrap();
        let app = Application::new(spec, Some(AppKind::OneShot), true, false, Utc::now()).unwrap();
        let bus = Bus::new(16);
        let config = cfg(&dir);

        app.launch_now(Utc::now(), &config, &bus).await.unwrap();
        assert_eq!(app.wait_stopped(Duration::from_secs(5)).await, Some(0));

        // The tick reaps, enters cooldown, and with zero retention asks for
        // removal right away. It never relaunches.
        assert!(matches!(
            app.evaluate(Utc::now(), &config, &bus).await,
            EvalOutcome::Remove
        ));
        let view = app.view().await;
        assert_eq!(view["starts_count"], 1);
        assert_eq!(view["last_return_code"], 0);
    }

    #[tokio::test]
    async fn disabled_app_never_launches() {
        let dir = TempDir::new().unwrap();
        let app = make(serde_json::json!({
            "name": "parked",
            "command": "sleep 5",
            "desired_state": "disabled"
        }));
        let bus = Bus::new(16);
        app.evaluate(Utc::now(), &cfg(&dir), &bus).await;
        assert!(!app.is_running().await);
        assert_eq!(app.view().await["status"], "disabled");
    }

    #[tokio::test]
    async fn health_mirrors_liveness_without_a_command() {
        let dir = TempDir::new().unwrap();
        let app = make(serde_json::json!({ "name": "hb", "command": "sleep 5" }));
        let bus = Bus::new(16);
        let config = cfg(&dir);

        // Not running yet: unhealthy, and the first check is not a flip
        // (initial state is unhealthy).
        assert_eq!(app.check_health(Duration::from_secs(1)).await, None);

        app.evaluate(Utc::now(), &config, &bus).await;
        assert_eq!(app.check_health(Duration::from_secs(1)).await, Some(true));
        assert_eq!(app.check_health(Duration::from_secs(1)).await, None);

        app.shutdown_process().await;
        assert_eq!(app.check_health(Duration::from_secs(1)).await, Some(false));
    }

    #[tokio::test]
    async fn health_command_verdict_wins_over_liveness() {
        let dir = TempDir::new().unwrap();
        let app = make(serde_json::json!({
            "name": "probed",
            "command": "sleep 5",
            "health_check_command": "exit 1"
        }));
        let bus = Bus::new(16);
        app.evaluate(Utc::now(), &cfg(&dir), &bus).await;
        assert!(app.is_running().await);
        // Running, but the probe fails: stays unhealthy (no flip from the
        // initial unhealthy state).
        assert_eq!(app.check_health(Duration::from_secs(2)).await, None);
        app.shutdown_process().await;
    }
}

/// Short-lived `sh -c` health probe. rc 0 ⇒ healthy; failure to spawn or a
/// timeout ⇒ unhealthy.
async fn run_health_command(
    cmd: &str,
    env: &std::collections::BTreeMap<String, String>,
    timeout: Duration,
) -> bool {
    let child = tokio::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .envs(env.iter())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .process_group(0)
        .spawn();
    let child = match child {
        Ok(c) => c,
        Err(_) => return false,
    };
    let pid = child.id().unwrap_or(0) as i32;
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(out)) => out.status.success(),
        Ok(Err(_)) => false,
        Err(_) => {
            if pid > 0 {
                let _ = nix::sys::signal::killpg(
                    nix::unistd::Pid::from_raw(pid),
                    nix::sys::signal::Signal::SIGKILL,
                );
            }
            false
        }
    }
}
