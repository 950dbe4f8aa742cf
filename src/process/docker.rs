//! # DockerProcess: container executor behind the same contract as native.
//!
//! The container runtime already ships a stable CLI; re-implementing its
//! client gains nothing, so the boundary stays `docker …` invocations with
//! stdout parsing treated as a trust-bounded contract.
//!
//! ## Spawn flow (worker task; image pulls may take minutes)
//! ```text
//! spawn() ─► synthetic pid 1, running()=true
//!    └─► worker:
//!         1. docker rm -f <name>              (stale container cleanup)
//!         2. docker image inspect <image>     (missing → docker pull,
//!            bounded by APPMESH_IMAGE_PULL_TIMEOUT, default 300 s)
//!         3. docker run -d --name <name> …    (env, limits, APP_DOCKER_OPTS)
//!         4. docker inspect .State.Pid        (pid ≤ 1 → failure + cleanup)
//!         5. monitor: poll init pid, fetch .State.ExitCode on death
//! ```
//!
//! ## Rules
//! - Failures surface through `start_error`, never a panic
//! - `kill_group` removes the container by id with a 3-second CLI deadline
//!   and kills an in-flight pull's process group
//! - Output is pulled on demand via `docker logs --since <last-fetch>`

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::AppError;

use super::{is_alive, proc_start_time, LaunchContext, OutputRing, ProcessHandle};

/// Env var bounding an image pull, in seconds.
const PULL_TIMEOUT_ENV: &str = "APPMESH_IMAGE_PULL_TIMEOUT";
/// Default pull deadline: 5 minutes.
const PULL_TIMEOUT_DEFAULT: u64 = 300;
/// Env var with extra flags for `docker run` (`-p`, `-v`, …).
const DOCKER_OPTS_ENV: &str = "APP_DOCKER_OPTS";
/// Deadline for ordinary CLI calls.
const CLI_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline for the `rm -f` issued by `kill_group`.
const REMOVE_TIMEOUT: Duration = Duration::from_secs(3);

struct DockerState {
    container_id: Mutex<Option<String>>,
    /// 0 = none, 1 = synthetic (spawn in flight), >1 = container init pid.
    pid: AtomicI32,
    spawning: AtomicBool,
    exit_code: Mutex<Option<i32>>,
    start_error: Mutex<Option<String>>,
    /// Pid of an in-flight `docker pull`, for group kill on cancellation.
    pull_pid: AtomicI32,
    last_fetch: Mutex<DateTime<Utc>>,
}

impl DockerState {
    fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(error = %reason, "container start failed");
        *self.start_error.lock().expect("start_error poisoned") = Some(reason);
        self.spawning.store(false, Ordering::Release);
        self.pid.store(0, Ordering::Release);
    }
}

/// A containerized process tracked by one application.
pub struct DockerProcess {
    state: Arc<DockerState>,
    ring: Arc<OutputRing>,
}

impl DockerProcess {
    /// Starts the container asynchronously.
    ///
    /// Returns immediately with a synthetic pid of 1; `running()` stays true
    /// while the worker pulls the image and starts the container.
    pub fn spawn(ctx: &LaunchContext, ring: Arc<OutputRing>) -> Result<Self, AppError> {
        let image = ctx
            .docker_image
            .clone()
            .ok_or_else(|| AppError::InvalidInput("docker_image is required".into()))?;

        let state = Arc::new(DockerState {
            container_id: Mutex::new(None),
            pid: AtomicI32::new(1),
            spawning: AtomicBool::new(true),
            exit_code: Mutex::new(None),
            start_error: Mutex::new(None),
            pull_pid: AtomicI32::new(0),
            last_fetch: Mutex::new(Utc::now()),
        });

        let worker_state = Arc::clone(&state);
        let worker_ring = Arc::clone(&ring);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            run_spawn(ctx, image, worker_state, worker_ring).await;
        });

        Ok(Self { state, ring })
    }

    /// Rebinds to a container that survived a daemon restart.
    ///
    /// `pid` must be the container's init pid and still alive; liveness and
    /// exit tracking resume exactly as after a normal start.
    pub fn attach(container_id: String, pid: i32, ring: Arc<OutputRing>) -> Result<Self, AppError> {
        if pid <= 1 || !is_alive(pid) {
            return Err(AppError::Transient(format!(
                "container init pid {pid} is gone"
            )));
        }
        let state = Arc::new(DockerState {
            container_id: Mutex::new(Some(container_id.clone())),
            pid: AtomicI32::new(pid),
            spawning: AtomicBool::new(false),
            exit_code: Mutex::new(None),
            start_error: Mutex::new(None),
            pull_pid: AtomicI32::new(0),
            last_fetch: Mutex::new(Utc::now()),
        });
        spawn_monitor(Arc::clone(&state), Arc::clone(&ring), pid, container_id);
        Ok(Self { state, ring })
    }

    fn container_id(&self) -> Option<String> {
        self.state
            .container_id
            .lock()
            .expect("container_id poisoned")
            .clone()
    }
}

async fn run_spawn(ctx: LaunchContext, image: String, state: Arc<DockerState>, ring: Arc<OutputRing>) {
    let name = ctx.app_name.clone();

    // 0. A container with our name may be left over from a host restart.
    let _ = docker_cli(&["rm", "-f", &name], CLI_TIMEOUT, None).await;

    // 1. Image present?
    let present = match docker_cli(
        &["image", "inspect", "-f", "{{.Size}}", &image],
        CLI_TIMEOUT,
        None,
    )
    .await
    {
        Ok((0, out)) => out.trim().parse::<u64>().map(|n| n >= 1).unwrap_or(false),
        _ => false,
    };
    if !present {
        *state.start_error.lock().expect("start_error poisoned") =
            Some(format!("docker image <{image}> not present, pulling"));
        let timeout = pull_timeout(&ctx);
        match docker_cli(&["pull", &image], timeout, Some(&state.pull_pid)).await {
            Ok((0, _)) => debug!(image = %image, "image pulled"),
            Ok((rc, out)) => {
                return state.fail(format!("docker pull <{image}> exited {rc}: {}", out.trim()));
            }
            Err(e) => return state.fail(format!("docker pull <{image}>: {e}")),
        }
        state.pull_pid.store(0, Ordering::Release);
    }

    // 2. Assemble the run command.
    let mut args: Vec<String> = vec!["run".into(), "-d".into(), "--name".into(), name.clone()];
    for (key, value) in &ctx.env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }
    let extra = ctx
        .env
        .get(DOCKER_OPTS_ENV)
        .cloned()
        .or_else(|| std::env::var(DOCKER_OPTS_ENV).ok());
    if let Some(extra) = extra {
        args.extend(extra.split_whitespace().map(str::to_string));
    }
    if let Some(mb) = ctx.limits.memory_mb {
        args.push("--memory".into());
        args.push(format!("{mb}M"));
        if let Some(total) = ctx.limits.memory_plus_swap_mb.filter(|t| *t > mb) {
            args.push("--memory-swap".into());
            args.push(format!("{}M", total - mb));
        }
    }
    if let Some(shares) = ctx.limits.cpu_shares {
        args.push("--cpu-shares".into());
        args.push(shares.to_string());
    }
    args.push(image.clone());
    if ctx.shell_mode {
        args.extend(["/bin/sh".into(), "-c".into(), ctx.command.clone()]);
    } else {
        match super::native::split_command(&ctx.command) {
            Ok(argv) => args.extend(argv),
            Err(e) => return state.fail(e.to_string()),
        }
    }

    // 3. Start it.
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let container_id = match docker_cli(&arg_refs, CLI_TIMEOUT, None).await {
        Ok((0, out)) => {
            let id = out.lines().next().unwrap_or("").trim().to_string();
            if id.is_empty() {
                return state.fail(format!("no container id in docker run output <{out}>"));
            }
            id
        }
        Ok((rc, out)) => {
            return state.fail(format!("docker run exited {rc}: {}", out.trim()));
        }
        Err(e) => return state.fail(format!("docker run: {e}")),
    };
    *state.container_id.lock().expect("container_id poisoned") = Some(container_id.clone());

    // 4. Resolve the container's init pid and attach to it.
    let pid = match docker_cli(
        &["inspect", "-f", "{{.State.Pid}}", &container_id],
        CLI_TIMEOUT,
        None,
    )
    .await
    {
        Ok((0, out)) => out.trim().parse::<i32>().unwrap_or(0),
        _ => 0,
    };
    if pid <= 1 {
        let _ = docker_cli(&["rm", "-f", &container_id], REMOVE_TIMEOUT, None).await;
        *state.container_id.lock().expect("container_id poisoned") = None;
        return state.fail(format!(
            "container <{container_id}> reported init pid {pid}"
        ));
    }

    debug!(pid, container = %container_id, "container started");
    state.pid.store(pid, Ordering::Release);
    state.spawning.store(false, Ordering::Release);

    // 5. Watch the init pid; collect the exit code when it dies.
    spawn_monitor(state, ring, pid, container_id);
}

/// Polls the container's init pid; on death, records the exit code from
/// `docker inspect` and marks the ring terminated.
fn spawn_monitor(state: Arc<DockerState>, ring: Arc<OutputRing>, pid: i32, container_id: String) {
    let start_ticks = proc_start_time(pid);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let gone =
                !is_alive(pid) || (start_ticks.is_some() && proc_start_time(pid) != start_ticks);
            if gone {
                break;
            }
        }
        let code = match docker_cli(
            &["inspect", "-f", "{{.State.ExitCode}}", &container_id],
            CLI_TIMEOUT,
            None,
        )
        .await
        {
            Ok((0, out)) => out.trim().parse::<i32>().unwrap_or(-1),
            _ => -1,
        };
        *state.exit_code.lock().expect("exit_code poisoned") = Some(code);
        state.pid.store(0, Ordering::Release);
        ring.mark_terminated(Some(code));
    });
}

fn pull_timeout(ctx: &LaunchContext) -> Duration {
    let from_env = ctx
        .env
        .get(PULL_TIMEOUT_ENV)
        .cloned()
        .or_else(|| std::env::var(PULL_TIMEOUT_ENV).ok())
        .and_then(|v| v.parse::<u64>().ok());
    Duration::from_secs(from_env.unwrap_or(PULL_TIMEOUT_DEFAULT))
}

/// Runs one `docker` CLI invocation with a deadline.
///
/// The child gets its own process group so a timeout can kill the whole CLI
/// subtree; the pgid is exposed through `record_pid` for external cancel
/// (in-flight pulls).
async fn docker_cli(
    args: &[&str],
    timeout: Duration,
    record_pid: Option<&AtomicI32>,
) -> Result<(i32, String), AppError> {
    let mut cmd = tokio::process::Command::new("docker");
    cmd.args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .process_group(0);

    let child = cmd
        .spawn()
        .map_err(|e| AppError::SpawnFailed(format!("docker {}: {e}", args.first().unwrap_or(&""))))?;
    let pid = child.id().unwrap_or(0) as i32;
    if let Some(slot) = record_pid {
        slot.store(pid, Ordering::Release);
    }

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            if !output.status.success() {
                text.push_str(&String::from_utf8_lossy(&output.stderr));
            }
            Ok((output.status.code().unwrap_or(-1), text))
        }
        Ok(Err(e)) => Err(AppError::Transient(format!("docker wait: {e}"))),
        Err(_) => {
            if pid > 0 {
                let _ = nix::sys::signal::killpg(Pid::from_raw(pid), Signal::SIGKILL);
            }
            Err(AppError::Timeout { timeout })
        }
    }
}

#[async_trait]
impl ProcessHandle for DockerProcess {
    fn pid(&self) -> Option<i32> {
        if self.state.spawning.load(Ordering::Acquire) {
            return Some(1);
        }
        let pid = self.state.pid.load(Ordering::Acquire);
        (pid > 1 && is_alive(pid)).then_some(pid)
    }

    fn running(&self) -> bool {
        self.pid().is_some()
    }

    fn exit_code(&self) -> Option<i32> {
        *self.state.exit_code.lock().expect("exit_code poisoned")
    }

    fn start_time(&self) -> Option<u64> {
        let pid = self.state.pid.load(Ordering::Acquire);
        (pid > 1).then(|| proc_start_time(pid)).flatten()
    }

    fn start_error(&self) -> Option<String> {
        self.state
            .start_error
            .lock()
            .expect("start_error poisoned")
            .clone()
    }

    fn container_id(&self) -> Option<String> {
        DockerProcess::container_id(self)
    }

    fn signal(&self, signal: Signal) -> Result<(), AppError> {
        let pid = self.state.pid.load(Ordering::Acquire);
        if pid <= 1 || !is_alive(pid) {
            return Err(AppError::NotFound("container process".into()));
        }
        nix::sys::signal::kill(Pid::from_raw(pid), signal)
            .map_err(|e| AppError::Transient(format!("kill({pid}, {signal}): {e}")))
    }

    async fn kill_group(&self, _term_timeout: Duration) {
        // Claim the id first so concurrent kills stay idempotent.
        let id = self
            .state
            .container_id
            .lock()
            .expect("container_id poisoned")
            .take();
        if let Some(id) = id {
            if let Err(e) = docker_cli(&["rm", "-f", &id], REMOVE_TIMEOUT, None).await {
                warn!(container = %id, error = %e, "container remove failed");
            }
        }
        let pull = self.state.pull_pid.swap(0, Ordering::AcqRel);
        if pull > 0 {
            let _ = nix::sys::signal::killpg(Pid::from_raw(pull), Signal::SIGKILL);
        }
        self.state.spawning.store(false, Ordering::Release);
        self.state.pid.store(0, Ordering::Release);
        self.ring.mark_terminated(self.exit_code());
    }

    async fn wait(&self, timeout: Duration) -> Option<i32> {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.running() {
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        self.exit_code()
    }

    async fn refresh_output(&self) {
        let Some(id) = self.container_id() else { return };
        let since = {
            let mut guard = self.state.last_fetch.lock().expect("last_fetch poisoned");
            let since = guard.to_rfc3339_opts(SecondsFormat::Secs, true);
            *guard = Utc::now();
            since
        };
        match docker_cli(&["logs", "--since", &since, &id], CLI_TIMEOUT, None).await {
            Ok((0, out)) if !out.is_empty() => {
                if let Err(e) = self.ring.append(out.as_bytes()) {
                    warn!(error = %e, "appending container logs failed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(container = %id, error = %e, "docker logs failed"),
        }
    }

    fn ring(&self) -> Arc<OutputRing> {
        Arc::clone(&self.ring)
    }
}
