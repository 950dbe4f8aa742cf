//! # AppProcess: native process executor.
//!
//! Spawns, tracks, limits, signals and reaps one child process.
//!
//! ## Launch sequence (in the forked child, before exec)
//! 1. `setsid()`: own session and process group, so `kill_group` is clean
//! 2. rlimits: `RLIMIT_AS` from `memory_mb`
//! 3. cgroup attach: cpu/memory controllers when the host exposes them
//! 4. `setgid` then `setuid`: privilege drop to `execution_user`
//!    (gid strictly before uid)
//! 5. close inherited descriptors beyond stdio
//!
//! ## Rules
//! - stdout and stderr stream into the application's [`OutputRing`]
//! - `metadata` bytes are written to the child's stdin, then stdin closes
//! - an attached process (crash recovery) is not a waitable child: liveness
//!   and "exit" come from procfs, and no exit code is available

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::AppError;

use super::{is_alive, proc_start_time, LaunchContext, OutputRing, ProcessHandle};

/// Exit bookkeeping shared between the wait task and the handle.
struct ExitState {
    done: AtomicBool,
    code: Mutex<Option<i32>>,
    notify: Notify,
}

enum Mode {
    /// Spawned by us; reaped by the wait task.
    Owned { exit: Arc<ExitState> },
    /// Adopted from a snapshot; procfs is the only source of truth.
    Attached { start_ticks: u64 },
}

/// A native child process tracked by one application.
pub struct AppProcess {
    pid: i32,
    pgid: Pid,
    start_ticks: u64,
    start_error: Mutex<Option<String>>,
    mode: Mode,
    ring: Arc<OutputRing>,
}

impl std::fmt::Debug for AppProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppProcess")
            .field("pid", &self.pid)
            .field("pgid", &self.pgid)
            .field("start_ticks", &self.start_ticks)
            .finish()
    }
}

impl AppProcess {
    /// Spawns the command described by `ctx`, wiring output into `ring`.
    pub async fn spawn(ctx: &LaunchContext, ring: Arc<OutputRing>) -> Result<Self, AppError> {
        let argv = if ctx.shell_mode {
            vec!["/bin/sh".to_string(), "-c".to_string(), ctx.command.clone()]
        } else {
            split_command(&ctx.command)?
        };
        if argv.is_empty() {
            return Err(AppError::InvalidInput("empty command".into()));
        }

        let creds = resolve_user(ctx.exec_user.as_deref())?;
        let cgroup_fd = prepare_cgroup(&ctx.app_name, &ctx.limits);
        let memory_bytes = ctx.limits.memory_mb.map(|mb| mb * 1024 * 1024);

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .envs(ctx.env.iter())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if ctx.stdin_blob.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if let Some(dir) = &ctx.working_dir {
            cmd.current_dir(dir);
        }

        // Child-side setup. Everything here must stay async-signal-safe:
        // raw syscalls only, no allocation (the cgroup fd was opened in the
        // parent for exactly that reason).
        unsafe {
            cmd.pre_exec(move || {
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if let Some(bytes) = memory_bytes {
                    let lim = libc::rlimit {
                        rlim_cur: bytes,
                        rlim_max: bytes,
                    };
                    let _ = libc::setrlimit(libc::RLIMIT_AS, &lim);
                }
                if let Some(fd) = cgroup_fd {
                    write_self_to_cgroup(fd);
                }
                if let Some((uid, gid)) = creds {
                    if libc::setgid(gid) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if libc::setuid(uid) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                // Stdio is already dup2'ed onto 0..2; drop the rest.
                let _ = libc::syscall(libc::SYS_close_range, 3, libc::c_uint::MAX, 0);
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| AppError::SpawnFailed(format!("exec '{}': {e}", argv[0])))?;
        let pid = child.id().ok_or_else(|| {
            AppError::SpawnFailed("child exited before it could be tracked".into())
        })? as i32;
        let start_ticks = proc_start_time(pid).unwrap_or(0);

        if let (Some(mut stdin), Some(blob)) = (child.stdin.take(), ctx.stdin_blob.clone()) {
            tokio::spawn(async move {
                let _ = stdin.write_all(&blob).await;
                // Dropping closes the descriptor; the child sees EOF.
            });
        }
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_into_ring(stdout, Arc::clone(&ring)));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_into_ring(stderr, Arc::clone(&ring)));
        }

        let exit = Arc::new(ExitState {
            done: AtomicBool::new(false),
            code: Mutex::new(None),
            notify: Notify::new(),
        });
        let exit_task = Arc::clone(&exit);
        let ring_task = Arc::clone(&ring);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status
                    .code()
                    .unwrap_or_else(|| 128 + status.signal().unwrap_or(0)),
                Err(e) => {
                    warn!(error = %e, "wait on child failed");
                    -1
                }
            };
            ring_task.mark_terminated(Some(code));
            *exit_task.code.lock().expect("exit mutex poisoned") = Some(code);
            exit_task.done.store(true, Ordering::Release);
            exit_task.notify.notify_waiters();
        });

        debug!(pid, command = %ctx.command, "spawned");
        Ok(Self {
            pid,
            pgid: Pid::from_raw(pid),
            start_ticks,
            start_error: Mutex::new(None),
            mode: Mode::Owned { exit },
            ring,
        })
    }

    /// Rebinds to a surviving process, verifying `(pid, start_ticks)` against
    /// procfs first.
    pub fn attach(pid: i32, start_ticks: u64, ring: Arc<OutputRing>) -> Result<Self, AppError> {
        match proc_start_time(pid) {
            Some(actual) if actual == start_ticks => {}
            Some(actual) => {
                return Err(AppError::Transient(format!(
                    "pid {pid} start time {actual} does not match recorded {start_ticks}"
                )))
            }
            None => {
                return Err(AppError::Transient(format!("pid {pid} is gone")));
            }
        }
        let pgid = nix::unistd::getpgid(Some(Pid::from_raw(pid))).unwrap_or(Pid::from_raw(pid));
        Ok(Self {
            pid,
            pgid,
            start_ticks,
            start_error: Mutex::new(None),
            mode: Mode::Attached { start_ticks },
            ring,
        })
    }

    fn attached_alive(&self, expected_ticks: u64) -> bool {
        is_alive(self.pid) && proc_start_time(self.pid) == Some(expected_ticks)
    }
}

#[async_trait]
impl ProcessHandle for AppProcess {
    fn pid(&self) -> Option<i32> {
        self.running().then_some(self.pid)
    }

    fn running(&self) -> bool {
        match &self.mode {
            Mode::Owned { exit } => !exit.done.load(Ordering::Acquire),
            Mode::Attached { start_ticks } => self.attached_alive(*start_ticks),
        }
    }

    fn exit_code(&self) -> Option<i32> {
        match &self.mode {
            Mode::Owned { exit } => *exit.code.lock().expect("exit mutex poisoned"),
            // Not our child: the real code went to whoever reaped it.
            // Recorded as 0 once the process is observed gone.
            Mode::Attached { start_ticks } => (!self.attached_alive(*start_ticks)).then_some(0),
        }
    }

    fn start_time(&self) -> Option<u64> {
        (self.start_ticks > 0).then_some(self.start_ticks)
    }

    fn start_error(&self) -> Option<String> {
        self.start_error.lock().expect("start_error poisoned").clone()
    }

    fn signal(&self, signal: Signal) -> Result<(), AppError> {
        if !self.running() {
            return Err(AppError::NotFound(format!("pid {}", self.pid)));
        }
        nix::sys::signal::kill(Pid::from_raw(self.pid), signal)
            .map_err(|e| AppError::Transient(format!("kill({}, {signal}): {e}", self.pid)))
    }

    async fn kill_group(&self, term_timeout: Duration) {
        if !self.running() {
            return;
        }
        let _ = killpg(self.pgid, Signal::SIGTERM);
        if self.wait(term_timeout).await.is_none() {
            let _ = killpg(self.pgid, Signal::SIGKILL);
            // Give the reaper a moment so callers observe the exit.
            let _ = self.wait(Duration::from_secs(1)).await;
        }
    }

    async fn wait(&self, timeout: Duration) -> Option<i32> {
        let deadline = tokio::time::Instant::now() + timeout;
        match &self.mode {
            Mode::Owned { exit } => {
                let exit = Arc::clone(exit);
                loop {
                    // Register before checking the flag; otherwise a wakeup
                    // between check and registration is lost.
                    let notified = exit.notify.notified();
                    if exit.done.load(Ordering::Acquire) {
                        return *exit.code.lock().expect("exit mutex poisoned");
                    }
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return None;
                    }
                }
            }
            Mode::Attached { start_ticks } => {
                let ticks = *start_ticks;
                while self.attached_alive(ticks) {
                    if tokio::time::Instant::now() >= deadline {
                        return None;
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                // Reaped elsewhere; exit code unavailable.
                Some(0)
            }
        }
    }

    async fn refresh_output(&self) {
        // Native output streams continuously; nothing buffered externally.
    }

    fn ring(&self) -> Arc<OutputRing> {
        Arc::clone(&self.ring)
    }
}

async fn pump_into_ring(
    mut source: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    ring: Arc<OutputRing>,
) {
    let mut buf = [0u8; 8192];
    loop {
        match source.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Err(e) = ring.append(&buf[..n]) {
                    warn!(error = %e, "output ring append failed");
                    break;
                }
            }
        }
    }
}

/// Resolves `execution_user` to raw ids before fork.
fn resolve_user(name: Option<&str>) -> Result<Option<(libc::uid_t, libc::gid_t)>, AppError> {
    let Some(name) = name else { return Ok(None) };
    let user = nix::unistd::User::from_name(name)
        .map_err(|e| AppError::SpawnFailed(format!("lookup user '{name}': {e}")))?
        .ok_or_else(|| AppError::SpawnFailed(format!("unknown user '{name}'")))?;
    Ok(Some((user.uid.as_raw(), user.gid.as_raw())))
}

/// Creates `/sys/fs/cgroup/appvisor/<app>` with the requested caps and
/// returns a raw fd to its `cgroup.procs`, pre-opened so the child can join
/// without allocating. `None` when the host offers no writable cgroup tree.
fn prepare_cgroup(app_name: &str, limits: &super::ResourceLimits) -> Option<std::os::fd::RawFd> {
    if limits.is_empty() {
        return None;
    }
    let dir = Path::new("/sys/fs/cgroup/appvisor").join(app_name.replace('/', "_"));
    std::fs::create_dir_all(&dir).ok()?;
    if let Some(shares) = limits.cpu_shares {
        // cgroup v2 weight range is 1..=10000.
        let _ = std::fs::write(dir.join("cpu.weight"), shares.clamp(1, 10_000).to_string());
    }
    if let Some(mb) = limits.memory_mb {
        let _ = std::fs::write(dir.join("memory.max"), (mb * 1024 * 1024).to_string());
        if let Some(total) = limits.memory_plus_swap_mb.filter(|t| *t > mb) {
            let _ = std::fs::write(
                dir.join("memory.swap.max"),
                ((total - mb) * 1024 * 1024).to_string(),
            );
        }
    }
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(dir.join("cgroup.procs"))
        .ok()?;
    // Leak the fd on purpose: it must survive until pre_exec runs in the
    // child. CLOEXEC stays unset so only exec reclaims it there.
    Some(std::os::fd::IntoRawFd::into_raw_fd(file))
}

/// Writes the child's own pid into the pre-opened `cgroup.procs` fd.
/// Async-signal-safe: stack buffer, raw write, no allocation.
unsafe fn write_self_to_cgroup(fd: std::os::fd::RawFd) {
    let mut pid = libc::getpid();
    let mut buf = [0u8; 16];
    let mut at = buf.len();
    if pid == 0 {
        at -= 1;
        buf[at] = b'0';
    }
    while pid > 0 {
        at -= 1;
        buf[at] = b'0' + (pid % 10) as u8;
        pid /= 10;
    }
    let _ = libc::write(
        fd,
        buf[at..].as_ptr() as *const libc::c_void,
        buf.len() - at,
    );
    let _ = libc::close(fd);
}

/// Shell-free argv splitting: whitespace-separated, honoring single/double
/// quotes and backslash escapes outside single quotes.
pub(crate) fn split_command(command: &str) -> Result<Vec<String>, AppError> {
    let mut argv = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = command.chars();

    'outer: while let Some(ch) = chars.next() {
        match ch {
            c if c.is_whitespace() => {
                if in_token {
                    argv.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '\'' => {
                in_token = true;
                for c in chars.by_ref() {
                    if c == '\'' {
                        continue 'outer;
                    }
                    current.push(c);
                }
                return Err(AppError::InvalidInput(format!(
                    "unterminated single quote in '{command}'"
                )));
            }
            '"' => {
                in_token = true;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => continue 'outer,
                        '\\' => match chars.next() {
                            Some(esc) => current.push(esc),
                            None => break,
                        },
                        _ => current.push(c),
                    }
                }
                return Err(AppError::InvalidInput(format!(
                    "unterminated double quote in '{command}'"
                )));
            }
            '\\' => {
                in_token = true;
                match chars.next() {
                    Some(esc) => current.push(esc),
                    None => {
                        return Err(AppError::InvalidInput(format!(
                            "trailing backslash in '{command}'"
                        )))
                    }
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        argv.push(current);
    }
    Ok(argv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn ctx(command: &str) -> LaunchContext {
        LaunchContext {
            app_name: "test".into(),
            command: command.into(),
            shell_mode: false,
            exec_user: None,
            working_dir: None,
            env: BTreeMap::new(),
            limits: Default::default(),
            stdin_blob: None,
            docker_image: None,
        }
    }

    fn test_ring(dir: &TempDir) -> Arc<OutputRing> {
        Arc::new(OutputRing::create(dir.path().to_path_buf(), "test", 3, 1 << 20).unwrap())
    }

    #[test]
    fn split_plain_and_quoted() {
        assert_eq!(split_command("echo hi").unwrap(), vec!["echo", "hi"]);
        assert_eq!(
            split_command("sh -c 'sleep 1 && echo done'").unwrap(),
            vec!["sh", "-c", "sleep 1 && echo done"]
        );
        assert_eq!(
            split_command(r#"printf "a b" c\ d"#).unwrap(),
            vec!["printf", "a b", "c d"]
        );
        assert!(split_command("echo 'oops").is_err());
        assert_eq!(split_command("  ").unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn spawn_captures_output_and_exit_code() {
        let dir = TempDir::new().unwrap();
        let ring = test_ring(&dir);
        let ctx = ctx("echo hi");
        let proc = AppProcess::spawn(&ctx, Arc::clone(&ring)).await.unwrap();

        let code = proc.wait(Duration::from_secs(5)).await;
        assert_eq!(code, Some(0));
        assert!(!proc.running());

        // Reader tasks may still be draining the pipe.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ring.read_all().unwrap(), b"hi\n");
    }

    #[tokio::test]
    async fn shell_mode_exit_code_propagates() {
        let dir = TempDir::new().unwrap();
        let ring = test_ring(&dir);
        let mut c = ctx("exit 7");
        c.shell_mode = true;
        let proc = AppProcess::spawn(&c, ring).await.unwrap();
        assert_eq!(proc.wait(Duration::from_secs(5)).await, Some(7));
    }

    #[tokio::test]
    async fn stdin_blob_reaches_child() {
        let dir = TempDir::new().unwrap();
        let ring = test_ring(&dir);
        let mut c = ctx("cat");
        c.stdin_blob = Some(b"metadata-blob".to_vec());
        let proc = AppProcess::spawn(&c, Arc::clone(&ring)).await.unwrap();
        assert_eq!(proc.wait(Duration::from_secs(5)).await, Some(0));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ring.read_all().unwrap(), b"metadata-blob");
    }

    #[tokio::test]
    async fn kill_group_terminates_sleepers() {
        let dir = TempDir::new().unwrap();
        let ring = test_ring(&dir);
        let proc = AppProcess::spawn(&ctx("sleep 30"), ring).await.unwrap();
        assert!(proc.running());
        proc.kill_group(Duration::from_millis(500)).await;
        assert!(!proc.running());
        // SIGTERM default disposition: 128 + 15.
        assert_eq!(proc.exit_code(), Some(143));
    }

    #[tokio::test]
    async fn wait_times_out_while_running() {
        let dir = TempDir::new().unwrap();
        let ring = test_ring(&dir);
        let proc = AppProcess::spawn(&ctx("sleep 30"), ring).await.unwrap();
        assert_eq!(proc.wait(Duration::from_millis(100)).await, None);
        proc.kill_group(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn attach_rejects_wrong_start_time() {
        let dir = TempDir::new().unwrap();
        let ring = test_ring(&dir);
        let proc = AppProcess::spawn(&ctx("sleep 30"), Arc::clone(&ring))
            .await
            .unwrap();
        let pid = proc.pid().unwrap();
        let ticks = proc.start_time().unwrap();

        assert!(AppProcess::attach(pid, ticks + 999, Arc::clone(&ring)).is_err());
        let adopted = AppProcess::attach(pid, ticks, Arc::clone(&ring)).unwrap();
        assert!(adopted.running());

        proc.kill_group(Duration::from_millis(500)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!adopted.running());
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let ring = test_ring(&dir);
        let err = AppProcess::spawn(&ctx("/nonexistent/binary-xyz"), ring)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::SpawnFailed(_)));
    }
}
