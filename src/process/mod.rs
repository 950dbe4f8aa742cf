//! Process execution back-ends and output capture.
//!
//! ## Contents
//! - [`ProcessHandle`] the contract shared by both back-ends
//! - [`LaunchContext`], [`ResourceLimits`] what a launch needs to know
//! - [`AppProcess`] native executor (fork/exec, process group, rlimits)
//! - [`DockerProcess`] container executor driving the `docker` CLI
//! - [`OutputRing`] bounded rotating capture of combined stdout/stderr
//!
//! ## Rules
//! - At most one live child per application; the owning application record
//!   holds the only handle
//! - `kill_group` escalates SIGTERM → SIGKILL against the whole process group
//! - No lock is held across a CLI shell-out

mod docker;
mod native;
mod ring;
mod stat;

pub use docker::DockerProcess;
pub use native::AppProcess;
pub use ring::{FetchChunk, OutputRing};
pub use stat::{is_alive, proc_start_time};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Resource caps applied to a launch.
///
/// Native launches map `memory_mb` to `RLIMIT_AS` and `cpu_shares` to the
/// cgroup cpu controller when available; container launches translate all
/// three to `docker run` flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_plus_swap_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<u64>,
}

impl ResourceLimits {
    /// True when no cap is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Everything a back-end needs to start one process.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    /// Application name; also the container name for the docker back-end.
    pub app_name: String,
    /// Command line. Shell-interpreted when `shell_mode` is set, otherwise
    /// split into argv without a shell.
    pub command: String,
    /// Hand the command line to `/bin/sh -c`.
    pub shell_mode: bool,
    /// OS user to impersonate (native back-end only).
    pub exec_user: Option<String>,
    /// Working directory of the child.
    pub working_dir: Option<PathBuf>,
    /// Child environment, ordered.
    pub env: BTreeMap<String, String>,
    /// Resource caps.
    pub limits: ResourceLimits,
    /// Bytes fed to the child's stdin at launch, then stdin is closed.
    pub stdin_blob: Option<Vec<u8>>,
    /// Container image; presence selects the docker back-end.
    pub docker_image: Option<String>,
}

/// Contract shared by the native and container executors.
///
/// A handle is owned by exactly one application record; workers borrow it for
/// the duration of a single operation.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Pid of the tracked process, if any is considered live.
    ///
    /// The docker back-end reports a synthetic pid 1 while its spawn worker
    /// (image pull included) is still in flight.
    fn pid(&self) -> Option<i32>;

    /// Liveness without reaping.
    fn running(&self) -> bool;

    /// Exit code once the process has been reaped, else `None`.
    fn exit_code(&self) -> Option<i32>;

    /// Kernel start time of the tracked pid (clock ticks since boot), used by
    /// the snapshot layer to verify re-attachment.
    fn start_time(&self) -> Option<u64>;

    /// Launch failure detail recorded by the back-end, if any.
    fn start_error(&self) -> Option<String>;

    /// Container id, for the docker back-end; `None` for native processes.
    fn container_id(&self) -> Option<String> {
        None
    }

    /// Best-effort signal to the process. `NotRunning` maps to
    /// [`AppError::NotFound`].
    fn signal(&self, signal: nix::sys::signal::Signal) -> Result<(), AppError>;

    /// SIGTERM to the process group, bounded wait, then SIGKILL.
    async fn kill_group(&self, term_timeout: Duration);

    /// Waits for process exit up to `timeout`; returns the exit code, or
    /// `None` when the deadline passed first.
    async fn wait(&self, timeout: Duration) -> Option<i32>;

    /// Pulls any output the back-end buffers externally into the ring.
    ///
    /// Native processes stream directly; the docker back-end fetches
    /// `docker logs --since <last-fetch>` here.
    async fn refresh_output(&self);

    /// The output ring attached at launch.
    fn ring(&self) -> Arc<OutputRing>;
}
