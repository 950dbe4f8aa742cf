//! # Error types used by the appvisor runtime and control surface.
//!
//! This module defines two main error enums:
//!
//! - [`RuntimeError`] errors raised by the supervision runtime itself.
//! - [`AppError`] errors raised by individual application operations.
//!
//! Both types provide helper methods `as_label` for logs.
//! [`AppError`] additionally distinguishes caller faults from recoverable
//! runtime faults via [`AppError::is_recoverable`].

use std::time::Duration;

use thiserror::Error;

/// # Errors produced by the appvisor runtime.
///
/// These represent failures in the supervision system itself.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Shutdown grace period was exceeded; some applications remained running
    /// and had to be force-terminated.
    #[error("shutdown timeout {grace:?} exceeded; still running: {stuck:?}; forcing termination")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Names of applications that did not stop in time.
        stuck: Vec<String>,
    },
    /// A timer was scheduled after the timer wheel began teardown.
    #[error("timer wheel is shutting down")]
    ShuttingDown,
    /// The main configuration file could not be read at startup.
    ///
    /// This is the only fatal error in the system.
    #[error("cannot read configuration {path}: {reason}")]
    BadConfiguration {
        /// Path that failed to load.
        path: String,
        /// Underlying parse/io failure.
        reason: String,
    },
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::GraceExceeded { .. } => "runtime_grace_exceeded",
            RuntimeError::ShuttingDown => "runtime_shutting_down",
            RuntimeError::BadConfiguration { .. } => "runtime_bad_configuration",
        }
    }
}

/// # Errors produced by application operations.
///
/// The variants map one-to-one onto the operation error taxonomy surfaced to
/// callers of the control surface. Only [`AppError::Transient`] is a fault of
/// the runtime environment; everything else is attributable to the request or
/// the supervised process.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum AppError {
    /// Malformed spec, duration parse failure, unknown exit behavior, …
    /// Surfaced to the caller; no state change.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Ownership/permission gate failure.
    #[error("permission denied for user '{user}' on application '{app}'")]
    Unauthorized { user: String, app: String },

    /// Attempt to overwrite a cloud-managed application, or a running
    /// application without write permission.
    #[error("conflict: {0}")]
    Conflict(String),

    /// fork/exec or container-start failure. Recorded into the application as
    /// `start_error`; the application retries at its next scheduled instant.
    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    /// Operation deadline exceeded. Triggers `kill_group` on whatever was
    /// spawned for the operation.
    #[error("timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// Application name not present in the registry.
    #[error("application '{0}' not found")]
    NotFound(String),

    /// Filesystem/persistence errors. Logged; the supervisor continues.
    #[error("transient failure: {0}")]
    Transient(String),
}

impl AppError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            AppError::InvalidInput(_) => "invalid_input",
            AppError::Unauthorized { .. } => "unauthorized",
            AppError::Conflict(_) => "conflict",
            AppError::SpawnFailed(_) => "spawn_failed",
            AppError::Timeout { .. } => "timeout",
            AppError::NotFound(_) => "not_found",
            AppError::Transient(_) => "transient",
        }
    }

    /// True when the supervisor may keep going and retry later.
    ///
    /// Caller faults (`InvalidInput`, `Unauthorized`, `Conflict`, `NotFound`)
    /// are not retried; spawn failures and transient persistence errors are.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AppError::SpawnFailed(_) | AppError::Timeout { .. } | AppError::Transient(_)
        )
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Transient(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::InvalidInput(e.to_string())
    }
}
