//! # Runtime events emitted by the supervisor and application state machines.
//!
//! The [`EventKind`] enum classifies event types across four categories:
//! - **Lifecycle events**: process execution flow (starting, started, exited,
//!   spawn failure, health flips)
//! - **Management events**: registry mutations (registered, removed, enabled,
//!   disabled)
//! - **Shutdown events**: daemon teardown progress
//! - **Subscriber events**: fan-out worker faults
//!
//! The [`Event`] struct carries additional metadata such as timestamps, the
//! application name, pid, exit code and error messages.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases
//! monotonically. This guarantees that events can be ordered correctly even
//! when delivered out-of-order through async channels.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::SystemTime;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Subscriber events ===
    /// Subscriber panicked during event processing.
    SubscriberPanicked,
    /// Subscriber dropped an event (queue full or worker closed).
    SubscriberOverflow,

    // === Shutdown events ===
    /// Shutdown requested (OS signal received).
    ShutdownRequested,
    /// All applications stopped within the configured grace period.
    AllStoppedWithin,
    /// Grace period exceeded; some applications did not stop in time.
    GraceExceeded,

    // === Application lifecycle events ===
    /// A launch has been decided for an application this tick.
    AppStarting,
    /// A child process (or container) is up and tracked.
    AppStarted,
    /// The tracked process exited and was reaped.
    AppExited,
    /// fork/exec or container start failed; recorded as `start_error`.
    SpawnFailed,
    /// Health state flipped (healthy ⇄ unhealthy).
    HealthChanged,

    // === Registry management events ===
    /// An application was registered (or hot-updated).
    AppRegistered,
    /// An application was removed from the registry.
    AppRemoved,
    /// An application was enabled.
    AppEnabled,
    /// An application was disabled.
    AppDisabled,

    // === Persistence ===
    /// The crash-recovery snapshot was written.
    SnapshotWritten,
}

/// Runtime event with optional metadata.
///
/// Carries information about application lifecycle, pids, exit codes, errors
/// and timing.
///
/// ## Fields
/// - `seq`: unique sequence number for ordering (monotonically increasing)
/// - `at`: wall-clock timestamp (may go backwards due to NTP, use for logging only)
/// - `kind`: event classification
/// - `app`, `pid`, `exit_code`, `error`: optional metadata
#[derive(Debug, Clone)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp (logging only).
    pub at: SystemTime,
    /// Name of the application, if applicable.
    pub app: Option<String>,
    /// Process id, if the event concerns a live or reaped process.
    pub pid: Option<i32>,
    /// Exit code, for [`EventKind::AppExited`].
    pub exit_code: Option<i32>,
    /// Error message, if the event represents a failure.
    pub error: Option<String>,
    /// The kind of event.
    pub kind: EventKind,
}

impl Event {
    /// Creates a new event of the given kind with the current timestamp and
    /// the next sequence number.
    pub fn now(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            kind,
            at: SystemTime::now(),
            app: None,
            pid: None,
            exit_code: None,
            error: None,
        }
    }

    /// Attaches an application name.
    pub fn with_app(mut self, name: impl Into<String>) -> Self {
        self.app = Some(name.into());
        self
    }

    /// Attaches a process id.
    pub fn with_pid(mut self, pid: i32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Attaches an exit code.
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    /// Attaches an error message.
    pub fn with_error(mut self, msg: impl Into<String>) -> Self {
        self.error = Some(msg.into());
        self
    }

    /// Creates a subscriber overflow event.
    ///
    /// Emitted when a subscriber's queue is full and an event is dropped.
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::now(EventKind::SubscriberOverflow)
            .with_error(format!("subscriber={subscriber} reason={reason}"))
    }

    /// Creates a subscriber panic event.
    ///
    /// Emitted when a subscriber panics during event processing.
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::now(EventKind::SubscriberPanicked)
            .with_app(subscriber)
            .with_error(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_is_monotonic() {
        let a = Event::now(EventKind::AppStarting);
        let b = Event::now(EventKind::AppStarted);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn builders_attach_metadata() {
        let ev = Event::now(EventKind::AppExited)
            .with_app("demo")
            .with_pid(42)
            .with_exit_code(7)
            .with_error("boom");
        assert_eq!(ev.app.as_deref(), Some("demo"));
        assert_eq!(ev.pid, Some(42));
        assert_eq!(ev.exit_code, Some(7));
        assert_eq!(ev.error.as_deref(), Some("boom"));
    }
}
