//! Application kind and exit behavior: the two tags that drive the state
//! machine's post-reap decision.
//!
//! The original design expressed these as a class hierarchy; here they are a
//! tagged variant plus a handful of predicates, which keeps the transition
//! table in one place (`Application::evaluate`).

use serde::{Deserialize, Serialize};

/// Behavior tag of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppKind {
    /// No recurrence: launch once eligible, supervise until told otherwise.
    LongRunning,
    /// Interval recurrence; the process is expected to exit between runs.
    ShortRunning,
    /// Interval recurrence; the process keeps running until the next instant,
    /// at which point it is replaced.
    Periodic,
    /// Cron recurrence; replaced at each cron hit like `Periodic`.
    Cron,
    /// Ephemeral run-once registration (`run_async` / `run_sync`); removed
    /// after retention.
    OneShot,
    /// Pre-start command carrying the real application definition; swapped
    /// in on success.
    UnInitialized,
}

impl AppKind {
    /// Does the state machine queue another run after a reap?
    pub fn reschedules_after_reap(self) -> bool {
        !matches!(self, AppKind::OneShot | AppKind::UnInitialized)
    }

    /// Is a still-running process replaced when the next instant arrives?
    pub fn replaces_at_next_instant(self) -> bool {
        matches!(self, AppKind::Periodic | AppKind::Cron)
    }
}

/// What to do when the tracked process is reaped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitBehavior {
    /// Wait for the next scheduled instant.
    #[default]
    Standby,
    /// Relaunch immediately.
    Restart,
    /// Relaunch immediately on non-zero exit; standby on success.
    Keepalive,
    /// Mark for deletion once retention elapses.
    Remove,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_never_requeues() {
        assert!(!AppKind::OneShot.reschedules_after_reap());
        assert!(!AppKind::UnInitialized.reschedules_after_reap());
        assert!(AppKind::ShortRunning.reschedules_after_reap());
    }

    #[test]
    fn periodic_kinds_replace_running_process() {
        assert!(AppKind::Periodic.replaces_at_next_instant());
        assert!(AppKind::Cron.replaces_at_next_instant());
        assert!(!AppKind::LongRunning.replaces_at_next_instant());
        assert!(!AppKind::ShortRunning.replaces_at_next_instant());
    }

    #[test]
    fn exit_behavior_wire_names() {
        assert_eq!(
            serde_json::to_string(&ExitBehavior::Keepalive).unwrap(),
            "\"keepalive\""
        );
        let b: ExitBehavior = serde_json::from_str("\"remove\"").unwrap();
        assert_eq!(b, ExitBehavior::Remove);
        assert!(serde_json::from_str::<ExitBehavior>("\"explode\"").is_err());
    }
}
