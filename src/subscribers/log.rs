//! # Built-in logging subscriber.
//!
//! [`LogSubscriber`] forwards runtime events to the `tracing` facade so the
//! daemon's log output carries the full application lifecycle without any
//! custom wiring.
//!
//! ## Output (with the default subscriber format)
//! ```text
//! INFO app_started app=web pid=4812
//! WARN spawn_failed app=batch error="exec: No such file or directory"
//! INFO app_exited app=batch pid=4901 exit_code=7
//! ```

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::events::{Event, EventKind};

use super::Subscribe;

/// Forwards events to `tracing` at a severity matching the event kind.
pub struct LogSubscriber;

#[async_trait]
impl Subscribe for LogSubscriber {
    async fn on_event(&self, e: &Event) {
        let app = e.app.as_deref().unwrap_or("-");
        match e.kind {
            EventKind::AppStarting => debug!(app, "app_starting"),
            EventKind::AppStarted => info!(app, pid = e.pid, "app_started"),
            EventKind::AppExited => {
                info!(app, pid = e.pid, exit_code = e.exit_code, "app_exited")
            }
            EventKind::SpawnFailed => {
                warn!(app, error = e.error.as_deref(), "spawn_failed")
            }
            EventKind::HealthChanged => {
                warn!(app, error = e.error.as_deref(), "health_changed")
            }
            EventKind::AppRegistered => info!(app, "app_registered"),
            EventKind::AppRemoved => info!(app, "app_removed"),
            EventKind::AppEnabled => info!(app, "app_enabled"),
            EventKind::AppDisabled => info!(app, "app_disabled"),
            EventKind::SnapshotWritten => debug!("snapshot_written"),
            EventKind::ShutdownRequested => info!("shutdown_requested"),
            EventKind::AllStoppedWithin => info!("all_stopped_within_grace"),
            EventKind::GraceExceeded => error!("grace_exceeded"),
            EventKind::SubscriberOverflow => {
                warn!(error = e.error.as_deref(), "subscriber_overflow")
            }
            EventKind::SubscriberPanicked => {
                error!(subscriber = app, error = e.error.as_deref(), "subscriber_panicked")
            }
        }
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
