//! # Health engine: periodic health evaluation across the registry.
//!
//! Applications with a `health_check_command` get it executed as a
//! short-lived native process on every health tick; rc 0 means healthy,
//! anything else (including a timeout) means unhealthy. Applications without
//! a command mirror process liveness.
//!
//! Checks for different applications run concurrently; a slow check only
//! delays its own application, never the supervisor tick.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::events::{Bus, Event, EventKind};

use super::Application;

/// Runs the health pass over a registry snapshot.
pub struct HealthEngine {
    timeout: Duration,
}

impl HealthEngine {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// One health tick: check every application, publish flips.
    pub async fn tick(&self, apps: &[Arc<Application>], bus: &Bus) {
        let checks = apps.iter().map(|app| {
            let app = Arc::clone(app);
            let timeout = self.timeout;
            async move {
                let flipped = app.check_health(timeout).await;
                (app, flipped)
            }
        });
        for (app, flipped) in join_all(checks).await {
            if let Some(healthy) = flipped {
                bus.publish(
                    Event::now(EventKind::HealthChanged)
                        .with_app(app.name())
                        .with_error(if healthy { "healthy" } else { "unhealthy" }),
                );
            }
        }
    }
}
