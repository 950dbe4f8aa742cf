//! Builder wiring for the supervisor runtime.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::events::Bus;
use crate::registry::Registry;
use crate::snapshot::SnapshotManager;
use crate::subscribers::{Subscribe, SubscriberSet};
use crate::timer::TimerWheel;

use super::supervisor::Supervisor;

/// Builder for constructing a [`Supervisor`] with optional subscribers.
///
/// Must be built inside a tokio runtime: the event fan-out workers and the
/// timer wheel dispatch task are spawned here.
pub struct SupervisorBuilder {
    cfg: Config,
    subscribers: Vec<Arc<dyn Subscribe>>,
}

impl SupervisorBuilder {
    /// Creates a new builder with the given configuration.
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            subscribers: Vec::new(),
        }
    }

    /// Sets event subscribers for observability.
    ///
    /// Subscribers receive runtime events (application lifecycle, spawn
    /// failures, health flips, …) through dedicated workers with bounded
    /// queues.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Builds and returns the supervisor.
    pub fn build(self) -> Arc<Supervisor> {
        let bus = Bus::new(self.cfg.bus_capacity_clamped());
        let subs = Arc::new(SubscriberSet::new(self.subscribers, bus.clone()));
        let runtime_token = CancellationToken::new();
        let registry = Registry::new(self.cfg.clone(), bus.clone());
        let snapshot = Arc::new(SnapshotManager::new(self.cfg.snapshot_path.clone()));
        let wheel = TimerWheel::new();

        Arc::new(Supervisor::new_internal(
            self.cfg,
            bus,
            registry,
            subs,
            snapshot,
            wheel,
            runtime_token,
        ))
    }
}
