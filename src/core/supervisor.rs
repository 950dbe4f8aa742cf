//! # Supervisor: the periodic tick over the registry.
//!
//! The [`Supervisor`] owns the runtime components and drives the scheduling
//! loop: every `schedule_interval` it calls `evaluate()` on a registry
//! snapshot, persists the crash-recovery snapshot, and (at its own cadence)
//! runs the health engine.
//!
//! ## Rules
//! - One tick at a time; `evaluate()` is bounded per application (blocking
//!   work lives on workers), so a misbehaving application delays a tick,
//!   never kills the loop
//! - Errors inside a tick are logged and published, never propagated
//! - Shutdown leaves supervised processes alive (the snapshot re-attaches
//!   them); only ephemeral run-once processes are killed, bounded by grace

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::apps::{EvalOutcome, HealthEngine};
use crate::config::Config;
use crate::error::RuntimeError;
use crate::events::{Bus, Event, EventKind};
use crate::registry::Registry;
use crate::snapshot::SnapshotManager;
use crate::subscribers::SubscriberSet;
use crate::timer::TimerWheel;

use super::shutdown::wait_for_shutdown_signal;

/// Orchestrates application evaluation, persistence, health and shutdown.
pub struct Supervisor {
    cfg: Config,
    bus: Bus,
    registry: Arc<Registry>,
    subs: Arc<SubscriberSet>,
    snapshot: Arc<SnapshotManager>,
    health: HealthEngine,
    wheel: Arc<TimerWheel>,
    runtime_token: CancellationToken,
}

impl Supervisor {
    pub(super) fn new_internal(
        cfg: Config,
        bus: Bus,
        registry: Arc<Registry>,
        subs: Arc<SubscriberSet>,
        snapshot: Arc<SnapshotManager>,
        wheel: Arc<TimerWheel>,
        runtime_token: CancellationToken,
    ) -> Self {
        let health = HealthEngine::new(cfg.health_check_timeout);
        Self {
            cfg,
            bus,
            registry,
            subs,
            snapshot,
            health,
            wheel,
            runtime_token,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn timer_wheel(&self) -> &Arc<TimerWheel> {
        &self.wheel
    }

    pub fn snapshot_manager(&self) -> &Arc<SnapshotManager> {
        &self.snapshot
    }

    /// Token that ends [`Supervisor::run`] when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.runtime_token.clone()
    }

    /// Boot-time crash recovery; call once before [`Supervisor::run`].
    pub async fn recover(&self) -> usize {
        self.snapshot.recover(&self.registry, &self.cfg).await
    }

    /// Runs the supervision loop until an OS signal or token cancellation.
    pub async fn run(&self) -> Result<(), RuntimeError> {
        self.subscriber_listener();

        let health_every =
            (self.cfg.health_check_interval.as_millis() / self.cfg.schedule_interval.as_millis().max(1))
                .max(1) as u64;
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                _ = self.runtime_token.cancelled() => break,
                res = wait_for_shutdown_signal() => {
                    if let Err(e) = res {
                        error!(error = %e, "signal registration failed");
                    }
                    self.bus.publish(Event::now(EventKind::ShutdownRequested));
                    self.runtime_token.cancel();
                    break;
                }
                _ = tokio::time::sleep(self.cfg.schedule_interval) => {
                    ticks += 1;
                    self.tick(ticks % health_every == 0).await;
                }
            }
        }

        self.finalize().await
    }

    /// One supervision pass: evaluate, persist, health.
    pub async fn tick(&self, run_health: bool) {
        let now = Utc::now();
        let apps = self.registry.snapshot();

        for app in &apps {
            match app.evaluate(now, &self.cfg, &self.bus).await {
                EvalOutcome::Keep => {}
                EvalOutcome::Remove => self.registry.remove_expired(app.name()),
                EvalOutcome::Promote(payload) => {
                    if let Err(e) = self.registry.promote(app.name(), *payload).await {
                        warn!(app = app.name(), error = %e, "promotion failed");
                    }
                }
            }
        }

        match self.snapshot.persist(&apps).await {
            Ok(()) => self.bus.publish(Event::now(EventKind::SnapshotWritten)),
            Err(e) => warn!(error = %e, "snapshot persist failed"),
        }

        if run_health {
            self.health.tick(&apps, &self.bus).await;
        }
    }

    /// Final snapshot, then reap ephemeral runs within the grace window.
    async fn finalize(&self) -> Result<(), RuntimeError> {
        let apps = self.registry.snapshot();
        if let Err(e) = self.snapshot.persist(&apps).await {
            warn!(error = %e, "final snapshot persist failed");
        }
        self.wheel.shutdown();

        let ephemeral: Vec<_> = apps.into_iter().filter(|a| a.is_ephemeral()).collect();
        if !ephemeral.is_empty() {
            debug!(count = ephemeral.len(), "stopping ephemeral runs");
            let kills = ephemeral.iter().map(|a| a.shutdown_process());
            if timeout(self.cfg.grace, join_all(kills)).await.is_err() {
                let mut stuck = Vec::new();
                for app in &ephemeral {
                    if app.is_running().await {
                        stuck.push(app.name().to_string());
                    }
                }
                self.bus.publish(Event::now(EventKind::GraceExceeded));
                return Err(RuntimeError::GraceExceeded {
                    grace: self.cfg.grace,
                    stuck,
                });
            }
        }
        self.bus.publish(Event::now(EventKind::AllStoppedWithin));
        Ok(())
    }

    /// Spawns the fan-out task: every bus event reaches every subscriber.
    fn subscriber_listener(&self) {
        let mut rx = self.bus.subscribe();
        let set = Arc::clone(&self.subs);
        let token = self.runtime_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(ev) => set.emit_arc(Arc::new(ev)),
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }
            }
        });
    }
}
