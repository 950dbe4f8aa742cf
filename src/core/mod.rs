//! Runtime core: the supervisor loop and its wiring.
//!
//! ## Files & responsibilities
//! - **supervisor.rs**: owns the runtime (Bus, Registry, SnapshotManager,
//!   HealthEngine, SubscriberSet, TimerWheel); drives the periodic tick that
//!   calls `evaluate()` on every application, persists the snapshot, and
//!   runs the health engine; handles graceful shutdown.
//! - **builder.rs**: constructs and wires a `Supervisor`.
//! - **shutdown.rs**: cross-platform OS signal handling.
//!
//! ## Tick timeline
//! ```text
//! loop {
//!   sleep(schedule_interval)                       (default 2 s)
//!   for app in registry.snapshot():
//!       app.evaluate(now)      → Keep | Remove | Promote
//!   snapshot.persist()                             (temp-file-rename)
//!   every Nth tick: health.tick()                  (N = health/schedule)
//! }
//! ```
//!
//! ## Shutdown timeline
//! ```text
//! OS signal → publish ShutdownRequested → stop ticking
//!   → final snapshot persist (supervised processes stay alive: the next
//!     daemon instance re-attaches to them)
//!   → kill ephemeral run-once processes, bounded by Config::grace
//!   → AllStoppedWithin, or GraceExceeded{grace, stuck}
//! ```

mod builder;
mod shutdown;
mod supervisor;

pub use builder::SupervisorBuilder;
pub use shutdown::wait_for_shutdown_signal;
pub use supervisor::Supervisor;
