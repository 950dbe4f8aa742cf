//! # appvisor
//!
//! **Appvisor** is a host-local application lifecycle supervisor.
//!
//! It schedules long-running, short-running, periodic and cron-driven
//! applications, launches them as native processes or containers, captures
//! their output into bounded rotating rings, health-checks them, and
//! re-attaches to surviving processes after a daemon restart.
//!
//! ## Features
//!
//! | Area               | Description                                                       | Key types                                |
//! |--------------------|-------------------------------------------------------------------|------------------------------------------|
//! | **Scheduling**     | Absolute windows, daily windows across midnight, interval, cron.  | [`ScheduleTimer`], [`DailyWindow`]       |
//! | **Execution**      | Native fork/exec with limits, or the container CLI.               | [`AppProcess`], [`DockerProcess`]        |
//! | **Output capture** | Bounded rotating ring with positional reads.                      | [`OutputRing`]                           |
//! | **Lifecycle**      | Per-application state machine with exit behaviors.                | [`Application`], [`AppKind`]             |
//! | **Supervision**    | Periodic tick, health engine, graceful shutdown.                  | [`Supervisor`], [`SupervisorBuilder`]    |
//! | **Recovery**       | Crash-safe snapshot and pid/start-time re-attachment.             | [`SnapshotManager`]                      |
//! | **Control**        | Transport-agnostic operation set with the ownership gate.         | [`ControlSurface`], [`Caller`]           |
//! | **Observability**  | Event bus with subscriber fan-out.                                | [`Bus`], [`Event`], [`Subscribe`]        |
//! | **Errors**         | Typed errors for the runtime and per-operation taxonomy.          | [`RuntimeError`], [`AppError`]           |
//!
//! ```no_run
//! use std::sync::Arc;
//! use appvisor::{Caller, Config, ControlSurface, LogSubscriber, SupervisorBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cfg = Config::default();
//!     let sup = SupervisorBuilder::new(cfg)
//!         .with_subscribers(vec![Arc::new(LogSubscriber)])
//!         .build();
//!
//!     let surface = ControlSurface::new(Arc::clone(&sup));
//!     let caller = Caller::privileged("admin");
//!     surface
//!         .register(&caller, &serde_json::json!({
//!             "name": "ping",
//!             "command": "ping -c 1 localhost",
//!             "interval": 60
//!         }))
//!         .await?;
//!
//!     sup.recover().await;
//!     sup.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ---

mod apps;
mod config;
mod controller;
mod core;
mod error;
mod events;
mod process;
mod registry;
mod schedule;
mod snapshot;
mod subscribers;
mod timer;

// ---- Public re-exports ----

pub use apps::{
    Access, AppKind, AppSpec, AppStatus, Application, DailyWindowSpec, DesiredState, EvalOutcome,
    ExitBehavior, HealthEngine, OwnerPermission, Relation,
};
pub use config::{Config, ConfigFile, DaemonSection};
pub use controller::{
    Caller, ControlSurface, RunResult, APP_CONTROL, APP_DELETE, APP_REG, APP_RUN, APP_VIEW,
};
pub use core::{Supervisor, SupervisorBuilder};
pub use error::{AppError, RuntimeError};
pub use events::{Bus, Event, EventKind};
pub use process::{
    AppProcess, DockerProcess, FetchChunk, LaunchContext, OutputRing, ProcessHandle,
    ResourceLimits,
};
pub use registry::{RegisterOptions, Registry};
pub use schedule::{DailyWindow, DurationField, Recurrence, ScheduleTimer};
pub use snapshot::{SnapshotEntry, SnapshotFile, SnapshotManager};
pub use subscribers::{LogSubscriber, Subscribe, SubscriberSet};
pub use timer::{TimerId, TimerWheel};
