//! Delayed and periodic callbacks on a single dispatch task.
//!
//! ## Contents
//! - [`TimerWheel`] min-heap driven scheduler with cancellation
//! - [`TimerId`] opaque handle for cancelling a pending timer
//!
//! ## Rules
//! - Callbacks execute serially on the wheel's dispatch task; they must not
//!   block (spawn blocking work onto worker tasks instead)
//! - Scheduling after teardown fails with `RuntimeError::ShuttingDown`
//! - Delays use the monotonic clock; wall-clock instants belong to the
//!   schedule evaluator, not here

mod wheel;

pub use wheel::{TimerId, TimerWheel};
