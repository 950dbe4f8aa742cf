//! Event subscribers: fan-out and built-ins.
//!
//! ## Contents
//! - [`Subscribe`] extension point for plugging custom event handlers
//! - [`SubscriberSet`] non-blocking fan-out with per-subscriber workers
//! - [`LogSubscriber`] built-in subscriber forwarding events to `tracing`
//!
//! ## Rules
//! - Slow subscribers only affect themselves (queue overflow → event drop)
//! - Panics are isolated (do not crash the runtime or other subscribers)
//! - Subscribers never block publishers

mod log;
mod set;
mod subscriber;

pub use log::LogSubscriber;
pub use set::SubscriberSet;
pub use subscriber::Subscribe;
