//! Calendar scheduling: when is an application due to run next?
//!
//! ## Contents
//! - [`DurationField`] wire form of a duration (integer seconds or ISO-8601)
//! - [`DailyWindow`] half-open `[start, end)` time-of-day window, possibly
//!   wrapping midnight, resolved in a fixed offset timezone
//! - [`ScheduleTimer`] next-instant computation for plain, interval and cron
//!   recurrences, clipped to `[start_time, end_time]`
//!
//! ## Rules
//! - Windows use an inclusive lower bound and exclusive upper bound
//! - Equal-instant candidates fire
//! - A result past `end_time` means "never again" (`None`)

mod duration;
mod timer;
mod window;

pub use duration::DurationField;
pub use timer::{Recurrence, ScheduleTimer};
pub use window::{parse_posix_offset, DailyWindow};
