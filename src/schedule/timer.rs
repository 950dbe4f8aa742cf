//! # Next-instant computation for application schedules.
//!
//! [`ScheduleTimer`] answers one question: given the current wall instant,
//! when must the application run next? `None` means "never again".
//!
//! ## Algorithm
//! ```text
//! candidate = max(now, start_time)          candidate > end_time → None
//!     │
//!     ├─ advance candidate into the daily window (if any)
//!     ├─ Once      → candidate
//!     ├─ Every(T)  → least start_time + k·T ≥ candidate, re-windowed
//!     └─ Cron(expr)→ first expression hit ≥ candidate, re-windowed
//!     │
//!     └─ result > end_time → None
//! ```
//!
//! ## Rules
//! - Interval/cron arithmetic and the window constraint are satisfied
//!   *together*: after arithmetic the window is re-applied and the search
//!   repeats from the adjusted instant (bounded; gives up with `None` when
//!   window and grid cannot be reconciled).
//! - An unset `start_time` resolves to the construction instant; an unset
//!   `end_time` to construction + 10 years.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule;

use super::window::DailyWindow;

/// Window/grid reconciliation attempts before giving up.
const RECONCILE_LIMIT: usize = 1_000;

/// Cap applied when `end_time` is unset.
const END_CAP_DAYS: i64 = 365 * 10;

/// How often an application recurs.
#[derive(Debug, Clone)]
pub enum Recurrence {
    /// Single eligibility instant (long-running, one-shot).
    Once,
    /// Fixed interval in whole seconds, anchored at `start_time`.
    Every(u64),
    /// Cron expression (6-field extended form).
    Cron(Box<Schedule>),
}

/// Computes the next eligible instant for one application.
#[derive(Debug, Clone)]
pub struct ScheduleTimer {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    window: Option<DailyWindow>,
    recurrence: Recurrence,
}

impl ScheduleTimer {
    /// Builds a timer, applying the unset-bound defaults relative to `now`.
    pub fn new(
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        window: Option<DailyWindow>,
        recurrence: Recurrence,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            start: start.unwrap_or(now),
            end: end.unwrap_or(now + ChronoDuration::days(END_CAP_DAYS)),
            window,
            recurrence,
        }
    }

    /// The anchor instant of the schedule.
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// True when `instant` is inside both the absolute range and the daily
    /// window. Used as the launch precondition on each tick.
    pub fn in_window(&self, instant: DateTime<Utc>) -> bool {
        if instant < self.start || instant > self.end {
            return false;
        }
        self.window.map_or(true, |w| w.contains(instant))
    }

    /// Next eligible instant at or after `now`, or `None` for "never again".
    pub fn next_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = now.max(self.start);
        if candidate > self.end {
            return None;
        }
        if let Some(w) = &self.window {
            candidate = w.advance_into(candidate);
        }

        let result = match &self.recurrence {
            Recurrence::Once => Some(candidate),
            Recurrence::Every(secs) => self.reconcile(candidate, |c| self.grid_at_or_after(c, *secs)),
            Recurrence::Cron(schedule) => self.reconcile(candidate, |c| cron_at_or_after(schedule, c)),
        }?;

        (result <= self.end).then_some(result)
    }

    /// Repeats `step` until its result is already inside the daily window.
    fn reconcile(
        &self,
        mut candidate: DateTime<Utc>,
        step: impl Fn(DateTime<Utc>) -> Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        for _ in 0..RECONCILE_LIMIT {
            let t = step(candidate)?;
            if t > self.end {
                return None;
            }
            match &self.window {
                None => return Some(t),
                Some(w) => {
                    let adjusted = w.advance_into(t);
                    if adjusted == t {
                        return Some(t);
                    }
                    candidate = adjusted;
                }
            }
        }
        None
    }

    /// Least `start + k·interval ≥ candidate`.
    fn grid_at_or_after(&self, candidate: DateTime<Utc>, interval: u64) -> Option<DateTime<Utc>> {
        let interval = interval.max(1) as i64;
        let elapsed = (candidate - self.start).num_seconds();
        let k = if elapsed <= 0 {
            0
        } else {
            (elapsed + interval - 1) / interval
        };
        self.start
            .checked_add_signed(ChronoDuration::seconds(k * interval))
    }
}

/// First cron hit at or after `candidate` (second resolution).
fn cron_at_or_after(schedule: &Schedule, candidate: DateTime<Utc>) -> Option<DateTime<Utc>> {
    // `after` is exclusive; back off one second so an exact hit counts.
    schedule
        .after(&(candidate - ChronoDuration::seconds(1)))
        .next()
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use chrono::{FixedOffset, NaiveTime, TimeZone};

    use super::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 10, 11, h, m, s).unwrap()
    }

    fn window(sh: u32, eh: u32) -> DailyWindow {
        DailyWindow::new(
            NaiveTime::from_hms_opt(sh, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(eh, 0, 0).unwrap(),
            FixedOffset::east_opt(0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn once_fires_at_start() {
        let t = ScheduleTimer::new(Some(at(12, 0, 0)), None, None, Recurrence::Once, at(9, 0, 0));
        assert_eq!(t.next_time(at(9, 0, 0)), Some(at(12, 0, 0)));
        // Already past start: fire now.
        assert_eq!(t.next_time(at(13, 0, 0)), Some(at(13, 0, 0)));
    }

    #[test]
    fn past_end_means_never() {
        let t = ScheduleTimer::new(
            Some(at(8, 0, 0)),
            Some(at(10, 0, 0)),
            None,
            Recurrence::Once,
            at(8, 0, 0),
        );
        assert_eq!(t.next_time(at(11, 0, 0)), None);
    }

    #[test]
    fn interval_grid_is_anchored_at_start() {
        let t = ScheduleTimer::new(
            Some(at(8, 0, 0)),
            None,
            None,
            Recurrence::Every(300),
            at(8, 0, 0),
        );
        // 08:07:31 → next grid point 08:10:00.
        assert_eq!(t.next_time(at(8, 7, 31)), Some(at(8, 10, 0)));
        // Exactly on the grid: equal-instant candidates fire.
        assert_eq!(t.next_time(at(8, 10, 0)), Some(at(8, 10, 0)));
    }

    #[test]
    fn interval_respects_window() {
        let t = ScheduleTimer::new(
            Some(at(0, 0, 0)),
            None,
            Some(window(9, 17)),
            Recurrence::Every(3_600),
            at(0, 0, 0),
        );
        // 05:00 is outside the window; first grid point inside is 09:00.
        assert_eq!(t.next_time(at(5, 0, 0)), Some(at(9, 0, 0)));
        // 16:30 → 17:00 is on the grid but outside; rolls to 09:00 tomorrow.
        assert_eq!(
            t.next_time(at(16, 30, 0)),
            Some(Utc.with_ymd_and_hms(2020, 10, 12, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn interval_in_closed_window_returns_none_past_end() {
        // Window just closed and end_time is before it reopens: never again.
        let t = ScheduleTimer::new(
            Some(at(9, 0, 0)),
            Some(at(18, 0, 0)),
            Some(window(9, 17)),
            Recurrence::Every(600),
            at(9, 0, 0),
        );
        assert_eq!(t.next_time(at(17, 0, 1)), None);
    }

    #[test]
    fn midnight_window_fires_at_2300() {
        let t = ScheduleTimer::new(
            Some(at(20, 0, 0)),
            None,
            Some(
                DailyWindow::new(
                    NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
                    NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
                    FixedOffset::east_opt(0).unwrap(),
                )
                .unwrap(),
            ),
            Recurrence::Once,
            at(20, 0, 0),
        );
        assert!(t.in_window(at(23, 0, 0)));
        assert_eq!(t.next_time(at(21, 59, 50)), Some(at(22, 0, 0)));
    }

    #[test]
    fn cron_five_second_slot_fires_once() {
        let schedule = Schedule::from_str("*/5 * * * * *").unwrap();
        let t = ScheduleTimer::new(
            Some(at(8, 0, 0)),
            None,
            None,
            Recurrence::Cron(Box::new(schedule)),
            at(8, 0, 0),
        );
        // An exact hit is eligible…
        assert_eq!(t.next_time(at(8, 0, 5)), Some(at(8, 0, 5)));
        // …and the instant after it belongs to the next slot, so a launch at
        // 08:00:05 asking "what comes after me" never lands in the same slot.
        assert_eq!(t.next_time(at(8, 0, 6)), Some(at(8, 0, 10)));
    }

    #[test]
    fn cron_respects_window() {
        let schedule = Schedule::from_str("0 0 * * * *").unwrap(); // hourly
        let t = ScheduleTimer::new(
            Some(at(0, 0, 0)),
            None,
            Some(window(9, 12)),
            Recurrence::Cron(Box::new(schedule)),
            at(0, 0, 0),
        );
        assert_eq!(t.next_time(at(3, 30, 0)), Some(at(9, 0, 0)));
    }

    #[test]
    fn unset_end_is_capped() {
        let t = ScheduleTimer::new(Some(at(0, 0, 0)), None, None, Recurrence::Once, at(0, 0, 0));
        let far = at(0, 0, 0) + ChronoDuration::days(365 * 11);
        assert_eq!(t.next_time(far), None);
    }
}
