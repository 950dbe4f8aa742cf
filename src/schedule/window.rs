//! Daily time-of-day windows resolved in a fixed-offset timezone.
//!
//! A window is half-open `[start, end)` on the local clock. `start > end`
//! wraps midnight: the *invalid* range is `[end, start)` and the valid range
//! crosses 0:00. `start == end` is rejected at ingestion.

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveTime, Timelike, Utc};

use crate::error::AppError;

/// Parses a POSIX-style timezone label into a fixed offset.
///
/// Accepted forms: empty (UTC), `GMT+08:00`, `UTC-05:30`, `+02:00`, `GMT+8`.
pub fn parse_posix_offset(tz: &str) -> Result<FixedOffset, AppError> {
    let bad = || AppError::InvalidInput(format!("bad posix_timezone '{tz}'"));
    let trimmed = tz.trim();
    if trimmed.is_empty() {
        return Ok(FixedOffset::east_opt(0).unwrap());
    }
    let rest = trimmed
        .strip_prefix("GMT")
        .or_else(|| trimmed.strip_prefix("UTC"))
        .unwrap_or(trimmed);
    if rest.is_empty() {
        return Ok(FixedOffset::east_opt(0).unwrap());
    }

    let (sign, body) = match rest.as_bytes()[0] {
        b'+' => (1i32, &rest[1..]),
        b'-' => (-1i32, &rest[1..]),
        _ => return Err(bad()),
    };
    let (hours, minutes) = match body.split_once(':') {
        Some((h, m)) => (
            h.parse::<i32>().map_err(|_| bad())?,
            m.parse::<i32>().map_err(|_| bad())?,
        ),
        None => (body.parse::<i32>().map_err(|_| bad())?, 0),
    };
    if !(0..=14).contains(&hours) || !(0..60).contains(&minutes) {
        return Err(bad());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(bad)
}

/// Half-open daily window `[start, end)` on the clock of `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyWindow {
    start: NaiveTime,
    end: NaiveTime,
    offset: FixedOffset,
}

impl DailyWindow {
    /// Builds a window, rejecting `start == end`.
    pub fn new(start: NaiveTime, end: NaiveTime, offset: FixedOffset) -> Result<Self, AppError> {
        if start == end {
            return Err(AppError::InvalidInput(
                "daily window start and end must differ".into(),
            ));
        }
        Ok(Self { start, end, offset })
    }

    /// True when `instant` falls inside the window.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        let tod = instant.with_timezone(&self.offset).time();
        if self.start < self.end {
            tod >= self.start && tod < self.end
        } else {
            // Wrapped: [end, start) is the invalid range.
            !(tod >= self.end && tod < self.start)
        }
    }

    /// Moves `instant` forward to the first in-window instant (identity when
    /// already inside).
    ///
    /// Mirrors the window arithmetic of the original scheduler: compute the
    /// local time-of-day and jump forward by the gap to `start`, across
    /// midnight when needed.
    pub fn advance_into(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        if self.contains(instant) {
            return instant;
        }
        let tod = instant.with_timezone(&self.offset).time();
        let day = ChronoDuration::seconds(86_400);
        let gap = if tod < self.start {
            self.start - tod
        } else {
            // At/after start is impossible here unless past `end`; wait for
            // tomorrow's start.
            day - (tod - self.start)
        };
        // Strip sub-second noise so fired instants land on whole seconds.
        let adjusted = instant + gap;
        adjusted - ChronoDuration::nanoseconds(i64::from(adjusted.nanosecond()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn t(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 10, 11, h, m, s).unwrap()
    }

    #[test]
    fn offset_forms() {
        assert_eq!(parse_posix_offset("").unwrap().local_minus_utc(), 0);
        assert_eq!(
            parse_posix_offset("GMT+08:00").unwrap().local_minus_utc(),
            8 * 3600
        );
        assert_eq!(
            parse_posix_offset("UTC-05:30").unwrap().local_minus_utc(),
            -(5 * 3600 + 1800)
        );
        assert_eq!(
            parse_posix_offset("+02:00").unwrap().local_minus_utc(),
            2 * 3600
        );
        assert!(parse_posix_offset("PST").is_err());
    }

    #[test]
    fn rejects_empty_window() {
        assert!(DailyWindow::new(t(9, 0, 0), t(9, 0, 0), utc()).is_err());
    }

    #[test]
    fn plain_window_bounds() {
        let w = DailyWindow::new(t(9, 0, 0), t(17, 0, 0), utc()).unwrap();
        assert!(w.contains(at(9, 0, 0)), "lower bound inclusive");
        assert!(w.contains(at(16, 59, 59)));
        assert!(!w.contains(at(17, 0, 0)), "upper bound exclusive");
        assert!(!w.contains(at(8, 59, 59)));
    }

    #[test]
    fn wrapped_window_bounds() {
        let w = DailyWindow::new(t(22, 0, 0), t(2, 0, 0), utc()).unwrap();
        assert!(w.contains(at(23, 0, 0)), "23:00 is inside 22:00-02:00");
        assert!(w.contains(at(1, 59, 59)));
        assert!(w.contains(at(22, 0, 0)));
        assert!(!w.contains(at(2, 0, 0)));
        assert!(!w.contains(at(12, 0, 0)));
    }

    #[test]
    fn advance_jumps_to_start() {
        let w = DailyWindow::new(t(22, 0, 0), t(2, 0, 0), utc()).unwrap();
        assert_eq!(w.advance_into(at(21, 59, 50)), at(22, 0, 0));
        // Already inside: identity.
        assert_eq!(w.advance_into(at(23, 30, 0)), at(23, 30, 0));
    }

    #[test]
    fn advance_crosses_midnight_for_closed_window() {
        let w = DailyWindow::new(t(9, 0, 0), t(17, 0, 0), utc()).unwrap();
        let next = w.advance_into(at(18, 0, 0));
        assert_eq!(
            next,
            Utc.with_ymd_and_hms(2020, 10, 12, 9, 0, 0).unwrap(),
            "after close, next valid instant is tomorrow's start"
        );
    }

    #[test]
    fn respects_timezone_offset() {
        // Window 09:00-17:00 at GMT+08:00 == 01:00-09:00 UTC.
        let off = parse_posix_offset("GMT+08:00").unwrap();
        let w = DailyWindow::new(t(9, 0, 0), t(17, 0, 0), off).unwrap();
        assert!(w.contains(at(1, 0, 0)));
        assert!(!w.contains(at(9, 0, 0)));
    }
}
