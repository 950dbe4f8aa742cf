//! Duration wire format: integer seconds or ISO-8601.
//!
//! Application specs accept durations either as plain seconds (`10`) or as an
//! ISO-8601 duration string (`P1Y2M3DT4H5M6S`, `P5W`, `PT10S`). The original
//! wire form is preserved so a spec round-trips byte-identically.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// A duration as it appears on the wire.
///
/// Keeps the ingested representation (seconds or ISO string) and converts on
/// demand via [`DurationField::to_duration`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DurationField {
    /// Plain integer seconds.
    Seconds(u64),
    /// ISO-8601 duration string.
    Iso(String),
}

impl DurationField {
    /// Resolves to an elapsed-time duration.
    ///
    /// Calendar components use the fixed conventions: 1 year = 365 days,
    /// 1 month = 30 days, 1 week = 7 days.
    pub fn to_duration(&self) -> Result<Duration, AppError> {
        match self {
            DurationField::Seconds(s) => Ok(Duration::from_secs(*s)),
            DurationField::Iso(text) => parse_iso8601(text),
        }
    }
}

/// Parses an ISO-8601 duration (`PnYnMnDTnHnMnS` or `PnW`).
///
/// Empty designators are allowed (`PT5M`); an all-empty duration (`P`, `PT`)
/// is rejected.
fn parse_iso8601(text: &str) -> Result<Duration, AppError> {
    let bad = || AppError::InvalidInput(format!("bad ISO-8601 duration '{text}'"));
    let mut chars = text.chars().peekable();
    if chars.next() != Some('P') {
        return Err(bad());
    }

    let mut total: u64 = 0;
    let mut in_time = false;
    let mut num = String::new();
    let mut seen_component = false;

    for ch in chars {
        match ch {
            'T' if num.is_empty() => in_time = true,
            '0'..='9' => num.push(ch),
            unit => {
                let n: u64 = num.parse().map_err(|_| bad())?;
                num.clear();
                seen_component = true;
                let secs = match (unit, in_time) {
                    ('Y', false) => n.checked_mul(365 * 86_400),
                    ('M', false) => n.checked_mul(30 * 86_400),
                    ('W', false) => n.checked_mul(7 * 86_400),
                    ('D', false) => n.checked_mul(86_400),
                    ('H', true) => n.checked_mul(3_600),
                    ('M', true) => n.checked_mul(60),
                    ('S', true) => Some(n),
                    _ => return Err(bad()),
                }
                .ok_or_else(bad)?;
                total = total.checked_add(secs).ok_or_else(bad)?;
            }
        }
    }

    if !num.is_empty() || !seen_component {
        return Err(bad());
    }
    Ok(Duration::from_secs(total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_form() {
        assert_eq!(
            DurationField::Seconds(90).to_duration().unwrap(),
            Duration::from_secs(90)
        );
    }

    #[test]
    fn iso_full_form() {
        let d = DurationField::Iso("P1Y2M3DT4H5M6S".into())
            .to_duration()
            .unwrap();
        let expect = 365 * 86_400 + 2 * 30 * 86_400 + 3 * 86_400 + 4 * 3_600 + 5 * 60 + 6;
        assert_eq!(d, Duration::from_secs(expect));
    }

    #[test]
    fn iso_weeks() {
        let d = DurationField::Iso("P5W".into()).to_duration().unwrap();
        assert_eq!(d, Duration::from_secs(5 * 7 * 86_400));
    }

    #[test]
    fn iso_time_only() {
        let d = DurationField::Iso("PT1S".into()).to_duration().unwrap();
        assert_eq!(d, Duration::from_secs(1));
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "P", "PT", "5S", "PT5X", "P-1D", "PT5"] {
            assert!(
                DurationField::Iso(bad.into()).to_duration().is_err(),
                "{bad} should not parse"
            );
        }
    }

    #[test]
    fn wire_form_round_trips() {
        let v: DurationField = serde_json::from_str("\"PT10S\"").unwrap();
        assert_eq!(serde_json::to_string(&v).unwrap(), "\"PT10S\"");
        let v: DurationField = serde_json::from_str("60").unwrap();
        assert_eq!(serde_json::to_string(&v).unwrap(), "60");
    }
}
