//! # AppSpec: the wire-format application definition.
//!
//! Field names are the stable JSON vocabulary of the configuration file and
//! the `register` operation. Parsing is lenient about representation
//! (durations as seconds or ISO-8601, instants as naive date-times resolved
//! under `posix_timezone`) but strict about semantics: a spec that fails
//! [`AppSpec::validate`] is rejected before it can touch the registry.
//!
//! Serialization preserves the ingested representation so a registered spec
//! round-trips to canonically equal JSON.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;
use crate::process::{LaunchContext, ResourceLimits};
use crate::schedule::{
    parse_posix_offset, DailyWindow, DurationField, Recurrence, ScheduleTimer,
};

use super::kind::{AppKind, ExitBehavior};
use super::permission::OwnerPermission;

/// Desired lifecycle state of a registered application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    #[default]
    Enabled,
    Disabled,
}

/// Daily window as it appears on the wire (`HH:MM[:SS]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyWindowSpec {
    pub start_time_of_day: String,
    pub end_time_of_day: String,
}

/// One application definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Group of the owner; the user store itself is an external collaborator,
    /// so the group rides on the spec.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_group: Option<String>,
    #[serde(default, skip_serializing_if = "is_default_permission")]
    pub owner_permission: OwnerPermission,

    pub command: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub shell_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    /// Decrypted/merged only at launch; redacted in every serialized view.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secure_environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,
    #[serde(default, skip_serializing_if = "ResourceLimits::is_empty")]
    pub resource_limits: ResourceLimits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_command: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_window: Option<DailyWindowSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posix_timezone: Option<String>,
    /// Interval duration, or a cron expression when `cron_flag` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<DurationField>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cron_flag: bool,
    /// Keep the process running between interval instants (replaced at each).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub keep_running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<DurationField>,

    #[serde(default, skip_serializing_if = "is_default_state")]
    pub desired_state: DesiredState,
    #[serde(default, skip_serializing_if = "is_default_behavior")]
    pub exit_behavior: ExitBehavior,
    /// Fed to the child's stdin at launch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Real application definition carried by an un-initialized app; swapped
    /// in once the pre-start command succeeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_application: Option<Box<Value>>,
}

fn is_default_permission(p: &OwnerPermission) -> bool {
    *p == OwnerPermission::default()
}
fn is_default_state(s: &DesiredState) -> bool {
    *s == DesiredState::default()
}
fn is_default_behavior(b: &ExitBehavior) -> bool {
    *b == ExitBehavior::default()
}

impl AppSpec {
    /// Parses a JSON value into a validated spec.
    pub fn from_json(value: &Value) -> Result<Self, AppError> {
        let spec: AppSpec = serde_json::from_value(value.clone())?;
        spec.validate()?;
        Ok(spec)
    }

    /// Semantic validation beyond what serde checks.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::InvalidInput("application name is empty".into()));
        }
        if self.name.contains('/') || self.name.contains("..") {
            return Err(AppError::InvalidInput(format!(
                "application name '{}' contains path separators",
                self.name
            )));
        }
        if self.command.trim().is_empty() {
            return Err(AppError::InvalidInput("command is empty".into()));
        }
        // Exercise every parser so malformed fields fail at ingestion,
        // not mid-supervision.
        self.timer(Utc::now())?;
        if let Some(r) = &self.retention {
            r.to_duration()?;
        }
        if self.cron_flag && self.interval.is_none() {
            return Err(AppError::InvalidInput(
                "cron_flag set without an interval expression".into(),
            ));
        }
        if let Some(payload) = &self.initial_application {
            let inner: AppSpec = serde_json::from_value((**payload).clone())?;
            inner.validate()?;
        }
        Ok(())
    }

    /// Behavior tag derived from the spec fields.
    ///
    /// `OneShot` is never derived here; it is imposed by the control surface
    /// on ephemeral run-once registrations.
    pub fn kind(&self) -> AppKind {
        if self.initial_application.is_some() {
            AppKind::UnInitialized
        } else if self.interval.is_some() {
            if self.cron_flag {
                AppKind::Cron
            } else if self.keep_running {
                AppKind::Periodic
            } else {
                AppKind::ShortRunning
            }
        } else {
            AppKind::LongRunning
        }
    }

    /// Builds the schedule evaluator for this spec.
    pub fn timer(&self, now: DateTime<Utc>) -> Result<ScheduleTimer, AppError> {
        let offset = parse_posix_offset(self.posix_timezone.as_deref().unwrap_or(""))?;

        let parse_instant = |text: &str| -> Result<DateTime<Utc>, AppError> {
            if let Ok(t) = DateTime::parse_from_rfc3339(text) {
                return Ok(t.with_timezone(&Utc));
            }
            let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S")
                .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S"))
                .map_err(|_| AppError::InvalidInput(format!("bad instant '{text}'")))?;
            naive
                .and_local_timezone(offset)
                .single()
                .map(|t| t.with_timezone(&Utc))
                .ok_or_else(|| AppError::InvalidInput(format!("ambiguous instant '{text}'")))
        };

        let start = self.start_time.as_deref().map(parse_instant).transpose()?;
        let end = self.end_time.as_deref().map(parse_instant).transpose()?;

        let window = self
            .daily_window
            .as_ref()
            .map(|w| -> Result<DailyWindow, AppError> {
                DailyWindow::new(
                    parse_time_of_day(&w.start_time_of_day)?,
                    parse_time_of_day(&w.end_time_of_day)?,
                    offset,
                )
            })
            .transpose()?;

        let recurrence = match (&self.interval, self.cron_flag) {
            (None, _) => Recurrence::Once,
            (Some(field), false) => {
                let d = field.to_duration()?;
                if d.as_secs() == 0 {
                    return Err(AppError::InvalidInput("interval must be positive".into()));
                }
                Recurrence::Every(d.as_secs())
            }
            (Some(DurationField::Iso(expr)), true) => {
                let normalized = normalize_cron(expr);
                let schedule = cron::Schedule::from_str(&normalized).map_err(|e| {
                    AppError::InvalidInput(format!("bad cron expression '{expr}': {e}"))
                })?;
                Recurrence::Cron(Box::new(schedule))
            }
            (Some(DurationField::Seconds(_)), true) => {
                return Err(AppError::InvalidInput(
                    "cron_flag set but interval is numeric".into(),
                ));
            }
        };

        Ok(ScheduleTimer::new(start, end, window, recurrence, now))
    }

    /// Assembles the launch context, applying daemon-level defaults and
    /// merging the secure environment.
    pub fn launch_context(
        &self,
        default_exec_user: Option<&str>,
        default_work_dir: Option<&PathBuf>,
    ) -> LaunchContext {
        let mut env = self.environment.clone();
        for (k, v) in &self.secure_environment {
            env.insert(k.clone(), v.clone());
        }
        let stdin_blob = self.metadata.as_ref().map(|m| match m {
            Value::String(s) => s.clone().into_bytes(),
            other => other.to_string().into_bytes(),
        });
        LaunchContext {
            app_name: self.name.clone(),
            command: self.command.clone(),
            shell_mode: self.shell_mode,
            exec_user: self
                .execution_user
                .clone()
                .or_else(|| default_exec_user.map(str::to_string)),
            working_dir: self
                .working_dir
                .clone()
                .or_else(|| default_work_dir.cloned()),
            env,
            limits: self.resource_limits,
            stdin_blob,
            docker_image: self.docker_image.clone(),
        }
    }

    /// Serialized view with secure environment values masked.
    pub fn redacted_json(&self) -> Value {
        let mut v = serde_json::to_value(self).expect("spec serializes");
        if let Some(map) = v
            .get_mut("secure_environment")
            .and_then(Value::as_object_mut)
        {
            for value in map.values_mut() {
                *value = Value::String("*".into());
            }
        }
        v
    }
}

/// `HH:MM:SS` or `HH:MM`.
fn parse_time_of_day(text: &str) -> Result<NaiveTime, AppError> {
    NaiveTime::parse_from_str(text, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(text, "%H:%M"))
        .map_err(|_| AppError::InvalidInput(format!("bad time of day '{text}'")))
}

/// Prepends a seconds field to a classic 5-field expression; the extended
/// grammar wants six.
fn normalize_cron(expr: &str) -> String {
    let trimmed = expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn minimal(extra: &str) -> Value {
        let text = format!(r#"{{"name":"demo","command":"sleep 1"{extra}}}"#);
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn minimal_spec_is_long_running() {
        let spec = AppSpec::from_json(&minimal("")).unwrap();
        assert_eq!(spec.kind(), AppKind::LongRunning);
        assert_eq!(spec.desired_state, DesiredState::Enabled);
        assert_eq!(spec.exit_behavior, ExitBehavior::Standby);
    }

    #[test]
    fn kind_derivation() {
        let spec = AppSpec::from_json(&minimal(r#","interval":60"#)).unwrap();
        assert_eq!(spec.kind(), AppKind::ShortRunning);

        let spec = AppSpec::from_json(&minimal(r#","interval":60,"keep_running":true"#)).unwrap();
        assert_eq!(spec.kind(), AppKind::Periodic);

        let spec =
            AppSpec::from_json(&minimal(r#","interval":"0 */5 * * * *","cron_flag":true"#)).unwrap();
        assert_eq!(spec.kind(), AppKind::Cron);

        let inner = r#","initial_application":{"name":"real","command":"sleep 5"}"#;
        let spec = AppSpec::from_json(&minimal(inner)).unwrap();
        assert_eq!(spec.kind(), AppKind::UnInitialized);
    }

    #[test]
    fn rejects_bad_specs() {
        for (extra, why) in [
            (r#","interval":"not a cron","cron_flag":true"#, "bad cron"),
            (r#","interval":0"#, "zero interval"),
            (r#","cron_flag":true"#, "cron without interval"),
            (
                r#","daily_window":{"start_time_of_day":"09:00:00","end_time_of_day":"09:00:00"}"#,
                "empty window",
            ),
            (r#","start_time":"tomorrow-ish""#, "bad instant"),
            (r#","retention":"PXYZ""#, "bad retention"),
        ] {
            assert!(AppSpec::from_json(&minimal(extra)).is_err(), "{why}");
        }
        assert!(
            AppSpec::from_json(&serde_json::json!({"name":"","command":"x"})).is_err(),
            "empty name"
        );
        assert!(
            AppSpec::from_json(&serde_json::json!({"name":"a/b","command":"x"})).is_err(),
            "name with separator"
        );
    }

    #[test]
    fn instants_resolve_under_posix_timezone() {
        let spec = AppSpec::from_json(&minimal(
            r#","start_time":"2020-10-11T09:22:05","posix_timezone":"GMT+08:00""#,
        ))
        .unwrap();
        let now = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let timer = spec.timer(now).unwrap();
        assert_eq!(
            timer.start(),
            Utc.with_ymd_and_hms(2020, 10, 11, 1, 22, 5).unwrap()
        );
    }

    #[test]
    fn round_trip_is_canonical() {
        let original = serde_json::json!({
            "name": "t-round",
            "command": "echo hi",
            "shell_mode": true,
            "environment": {"A": "1", "B": "2"},
            "owner": "alice",
            "owner_permission": 21,
            "interval": "PT5M",
            "retention": 30,
            "exit_behavior": "keepalive",
            "daily_window": {"start_time_of_day": "22:00:00", "end_time_of_day": "02:00:00"},
            "posix_timezone": "GMT+00:00"
        });
        let spec = AppSpec::from_json(&original).unwrap();
        let serialized = serde_json::to_value(&spec).unwrap();
        let again = AppSpec::from_json(&serialized).unwrap();
        assert_eq!(spec, again);
        assert_eq!(serialized, serde_json::to_value(&again).unwrap());
        // Wire representations survive (ISO stays ISO, seconds stay seconds).
        assert_eq!(serialized["interval"], "PT5M");
        assert_eq!(serialized["retention"], 30);
    }

    #[test]
    fn secure_environment_is_redacted() {
        let spec = AppSpec::from_json(&minimal(
            r#","secure_environment":{"TOKEN":"s3cret"},"environment":{"PLAIN":"ok"}"#,
        ))
        .unwrap();
        let view = spec.redacted_json();
        assert_eq!(view["secure_environment"]["TOKEN"], "*");
        assert_eq!(view["environment"]["PLAIN"], "ok");

        // But the launch context sees the real value.
        let ctx = spec.launch_context(None, None);
        assert_eq!(ctx.env.get("TOKEN").unwrap(), "s3cret");
    }

    #[test]
    fn metadata_feeds_stdin() {
        let spec = AppSpec::from_json(&minimal(r#","metadata":{"k":"v"}"#)).unwrap();
        let ctx = spec.launch_context(None, None);
        assert_eq!(ctx.stdin_blob.unwrap(), br#"{"k":"v"}"#);

        let spec = AppSpec::from_json(&minimal(r#","metadata":"plain text""#)).unwrap();
        assert_eq!(
            spec.launch_context(None, None).stdin_blob.unwrap(),
            b"plain text"
        );
    }

    #[test]
    fn five_field_cron_is_normalized() {
        let spec =
            AppSpec::from_json(&minimal(r#","interval":"*/5 * * * *","cron_flag":true"#)).unwrap();
        assert_eq!(spec.kind(), AppKind::Cron);
        spec.timer(Utc::now()).unwrap();
    }
}
