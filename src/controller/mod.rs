//! Public control surface: the transport-agnostic operation set.
//!
//! ## Contents
//! - [`ControlSurface`] register / unregister / enable / disable / view /
//!   list / output / run_async / run_sync
//! - [`Caller`] identity + role permissions, filled in by the external
//!   authentication collaborator
//! - role permission names ([`APP_VIEW`], [`APP_REG`], …)
//!
//! ## Rules
//! - Every operation performs the ownership gate before dispatch; role
//!   permissions come on top of it
//! - Run-once registrations are ephemeral: never persisted, removed by a
//!   timer at `timeout + retention`

mod surface;

use std::collections::HashSet;

use crate::error::AppError;

pub use surface::{ControlSurface, RunResult};

/// Role permission: view applications and their output.
pub const APP_VIEW: &str = "app-view";
/// Role permission: register applications.
pub const APP_REG: &str = "app-reg";
/// Role permission: unregister applications.
pub const APP_DELETE: &str = "app-delete";
/// Role permission: enable/disable applications.
pub const APP_CONTROL: &str = "app-control";
/// Role permission: run-once operations.
pub const APP_RUN: &str = "app-run";

/// Caller identity as resolved by the external auth layer.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user: String,
    pub group: Option<String>,
    pub permissions: HashSet<String>,
}

impl Caller {
    /// Caller with an explicit permission set.
    pub fn new(
        user: impl Into<String>,
        group: Option<String>,
        permissions: impl IntoIterator<Item = &'static str>,
    ) -> Self {
        Self {
            user: user.into(),
            group,
            permissions: permissions.into_iter().map(str::to_string).collect(),
        }
    }

    /// Fully privileged caller (daemon-internal operations, tests).
    pub fn privileged(user: impl Into<String>) -> Self {
        Self::new(
            user,
            None,
            [APP_VIEW, APP_REG, APP_DELETE, APP_CONTROL, APP_RUN],
        )
    }

    /// Role check; the ownership gate is separate.
    pub fn require(&self, permission: &str) -> Result<(), AppError> {
        if self.permissions.contains(permission) {
            Ok(())
        } else {
            Err(AppError::Unauthorized {
                user: self.user.clone(),
                app: format!("<{permission}>"),
            })
        }
    }
}
