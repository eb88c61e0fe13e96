use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Permission identifier (`"area.action"`).
///
/// `"*"` grants everything.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(Cow<'static, str>);

impl Permission {
    pub const WILDCARD: Permission = Permission(Cow::Borrowed("*"));
    pub const DISPATCH_EXECUTE: Permission = Permission(Cow::Borrowed("dispatch.execute"));
    pub const LOGS_READ: Permission = Permission(Cow::Borrowed("logs.read"));
    /// Activate/deactivate the kill switch.
    pub const KILL_SWITCH_TOGGLE: Permission = Permission(Cow::Borrowed("killswitch.toggle"));
    /// Reset job-lock counters.
    pub const CONCURRENCY_RESET: Permission = Permission(Cow::Borrowed("concurrency.reset"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        self.as_str() == "*"
    }
}

impl core::fmt::Display for Permission {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
