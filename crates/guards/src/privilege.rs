//! Privilege gate for control-plane mutations.
//!
//! Authorization is decided by the caller's auth layer and handed in as a
//! trusted boolean. Mutating operations take a [`Privileged`] token by value,
//! so the check necessarily happens before any state is touched.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("'{actor}' is not permitted to perform '{action}'")]
pub struct PermissionDenied {
    pub actor: String,
    pub action: String,
}

/// Proof that the actor passed the privilege check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Privileged {
    actor: String,
}

impl Privileged {
    pub fn check(
        is_privileged: bool,
        actor: impl Into<String>,
        action: &str,
    ) -> Result<Self, PermissionDenied> {
        let actor = actor.into();
        if is_privileged {
            Ok(Self { actor })
        } else {
            Err(PermissionDenied {
                actor,
                action: action.to_string(),
            })
        }
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }
}
