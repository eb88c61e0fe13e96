//! Execution-mode policy: which dispatch targets the current operating mode permits.
//!
//! The mode itself is owned by start-up configuration; this module is a pure
//! lookup with no state of its own.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use dispatchgate_core::DomainError;

use crate::error::ExecutionModeError;

/// Process operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Every target is permitted.
    #[default]
    Full,
    /// Only in-process targets; the external workflow engine is off limits.
    LocalOnly,
    /// Nothing may be dispatched.
    Disabled,
}

/// Where an admitted dispatch would be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchTarget {
    /// The external HTTP workflow engine.
    WorkflowEngine,
    /// In-process handlers.
    Local,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Full => "full",
            ExecutionMode::LocalOnly => "local_only",
            ExecutionMode::Disabled => "disabled",
        }
    }

    /// Whether `target` may be dispatched in this mode.
    pub fn allows(self, target: DispatchTarget) -> bool {
        allowed(self, target)
    }

    /// Like [`allows`](Self::allows), producing the denial on failure.
    pub fn check(self, target: DispatchTarget) -> Result<(), ExecutionModeError> {
        if allowed(self, target) {
            Ok(())
        } else {
            Err(ExecutionModeError {
                target,
                current_mode: self,
            })
        }
    }

    pub fn info(self) -> ExecutionModeInfo {
        ExecutionModeInfo {
            mode: self,
            workflow_engine_enabled: allowed(self, DispatchTarget::WorkflowEngine),
            local_enabled: allowed(self, DispatchTarget::Local),
        }
    }
}

/// Mode → permitted targets.
pub fn allowed(current_mode: ExecutionMode, target: DispatchTarget) -> bool {
    match (current_mode, target) {
        (ExecutionMode::Full, _) => true,
        (ExecutionMode::LocalOnly, DispatchTarget::Local) => true,
        (ExecutionMode::LocalOnly, DispatchTarget::WorkflowEngine) => false,
        (ExecutionMode::Disabled, _) => false,
    }
}

impl DispatchTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchTarget::WorkflowEngine => "workflow_engine",
            DispatchTarget::Local => "local",
        }
    }
}

impl core::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::fmt::Display for DispatchTarget {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "full" => Ok(ExecutionMode::Full),
            "local_only" | "local" => Ok(ExecutionMode::LocalOnly),
            "disabled" | "off" => Ok(ExecutionMode::Disabled),
            other => Err(DomainError::validation(format!(
                "unknown execution mode '{other}' (expected full, local_only or disabled)"
            ))),
        }
    }
}

/// Snapshot of the mode for status responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionModeInfo {
    pub mode: ExecutionMode,
    pub workflow_engine_enabled: bool,
    pub local_enabled: bool,
}
