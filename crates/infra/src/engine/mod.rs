//! Outbound workflow-engine invocation.

mod http;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use dispatchgate_core::ExecutionLogId;

pub use http::{HttpWorkflowEngine, SIGNATURE_HEADER, LOG_ID_HEADER, sign_payload};

/// One call into the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub log_id: ExecutionLogId,
    pub tool_id: String,
    pub webhook_path: String,
    pub action: String,
    pub params: JsonValue,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("could not reach workflow engine: {0}")]
    Transport(String),

    #[error("workflow engine timed out after {0}s")]
    Timeout(u64),

    #[error("workflow engine returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode workflow engine response: {0}")]
    Decode(String),

    #[error("invalid workflow request: {0}")]
    Request(String),
}

/// Something that can run a tool's workflow and return its output.
#[async_trait::async_trait]
pub trait WorkflowEngine: Send + Sync {
    async fn invoke(&self, request: &InvokeRequest) -> Result<JsonValue, EngineError>;
}
