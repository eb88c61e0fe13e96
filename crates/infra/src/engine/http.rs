use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::{Map, Value as JsonValue, json};
use sha2::Sha256;
use tracing::instrument;

use super::{EngineError, InvokeRequest, WorkflowEngine};

pub const SIGNATURE_HEADER: &str = "X-Dispatch-Signature";
pub const LOG_ID_HEADER: &str = "X-Dispatch-Log-Id";

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 of `body` under `secret`.
pub fn sign_payload(secret: &[u8], body: &[u8]) -> Result<String, EngineError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .map_err(|e| EngineError::Request(format!("invalid signing key: {e}")))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Webhook-triggered workflow engine reached over HTTP.
///
/// Each call POSTs the tool params plus a `_dispatch` envelope to
/// `{base_url}/{webhook_path}`. The body is signed when a secret is set.
#[derive(Clone)]
pub struct HttpWorkflowEngine {
    client: reqwest::Client,
    base_url: String,
    secret: Option<Vec<u8>>,
    timeout: Duration,
}

impl HttpWorkflowEngine {
    pub fn new(
        base_url: impl Into<String>,
        secret: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret,
            timeout,
        })
    }

    fn url(&self, webhook_path: &str) -> String {
        format!("{}/{}", self.base_url, webhook_path.trim_start_matches('/'))
    }

    fn body(request: &InvokeRequest) -> JsonValue {
        let mut body = match &request.params {
            JsonValue::Object(map) => map.clone(),
            JsonValue::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("params".to_string(), other.clone());
                map
            }
        };
        body.insert(
            "_dispatch".to_string(),
            json!({
                "log_id": request.log_id,
                "tool_id": request.tool_id,
                "action": request.action,
                "timestamp": Utc::now(),
            }),
        );
        JsonValue::Object(body)
    }
}

#[async_trait::async_trait]
impl WorkflowEngine for HttpWorkflowEngine {
    #[instrument(skip_all, fields(tool_id = %request.tool_id, log_id = %request.log_id), err)]
    async fn invoke(&self, request: &InvokeRequest) -> Result<JsonValue, EngineError> {
        let body = serde_json::to_vec(&Self::body(request))
            .map_err(|e| EngineError::Request(e.to_string()))?;

        let mut call = self
            .client
            .post(self.url(&request.webhook_path))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(LOG_ID_HEADER, request.log_id.to_string());
        if let Some(secret) = &self.secret {
            call = call.header(SIGNATURE_HEADER, sign_payload(secret, &body)?);
        }

        let resp = call.body(body).send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::Timeout(self.timeout.as_secs())
            } else {
                EngineError::Transport(e.to_string())
            }
        })?;

        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| EngineError::Decode(e.to_string()))?;
        if !(200..300).contains(&status) {
            return Err(EngineError::Status { status, body: text });
        }
        Ok(parse_response(&text))
    }
}

/// Empty bodies become `null`; non-JSON bodies are passed through as text.
fn parse_response(text: &str) -> JsonValue {
    if text.trim().is_empty() {
        return JsonValue::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| JsonValue::String(text.to_string()))
}

#[cfg(test)]
mod tests {
    use dispatchgate_core::ExecutionLogId;

    use super::*;

    #[test]
    fn signature_matches_rfc4231_vector() {
        let sig = sign_payload(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn body_merges_params_with_dispatch_envelope() {
        let log_id = ExecutionLogId::new();
        let body = HttpWorkflowEngine::body(&InvokeRequest {
            log_id,
            tool_id: "listing-local".to_string(),
            webhook_path: "/listing-local".to_string(),
            action: "run".to_string(),
            params: json!({"city": "Austin"}),
        });

        assert_eq!(body["city"], "Austin");
        assert_eq!(body["_dispatch"]["action"], "run");
        assert_eq!(body["_dispatch"]["log_id"], json!(log_id));
    }

    #[test]
    fn lenient_response_parsing() {
        assert_eq!(parse_response(""), JsonValue::Null);
        assert_eq!(parse_response("{\"ok\":true}"), json!({"ok": true}));
        assert_eq!(parse_response("accepted"), json!("accepted"));
    }

    #[test]
    fn urls_join_without_double_slashes() {
        let engine =
            HttpWorkflowEngine::new("http://engine:5678/webhook/", None, Duration::from_secs(5))
                .unwrap();
        assert_eq!(engine.url("/listing-local"), "http://engine:5678/webhook/listing-local");
    }

    #[tokio::test]
    async fn unreachable_engine_is_a_transport_error() {
        let engine =
            HttpWorkflowEngine::new("http://127.0.0.1:9", None, Duration::from_secs(2)).unwrap();
        let err = engine
            .invoke(&InvokeRequest {
                log_id: ExecutionLogId::new(),
                tool_id: "listing-local".to_string(),
                webhook_path: "listing-local".to_string(),
                action: "run".to_string(),
                params: JsonValue::Null,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Transport(_) | EngineError::Timeout(_)));
    }
}
