use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Map, Value as JsonValue, json};

use dispatchgate_auth::AuthzError;
use dispatchgate_guards::{DispatchError, ToolCatalogue};
use dispatchgate_infra::{AdminError, StoreError};

pub fn dispatch_error_to_response(err: &DispatchError, catalogue: &ToolCatalogue) -> Response {
    let status = match err {
        DispatchError::RateLimited(_) | DispatchError::ConcurrencyLimit(_) => {
            StatusCode::TOO_MANY_REQUESTS
        }
        DispatchError::KillSwitchActive(_)
        | DispatchError::ExecutionMode(_)
        | DispatchError::GuardUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        DispatchError::InvokeFailure { .. } => StatusCode::BAD_GATEWAY,
        DispatchError::UnknownTool { .. } | DispatchError::Validation(_) => StatusCode::BAD_REQUEST,
    };

    let mut extra = match err.context() {
        JsonValue::Object(map) => map,
        _ => Map::new(),
    };
    if let DispatchError::UnknownTool { .. } = err {
        extra.insert("available_tools".to_string(), json!(catalogue.ids()));
    }

    let mut response = error_body(status, err.code(), err.to_string(), extra);
    if let DispatchError::RateLimited(limited) = err {
        if let Ok(value) = HeaderValue::from_str(&limited.retry_after_secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

pub fn admin_error_to_response(err: AdminError) -> Response {
    match err {
        AdminError::Forbidden(denied) => json_error(StatusCode::FORBIDDEN, "FORBIDDEN", denied.to_string()),
        AdminError::Validation(e) => json_error(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string()),
        AdminError::Conflict(msg) => json_error(StatusCode::CONFLICT, "CONFLICT", msg),
        AdminError::Store(e) => store_error_to_response(e),
    }
}

pub fn store_error_to_response(err: StoreError) -> Response {
    match err {
        StoreError::Unavailable { .. } => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE", err.to_string())
        }
        StoreError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string()),
        StoreError::Conflict(_) | StoreError::Ledger(_) => {
            json_error(StatusCode::CONFLICT, "CONFLICT", err.to_string())
        }
        StoreError::Corrupt(_) | StoreError::Backend { .. } => {
            tracing::error!(error = %err, "store error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR", err.to_string())
        }
    }
}

pub fn authz_error_to_response(err: AuthzError) -> Response {
    json_error(StatusCode::FORBIDDEN, "FORBIDDEN", err.to_string())
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    error_body(status, code, message.into(), Map::new())
}

fn error_body(
    status: StatusCode,
    code: &'static str,
    message: String,
    extra: Map<String, JsonValue>,
) -> Response {
    let mut body = Map::new();
    body.insert("success".to_string(), JsonValue::Bool(false));
    body.insert("error".to_string(), json!(code));
    for (key, value) in extra {
        body.entry(key).or_insert(value);
    }
    body.insert("message".to_string(), JsonValue::String(message));
    (status, axum::Json(JsonValue::Object(body))).into_response()
}
