//! Read-only ledger endpoints.

use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;

use dispatchgate_auth::Permission;
use dispatchgate_core::ExecutionLogId;

use crate::app::dto::{LogQuery, StatsQuery};
use crate::app::{errors, services::AppServices};
use crate::authz;
use crate::context::PrincipalContext;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_logs))
        .route("/stats", get(stats))
        .route("/:id", get(get_log))
}

/// GET /logs - newest first
pub async fn list_logs(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Query(query): Query<LogQuery>,
) -> Response {
    if let Err(e) = authz::require(&principal, &Permission::LOGS_READ) {
        return errors::authz_error_to_response(e);
    }
    let filter = match query.into_filter() {
        Ok(f) => f,
        Err(msg) => return errors::json_error(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg),
    };

    match services.audit.query(&filter).await {
        Ok(logs) => Json(json!({ "count": logs.len(), "logs": logs })).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /logs/stats - counts over a trailing window
pub async fn stats(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Query(query): Query<StatsQuery>,
) -> Response {
    if let Err(e) = authz::require(&principal, &Permission::LOGS_READ) {
        return errors::authz_error_to_response(e);
    }
    let parsed = query
        .window()
        .and_then(|w| Ok((w, query.kind()?, query.stale_after()?)));
    let (window, kind, stale_after) = match parsed {
        Ok(p) => p,
        Err(msg) => return errors::json_error(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg),
    };

    match services.audit.stats(window, kind, stale_after).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /logs/:id
pub async fn get_log(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> Response {
    if let Err(e) = authz::require(&principal, &Permission::LOGS_READ) {
        return errors::authz_error_to_response(e);
    }
    let Ok(uuid) = id.parse() else {
        return errors::json_error(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", "invalid log id");
    };
    let id = ExecutionLogId::from_uuid(uuid);

    match services.audit.get(id).await {
        Ok(Some(entry)) => Json(entry).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "NOT_FOUND", "execution log not found"),
        Err(e) => errors::store_error_to_response(e),
    }
}
