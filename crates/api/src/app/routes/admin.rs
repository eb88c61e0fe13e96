//! Control-plane routes: kill switch and concurrency counters.
//!
//! Mutations require a privileged principal; the check runs before any
//! store is touched.

use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::Path,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;

use dispatchgate_auth::Permission;
use dispatchgate_infra::{ActivateKillSwitch, AdminError};

use crate::app::{dto::ResetConcurrencyRequest, errors, services::AppServices};
use crate::authz;
use crate::context::PrincipalContext;

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

pub fn router() -> Router {
    Router::new()
        .route("/kill-switch", get(kill_switch_status))
        .route("/kill-switch/activate", post(activate_kill_switch))
        .route("/kill-switch/deactivate", post(deactivate_kill_switch))
        .route("/kill-switch/blocked/:tool_id", get(is_blocked))
        .route("/concurrency", get(concurrency_status))
        .route("/concurrency/reset", post(reset_concurrency))
}

// ─────────────────────────────────────────────────────────────────────────────
// Kill switch
// ─────────────────────────────────────────────────────────────────────────────

/// GET /admin/kill-switch
pub async fn kill_switch_status(Extension(services): Extension<Arc<AppServices>>) -> Response {
    match services.kill_switch.status().await {
        Ok(state) => Json(state).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// POST /admin/kill-switch/activate
pub async fn activate_kill_switch(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<ActivateKillSwitch>,
) -> Response {
    let who = match authz::privileged(&principal, &Permission::KILL_SWITCH_TOGGLE) {
        Ok(who) => who,
        Err(denied) => return errors::admin_error_to_response(AdminError::from(denied)),
    };

    match services.kill_switch.activate(&who, body).await {
        Ok(state) => Json(json!({ "success": true, "kill_switch": state })).into_response(),
        Err(e) => errors::admin_error_to_response(e),
    }
}

/// POST /admin/kill-switch/deactivate
pub async fn deactivate_kill_switch(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
) -> Response {
    let who = match authz::privileged(&principal, &Permission::KILL_SWITCH_TOGGLE) {
        Ok(who) => who,
        Err(denied) => return errors::admin_error_to_response(AdminError::from(denied)),
    };

    match services.kill_switch.deactivate(&who).await {
        Ok(state) => Json(json!({ "success": true, "kill_switch": state })).into_response(),
        Err(e) => errors::admin_error_to_response(e),
    }
}

/// GET /admin/kill-switch/blocked/:tool_id
pub async fn is_blocked(
    Extension(services): Extension<Arc<AppServices>>,
    Path(tool_id): Path<String>,
) -> Response {
    let tool_id = services.coordinator.catalogue().normalize_tool_id(&tool_id);
    match services.kill_switch.is_blocked(&tool_id).await {
        Ok(blocked) => Json(json!({ "tool_id": tool_id, "blocked": blocked })).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Concurrency
// ─────────────────────────────────────────────────────────────────────────────

/// GET /admin/concurrency
pub async fn concurrency_status(Extension(services): Extension<Arc<AppServices>>) -> Response {
    match services.concurrency.status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// POST /admin/concurrency/reset - body `{ "job_type": ... }` is optional
pub async fn reset_concurrency(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    body: Option<Json<ResetConcurrencyRequest>>,
) -> Response {
    let who = match authz::privileged(&principal, &Permission::CONCURRENCY_RESET) {
        Ok(who) => who,
        Err(denied) => return errors::admin_error_to_response(AdminError::from(denied)),
    };
    let job_type = body.and_then(|Json(b)| b.job_type);

    match services.concurrency.reset(&who, job_type.as_deref()).await {
        Ok(reset) => Json(json!({
            "success": true,
            "job_type": job_type,
            "reset": reset,
        }))
        .into_response(),
        Err(e) => errors::admin_error_to_response(e),
    }
}
