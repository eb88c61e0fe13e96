use axum::{Extension, Json, http::StatusCode, response::IntoResponse};

use dispatchgate_auth::Permission;

use crate::context::PrincipalContext;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn whoami(Extension(principal): Extension<PrincipalContext>) -> impl IntoResponse {
    let p = principal.principal();
    Json(serde_json::json!({
        "principal_id": principal.principal_id().to_string(),
        "actor": principal.actor(),
        "roles": principal.roles().iter().map(|r| r.as_str()).collect::<Vec<_>>(),
        "permissions": p.permissions.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
        "can_toggle_kill_switch": principal.has(&Permission::KILL_SWITCH_TOGGLE),
    }))
}
