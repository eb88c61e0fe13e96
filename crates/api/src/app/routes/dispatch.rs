//! Dispatch admission endpoints.

use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::{Value as JsonValue, json};

use dispatchgate_auth::Permission;
use dispatchgate_infra::{DispatchRequest, dispatch::DispatchState};

use crate::app::{errors, services::AppServices};
use crate::authz;
use crate::context::PrincipalContext;

pub fn router() -> Router {
    Router::new()
        .route("/", get(summary).post(dispatch))
        .route("/tools", get(tools))
}

/// POST /dispatch - admit and run a tool
pub async fn dispatch(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<DispatchRequest>,
) -> Response {
    if let Err(e) = authz::require(&principal, &Permission::DISPATCH_EXECUTE) {
        return errors::authz_error_to_response(e);
    }

    match services
        .coordinator
        .dispatch(body, Some(principal.actor()))
        .await
    {
        Ok(outcome) => {
            let status = match outcome.status {
                DispatchState::Completed => StatusCode::OK,
                DispatchState::Pending => StatusCode::ACCEPTED,
            };
            let mut body = json!({ "success": true });
            if let (Some(map), Ok(JsonValue::Object(fields))) =
                (body.as_object_mut(), serde_json::to_value(&outcome))
            {
                map.extend(fields);
            }
            (status, Json(body)).into_response()
        }
        Err(err) => errors::dispatch_error_to_response(&err, services.coordinator.catalogue()),
    }
}

/// GET /dispatch - admission status summary
pub async fn summary(Extension(services): Extension<Arc<AppServices>>) -> Response {
    match services.coordinator.summary().await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /dispatch/tools - registered tool catalogue
pub async fn tools(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    let catalogue = services.coordinator.catalogue();
    Json(json!({
        "count": catalogue.len(),
        "tools": catalogue.definitions().collect::<Vec<_>>(),
    }))
}
