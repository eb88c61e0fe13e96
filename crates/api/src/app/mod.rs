//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store selection and guard-service construction
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: query/body DTOs and their mapping to guard types
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use dispatchgate_infra::DispatchConfig;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the full HTTP router from configuration (entrypoint used by `main.rs`).
pub async fn build_app(config: DispatchConfig) -> anyhow::Result<Router> {
    let services = services::build_services(&config).await?;
    Ok(router_with(config.jwt_secret.into_bytes(), Arc::new(services)))
}

/// Router over already-built services.
pub fn router_with(jwt_secret: Vec<u8>, services: Arc<AppServices>) -> Router {
    let jwt = Arc::new(dispatchgate_auth::Hs256JwtValidator::new(jwt_secret));
    let auth_state = middleware::AuthState { jwt };

    let protected = routes::router()
        .layer(Extension(services))
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            middleware::auth_middleware,
        ));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
        .layer(ServiceBuilder::new())
}
