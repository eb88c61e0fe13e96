use axum::{Router, routing::get};

pub mod admin;
pub mod dispatch;
pub mod logs;
pub mod system;

/// Router for all authenticated endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .nest("/dispatch", dispatch::router())
        .nest("/admin", admin::router())
        .nest("/logs", logs::router())
}
