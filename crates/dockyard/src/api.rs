//! HTTP control plane.

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::engine::ServiceManager;
use crate::keys::KeyRegistry;
use crate::request_logging::log_request;
use crate::supervisor::Reloader;

mod api_types;
mod auth;
mod handlers;

pub use api_types::ApiError;

#[derive(Debug, Clone)]
pub struct AppState {
    pub manager: Arc<ServiceManager>,
    pub keys: Arc<KeyRegistry>,
    /// Shared secret signing administrative requests.
    pub admin_key: Arc<str>,
    pub reloader: Reloader,
}

pub fn router(state: AppState) -> Router {
    let admin_router = Router::new()
        .route("/create", post(handlers::create_key))
        .route("/reload", post(handlers::reload))
        .route("/services/build", post(handlers::build_service))
        .route("/services/run", post(handlers::run_service))
        .route("/services/stop", post(handlers::stop_service))
        .route("/services/restart", post(handlers::restart_service))
        .route("/services/destroy", post(handlers::destroy_service))
        .route("/services/build-all", post(handlers::build_all))
        .route("/services/restart-all", post(handlers::restart_all))
        .route("/proxy/reconcile", post(handlers::reconcile_proxy))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_admin_signature,
        ));

    Router::new()
        .route("/services", get(handlers::list_services))
        .route("/service", get(handlers::service_status))
        .route("/deploy", post(handlers::deploy))
        .merge(admin_router)
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}
