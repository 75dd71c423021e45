use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use tracing::info;

use crate::deployment::service::validate_repository;
use crate::deployment::{ServiceConfiguration, ServiceStatus};
use crate::engine::BulkOutcome;
use crate::error::EngineError;

use super::api_types::{ApiError, DeployAcceptedResponse, ReconcileResponse, ServiceRequest};
use super::auth::signature_header;
use super::AppState;

type ApiResult<T> = Result<T, ApiError>;

pub(super) async fn list_services(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<ServiceStatus>>> {
    Ok(Json(state.manager.get_status().await?))
}

pub(super) async fn service_status(
    State(state): State<AppState>,
    Query(query): Query<ServiceRequest>,
) -> ApiResult<Json<ServiceStatus>> {
    let service = query.service()?;
    Ok(Json(state.manager.get_status_of(&service).await?))
}

/// Push webhook: authorized with the repository's access key, deployed in the background.
pub(super) async fn deploy(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<DeployAcceptedResponse>)> {
    let webhook = state.manager.source().service_from_webhook(&body)?;
    let signature = signature_header(&headers).ok_or_else(|| {
        EngineError::Unauthorized(format!("missing signature for {}", webhook.service))
    })?;
    state
        .keys
        .verify(&webhook.service.repository, &signature, &body)
        .await?;

    let response = DeployAcceptedResponse {
        id: webhook.service.id(),
        repository: webhook.service.repository.clone(),
        branch: webhook.service.branch.clone(),
    };

    state.manager.deploy_in_background(webhook);

    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// Body is the bare `owner/name` repository.
pub(super) async fn create_key(
    State(state): State<AppState>,
    body: String,
) -> ApiResult<(StatusCode, String)> {
    let repository = body.trim();
    validate_repository(repository)?;
    if !state.manager.source().exists(repository).await? {
        return Err(EngineError::not_found("repository", repository).into());
    }

    let key = state.keys.create_key(repository).await?;
    Ok((StatusCode::CREATED, key))
}

pub(super) async fn reload(State(state): State<AppState>) -> StatusCode {
    info!("reload requested");
    state.reloader.trigger();
    StatusCode::OK
}

pub(super) async fn build_service(
    State(state): State<AppState>,
    Json(payload): Json<ServiceRequest>,
) -> ApiResult<Json<ServiceConfiguration>> {
    let service = payload.service()?;
    Ok(Json(state.manager.deploy(&service, None).await?))
}

pub(super) async fn run_service(
    State(state): State<AppState>,
    Json(payload): Json<ServiceRequest>,
) -> ApiResult<Json<ServiceConfiguration>> {
    let service = payload.service()?;
    Ok(Json(state.manager.run_in_background(&service, None).await?))
}

pub(super) async fn stop_service(
    State(state): State<AppState>,
    Json(payload): Json<ServiceRequest>,
) -> ApiResult<StatusCode> {
    let service = payload.service()?;
    state.manager.stop(&service).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn restart_service(
    State(state): State<AppState>,
    Json(payload): Json<ServiceRequest>,
) -> ApiResult<Json<ServiceConfiguration>> {
    let service = payload.service()?;
    Ok(Json(state.manager.restart(&service).await?))
}

pub(super) async fn destroy_service(
    State(state): State<AppState>,
    Json(payload): Json<ServiceRequest>,
) -> ApiResult<StatusCode> {
    let service = payload.service()?;
    state.manager.destroy(&service).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn build_all(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<BulkOutcome>>> {
    Ok(Json(state.manager.build_all().await?))
}

pub(super) async fn restart_all(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<BulkOutcome>>> {
    Ok(Json(state.manager.restart_all().await?))
}

pub(super) async fn reconcile_proxy(
    State(state): State<AppState>,
) -> ApiResult<Json<ReconcileResponse>> {
    let sites = state.manager.reconcile_proxy().await?;
    Ok(Json(ReconcileResponse { sites }))
}
