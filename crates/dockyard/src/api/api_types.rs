use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::deployment::Service;
use crate::error::{EngineError, EngineResult};

/// Coordinates of one service. A missing branch means `master`.
#[derive(Debug, Deserialize)]
pub(super) struct ServiceRequest {
    pub(super) repository: String,
    #[serde(default)]
    pub(super) branch: Option<String>,
}

impl ServiceRequest {
    pub(super) fn service(&self) -> EngineResult<Service> {
        Service::new(&self.repository, self.branch.as_deref().unwrap_or_default())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct DeployAcceptedResponse {
    pub(super) id: String,
    pub(super) repository: String,
    pub(super) branch: String,
}

#[derive(Debug, Serialize)]
pub(super) struct ReconcileResponse {
    pub(super) sites: usize,
}

#[derive(Debug, Serialize)]
pub(super) struct ErrorResponse {
    pub(super) error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct TraceResponse {
    pub(super) trace_id: String,
}

/// Maps [`EngineError`] onto a status code. Server-side failures only expose a trace id
/// that matches the logged error.
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        Self(error)
    }
}

impl ApiError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self.0 {
            EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            EngineError::Conflict { .. } => StatusCode::CONFLICT,
            EngineError::ConfigurationError(_) => StatusCode::BAD_REQUEST,
            EngineError::BuildFailure { .. }
            | EngineError::RuntimeFailure { .. }
            | EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if self.0.is_client_error() {
            return (
                status,
                Json(ErrorResponse {
                    error: self.0.to_string(),
                }),
            )
                .into_response();
        }

        let trace_id = Uuid::new_v4().to_string();
        error!("request failed [{trace_id}]: {:#}", anyhow::Error::from(self.0));
        (status, Json(TraceResponse { trace_id })).into_response()
    }
}
