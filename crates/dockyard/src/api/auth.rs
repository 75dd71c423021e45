use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use tracing::warn;

use crate::error::EngineError;
use crate::keys::{expected_signature, verify_signature};
use crate::request_logging::BODY_READ_LIMIT_BYTES;

use super::api_types::ApiError;
use super::AppState;

pub(super) const SIGNATURE_SHA256_HEADER: &str = "X-Hub-Signature-256";
pub(super) const SIGNATURE_SHA1_HEADER: &str = "X-Hub-Signature";

/// The SHA-256 signature header wins when both are present.
pub(super) fn signature_header(headers: &HeaderMap) -> Option<String> {
    [SIGNATURE_SHA256_HEADER, SIGNATURE_SHA1_HEADER]
        .into_iter()
        .find_map(|name| headers.get(name))
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
}

pub(super) async fn require_admin_signature(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let signature = signature_header(request.headers())
        .ok_or_else(|| EngineError::Unauthorized("missing signature".to_string()))?;

    let (parts, body) = request.into_parts();
    let body_bytes = to_bytes(body, BODY_READ_LIMIT_BYTES)
        .await
        .map_err(|_| EngineError::ConfigurationError("unreadable request body".to_string()))?;

    if !verify_signature(&signature, &state.admin_key, &body_bytes) {
        warn!(
            "rejected {} {}: received {signature:?}, expected {:?}",
            parts.method,
            parts.uri.path(),
            expected_signature(&signature, &state.admin_key, &body_bytes).unwrap_or_default()
        );
        return Err(EngineError::Unauthorized("signature mismatch".to_string()).into());
    }

    let request = Request::from_parts(parts, Body::from(body_bytes));
    Ok(next.run(request).await)
}
