use std::sync::atomic::{AtomicU64, Ordering};

use axum::body::{to_bytes, Body, Bytes};
use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use tracing::info;

static LOG_COUNTER: AtomicU64 = AtomicU64::new(1);

pub(crate) const BODY_READ_LIMIT_BYTES: usize = 1_048_576;
const SHORT_BODY_MAX_CHARS: usize = 160;

pub async fn log_request(request: Request<Body>, next: Next) -> Response {
    let method = request.method().as_str().to_string();
    let route = request.extensions().get::<MatchedPath>().map_or_else(
        || request.uri().path().to_string(),
        |matched_path| matched_path.as_str().to_string(),
    );

    let (parts, body) = request.into_parts();
    let (body_bytes, short_body) = match to_bytes(body, BODY_READ_LIMIT_BYTES).await {
        Ok(bytes) => {
            let shortened = shorten_request_body(&String::from_utf8_lossy(&bytes));
            (bytes, shortened)
        }
        Err(_) => (Bytes::new(), "<request-body-unavailable>".to_string()),
    };

    let handler = handler_name(method.as_str(), route.as_str());
    let log_number = LOG_COUNTER.fetch_add(1, Ordering::Relaxed);
    info!(target: "dockyard::http", "{log_number}\t{handler}\t{route}\t{short_body}");

    let request = Request::from_parts(parts, Body::from(body_bytes));
    let response = next.run(request).await;
    info!(target: "dockyard::http", "{log_number}\t{}", response.status().as_u16());
    response
}

fn shorten_request_body(raw_body: &str) -> String {
    if raw_body.is_empty() {
        return "-".to_string();
    }

    let single_line = raw_body
        .replace(['\r', '\n', '\t'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    if single_line.chars().count() <= SHORT_BODY_MAX_CHARS {
        return single_line;
    }

    let mut shortened = single_line
        .chars()
        .take(SHORT_BODY_MAX_CHARS)
        .collect::<String>();
    shortened.push_str("...");
    shortened
}

fn handler_name(method: &str, route: &str) -> &'static str {
    match (method, route) {
        ("GET", "/services") => "handlers.list_services",
        ("GET", "/service") => "handlers.service_status",
        ("POST", "/deploy") => "handlers.deploy",
        ("POST", "/create") => "handlers.create_key",
        ("POST", "/reload") => "handlers.reload",
        ("POST", "/services/build") => "handlers.build_service",
        ("POST", "/services/run") => "handlers.run_service",
        ("POST", "/services/stop") => "handlers.stop_service",
        ("POST", "/services/restart") => "handlers.restart_service",
        ("POST", "/services/destroy") => "handlers.destroy_service",
        ("POST", "/services/build-all") => "handlers.build_all",
        ("POST", "/services/restart-all") => "handlers.restart_all",
        ("POST", "/proxy/reconcile") => "handlers.reconcile_proxy",
        _ => "unknown.unknown_handler",
    }
}
