//! Request logging middleware.
//!
//! Logs every HTTP request with method, path, status code, and
//! latency, and feeds the per-route latency histogram. Health and
//! metrics probes are skipped to keep the log signal clean.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tracing::{info, warn};

const QUIET_PATHS: [&str; 2] = ["/health", "/metrics"];

/// Middleware that logs HTTP requests with timing information.
///
/// INFO for success and client errors, WARN for 5xx. Payment-required
/// responses are logged at INFO with the 402 called out, since they
/// are a normal part of the x402 flow.
pub async fn request_logging_simple(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if QUIET_PATHS.contains(&path.as_str()) {
        return next.run(request).await;
    }

    let start = Instant::now();
    let response = next.run(request).await;
    let latency_ms = start.elapsed().as_millis() as u64;
    let status = response.status();

    metrics::histogram!("http_request_latency_ms", latency_ms as f64);

    if status.is_server_error() {
        warn!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            latency_ms = latency_ms,
            "Request failed (5xx)"
        );
    } else if status == StatusCode::PAYMENT_REQUIRED {
        info!(
            method = %method,
            path = %path,
            latency_ms = latency_ms,
            "Request challenged (402)"
        );
    } else {
        info!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            latency_ms = latency_ms,
            "Request completed"
        );
    }

    response
}
