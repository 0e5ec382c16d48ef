use std::time::Instant;

use axum::{
    extract::Request,
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::http::handlers::SESSION_ID_HEADER;

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

/// Logs one summary per exchange, tagged with the session the request named
/// or, for a new subscription, the session it was issued.
pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let origin = header_text(request.headers(), header::ORIGIN.as_str());
    let named_session = header_text(request.headers(), SESSION_ID_HEADER);
    let started_at = Instant::now();

    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = started_at.elapsed().as_millis();
    let session = named_session.or_else(|| header_text(response.headers(), SESSION_ID_HEADER));

    // For subscriptions this measures time to open the stream, not its lifetime.
    info!(
        method = %method,
        path = %path,
        status = status.as_u16(),
        duration_ms = elapsed_ms,
        session_id = session.as_deref().unwrap_or("-"),
        "request summary"
    );

    match status {
        StatusCode::FORBIDDEN => warn!(
            method = %method,
            origin = origin.as_deref().unwrap_or("-"),
            "origin rejected"
        ),
        StatusCode::SERVICE_UNAVAILABLE => {
            warn!(method = %method, "request refused during shutdown")
        }
        _ => {}
    }

    response
}

fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}
