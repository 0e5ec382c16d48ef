//! Axum HTTP handlers for the streaming endpoint
//!
//! POST submits one JSON-RPC message and is acknowledged with 202 before the
//! handler runs. GET opens a server-sent-event stream and returns its session
//! id in the `Mcp-Session-Id` header; responses and notifications arrive there.

use std::convert::Infallible;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    Extension,
};
use tokio_stream::StreamExt;

use crate::{
    errors::AppError,
    gatekeeper::NegotiatedVersion,
    mcp::{router::RouteError, rpc::JsonRpcMessage},
    session::{registry::RegistryError, ReplyTarget, SessionId},
    AppState,
};

pub const SESSION_ID_HEADER: &str = "mcp-session-id";

impl From<RouteError> for AppError {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::UnmatchedResponse(_) => {
                AppError::bad_request("unmatched_response", err.to_string())
            }
        }
    }
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::ShutDown => {
                AppError::unavailable("shutting_down", "server is shutting down")
            }
        }
    }
}

pub async fn submit(
    State(state): State<AppState>,
    Extension(version): Extension<NegotiatedVersion>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let message = JsonRpcMessage::from_slice(&body)
        .map_err(|err| AppError::bad_request("malformed_message", err.to_string()))?;

    let target = reply_target(&headers);
    state.router.accept(message, target, version)?;

    Ok(StatusCode::ACCEPTED)
}

pub async fn subscribe(State(state): State<AppState>) -> Result<Response, AppError> {
    let stream = state.registry.register()?;
    let session_id = HeaderValue::from_str(stream.id().as_str())
        .map_err(|_| AppError::internal("session id is not a valid header value"))?;

    let events =
        stream.map(|frame| Ok::<_, Infallible>(Event::default().event("message").data(frame)));
    let headers = [(SESSION_ID_HEADER, session_id)];

    let response = match state.options.sse_keep_alive {
        Some(interval) => (
            headers,
            Sse::new(events).keep_alive(KeepAlive::new().interval(interval)),
        )
            .into_response(),
        None => (headers, Sse::new(events)).into_response(),
    };

    Ok(response)
}

fn reply_target(headers: &HeaderMap) -> ReplyTarget {
    headers
        .get(SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| ReplyTarget::Session(SessionId::from(value)))
        .unwrap_or(ReplyTarget::Detached)
}
