//! Message routing between the transport and procedure handlers
//!
//! The router classifies each inbound message, runs the handler on its own
//! task, and turns the outcome of every request into exactly one correlated
//! response, whether the handler succeeds, fails, panics, or is cancelled
//! because its reply session closed. Notifications never produce a response.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use dashmap::DashSet;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::errors::HandlerError;
use crate::gatekeeper::NegotiatedVersion;
use crate::mcp::rpc::{
    handler_error_to_rpc, request_id_to_value, rpc_error, JsonRpcMessage, Notification, Request,
    RequestId, Response, INVALID_REQUEST,
};
use crate::session::{Broadcaster, DeliveryReport, ReplyTarget, SessionId};

/// A procedure implementation. Handlers see decoded parameters only; sessions
/// and delivery stay behind the [`RequestContext`].
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        ctx: RequestContext,
    ) -> Result<Value, HandlerError>;
}

/// Sends notifications to every open session.
#[derive(Clone)]
pub struct Notifier {
    broadcaster: Broadcaster,
}

impl Notifier {
    pub fn notify(&self, method: impl Into<String>, params: Option<Value>) -> DeliveryReport {
        self.broadcaster.notify(Notification::new(method, params))
    }
}

#[derive(Clone)]
pub struct RequestContext {
    notifier: Notifier,
    cancellation: CancellationToken,
    version: NegotiatedVersion,
}

impl RequestContext {
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Cancelled when the caller's session closes or the server shuts down.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn protocol_version(&self) -> &'static str {
        self.version.0
    }
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(
        "response id {} does not match any request issued by the server",
        request_id_to_value(.0)
    )]
    UnmatchedResponse(RequestId),
}

/// Request ids are tracked per session only. Submitters without a session
/// header share no identity, so their ids are never compared.
pub struct MessageRouter {
    handler: Arc<dyn RpcHandler>,
    broadcaster: Broadcaster,
    pending: DashSet<(SessionId, RequestId)>,
    in_flight: AtomicUsize,
}

impl MessageRouter {
    pub fn new(handler: Arc<dyn RpcHandler>, broadcaster: Broadcaster) -> Self {
        Self {
            handler,
            broadcaster,
            pending: DashSet::new(),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Requests currently awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Hands an inbound message to a background task and returns at once.
    ///
    /// The server never issues requests of its own, so a client-submitted
    /// response can never match a pending request and is refused here.
    pub fn accept(
        self: &Arc<Self>,
        message: JsonRpcMessage,
        target: ReplyTarget,
        version: NegotiatedVersion,
    ) -> Result<JoinHandle<()>, RouteError> {
        if let JsonRpcMessage::Response(response) = message {
            warn!(
                request_id = %request_id_to_value(&response.id),
                "client sent a response with no matching request"
            );
            return Err(RouteError::UnmatchedResponse(response.id));
        }

        let router = Arc::clone(self);
        Ok(tokio::spawn(async move {
            router.route(message, target, version).await;
        }))
    }

    /// Dispatches a message and delivers the response, if any.
    pub async fn route(
        &self,
        message: JsonRpcMessage,
        target: ReplyTarget,
        version: NegotiatedVersion,
    ) {
        if let Some(response) = self.dispatch(message, &target, version).await {
            self.broadcaster.deliver_reply(&target, response);
        }
    }

    pub async fn dispatch(
        &self,
        message: JsonRpcMessage,
        target: &ReplyTarget,
        version: NegotiatedVersion,
    ) -> Option<Response> {
        match message {
            JsonRpcMessage::Request(request) => {
                Some(self.handle_request(request, target, version).await)
            }
            JsonRpcMessage::Notification(notification) => {
                self.handle_notification(notification, target, version).await;
                None
            }
            JsonRpcMessage::Response(response) => {
                warn!(
                    request_id = %request_id_to_value(&response.id),
                    "dropping unmatched response"
                );
                None
            }
        }
    }

    async fn handle_request(
        &self,
        request: Request,
        target: &ReplyTarget,
        version: NegotiatedVersion,
    ) -> Response {
        let key = target
            .session()
            .map(|session| (session.clone(), request.id.clone()));
        if let Some(key) = &key {
            if !self.pending.insert(key.clone()) {
                warn!(
                    request_id = %request_id_to_value(&request.id),
                    session_id = %key.0,
                    "request id already in flight"
                );
                return Response::failure(
                    request.id,
                    rpc_error(
                        INVALID_REQUEST,
                        "Invalid Request: request id already in flight",
                        None,
                    ),
                );
            }
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let audit_params = redact_audit_params(request.params.as_ref());
        let outcome = self
            .invoke(&request.method, request.params, target, version)
            .await;

        let response = match outcome {
            Ok(result) => Response::success(request.id, result),
            Err(err) => {
                if let HandlerError::Internal(detail) = &err {
                    error!(method = %request.method, error = %detail, "request handler failed");
                }
                Response::failure(request.id, handler_error_to_rpc(err))
            }
        };

        // The response completes exactly the pending entry it was built for.
        if let Some(key) = &key {
            self.pending.remove(key);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        info!(
            method = %request.method,
            params = %audit_params,
            outcome = if response.is_error() { "failure" } else { "success" },
            "rpc request audited"
        );

        response
    }

    async fn handle_notification(
        &self,
        notification: Notification,
        target: &ReplyTarget,
        version: NegotiatedVersion,
    ) {
        let audit_params = redact_audit_params(notification.params.as_ref());
        let outcome = self
            .invoke(&notification.method, notification.params, target, version)
            .await;

        match outcome {
            Ok(_) => info!(
                method = %notification.method,
                params = %audit_params,
                outcome = "success",
                "rpc notification audited"
            ),
            Err(err) => warn!(
                method = %notification.method,
                params = %audit_params,
                error = %err,
                "rpc notification failed"
            ),
        }
    }

    async fn invoke(
        &self,
        method: &str,
        params: Option<Value>,
        target: &ReplyTarget,
        version: NegotiatedVersion,
    ) -> Result<Value, HandlerError> {
        let cancellation = self
            .broadcaster
            .registry()
            .cancellation_for(target.session());
        let ctx = RequestContext {
            notifier: Notifier {
                broadcaster: self.broadcaster.clone(),
            },
            cancellation: cancellation.clone(),
            version,
        };

        let handler = Arc::clone(&self.handler);
        let task_method = method.to_string();
        let mut task = tokio::spawn(async move { handler.call(&task_method, params, ctx).await });

        tokio::select! {
            joined = &mut task => joined.unwrap_or_else(|err| {
                Err(HandlerError::Internal(format!("handler task failed: {err}")))
            }),
            () = cancellation.cancelled() => {
                task.abort();
                Err(HandlerError::Internal("cancelled: reply session closed".to_string()))
            }
        }
    }
}

pub fn redact_audit_params(params: Option<&Value>) -> Value {
    params.map(redact_audit_value).unwrap_or(Value::Null)
}

pub fn redact_audit_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    if is_sensitive_key(key) {
                        (key.clone(), Value::String("[REDACTED]".to_string()))
                    } else {
                        (key.clone(), redact_audit_value(item))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_audit_value).collect()),
        _ => value.clone(),
    }
}

pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = key.trim().to_ascii_lowercase();
    matches!(
        normalized.as_str(),
        "authorization" | "bearer" | "credentials" | "api_key" | "apikey"
    ) || normalized.contains("token")
        || normalized.contains("secret")
        || normalized.contains("password")
        || normalized.contains("credential")
}
