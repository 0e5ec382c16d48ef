use std::{str::FromStr, sync::Arc};

use thiserror::Error;
use tracing::warn;

use crate::mcp::rpc::{request_id_to_value, JsonRpcMessage, Notification, Response};

use super::registry::{DeliveryReport, Frame, SessionId, SessionRegistry};

/// Where responses are delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplyPolicy {
    /// Deliver a response only to the session that submitted the request.
    #[default]
    Correlated,
    /// Deliver every response to every open session. Responses leak across
    /// clients under this policy; only suitable for single-client deployments.
    FanOut,
}

#[derive(Debug, Error)]
#[error("reply policy must be one of: correlated, fanout")]
pub struct InvalidReplyPolicy;

impl FromStr for ReplyPolicy {
    type Err = InvalidReplyPolicy;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "correlated" | "session" => Ok(Self::Correlated),
            "fanout" | "fan-out" | "broadcast" => Ok(Self::FanOut),
            _ => Err(InvalidReplyPolicy),
        }
    }
}

/// The channel a request's response should travel back on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReplyTarget {
    Session(SessionId),
    /// The submitting client named no session.
    Detached,
}

impl ReplyTarget {
    pub fn session(&self) -> Option<&SessionId> {
        match self {
            Self::Session(id) => Some(id),
            Self::Detached => None,
        }
    }
}

#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<SessionRegistry>,
    policy: ReplyPolicy,
}

impl Broadcaster {
    pub fn new(registry: Arc<SessionRegistry>, policy: ReplyPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn broadcast(&self, message: &JsonRpcMessage) -> DeliveryReport {
        match encode(message) {
            Some(frame) => self.registry.fan_out(&frame),
            None => DeliveryReport::default(),
        }
    }

    pub fn send_to(&self, id: &SessionId, message: &JsonRpcMessage) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        if let Some(frame) = encode(message) {
            report.record(self.registry.send(id, frame));
        }
        report
    }

    pub fn notify(&self, notification: Notification) -> DeliveryReport {
        self.broadcast(&JsonRpcMessage::Notification(notification))
    }

    pub fn deliver_reply(&self, target: &ReplyTarget, response: Response) -> DeliveryReport {
        let request_id = request_id_to_value(&response.id);
        let message = JsonRpcMessage::Response(response);

        let report = match (self.policy, target) {
            (ReplyPolicy::FanOut, _) => self.broadcast(&message),
            (ReplyPolicy::Correlated, ReplyTarget::Session(id)) => self.send_to(id, &message),
            (ReplyPolicy::Correlated, ReplyTarget::Detached) => DeliveryReport::default(),
        };

        if report.delivered == 0 {
            warn!(
                request_id = %request_id,
                target = ?target,
                "response had no open session to deliver to"
            );
        }
        report
    }
}

fn encode(message: &JsonRpcMessage) -> Option<Frame> {
    match serde_json::to_string(message) {
        Ok(json) => Some(Arc::from(json)),
        Err(err) => {
            warn!(kind = message.kind(), error = %err, "failed to encode outbound message");
            None
        }
    }
}
