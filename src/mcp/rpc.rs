//! Inbound message classification and outbound envelopes for the stream
//! transport
//!
//! Ids and error objects are the MCP schema types. Payloads are classified
//! strictly as request, notification or response before anything is routed,
//! and handler failures map onto fixed JSON-RPC error codes.

pub use rust_mcp_sdk::schema::{RequestId, RpcError};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::errors::HandlerError;

pub const JSONRPC_VERSION: &str = "2.0";

pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// Params stay untyped here: JSON-RPC allows arrays as well as objects, which
/// the schema's notification params cannot carry.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Result(Value),
    Error(RpcError),
}

/// A response whose result may be any JSON value, not only an object.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("body is not valid JSON: {0}")]
    Syntax(#[from] serde_json::Error),
    #[error("message must be a single JSON object")]
    NotAnObject,
    #[error("jsonrpc must be \"2.0\"")]
    Version,
    #[error("id must be a string, null, or an integer in the signed 64-bit range")]
    InvalidId,
    #[error("method must be a non-empty string")]
    InvalidMethod,
    #[error("params must be an object or an array")]
    InvalidParams,
    #[error("response must carry exactly one of result or error")]
    InvalidResponse,
}

impl Request {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
        }
    }
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.into(),
            params,
        }
    }
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            outcome: Outcome::Result(result),
        }
    }

    pub fn failure(id: RequestId, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            outcome: Outcome::Error(error),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error(_))
    }
}

impl JsonRpcMessage {
    pub fn from_slice(body: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(body)?;
        Self::from_value(value)
    }

    /// Classifies one decoded JSON value. A `method` makes it a request or a
    /// notification (absent or null `id` is the discriminant); otherwise it
    /// must be a response carrying exactly one of `result`/`error`.
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let Value::Object(mut object) = value else {
            return Err(DecodeError::NotAnObject);
        };

        if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(DecodeError::Version);
        }

        let id = decode_id(object.remove("id"))?;

        if let Some(method) = object.remove("method") {
            let method = match method {
                Value::String(method) if !method.trim().is_empty() => method,
                _ => return Err(DecodeError::InvalidMethod),
            };
            let params = decode_params(object.remove("params"))?;

            return Ok(match id {
                Some(id) => Self::Request(Request::new(id, method, params)),
                None => Self::Notification(Notification::new(method, params)),
            });
        }

        let id = id.ok_or(DecodeError::InvalidResponse)?;
        let outcome = match (object.remove("result"), object.remove("error")) {
            (Some(result), None) => Outcome::Result(result),
            (None, Some(error)) => Outcome::Error(decode_error_object(error)?),
            _ => return Err(DecodeError::InvalidResponse),
        };

        Ok(Self::Response(Response {
            jsonrpc: JSONRPC_VERSION,
            id,
            outcome,
        }))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Notification(_) => "notification",
            Self::Response(_) => "response",
        }
    }
}

/// Integer ids are held as `i64`, so an integer id outside the signed 64-bit
/// range is refused rather than silently rewritten.
fn decode_id(id: Option<Value>) -> Result<Option<RequestId>, DecodeError> {
    match id {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(RequestId::String(value))),
        Some(Value::Number(number)) => number
            .as_i64()
            .map(|value| Some(RequestId::Integer(value)))
            .ok_or(DecodeError::InvalidId),
        Some(_) => Err(DecodeError::InvalidId),
    }
}

fn decode_params(params: Option<Value>) -> Result<Option<Value>, DecodeError> {
    match params {
        None => Ok(None),
        Some(params @ (Value::Object(_) | Value::Array(_))) => Ok(Some(params)),
        Some(_) => Err(DecodeError::InvalidParams),
    }
}

fn decode_error_object(error: Value) -> Result<RpcError, DecodeError> {
    let Value::Object(mut error) = error else {
        return Err(DecodeError::InvalidResponse);
    };

    let code = error
        .get("code")
        .and_then(Value::as_i64)
        .ok_or(DecodeError::InvalidResponse)?;
    let message = match error.remove("message") {
        Some(Value::String(message)) => message,
        _ => return Err(DecodeError::InvalidResponse),
    };

    Ok(rpc_error(code, &message, error.remove("data")))
}

pub fn rpc_error(code: i64, message: &str, data: Option<Value>) -> RpcError {
    RpcError {
        code,
        data,
        message: message.to_string(),
    }
}

pub fn request_id_to_value(id: &RequestId) -> Value {
    match id {
        RequestId::String(value) => Value::String(value.clone()),
        RequestId::Integer(value) => Value::Number((*value).into()),
    }
}

pub fn handler_error_to_rpc(err: HandlerError) -> RpcError {
    match err {
        HandlerError::InvalidParams(detail) => rpc_error(
            INVALID_PARAMS,
            "Invalid params",
            Some(json!({
                "code": "invalid_params",
                "message": detail,
                "details": {}
            })),
        ),
        HandlerError::MethodNotFound(method) => rpc_error(
            METHOD_NOT_FOUND,
            "Method not found",
            Some(json!({
                "code": "method_not_found",
                "message": format!("unknown method: {method}"),
                "details": {}
            })),
        ),
        HandlerError::Internal(_) => rpc_error(INTERNAL_ERROR, "Internal error", None),
    }
}
