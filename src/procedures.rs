//! Demonstration procedures served over the transport
//!
//! Small stateless handlers (arithmetic, text transforms, clock, progress
//! streaming) plus the MCP `initialize` handshake.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use regex::Regex;
use rust_mcp_sdk::schema::{Implementation, InitializeResult, ServerCapabilities};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};

use crate::errors::HandlerError;
use crate::gatekeeper::SUPPORTED_PROTOCOL_VERSIONS;
use crate::mcp::router::{RequestContext, RpcHandler};

pub const MAX_PROGRESS_STEPS: u32 = 100;
const DEFAULT_PROGRESS_STEPS: u32 = 5;

#[derive(Debug, Deserialize)]
struct AddParams {
    a: f64,
    b: f64,
}

#[derive(Debug, Deserialize)]
struct TextParams {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ReplaceParams {
    text: String,
    pattern: String,
    replacement: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgressParams {
    steps: Option<u32>,
    interval_ms: Option<u64>,
    progress_token: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct DemoProcedures {
    progress_interval: Duration,
}

impl Default for DemoProcedures {
    fn default() -> Self {
        Self {
            progress_interval: Duration::from_millis(500),
        }
    }
}

impl DemoProcedures {
    pub fn with_progress_interval(progress_interval: Duration) -> Self {
        Self { progress_interval }
    }

    async fn progress(
        &self,
        params: Option<Value>,
        ctx: &RequestContext,
    ) -> Result<Value, HandlerError> {
        let params: ProgressParams = match params {
            Some(params) => parse_params(Some(params))?,
            None => ProgressParams::default(),
        };

        let steps = params.steps.unwrap_or(DEFAULT_PROGRESS_STEPS);
        if steps == 0 || steps > MAX_PROGRESS_STEPS {
            return Err(HandlerError::InvalidParams(format!(
                "steps must be between 1 and {MAX_PROGRESS_STEPS}"
            )));
        }
        let interval = params
            .interval_ms
            .map(Duration::from_millis)
            .unwrap_or(self.progress_interval);
        let token = params.progress_token.unwrap_or(Value::Null);

        for step in 1..=steps {
            tokio::select! {
                () = ctx.cancellation().cancelled() => {
                    return Err(HandlerError::Internal(format!(
                        "progress cancelled after {} of {steps} steps",
                        step - 1
                    )));
                }
                () = tokio::time::sleep(interval) => {}
            }

            ctx.notifier().notify(
                "notifications/progress",
                Some(json!({
                    "progressToken": token,
                    "progress": step,
                    "total": steps
                })),
            );
        }

        Ok(json!({ "completed": steps }))
    }
}

#[async_trait]
impl RpcHandler for DemoProcedures {
    async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        ctx: RequestContext,
    ) -> Result<Value, HandlerError> {
        match method {
            "initialize" => initialize(params.as_ref(), ctx.protocol_version()),
            "notifications/initialized" => Ok(Value::Null),
            "ping" => Ok(json!({})),
            "echo" => Ok(params.unwrap_or(Value::Null)),
            "math/add" => {
                let AddParams { a, b } = parse_params(params)?;
                Ok(json!({ "sum": a + b }))
            }
            "text/uppercase" => {
                let TextParams { text } = parse_params(params)?;
                Ok(json!({ "text": text.to_uppercase() }))
            }
            "text/replace" => {
                let ReplaceParams {
                    text,
                    pattern,
                    replacement,
                } = parse_params(params)?;
                let regex = Regex::new(&pattern)
                    .map_err(|err| HandlerError::InvalidParams(format!("invalid pattern: {err}")))?;
                Ok(json!({ "text": regex.replace_all(&text, replacement.as_str()) }))
            }
            "time/now" => Ok(json!({
                "utc": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
            })),
            "demo/progress" => self.progress(params, &ctx).await,
            other => Err(HandlerError::MethodNotFound(other.to_string())),
        }
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, HandlerError> {
    let params = params.ok_or_else(|| HandlerError::InvalidParams("params are required".into()))?;
    serde_json::from_value(params).map_err(|err| HandlerError::InvalidParams(err.to_string()))
}

fn initialize(params: Option<&Value>, negotiated: &'static str) -> Result<Value, HandlerError> {
    let offered = params
        .and_then(Value::as_object)
        .and_then(|object| object.get("protocolVersion"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|version| !version.is_empty())
        .ok_or_else(|| {
            HandlerError::InvalidParams("initialize params.protocolVersion is required".into())
        })?;

    let protocol_version = SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .copied()
        .find(|supported| *supported == offered)
        .unwrap_or(negotiated);

    let result = InitializeResult {
        server_info: Implementation {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: None,
            description: None,
            icons: vec![],
            website_url: None,
        },
        capabilities: ServerCapabilities::default(),
        protocol_version: protocol_version.to_string(),
        instructions: None,
        meta: None,
    };

    serde_json::to_value(result)
        .map_err(|err| HandlerError::Internal(format!("initialize result serialization: {err}")))
}
