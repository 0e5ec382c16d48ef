use std::{env, net::SocketAddr, time::Duration};

use thiserror::Error;

use crate::session::ReplyPolicy;

pub const DEFAULT_ENDPOINT_PATH: &str = "/mcp";
pub const DEFAULT_SESSION_BUFFER: usize = 64;
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub bind_port: u16,
    pub transport: TransportOptions,
}

/// Settings consumed by the HTTP transport itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub endpoint_path: String,
    pub reply_policy: ReplyPolicy,
    pub session_buffer: usize,
    pub sse_keep_alive: Option<Duration>,
    pub max_body_bytes: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            endpoint_path: DEFAULT_ENDPOINT_PATH.to_string(),
            reply_policy: ReplyPolicy::default(),
            session_buffer: DEFAULT_SESSION_BUFFER,
            sse_keep_alive: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("BIND_PORT must be a valid u16")]
    InvalidPort,
    #[error("invalid bind address or port")]
    InvalidSocket,
    #[error("MCP_ENDPOINT_PATH must start with '/'")]
    InvalidEndpointPath,
    #[error("MCP_REPLY_POLICY must be one of: correlated, fanout")]
    InvalidReplyPolicy,
    #[error("MCP_SESSION_BUFFER must be a positive integer")]
    InvalidSessionBuffer,
    #[error("MCP_SSE_KEEPALIVE_SECS must be a positive integer")]
    InvalidKeepAlive,
    #[error("MCP_MAX_BODY_BYTES must be a positive integer")]
    InvalidMaxBodyBytes,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let bind_addr = var("BIND_ADDR").unwrap_or_else(|| "127.0.0.1".to_string());
        let bind_port = var("BIND_PORT")
            .map(|value| value.parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(8080);

        let endpoint_path = var("MCP_ENDPOINT_PATH")
            .map(|value| {
                if value.starts_with('/') {
                    Ok(value)
                } else {
                    Err(ConfigError::InvalidEndpointPath)
                }
            })
            .transpose()?
            .unwrap_or_else(|| DEFAULT_ENDPOINT_PATH.to_string());
        let reply_policy = var("MCP_REPLY_POLICY")
            .map(|value| {
                value
                    .parse::<ReplyPolicy>()
                    .map_err(|_| ConfigError::InvalidReplyPolicy)
            })
            .transpose()?
            .unwrap_or_default();
        let session_buffer = var("MCP_SESSION_BUFFER")
            .map(|value| parse_positive(&value, ConfigError::InvalidSessionBuffer))
            .transpose()?
            .unwrap_or(DEFAULT_SESSION_BUFFER);
        let sse_keep_alive = var("MCP_SSE_KEEPALIVE_SECS")
            .map(|value| {
                parse_positive(&value, ConfigError::InvalidKeepAlive)
                    .map(|secs| Duration::from_secs(secs as u64))
            })
            .transpose()?;
        let max_body_bytes = var("MCP_MAX_BODY_BYTES")
            .map(|value| parse_positive(&value, ConfigError::InvalidMaxBodyBytes))
            .transpose()?
            .unwrap_or(DEFAULT_MAX_BODY_BYTES);

        let config = Self {
            bind_addr,
            bind_port,
            transport: TransportOptions {
                endpoint_path,
                reply_policy,
                session_buffer,
                sse_keep_alive,
                max_body_bytes,
            },
        };

        let _ = config.bind_socket()?;
        Ok(config)
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.bind_port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }
}

fn parse_positive(value: &str, err: ConfigError) -> Result<usize, ConfigError> {
    match value.parse::<usize>() {
        Ok(parsed) if parsed > 0 => Ok(parsed),
        _ => Err(err),
    }
}
