//! Connection admission checks
//!
//! Every request to the endpoint passes through [`enforce_gatekeeper`] before
//! its body is read. Browsers must present a loopback `Origin`; clients without
//! an origin (CLIs, native apps) are admitted. The protocol version header is
//! negotiated against [`SUPPORTED_PROTOCOL_VERSIONS`].

use std::net::IpAddr;

use axum::{
    extract::Request,
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use axum_extra::headers::{HeaderMapExt, Origin};
use thiserror::Error;
use tracing::debug;

use crate::errors::AppError;

pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";
pub const BASELINE_PROTOCOL_VERSION: &str = "2025-03-26";
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[BASELINE_PROTOCOL_VERSION];

/// Protocol version admitted for a request, stored in request extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedVersion(pub &'static str);

impl Default for NegotiatedVersion {
    fn default() -> Self {
        Self(BASELINE_PROTOCOL_VERSION)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("origin is not a loopback address")]
    Forbidden,
    #[error("unsupported protocol version")]
    UnsupportedVersion,
}

impl From<Rejection> for AppError {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::Forbidden => {
                AppError::forbidden("origin_forbidden", "origin is not allowed")
            }
            Rejection::UnsupportedVersion => AppError::bad_request(
                "unsupported_protocol_version",
                format!(
                    "supported protocol versions: {}",
                    SUPPORTED_PROTOCOL_VERSIONS.join(", ")
                ),
            ),
        }
    }
}

pub async fn enforce_gatekeeper(mut request: Request, next: Next) -> Result<Response, AppError> {
    let version = admit(request.headers()).inspect_err(|rejection| {
        debug!(reason = %rejection, path = %request.uri().path(), "connection rejected");
    })?;

    request.extensions_mut().insert(version);
    Ok(next.run(request).await)
}

pub fn admit(headers: &HeaderMap) -> Result<NegotiatedVersion, Rejection> {
    check_origin(headers)?;
    check_protocol_version(headers)
}

pub fn check_origin(headers: &HeaderMap) -> Result<(), Rejection> {
    match headers.typed_try_get::<Origin>() {
        Ok(None) => Ok(()),
        Ok(Some(origin)) if !origin.is_null() && is_loopback_host(origin.hostname()) => Ok(()),
        Ok(Some(_)) | Err(_) => Err(Rejection::Forbidden),
    }
}

pub fn check_protocol_version(headers: &HeaderMap) -> Result<NegotiatedVersion, Rejection> {
    let Some(value) = headers.get(PROTOCOL_VERSION_HEADER) else {
        return Ok(NegotiatedVersion::default());
    };

    let offered = value
        .to_str()
        .map(str::trim)
        .map_err(|_| Rejection::UnsupportedVersion)?;

    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .copied()
        .find(|supported| *supported == offered)
        .map(NegotiatedVersion)
        .ok_or(Rejection::UnsupportedVersion)
}

fn is_loopback_host(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host.eq_ignore_ascii_case("localhost") || host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}
