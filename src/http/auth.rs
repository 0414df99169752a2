//! API-key authentication for the maintenance control plane.
//!
//! Every write path requires the configured key via `X-MCP-API-Key` or
//! `Authorization: Bearer`. With no key configured, requests are rejected —
//! unless the insecure-local override flag is set AND the client is loopback.
//! Key comparison is constant-time.

use axum::extract::{ConnectInfo, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::AuthConfig;
use crate::errors::PalaceError;

pub const API_KEY_HEADER: &str = "X-MCP-API-Key";

/// Constant-time string comparison covering both content and length.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let max_len = a.len().max(b.len());
    let mut diff: u32 = (a.len() ^ b.len()) as u32;
    for i in 0..max_len {
        let byte_a = a.get(i).copied().unwrap_or(0);
        let byte_b = b.get(i).copied().unwrap_or(0);
        diff |= (byte_a ^ byte_b) as u32;
    }
    diff == 0
}

fn is_loopback(addr: Option<&SocketAddr>) -> bool {
    addr.map(|a| a.ip().is_loopback()).unwrap_or(false)
}

fn extract_bearer(authorization: Option<&str>) -> Option<&str> {
    let value = authorization?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Check one request's credentials against the auth config.
pub fn check_api_key(
    config: &AuthConfig,
    provided_header: Option<&str>,
    authorization: Option<&str>,
    client: Option<&SocketAddr>,
) -> Result<(), PalaceError> {
    let Some(configured) = config.api_key.as_deref().filter(|k| !k.trim().is_empty()) else {
        if config.allow_insecure_local {
            if is_loopback(client) {
                return Ok(());
            }
            return Err(PalaceError::InsecureLocalOverrideRequiresLoopback);
        }
        return Err(PalaceError::ApiKeyNotConfigured);
    };

    let provided = provided_header
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .or_else(|| extract_bearer(authorization));
    match provided {
        Some(key) if constant_time_eq(key, configured) => Ok(()),
        _ => Err(PalaceError::InvalidOrMissingApiKey),
    }
}

/// Axum middleware enforcing the API key on every routed request.
pub async fn require_api_key(
    axum::extract::State(config): axum::extract::State<Arc<AuthConfig>>,
    request: Request,
    next: Next,
) -> Response {
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let header = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let authorization = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    if let Err(e) = check_api_key(
        &config,
        header.as_deref(),
        authorization.as_deref(),
        client.as_ref(),
    ) {
        return e.into_response();
    }
    next.run(request).await
}
