//! API Key Authentication
//!
//! Checks the configured key header (default `X-API-Key`) against the key set.
//! Runs before rate limiting and before any upstream call; WebSocket
//! handshakes are rejected before the upgrade.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use voice_gateway_config::AuthConfig;
use voice_gateway_core::{AuthFailure, Error, RequestIdentity};

use crate::error::ApiError;
use crate::state::AppState;
use crate::ServerError;

/// Track if we've warned about auth being disabled (warn once only)
static AUTH_DISABLED_WARNED: AtomicBool = AtomicBool::new(false);

/// Address recorded when the connection info is unavailable
const UNKNOWN_ADDRESS: &str = "unknown";

#[derive(Debug, Clone)]
pub struct Authenticator {
    enabled: bool,
    header: HeaderName,
    keys: Vec<String>,
}

impl Authenticator {
    pub fn new(config: &AuthConfig) -> Result<Self, ServerError> {
        let header = HeaderName::try_from(config.header_name.trim()).map_err(|e| {
            ServerError::Configuration(format!(
                "Invalid auth header name '{}': {}",
                config.header_name, e
            ))
        })?;
        Ok(Self {
            enabled: config.enabled,
            header,
            keys: config
                .api_keys
                .iter()
                .filter(|k| !k.is_empty())
                .cloned()
                .collect(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Resolve the caller's identity, rejecting bad keys when auth is enabled
    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        client_address: impl Into<String>,
    ) -> Result<RequestIdentity, AuthFailure> {
        let presented = headers
            .get(&self.header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string);

        if !self.enabled {
            if !AUTH_DISABLED_WARNED.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    "API authentication is DISABLED! Set GATEWAY__AUTH__ENABLED=true for production."
                );
            }
            return Ok(RequestIdentity::new(presented, client_address));
        }

        let Some(key) = presented else {
            return Err(AuthFailure::Missing);
        };
        if self.is_known(&key) {
            Ok(RequestIdentity::new(Some(key), client_address))
        } else {
            Err(AuthFailure::Invalid)
        }
    }

    /// Compares against every configured key so timing does not reveal which matched
    fn is_known(&self, key: &str) -> bool {
        self.keys
            .iter()
            .fold(false, |found, candidate| {
                constant_time_compare(key.as_bytes(), candidate.as_bytes()) | found
            })
    }
}

/// Authentication middleware
///
/// Public paths (`/health`, `/metrics`) pass through untouched. Everything
/// else gets a [`RequestIdentity`] extension or a 401/403 envelope.
pub async fn auth_middleware(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    if state.is_public_path(request.uri().path()) {
        return next.run(request).await;
    }

    let client_address = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string());

    match state
        .authenticator
        .authenticate(request.headers(), client_address.clone())
    {
        Ok(identity) => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(failure) => {
            tracing::warn!(
                client = %client_address,
                path = %request.uri().path(),
                reason = failure.message(),
                "Rejected unauthenticated request"
            );
            ApiError::from(Error::Unauthorized(failure)).into_response()
        }
    }
}

/// Constant-time comparison to prevent timing attacks
fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
