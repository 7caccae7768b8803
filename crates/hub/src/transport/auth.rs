// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bearer token validation and namespace resolution.
//!
//! The access token is the CLI API token, optionally suffixed `:namespace`.
//! A bare token maps to the `default` namespace.

use axum::http::HeaderMap;

use crate::error::HubError;

/// Default namespace for bare tokens.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Constant-time string comparison to prevent timing side-channel attacks.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Authenticated caller context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub namespace: String,
}

/// Resolve a presented token against the expected base token.
///
/// `token` == base → default namespace; `base:ns` → namespace `ns`.
pub fn resolve_token(token: &str, expected: &str) -> Option<AuthContext> {
    if constant_time_eq(token, expected) {
        return Some(AuthContext { namespace: DEFAULT_NAMESPACE.to_owned() });
    }
    if let Some((base, namespace)) = token.rsplit_once(':') {
        if !namespace.is_empty() && constant_time_eq(base, expected) {
            return Some(AuthContext { namespace: namespace.to_owned() });
        }
    }
    None
}

/// Validate a Bearer token from HTTP headers.
pub fn authenticate(headers: &HeaderMap, expected: &str) -> Result<AuthContext, HubError> {
    let header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(HubError::Unauthorized)?;
    let token = header.strip_prefix("Bearer ").ok_or(HubError::Unauthorized)?;
    resolve_token(token, expected).ok_or(HubError::Unauthorized)
}

/// Validate a token passed as a query parameter (SSE / WebSocket upgrades,
/// where headers are awkward for browsers).
pub fn authenticate_token_param(
    token: Option<&str>,
    expected: &str,
) -> Result<AuthContext, HubError> {
    let token = token.ok_or(HubError::Unauthorized)?;
    resolve_token(token, expected).ok_or(HubError::Unauthorized)
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
