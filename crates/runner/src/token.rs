// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Machine↔hub auth token lifecycle.
//!
//! The base token is a strong random string; a namespace other than the
//! default rides along as a `:namespace` suffix.

use base64::Engine;
use rand::Rng;

/// Default namespace implied by a bare token.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Generate a strong URL-safe token.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Split a possibly-suffixed token into `(base, namespace)`.
///
/// The base alphabet is URL-safe base64, so the first `:` is unambiguous.
pub fn split_token(token: &str) -> (&str, &str) {
    match token.split_once(':') {
        Some((base, namespace)) if !namespace.is_empty() => (base, namespace),
        _ => (token, DEFAULT_NAMESPACE),
    }
}

/// Attach a namespace suffix; the default namespace stays bare.
pub fn with_namespace(base: &str, namespace: &str) -> String {
    if namespace == DEFAULT_NAMESPACE || namespace.is_empty() {
        base.to_owned()
    } else {
        format!("{base}:{namespace}")
    }
}

#[cfg(test)]
#[path = "token_tests.rs"]
mod tests;
