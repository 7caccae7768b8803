// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persisted hub settings (`settings.json`, mode 0600).
//!
//! Generated on first boot: a stable machine id, the CLI API token runners
//! authenticate with, and the VAPID key pair handed to the push provider.

use std::path::Path;

use base64::Engine;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Generate a strong URL-safe token.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// VAPID key pair for the web-push provider. Opaque to the hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VapidKeys {
    pub public_key: String,
    pub private_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub machine_id: String,
    pub cli_api_token: String,
    pub vapid_keys: VapidKeys,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Settings {
    fn generate() -> Self {
        Self {
            machine_id: uuid::Uuid::new_v4().to_string(),
            cli_api_token: generate_token(),
            vapid_keys: VapidKeys { public_key: generate_token(), private_key: generate_token() },
            cors_origins: Vec::new(),
        }
    }

    /// Load settings, creating and persisting fresh ones on first boot.
    pub fn load_or_create(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let settings = serde_json::from_str(&contents)?;
            return Ok(settings);
        }

        let settings = Self::generate();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let contents = serde_json::to_string_pretty(&settings)?;
        std::fs::write(path, contents)?;
        restrict_permissions(path)?;
        Ok(settings)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
#[path = "settings_tests.rs"]
mod tests;
