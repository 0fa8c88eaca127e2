use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};

use crate::duration::deserialize_duration;
use crate::error::Error;

fn default_auth_mount() -> String {
    "jwt".to_string()
}

fn default_renew_increment() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_relogin_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_relogin_backoff_max() -> Duration {
    Duration::from_secs(60)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn deserialize_secret<'de, D>(deserializer: D) -> std::result::Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

/// Session lifecycle and transport tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Mount path of the JWT auth method (`/v1/auth/{auth_mount}/login`).
    pub auth_mount: String,

    /// Lease extension requested on every token renewal.
    #[serde(deserialize_with = "deserialize_duration")]
    pub renew_increment: Duration,

    /// First delay after a failed re-login; doubles up to `relogin_backoff_max`.
    /// Also the minimum spacing between two logins.
    #[serde(deserialize_with = "deserialize_duration")]
    pub relogin_backoff: Duration,

    #[serde(deserialize_with = "deserialize_duration")]
    pub relogin_backoff_max: Duration,

    /// Upper bound for every HTTP request made by the client.
    #[serde(deserialize_with = "deserialize_duration")]
    pub request_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            auth_mount: default_auth_mount(),
            renew_increment: default_renew_increment(),
            relogin_backoff: default_relogin_backoff(),
            relogin_backoff_max: default_relogin_backoff_max(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// Connection settings for a JWT-authenticated Vault client.
///
/// Every top-level field is required; only the `[lifecycle]` table has defaults.
///
/// # Example
///
/// ```toml
/// vault_url = "https://vault.example.com"
/// vault_role = "vault"
/// auth_url = "https://keycloak.example.com"
/// auth_realm = "master"
/// auth_client_id = "my-service"
/// auth_client_secret = "..."
/// vault_engine = "secret"
///
/// [lifecycle]
/// renew_increment = "1h"
/// relogin_backoff = "2s"
/// ```
#[derive(Debug, Deserialize)]
pub struct VaultConfig {
    pub vault_url: String,
    pub vault_role: String,
    pub auth_url: String,
    pub auth_realm: String,
    pub auth_client_id: String,
    #[serde(deserialize_with = "deserialize_secret")]
    pub auth_client_secret: SecretString,
    /// Mount name of the KV v2 secret engine.
    pub vault_engine: String,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

impl VaultConfig {
    pub fn new(
        vault_url: impl Into<String>,
        vault_role: impl Into<String>,
        auth_url: impl Into<String>,
        auth_realm: impl Into<String>,
        auth_client_id: impl Into<String>,
        auth_client_secret: SecretString,
        vault_engine: impl Into<String>,
    ) -> Self {
        Self {
            vault_url: vault_url.into(),
            vault_role: vault_role.into(),
            auth_url: auth_url.into(),
            auth_realm: auth_realm.into(),
            auth_client_id: auth_client_id.into(),
            auth_client_secret,
            vault_engine: vault_engine.into(),
            lifecycle: LifecycleConfig::default(),
        }
    }

    pub fn with_lifecycle(mut self, lifecycle: LifecycleConfig) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: VaultConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    /// Reject settings the client cannot start with.
    pub fn validate(&self) -> crate::Result<()> {
        let required = [
            ("vault_url", self.vault_url.as_str()),
            ("vault_role", self.vault_role.as_str()),
            ("auth_url", self.auth_url.as_str()),
            ("auth_realm", self.auth_realm.as_str()),
            ("auth_client_id", self.auth_client_id.as_str()),
            ("auth_client_secret", self.auth_client_secret.expose_secret()),
            ("vault_engine", self.vault_engine.as_str()),
            ("lifecycle.auth_mount", self.lifecycle.auth_mount.as_str()),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(Error::configuration(format!("{name} must not be empty")));
            }
        }

        if self.lifecycle.renew_increment.is_zero() {
            return Err(Error::configuration(
                "lifecycle.renew_increment must be greater than zero",
            ));
        }
        if self.lifecycle.relogin_backoff.is_zero() {
            return Err(Error::configuration(
                "lifecycle.relogin_backoff must be greater than zero",
            ));
        }
        if self.lifecycle.relogin_backoff > self.lifecycle.relogin_backoff_max {
            return Err(Error::configuration(
                "lifecycle.relogin_backoff must not exceed lifecycle.relogin_backoff_max",
            ));
        }

        Ok(())
    }
}

/// Returns the default config file path.
///
/// Resolution order:
/// 1. `./vaultjwt.toml` if it exists in current directory
/// 2. `~/.config/vaultjwt/vaultjwt.toml` (XDG config directory)
pub fn default_config_path() -> PathBuf {
    let local_config = PathBuf::from("vaultjwt.toml");
    if local_config.exists() {
        return local_config;
    }

    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("vaultjwt").join("vaultjwt.toml");
    }

    local_config
}
