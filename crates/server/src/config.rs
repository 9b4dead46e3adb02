use std::{path::Path, time::Duration};

use anyhow::{bail, Result};
use config::{Config, ConfigError, Environment, File, FileFormat};
use panel_api::AccessConfig;
use reconciler::ReconcilerConfig;
use serde::Deserialize;
use storage::DEFAULT_DATABASE_URL;
use transport::TransportSettings;

pub const SETTINGS_FILE: &str = "panel.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bind_addr: String,
    pub database_url: String,
    pub pending_timeout_ms: u64,
    pub session_secret: String,
    pub session_ttl_secs: u64,
    pub allow_anonymous_commands: bool,
    /// Request body cap for the JSON routes.
    pub max_body_bytes: usize,
    pub transport: TransportSettings,
}

impl Default for Settings {
    fn default() -> Self {
        let access = AccessConfig::default();
        Self {
            bind_addr: "127.0.0.1:8080".into(),
            database_url: DEFAULT_DATABASE_URL.into(),
            pending_timeout_ms: 10_000,
            session_secret: access.session_secret,
            session_ttl_secs: access.session_ttl.as_secs(),
            allow_anonymous_commands: access.allow_anonymous_commands,
            max_body_bytes: 16 * 1024,
            transport: TransportSettings::default(),
        }
    }
}

impl Settings {
    pub fn access(&self) -> AccessConfig {
        AccessConfig {
            session_secret: self.session_secret.clone(),
            session_ttl: Duration::from_secs(self.session_ttl_secs),
            allow_anonymous_commands: self.allow_anonymous_commands,
        }
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            pending_timeout: Duration::from_millis(self.pending_timeout_ms),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pending_timeout_ms == 0 {
            bail!("pending_timeout_ms must be greater than zero");
        }
        if self.session_secret.trim().is_empty() {
            bail!("session_secret must not be empty");
        }
        if self.session_ttl_secs == 0 {
            bail!("session_ttl_secs must be greater than zero");
        }
        Ok(())
    }
}

/// Defaults, then `panel.toml` in the working directory if present, then
/// `APP__*` environment variables (`APP__TRANSPORT__MODE=broadcast`).
pub fn load_settings() -> Result<Settings, ConfigError> {
    load_from(Path::new(SETTINGS_FILE))
}

pub fn load_from(path: &Path) -> Result<Settings, ConfigError> {
    Config::builder()
        .add_source(File::from(path).format(FileFormat::Toml).required(false))
        .add_source(
            Environment::with_prefix("APP")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
