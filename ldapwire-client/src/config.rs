//! Client configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via LDAPWIRE_CONFIG)
//! 3. Environment variables

use crate::connection::{ConnectionConfig, DEFAULT_READ_BUFFER_SIZE};
use crate::tls::TlsClientConfig;
use ldapwire_protocol::filter::DEFAULT_MAX_FILTER_DEPTH;
use ldapwire_protocol::{DEFAULT_PORT, MAX_MESSAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// File and environment layer over [`ConnectionConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address as `host:port`.
    pub addr: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub read_buffer_size: usize,
    pub max_message_size: usize,
    /// Maximum nesting depth accepted by the filter compiler.
    pub filter_depth_limit: usize,
    pub tls: TlsClientConfig,
    /// Dump every packet sent and received at debug level.
    pub debug: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: format!("127.0.0.1:{}", DEFAULT_PORT),
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_message_size: MAX_MESSAGE_SIZE,
            filter_depth_limit: DEFAULT_MAX_FILTER_DEPTH,
            tls: TlsClientConfig::default(),
            debug: false,
        }
    }
}

impl ClientConfig {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("LDAPWIRE_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content =
            serde_yaml::to_string(self).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(path.to_path_buf(), e))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies `LDAPWIRE_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("LDAPWIRE_ADDR") {
            self.addr = addr;
        }
        if let Some(secs) = lookup("LDAPWIRE_CONNECT_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.connect_timeout_secs = secs;
        }
        if let Some(secs) = lookup("LDAPWIRE_REQUEST_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.request_timeout_secs = secs;
        }
        if let Some(enabled) = lookup("LDAPWIRE_TLS") {
            self.tls.enabled = parse_flag(&enabled);
        }
        if let Some(path) = lookup("LDAPWIRE_TLS_CA") {
            self.tls.ca_cert_path = Some(PathBuf::from(path));
            self.tls.enabled = true;
        }
        if let Some(insecure) = lookup("LDAPWIRE_TLS_INSECURE") {
            self.tls.insecure = parse_flag(&insecure);
        }
        if let Some(debug) = lookup("LDAPWIRE_DEBUG") {
            self.debug = parse_flag(&debug);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.addr.trim().is_empty() {
            return Err(ConfigError::Validation("addr is empty".to_string()));
        }
        if self.tls.client_cert_path.is_some() != self.tls.client_key_path.is_some() {
            return Err(ConfigError::Validation(
                "client_cert_path and client_key_path must be set together".to_string(),
            ));
        }
        Ok(())
    }

    pub fn into_connection_config(self) -> ConnectionConfig {
        let mut config = ConnectionConfig::new(self.addr)
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .with_request_timeout(Duration::from_secs(self.request_timeout_secs))
            .with_read_buffer_size(self.read_buffer_size)
            .with_max_message_size(self.max_message_size)
            .with_filter_depth_limit(self.filter_depth_limit)
            .with_debug(self.debug);
        if self.tls.enabled {
            config = config.with_tls(self.tls);
        }
        config
    }
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    Parse(PathBuf, #[source] serde_yaml::Error),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}
