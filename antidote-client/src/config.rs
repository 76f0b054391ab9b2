//! Client configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via ANTIDOTE_CONFIG)
//! 3. Environment variables

use antidote_protocol::{DEFAULT_PORT, MAX_FRAME_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default connect timeout (10 s).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default per-request timeout (30 s).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Request timeout, including time spent queued behind other requests.
    pub request_timeout: Duration,
    /// Largest inbound frame accepted before the connection is dropped.
    pub max_frame_size: u32,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size.clamp(1, MAX_FRAME_SIZE);
        self
    }

    /// `host:port` as passed to the resolver.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new("127.0.0.1", DEFAULT_PORT)
    }
}

/// File and environment configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection settings.
    pub connection: ConnectionSection,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("ANTIDOTE_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_overrides(|name| std::env::var(name).ok());
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

    /// Applies overrides looked up by variable name.
    pub fn apply_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        self.connection.apply_overrides(&var);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection.validate()
    }

    /// Builds the connection configuration for these settings.
    pub fn connection_config(&self) -> ConnectionConfig {
        let c = &self.connection;
        ConnectionConfig::new(c.host.clone(), c.port)
            .with_connect_timeout(Duration::from_millis(c.connect_timeout_ms))
            .with_request_timeout(Duration::from_millis(c.request_timeout_ms))
            .with_max_frame_size(c.max_frame_size)
    }
}

/// `connection` section of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_frame_size: u32,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl ConnectionSection {
    fn apply_overrides<F>(&mut self, var: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = var("ANTIDOTE_HOST") {
            self.host = host;
        }
        if let Some(port) = var("ANTIDOTE_PORT").and_then(|v| v.parse().ok()) {
            self.port = port;
        }
        if let Some(ms) = var("ANTIDOTE_CONNECT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.connect_timeout_ms = ms;
        }
        if let Some(ms) = var("ANTIDOTE_REQUEST_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.request_timeout_ms = ms;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::Validation("connection.host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::Validation("connection.port must not be 0".into()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "connection.connect_timeout_ms must be positive".into(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "connection.request_timeout_ms must be positive".into(),
            ));
        }
        if self.max_frame_size == 0 || self.max_frame_size > MAX_FRAME_SIZE {
            return Err(ConfigError::Validation(format!(
                "connection.max_frame_size must be between 1 and {}",
                MAX_FRAME_SIZE
            )));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {1}", .0.display())]
    Parse(PathBuf, #[source] serde_yaml::Error),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}
