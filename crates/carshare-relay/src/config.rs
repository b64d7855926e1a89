//! Configuration management

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::framing::FramingMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub database_path: PathBuf,
    pub max_message_size: usize,
    pub request_timeout_secs: u64,
    pub framing: FramingMode,
    /// Raw framing: a request ends when the terminal half-closes or sends
    /// nothing more for this long
    pub raw_idle_timeout_ms: u64,
    pub database_pool_size: u32,
    pub admin_addr: Option<SocketAddr>,
    pub admin_token: Option<String>,
    pub shutdown_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 65000)),
            database_path: PathBuf::from("carshare.db"),
            max_message_size: 4096,
            request_timeout_secs: 10,
            framing: FramingMode::Raw,
            raw_idle_timeout_ms: 200,
            database_pool_size: 8,
            admin_addr: None,
            admin_token: None,
            shutdown_timeout_secs: 30,
        }
    }
}

impl RelayConfig {
    /// Load configuration from environment variables, command line, and TOML file
    pub fn load() -> Result<Self, ConfigError> {
        // Start with defaults
        let mut config = Self::default();

        // Load from environment variables
        config.load_from_env()?;

        // Load from command line arguments
        let args: Vec<String> = std::env::args().skip(1).collect();
        let config_path = config.load_from_args(&args)?;

        // Load from TOML config file (if specified)
        if let Some(path) = config_path.or_else(|| std::env::var("CARSHARE_RELAY_CONFIG").ok()) {
            config.load_from_toml(&path)?;
        }

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn raw_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.raw_idle_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid("max_message_size must be > 0".to_string()));
        }

        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("request_timeout_secs must be > 0".to_string()));
        }

        if self.shutdown_timeout_secs == 0 {
            return Err(ConfigError::Invalid("shutdown_timeout_secs must be > 0".to_string()));
        }

        if self.raw_idle_timeout_ms == 0 {
            return Err(ConfigError::Invalid("raw_idle_timeout_ms must be > 0".to_string()));
        }

        if self.database_pool_size == 0 {
            return Err(ConfigError::Invalid("database_pool_size must be > 0".to_string()));
        }

        if self.admin_addr.is_some() && self.admin_token.is_none() {
            return Err(ConfigError::Invalid(
                "admin_addr requires admin_token to be set".to_string(),
            ));
        }

        Ok(())
    }

    fn load_from_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(addr) = std::env::var("CARSHARE_LISTEN_ADDR") {
            self.listen_addr = parse_addr("listen_addr", &addr)?;
        }

        if let Ok(path) = std::env::var("CARSHARE_DATABASE") {
            self.database_path = PathBuf::from(path);
        }

        if let Ok(mode) = std::env::var("CARSHARE_FRAMING") {
            self.framing = mode.parse().map_err(ConfigError::Invalid)?;
        }

        if let Ok(addr) = std::env::var("CARSHARE_ADMIN_ADDR") {
            self.admin_addr = Some(parse_addr("admin_addr", &addr)?);
        }

        if let Ok(token) = std::env::var("CARSHARE_ADMIN_TOKEN") {
            self.admin_token = Some(token);
        }

        Ok(())
    }

    /// Apply command line arguments (without the program name).
    ///
    /// # Returns
    /// The `--config` path, if one was given.
    pub fn load_from_args(&mut self, args: &[String]) -> Result<Option<String>, ConfigError> {
        let mut config_path = None;
        let mut i = 0;
        while i < args.len() {
            let flag = args[i].as_str();
            let takes_value = matches!(
                flag,
                "--listen-addr" | "-l" | "--database" | "-d" | "--framing" | "--admin-addr"
                    | "--admin-token" | "--config" | "-f"
            );
            if !takes_value {
                i += 1;
                continue;
            }
            let value = args
                .get(i + 1)
                .ok_or_else(|| ConfigError::Invalid(format!("{} requires a value", flag)))?;

            match flag {
                "--listen-addr" | "-l" => self.listen_addr = parse_addr("listen_addr", value)?,
                "--database" | "-d" => self.database_path = PathBuf::from(value),
                "--framing" => self.framing = value.parse().map_err(ConfigError::Invalid)?,
                "--admin-addr" => self.admin_addr = Some(parse_addr("admin_addr", value)?),
                "--admin-token" => self.admin_token = Some(value.clone()),
                _ => config_path = Some(value.clone()),
            }
            i += 2;
        }
        Ok(config_path)
    }

    /// Load from TOML config file
    pub fn load_from_toml(&mut self, path: &str) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.apply_toml(&content)
    }

    fn apply_toml(&mut self, content: &str) -> Result<(), ConfigError> {
        let toml_config: toml::Value = toml::from_str(content)?;

        if let Some(addr) = toml_config.get("listen_addr").and_then(|v| v.as_str()) {
            self.listen_addr = parse_addr("listen_addr in TOML", addr)?;
        }

        if let Some(path) = toml_config.get("database_path").and_then(|v| v.as_str()) {
            self.database_path = PathBuf::from(path);
        }

        if let Some(size) = toml_config.get("max_message_size").and_then(|v| v.as_integer()) {
            self.max_message_size = non_negative("max_message_size", size)? as usize;
        }

        if let Some(timeout) = toml_config.get("request_timeout_secs").and_then(|v| v.as_integer()) {
            self.request_timeout_secs = non_negative("request_timeout_secs", timeout)?;
        }

        if let Some(mode) = toml_config.get("framing").and_then(|v| v.as_str()) {
            self.framing = mode.parse().map_err(ConfigError::Invalid)?;
        }

        if let Some(idle) = toml_config.get("raw_idle_timeout_ms").and_then(|v| v.as_integer()) {
            self.raw_idle_timeout_ms = non_negative("raw_idle_timeout_ms", idle)?;
        }

        if let Some(size) = toml_config.get("database_pool_size").and_then(|v| v.as_integer()) {
            let size = non_negative("database_pool_size", size)?;
            self.database_pool_size = u32::try_from(size)
                .map_err(|_| ConfigError::Invalid("database_pool_size is too large".to_string()))?;
        }

        if let Some(addr) = toml_config.get("admin_addr").and_then(|v| v.as_str()) {
            self.admin_addr = Some(parse_addr("admin_addr in TOML", addr)?);
        }

        if let Some(token) = toml_config.get("admin_token").and_then(|v| v.as_str()) {
            self.admin_token = Some(token.to_string());
        }

        if let Some(timeout) = toml_config.get("shutdown_timeout_secs").and_then(|v| v.as_integer()) {
            self.shutdown_timeout_secs = non_negative("shutdown_timeout_secs", timeout)?;
        }

        Ok(())
    }
}

fn parse_addr(field: &str, value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("Invalid {}: {}", field, e)))
}

fn non_negative(field: &str, value: i64) -> Result<u64, ConfigError> {
    u64::try_from(value).map_err(|_| ConfigError::Invalid(format!("{} must be >= 0", field)))
}
