// src/config.rs
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use lapin::uri::AMQPUri;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::env;
use crate::rabbitmq::Topology;

pub const CONFIG_FILE_NAME: &str = "rabbit-session.json";
pub const CONFIG_PATH_VAR: &str = "RABBIT_SESSION_CONFIG";

// Configuration structures
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub connection: BrokerConfig,
    #[serde(default)]
    pub topology: Topology,
}

/// Where and how to reach the broker.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default = "default_timeout")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_seconds: u16,
}

// Default values
fn default_host() -> String { "localhost".to_string() }
fn default_port() -> u16 { 5672 }
fn default_username() -> String { "guest".to_string() }
fn default_password() -> String { "guest".to_string() }
fn default_vhost() -> String { "/".to_string() }
fn default_timeout() -> u64 { 5000 }
fn default_heartbeat() -> u16 { 30 }

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: default_username(),
            password: default_password(),
            vhost: default_vhost(),
            connection_timeout_ms: default_timeout(),
            heartbeat_seconds: default_heartbeat(),
        }
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("vhost", &self.vhost)
            .field("connection_timeout_ms", &self.connection_timeout_ms)
            .field("heartbeat_seconds", &self.heartbeat_seconds)
            .finish()
    }
}

impl BrokerConfig {
    /// Defaults overridden by `RABBITMQ_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        env::apply_overrides(&mut config)?;
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn amqp_uri(&self) -> AMQPUri {
        let mut uri = AMQPUri::default();
        uri.authority.host = self.host.clone();
        uri.authority.port = self.port;
        uri.authority.userinfo.username = self.username.clone();
        uri.authority.userinfo.password = self.password.clone();
        uri.vhost = self.vhost.clone();
        uri.query.heartbeat = Some(self.heartbeat_seconds);
        uri
    }
}

// Configuration loading and management functions
pub fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_PATH_VAR) {
        debug!("Using config file from {}: {}", CONFIG_PATH_VAR, path);
        return Some(PathBuf::from(path));
    }

    let local = Path::new(CONFIG_FILE_NAME);
    let nested = Path::new("config").join(CONFIG_FILE_NAME);
    let locations = [
        ("Current directory", local.to_path_buf()),
        ("Current directory (alternative)", nested),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Some(path.clone());
        }
    }

    // Try the user's home directory
    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Some(home_config);
        }
    }

    None
}

pub fn load_config_from(path: &Path) -> Result<SessionConfig> {
    let config_content = fs::read_to_string(path)
        .context(format!("Failed to read config file at {}", path.display()))?;

    let config: SessionConfig = serde_json::from_str(&config_content)
        .context("Configuration file contains invalid JSON or mistyped fields")?;

    validate(&config)?;
    Ok(config)
}

/// File settings (if any file is found), then environment overrides.
pub fn load_config() -> Result<SessionConfig> {
    let mut config = match find_config_file() {
        Some(path) => load_config_from(&path)?,
        None => {
            debug!("No config file found, using defaults");
            SessionConfig::default()
        }
    };

    env::apply_overrides(&mut config.connection)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &SessionConfig) -> Result<()> {
    if config.connection.host.is_empty() {
        return Err(anyhow!("Configuration error: connection.host cannot be empty"));
    }
    if config.connection.port == 0 {
        return Err(anyhow!("Configuration error: connection.port cannot be 0"));
    }
    Ok(())
}

pub fn create_default_config_file(path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&SessionConfig::default())
        .context("Failed to serialize default configuration")?;

    // Create parent directories if they don't exist
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .context(format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}
