// src/env.rs
use std::env;

use anyhow::{Context, Result};
use dotenv::dotenv;

use crate::config::BrokerConfig;

pub const HOST_VAR: &str = "RABBITMQ_HOST";
pub const PORT_VAR: &str = "RABBITMQ_PORT";
pub const USERNAME_VAR: &str = "RABBITMQ_USERNAME";
pub const PASSWORD_VAR: &str = "RABBITMQ_PASSWORD";
pub const VHOST_VAR: &str = "RABBITMQ_VHOST";
pub const CONNECT_TIMEOUT_VAR: &str = "RABBITMQ_CONNECT_TIMEOUT_MS";
pub const HEARTBEAT_VAR: &str = "RABBITMQ_HEARTBEAT_SECONDS";

/// Overwrite fields whose `RABBITMQ_*` variable is set. Reads `.env` first.
pub fn apply_overrides(config: &mut BrokerConfig) -> Result<()> {
    dotenv().ok();

    if let Ok(val) = env::var(HOST_VAR) {
        config.host = val;
    }
    if let Ok(val) = env::var(PORT_VAR) {
        config.port = val.parse().context(format!("{} must be a port number", PORT_VAR))?;
    }
    if let Ok(val) = env::var(USERNAME_VAR) {
        config.username = val;
    }
    if let Ok(val) = env::var(PASSWORD_VAR) {
        config.password = val;
    }
    if let Ok(val) = env::var(VHOST_VAR) {
        config.vhost = val;
    }
    if let Ok(val) = env::var(CONNECT_TIMEOUT_VAR) {
        config.connection_timeout_ms = val
            .parse()
            .context(format!("{} must be a number of milliseconds", CONNECT_TIMEOUT_VAR))?;
    }
    if let Ok(val) = env::var(HEARTBEAT_VAR) {
        config.heartbeat_seconds = val
            .parse()
            .context(format!("{} must be a number of seconds", HEARTBEAT_VAR))?;
    }

    Ok(())
}
