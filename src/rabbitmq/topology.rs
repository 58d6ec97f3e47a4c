// src/rabbitmq/topology.rs
use std::fmt;
use std::str::FromStr;

use lapin::ExchangeKind;
use serde::{Deserialize, Serialize};

use super::errors::{Result, SessionError};

/// Routing behaviour of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Topic => "topic",
            ExchangeType::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeType {
    type Err = SessionError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeType::Direct),
            "fanout" => Ok(ExchangeType::Fanout),
            "topic" => Ok(ExchangeType::Topic),
            "headers" => Ok(ExchangeType::Headers),
            other => Err(SessionError::ConfigurationError(format!(
                "unknown exchange type '{}'",
                other
            ))),
        }
    }
}

impl From<ExchangeType> for ExchangeKind {
    fn from(kind: ExchangeType) -> Self {
        match kind {
            ExchangeType::Direct => ExchangeKind::Direct,
            ExchangeType::Fanout => ExchangeKind::Fanout,
            ExchangeType::Topic => ExchangeKind::Topic,
            ExchangeType::Headers => ExchangeKind::Headers,
        }
    }
}

/// Exchange, queue and binding settings a session declares on the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Topology {
    pub exchange: Option<String>,
    #[serde(rename = "type")]
    pub exchange_type: ExchangeType,
    pub queue: Option<String>,
    pub routing_key: String,
    /// Empty lets the broker generate one.
    pub consumer_tag: String,
    pub durable: bool,
    pub passive: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            exchange: None,
            exchange_type: ExchangeType::Direct,
            queue: None,
            routing_key: String::new(),
            consumer_tag: String::new(),
            durable: true,
            passive: false,
            auto_delete: false,
            exclusive: false,
        }
    }
}

/// Arguments of an exchange.declare call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDeclaration {
    pub name: String,
    pub kind: ExchangeType,
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
}

/// Arguments of a queue.declare call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclaration {
    pub name: String,
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl Topology {
    pub fn exchange_name(&self) -> Result<&str> {
        match self.exchange.as_deref() {
            Some(name) if !name.is_empty() => Ok(name),
            _ => Err(SessionError::ConfigurationError(
                "exchange name is not set".to_string(),
            )),
        }
    }

    pub fn queue_name(&self) -> Result<&str> {
        match self.queue.as_deref() {
            Some(name) if !name.is_empty() => Ok(name),
            _ => Err(SessionError::ConfigurationError(
                "queue name is not set".to_string(),
            )),
        }
    }

    /// Both names, or the first one missing.
    pub fn require_names(&self) -> Result<(&str, &str)> {
        Ok((self.exchange_name()?, self.queue_name()?))
    }

    pub fn is_configured(&self) -> bool {
        self.require_names().is_ok()
    }

    pub fn exchange_declaration(&self) -> Result<ExchangeDeclaration> {
        Ok(ExchangeDeclaration {
            name: self.exchange_name()?.to_string(),
            kind: self.exchange_type,
            passive: self.passive,
            durable: self.durable,
            auto_delete: self.auto_delete,
        })
    }

    pub fn queue_declaration(&self) -> Result<QueueDeclaration> {
        Ok(QueueDeclaration {
            name: self.queue_name()?.to_string(),
            passive: self.passive,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
        })
    }
}
