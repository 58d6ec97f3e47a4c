// src/rabbitmq/transport.rs
// The seam between a session and the broker client underneath it.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use super::errors::{Result, SessionError};
use super::topology::{ExchangeDeclaration, QueueDeclaration};

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode that asks the broker to write the message to disk.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// A message ready to be handed to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub content_type: String,
    pub delivery_mode: u8,
    pub message_id: String,
    pub timestamp: u64,
}

impl OutgoingMessage {
    /// Persistent JSON envelope. serde_json leaves non-ASCII text unescaped.
    pub fn json<P: Serialize + ?Sized>(payload: &P) -> Result<Self> {
        let body = serde_json::to_vec(payload)?;

        Ok(Self {
            body,
            content_type: JSON_CONTENT_TYPE.to_string(),
            delivery_mode: PERSISTENT_DELIVERY_MODE,
            message_id: Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp() as u64,
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == PERSISTENT_DELIVERY_MODE
    }
}

/// A message pushed by the broker to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub data: Vec<u8>,
}

impl Delivery {
    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.data)
            .map_err(|e| SessionError::DeserializationError(e.to_string()))
    }

    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

/// Deliveries from a registered consumer. Ends when the channel closes.
pub type Deliveries = BoxStream<'static, Result<Delivery>>;

/// One connection plus one channel on a broker.
///
/// Every call is attempted exactly once; no implementation retries.
#[async_trait]
pub trait Transport: Send {
    async fn declare_exchange(&mut self, declaration: &ExchangeDeclaration) -> Result<()>;

    /// Returns the message count the broker reports for the queue.
    async fn declare_queue(&mut self, declaration: &QueueDeclaration) -> Result<u32>;

    async fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Per-consumer prefetch limit (global = false).
    async fn set_prefetch(&mut self, prefetch_count: u16) -> Result<()>;

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<()>;

    /// Register an auto-ack consumer: no-local=false, no-ack=true, exclusive=false, nowait=false.
    async fn consume(&mut self, queue: &str, consumer_tag: &str) -> Result<Deliveries>;

    /// Passive declare. `Ok(None)` when the queue does not exist.
    async fn queue_message_count(&mut self, queue: &str) -> Result<Option<u32>>;

    fn is_open(&self) -> bool;

    /// Close the channel, then the connection.
    /// Fails with `AlreadyClosed` when both were already gone.
    async fn close(&mut self) -> Result<()>;

    /// Release resources without awaiting. Called when a session is dropped unclosed.
    fn abandon(&mut self) {}
}
