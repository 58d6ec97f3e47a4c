// src/rabbitmq/session.rs

use std::future::Future;

use futures::future::{self, BoxFuture};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::amqp_client::LapinTransport;
use super::errors::{Result, SessionError};
use super::topology::{ExchangeType, Topology};
use super::transport::{Delivery, OutgoingMessage, Transport};
use crate::config::{BrokerConfig, SessionConfig};

/// Unacknowledged deliveries the broker may push per consumer.
pub const PREFETCH_COUNT: u16 = 1;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Exchange or queue name still missing.
    Unconfigured,
    Configured,
    /// Exchange, queue and binding exist on the broker.
    Bound,
    Sending,
    Listening,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Bound,
    Sending,
    Listening,
    Closed,
}

/// One connection and one channel, plus the topology they declare.
///
/// Setters only record values; nothing reaches the broker until a declare,
/// `send` or `listen` call. Changing settings after a declare does not
/// redeclare anything.
pub struct Session<T: Transport = LapinTransport> {
    transport: T,
    topology: Topology,
    phase: Phase,
}

impl Session<LapinTransport> {
    /// Open a connection and a channel to the broker.
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let transport = LapinTransport::connect(config).await?;
        Ok(Self::with_transport(transport))
    }

    /// Connect and take the topology from the configuration.
    pub async fn from_config(config: &SessionConfig) -> Result<Self> {
        let mut session = Self::connect(&config.connection).await?;
        session.topology = config.topology.clone();
        Ok(session)
    }
}

impl<T: Transport> Session<T> {
    pub fn with_transport(transport: T) -> Self {
        Self {
            transport,
            topology: Topology::default(),
            phase: Phase::Open,
        }
    }

    pub fn set_exchange(&mut self, exchange: impl Into<String>) -> &mut Self {
        self.topology.exchange = Some(exchange.into());
        self
    }

    pub fn set_queue(&mut self, queue: impl Into<String>) -> &mut Self {
        self.topology.queue = Some(queue.into());
        self
    }

    pub fn set_routing_key(&mut self, routing_key: impl Into<String>) -> &mut Self {
        self.topology.routing_key = routing_key.into();
        self
    }

    pub fn set_consumer_tag(&mut self, consumer_tag: impl Into<String>) -> &mut Self {
        self.topology.consumer_tag = consumer_tag.into();
        self
    }

    pub fn set_type(&mut self, exchange_type: ExchangeType) {
        self.topology.exchange_type = exchange_type;
    }

    pub fn set_auto_delete(&mut self, auto_delete: bool) {
        self.topology.auto_delete = auto_delete;
    }

    pub fn set_durable(&mut self, durable: bool) {
        self.topology.durable = durable;
    }

    pub fn set_passive(&mut self, passive: bool) {
        self.topology.passive = passive;
    }

    pub fn set_exclusive(&mut self, exclusive: bool) {
        self.topology.exclusive = exclusive;
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn state(&self) -> SessionState {
        match self.phase {
            Phase::Open if self.topology.is_configured() => SessionState::Configured,
            Phase::Open => SessionState::Unconfigured,
            Phase::Bound => SessionState::Bound,
            Phase::Sending => SessionState::Sending,
            Phase::Listening => SessionState::Listening,
            Phase::Closed => SessionState::Closed,
        }
    }

    pub fn is_open(&self) -> bool {
        self.phase != Phase::Closed && self.transport.is_open()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.phase == Phase::Closed {
            return Err(SessionError::AlreadyClosed);
        }
        Ok(())
    }

    pub async fn declare_exchange(&mut self) -> Result<()> {
        self.ensure_open()?;
        let declaration = self.topology.exchange_declaration()?;

        debug!(
            exchange = %declaration.name,
            kind = %declaration.kind,
            durable = declaration.durable,
            "Declaring exchange"
        );
        self.transport.declare_exchange(&declaration).await
    }

    pub async fn declare_queue(&mut self) -> Result<()> {
        self.ensure_open()?;
        let declaration = self.topology.queue_declaration()?;

        debug!(
            queue = %declaration.name,
            durable = declaration.durable,
            exclusive = declaration.exclusive,
            "Declaring queue"
        );
        let message_count = self.transport.declare_queue(&declaration).await?;
        debug!(queue = %declaration.name, message_count, "Queue declared");
        Ok(())
    }

    /// Declare the exchange, then the queue, bind them with the routing key
    /// and limit the channel to one unacknowledged delivery per consumer.
    pub async fn declare_binding(&mut self) -> Result<()> {
        self.ensure_open()?;
        let (exchange, queue) = self.topology.require_names()?;
        let (exchange, queue) = (exchange.to_string(), queue.to_string());

        self.declare_exchange().await?;
        self.declare_queue().await?;
        self.transport
            .bind_queue(&queue, &exchange, &self.topology.routing_key)
            .await?;
        self.transport.set_prefetch(PREFETCH_COUNT).await?;

        info!(
            exchange = %exchange,
            queue = %queue,
            routing_key = %self.topology.routing_key,
            "Binding declared"
        );
        self.phase = Phase::Bound;
        Ok(())
    }

    /// Publish `payload` as a persistent JSON message, then close the session.
    ///
    /// Missing names and unserializable payloads fail before anything is sent
    /// to the broker and leave the session open; close or drop it yourself.
    /// Once the broker has been contacted the session is closed whatever the
    /// outcome.
    pub async fn send<P: Serialize + ?Sized>(&mut self, payload: &P) -> Result<()> {
        self.ensure_open()?;
        self.topology.require_names()?;
        let message = OutgoingMessage::json(payload)?;

        let outcome = self.publish(message).await;
        let closed = self.close().await;
        outcome?;
        closed
    }

    async fn publish(&mut self, message: OutgoingMessage) -> Result<()> {
        self.declare_binding().await?;
        self.phase = Phase::Sending;

        let exchange = self.topology.exchange_name()?.to_string();
        let routing_key = self.topology.routing_key.clone();
        let message_id = message.message_id.clone();

        self.transport.publish(&exchange, &routing_key, message).await?;

        info!(
            exchange = %exchange,
            routing_key = %routing_key,
            message_id = %message_id,
            "Message published"
        );
        Ok(())
    }

    /// Consume until the channel closes. See [`Session::listen_until`].
    pub async fn listen<F, Fut>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(Delivery) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        self.listen_until(callback, future::pending::<()>()).await
    }

    /// Declare the binding, register an auto-ack consumer and hand each
    /// delivery to `callback`, one at a time, until the channel closes or
    /// `shutdown` resolves. The session is closed on the way out.
    ///
    /// Deliveries are acknowledged on receipt, so a message whose callback
    /// fails or never finishes is not redelivered.
    pub async fn listen_until<F, Fut, S>(&mut self, mut callback: F, shutdown: S) -> Result<()>
    where
        F: FnMut(Delivery) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<()>> + Send,
        S: Future<Output = ()> + Send,
    {
        self.ensure_open()?;
        self.topology.require_names()?;

        let outcome = self.consume_loop(&mut callback, shutdown).await;
        let closed = self.close().await;
        outcome?;
        closed
    }

    async fn consume_loop<F, Fut, S>(&mut self, callback: &mut F, shutdown: S) -> Result<()>
    where
        F: FnMut(Delivery) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<()>> + Send,
        S: Future<Output = ()> + Send,
    {
        self.declare_binding().await?;

        let queue = self.topology.queue_name()?.to_string();
        let mut deliveries = self
            .transport
            .consume(&queue, &self.topology.consumer_tag)
            .await?;
        self.phase = Phase::Listening;
        info!(queue = %queue, "Listening for messages");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!(queue = %queue, "Shutdown requested, leaving consume loop");
                    break;
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        let delivery_tag = delivery.delivery_tag;
                        if let Err(e) = callback(delivery).await {
                            error!(queue = %queue, delivery_tag, "Message callback failed: {:#}", e);
                        }
                    }
                    Some(Err(e)) => {
                        error!(queue = %queue, "Error receiving message: {}", e);
                        if !self.transport.is_open() {
                            warn!(queue = %queue, "Channel closed, leaving consume loop");
                            break;
                        }
                    }
                    None => {
                        info!(queue = %queue, "Consumer stream ended");
                        break;
                    }
                },
            }
        }
        Ok(())
    }

    /// Ready-message count of the queue; 0 when the queue is absent or the
    /// broker cannot be asked.
    pub async fn get_count_messages(&mut self) -> u32 {
        match self.try_count_messages().await {
            Ok(count) => count.unwrap_or(0),
            Err(e) => {
                warn!("Could not count messages, reporting 0: {}", e);
                0
            }
        }
    }

    /// Like [`Session::get_count_messages`], but `Ok(None)` for an absent queue
    /// and an error for everything else that went wrong.
    pub async fn try_count_messages(&mut self) -> Result<Option<u32>> {
        self.ensure_open()?;
        let queue = self.topology.queue_name()?.to_string();
        self.transport.queue_message_count(&queue).await
    }

    /// Close the channel, then the connection. Closing twice is not an error.
    pub async fn close(&mut self) -> Result<()> {
        if self.phase == Phase::Closed {
            debug!("Session already closed");
            return Ok(());
        }
        self.phase = Phase::Closed;

        match self.transport.close().await {
            Ok(()) => {
                debug!("Session closed");
                Ok(())
            }
            Err(e) if e.is_already_closed() => {
                debug!("Channel and connection were already closed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Run `f` with this session and close it afterwards, whether `f`
    /// succeeded or not. An error from `f` wins over an error from closing.
    pub async fn scoped<F, R>(mut self, f: F) -> Result<R>
    where
        F: for<'s> FnOnce(&'s mut Session<T>) -> BoxFuture<'s, Result<R>>,
    {
        let outcome = f(&mut self).await;
        let closed = self.close().await;
        let value = outcome?;
        closed?;
        Ok(value)
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        if self.phase != Phase::Closed {
            warn!("Session dropped without close, releasing channel and connection");
            self.phase = Phase::Closed;
            self.transport.abandon();
        }
    }
}

/// Connect with `config`, run `f`, and close the session on every exit path.
pub async fn with_session<F, R>(config: &SessionConfig, f: F) -> Result<R>
where
    F: for<'s> FnOnce(&'s mut Session<LapinTransport>) -> BoxFuture<'s, Result<R>>,
{
    Session::from_config(config).await?.scoped(f).await
}
