// src/rabbitmq/amqp_client.rs

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::errors::{closing_error, Result, SessionError};
use super::topology::{ExchangeDeclaration, QueueDeclaration};
use super::transport::{Deliveries, Delivery, OutgoingMessage, Transport};
use crate::config::BrokerConfig;

/// AMQP reply code for a normal shutdown.
const REPLY_SUCCESS: u16 = 200;

/// Transport over one lapin connection and one channel on it.
pub struct LapinTransport {
    connection: Arc<Connection>,
    channel: Channel,
    prefetch_count: Option<u16>,
}

impl LapinTransport {
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        info!(
            host = %config.host,
            port = config.port,
            vhost = %config.vhost,
            "Connecting to RabbitMQ"
        );

        let connection = timeout(
            config.connect_timeout(),
            Connection::connect_uri(config.amqp_uri(), ConnectionProperties::default()),
        )
        .await
        .map_err(|_| {
            SessionError::ConnectionError(format!(
                "Timed out after {:?} connecting to {}:{}",
                config.connect_timeout(),
                config.host,
                config.port
            ))
        })?
        .map_err(|e| SessionError::ConnectionError(format!("Failed to connect: {}", e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| SessionError::ConnectionError(format!("Failed to create channel: {}", e)))?;

        debug!(channel_id = channel.id(), "Channel opened");

        Ok(Self {
            connection: Arc::new(connection),
            channel,
            prefetch_count: None,
        })
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    // A soft protocol error makes the broker close the channel.
    async fn reopen_channel(&mut self) -> Result<()> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| SessionError::ConnectionError(format!("Failed to reopen channel: {}", e)))?;

        if let Some(prefetch_count) = self.prefetch_count {
            channel
                .basic_qos(prefetch_count, BasicQosOptions { global: false })
                .await
                .map_err(|e| SessionError::TopologyError(format!("Failed to set QoS: {}", e)))?;
        }

        debug!(channel_id = channel.id(), "Channel reopened");
        self.channel = channel;
        Ok(())
    }
}

// Soft errors are channel-level: the broker closes the channel that raised them.
fn is_soft_error(error: &lapin::Error) -> bool {
    matches!(
        error,
        lapin::Error::ProtocolError(amqp_error) if matches!(amqp_error.kind(), AMQPErrorKind::Soft(_))
    )
}

fn is_not_found(error: &lapin::Error) -> bool {
    matches!(
        error,
        lapin::Error::ProtocolError(amqp_error)
            if matches!(amqp_error.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND))
    )
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        content_type: delivery.properties.content_type().as_ref().map(|v| v.as_str().to_string()),
        message_id: delivery.properties.message_id().as_ref().map(|v| v.as_str().to_string()),
        data: delivery.data,
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn declare_exchange(&mut self, declaration: &ExchangeDeclaration) -> Result<()> {
        self.channel
            .exchange_declare(
                &declaration.name,
                declaration.kind.into(),
                ExchangeDeclareOptions {
                    passive: declaration.passive,
                    durable: declaration.durable,
                    auto_delete: declaration.auto_delete,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                SessionError::TopologyError(format!(
                    "Failed to declare exchange '{}': {}",
                    declaration.name, e
                ))
            })
    }

    async fn declare_queue(&mut self, declaration: &QueueDeclaration) -> Result<u32> {
        let queue = self
            .channel
            .queue_declare(
                &declaration.name,
                QueueDeclareOptions {
                    passive: declaration.passive,
                    durable: declaration.durable,
                    exclusive: declaration.exclusive,
                    auto_delete: declaration.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                SessionError::TopologyError(format!(
                    "Failed to declare queue '{}': {}",
                    declaration.name, e
                ))
            })?;

        Ok(queue.message_count())
    }

    async fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| SessionError::TopologyError(format!("Failed to bind queue: {}", e)))
    }

    async fn set_prefetch(&mut self, prefetch_count: u16) -> Result<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|e| SessionError::TopologyError(format!("Failed to set QoS: {}", e)))?;

        self.prefetch_count = Some(prefetch_count);
        Ok(())
    }

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type(message.content_type.into())
            .with_delivery_mode(message.delivery_mode)
            .with_message_id(message.message_id.into())
            .with_timestamp(message.timestamp);

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| SessionError::PublishError(e.to_string()))?
            .await
            .map_err(|e| SessionError::PublishError(e.to_string()))?;

        Ok(())
    }

    async fn consume(&mut self, queue: &str, consumer_tag: &str) -> Result<Deliveries> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: true,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| SessionError::ConsumeError(e.to_string()))?;

        debug!(consumer_tag = consumer.tag().as_str(), "Consumer registered");

        Ok(consumer
            .map(|result| {
                result
                    .map(into_delivery)
                    .map_err(|e| SessionError::ConsumeError(e.to_string()))
            })
            .boxed())
    }

    async fn queue_message_count(&mut self, queue: &str) -> Result<Option<u32>> {
        let options = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };

        match self
            .channel
            .queue_declare(queue, options, FieldTable::default())
            .await
        {
            Ok(declared) => Ok(Some(declared.message_count())),
            Err(e) if is_not_found(&e) => {
                debug!(queue = %queue, "Passive declare found no queue");
                self.reopen_channel().await?;
                Ok(None)
            }
            Err(e) => {
                if is_soft_error(&e) {
                    if let Err(reopen) = self.reopen_channel().await {
                        warn!(queue = %queue, "Channel not reopened after failed inspection: {}", reopen);
                    }
                }
                Err(SessionError::TopologyError(format!(
                    "Failed to inspect queue '{}': {}",
                    queue, e
                )))
            }
        }
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected() && self.connection.status().connected()
    }

    async fn close(&mut self) -> Result<()> {
        let channel_closed = self
            .channel
            .close(REPLY_SUCCESS, "Closing session")
            .await
            .map_err(closing_error);
        let connection_closed = self
            .connection
            .close(REPLY_SUCCESS, "Closing session")
            .await
            .map_err(closing_error);

        match (channel_closed, connection_closed) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), _) if !e.is_already_closed() => Err(e),
            (_, Err(e)) => Err(e),
            // The broker already tore the channel down; the connection closed cleanly.
            (Err(_), Ok(())) => Ok(()),
        }
    }

    fn abandon(&mut self) {
        let channel = self.channel.clone();
        let connection = self.connection.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = channel.close(REPLY_SUCCESS, "Session dropped").await {
                        debug!("Channel close on drop: {}", e);
                    }
                    if let Err(e) = connection.close(REPLY_SUCCESS, "Session dropped").await {
                        debug!("Connection close on drop: {}", e);
                    }
                });
            }
            Err(_) => warn!("Session dropped outside a tokio runtime; connection left to the broker"),
        }
    }
}
