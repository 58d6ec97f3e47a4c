// src/rabbitmq/mod.rs
// Messaging session over a RabbitMQ channel, and the transports it can run on

pub mod errors;
pub mod memory;
pub mod session;
pub mod topology;
pub mod transport;

mod amqp_client;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::LapinTransport;
pub use errors::{Result, SessionError};
pub use memory::{MemoryBroker, MemoryTransport};
pub use session::{with_session, Session, SessionState, PREFETCH_COUNT};
pub use topology::{ExchangeType, Topology};
pub use transport::{Deliveries, Delivery, OutgoingMessage, Transport};
