//! Declare a RabbitMQ exchange and queue, bind them, then publish JSON
//! messages to them or consume from them through a single [`Session`].
//!
//! ```no_run
//! use rabbit_session::{BrokerConfig, Session};
//!
//! # async fn run() -> rabbit_session::Result<()> {
//! let mut session = Session::connect(&BrokerConfig::default()).await?;
//! session
//!     .set_exchange("orders")
//!     .set_queue("orders.created")
//!     .set_routing_key("created");
//! session.send(&serde_json::json!({ "id": 1, "name": "café" })).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod env;
pub mod rabbitmq;

pub use config::{BrokerConfig, SessionConfig};
pub use rabbitmq::{
    with_session, Delivery, ExchangeType, MemoryBroker, Result, Session, SessionError,
    SessionState, Topology, Transport,
};
