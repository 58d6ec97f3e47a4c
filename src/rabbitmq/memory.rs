// src/rabbitmq/memory.rs
// In-process broker with AMQP 0-9-1 routing semantics, for tests and local runs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use tracing::debug;

use super::errors::{Result, SessionError};
use super::topology::{ExchangeDeclaration, ExchangeType, QueueDeclaration};
use super::transport::{Deliveries, Delivery, OutgoingMessage, Transport};

struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

struct StoredMessage {
    exchange: String,
    routing_key: String,
    message: OutgoingMessage,
}

struct MemoryConsumer {
    connection_id: u64,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
}

struct MemoryQueue {
    declaration: QueueDeclaration,
    owner: u64,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<MemoryConsumer>,
    had_consumer: bool,
    next_consumer: usize,
}

#[derive(Default)]
struct BrokerState {
    next_connection_id: u64,
    next_delivery_tag: u64,
    open_connections: HashSet<u64>,
    exchanges: HashMap<String, ExchangeDeclaration>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<Binding>,
    prefetch: HashMap<u64, u16>,
    operations: Vec<&'static str>,
}

/// Shared broker state. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

fn not_found(kind: &str, name: &str) -> String {
    format!("NOT_FOUND - no {} '{}'", kind, name)
}

/// Topic pattern match: `*` is exactly one word, `#` is zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((word, rest)) => match key.split_first() {
                Some((first, key_rest)) => {
                    (*word == "*" || word == first) && matches(rest, key_rest)
                }
                None => false,
            },
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

impl BrokerState {
    fn record(&mut self, operation: &'static str) {
        self.operations.push(operation);
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect());
        }

        let kind = self
            .exchanges
            .get(exchange)
            .map(|declaration| declaration.kind)
            .ok_or_else(|| SessionError::PublishError(not_found("exchange", exchange)))?;

        let mut targets: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let matched = match kind {
                ExchangeType::Direct => binding.routing_key == routing_key,
                ExchangeType::Fanout => true,
                ExchangeType::Topic => topic_matches(&binding.routing_key, routing_key),
                // Without binding arguments every headers binding matches.
                ExchangeType::Headers => true,
            };
            if matched && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    fn dispatch(&mut self, queue_name: &str, stored: StoredMessage) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        while !queue.consumers.is_empty() {
            let index = queue.next_consumer % queue.consumers.len();
            self.next_delivery_tag += 1;
            let delivery = Delivery {
                delivery_tag: self.next_delivery_tag,
                exchange: stored.exchange.clone(),
                routing_key: stored.routing_key.clone(),
                redelivered: false,
                content_type: Some(stored.message.content_type.clone()),
                message_id: Some(stored.message.message_id.clone()),
                data: stored.message.body.clone(),
            };

            match queue.consumers[index].sender.unbounded_send(Ok(delivery)) {
                Ok(()) => {
                    queue.next_consumer = index + 1;
                    return;
                }
                Err(_) => {
                    // Receiver gone; forget the consumer and try the next one.
                    queue.consumers.remove(index);
                }
            }
        }

        queue.messages.push_back(stored);
    }

    fn release_connection(&mut self, connection_id: u64) {
        self.open_connections.remove(&connection_id);
        self.prefetch.remove(&connection_id);

        let mut deleted = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            queue.consumers.retain(|c| c.connection_id != connection_id);

            let exclusive_owner = queue.declaration.exclusive && queue.owner == connection_id;
            let unused = queue.declaration.auto_delete && queue.had_consumer && queue.consumers.is_empty();
            if exclusive_owner || unused {
                deleted.push(name.clone());
            }
        }

        for name in deleted {
            debug!(queue = %name, "Deleting queue with its last owner or consumer");
            self.queues.remove(&name);
            self.bindings.retain(|b| b.queue != name);
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a connection with one channel on it.
    pub fn connect(&self) -> MemoryTransport {
        let mut state = self.lock();
        state.next_connection_id += 1;
        let connection_id = state.next_connection_id;
        state.open_connections.insert(connection_id);

        MemoryTransport {
            broker: self.clone(),
            connection_id,
            open: true,
        }
    }

    /// Protocol methods issued so far, oldest first.
    pub fn operations(&self) -> Vec<&'static str> {
        self.lock().operations.clone()
    }

    pub fn clear_operations(&self) {
        self.lock().operations.clear();
    }

    pub fn open_connections(&self) -> usize {
        self.lock().open_connections.len()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    /// (exchange, routing key) pairs bound to a queue.
    pub fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        self.lock()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| (b.exchange.clone(), b.routing_key.clone()))
            .collect()
    }

    /// Messages waiting in a queue, `None` if it does not exist.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|q| q.messages.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    /// Remove and return the messages waiting in a queue, as a consumer would see them.
    pub fn take_messages(&self, queue: &str) -> Vec<Delivery> {
        let mut state = self.lock();
        let drained: Vec<StoredMessage> = match state.queues.get_mut(queue) {
            Some(q) => q.messages.drain(..).collect(),
            None => return Vec::new(),
        };

        drained
            .into_iter()
            .map(|stored| {
                state.next_delivery_tag += 1;
                Delivery {
                    delivery_tag: state.next_delivery_tag,
                    exchange: stored.exchange,
                    routing_key: stored.routing_key,
                    redelivered: false,
                    content_type: Some(stored.message.content_type),
                    message_id: Some(stored.message.message_id),
                    data: stored.message.body,
                }
            })
            .collect()
    }

    /// Close every connection from the broker side, ending all consumers.
    pub fn close_all_connections(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.open_connections.iter().copied().collect();
        for id in ids {
            state.release_connection(id);
        }
    }
}

/// One connection to a [`MemoryBroker`].
pub struct MemoryTransport {
    broker: MemoryBroker,
    connection_id: u64,
    open: bool,
}

impl MemoryTransport {
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn prefetch_count(&self) -> Option<u16> {
        self.broker.lock().prefetch.get(&self.connection_id).copied()
    }

    fn state(&self, operation: &'static str) -> Result<MutexGuard<'_, BrokerState>> {
        let mut state = self.broker.lock();
        if !self.open || !state.open_connections.contains(&self.connection_id) {
            return Err(SessionError::AlreadyClosed);
        }
        state.record(operation);
        Ok(state)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn declare_exchange(&mut self, declaration: &ExchangeDeclaration) -> Result<()> {
        let mut state = self.state("exchange.declare")?;
        let existing = state.exchanges.get(&declaration.name).cloned();

        match existing {
            Some(_) if declaration.passive => Ok(()),
            None if declaration.passive => Err(SessionError::TopologyError(not_found(
                "exchange",
                &declaration.name,
            ))),
            Some(existing)
                if existing.kind != declaration.kind
                    || existing.durable != declaration.durable
                    || existing.auto_delete != declaration.auto_delete =>
            {
                Err(SessionError::TopologyError(format!(
                    "PRECONDITION_FAILED - inequivalent arg for exchange '{}': declared as {} durable={}",
                    declaration.name, existing.kind, existing.durable
                )))
            }
            Some(_) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(declaration.name.clone(), declaration.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&mut self, declaration: &QueueDeclaration) -> Result<u32> {
        let connection_id = self.connection_id;
        let mut state = self.state("queue.declare")?;
        let existing = state
            .queues
            .get(&declaration.name)
            .map(|q| (q.declaration.clone(), q.owner, q.messages.len() as u32));

        match existing {
            Some((existing, owner, _)) if existing.exclusive && owner != connection_id => {
                Err(SessionError::TopologyError(format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to queue '{}'",
                    declaration.name
                )))
            }
            Some((_, _, message_count)) if declaration.passive => Ok(message_count),
            Some((existing, _, _))
                if existing.durable != declaration.durable
                    || existing.exclusive != declaration.exclusive
                    || existing.auto_delete != declaration.auto_delete =>
            {
                Err(SessionError::TopologyError(format!(
                    "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                    declaration.name
                )))
            }
            Some((_, _, message_count)) => Ok(message_count),
            None if declaration.passive => {
                Err(SessionError::TopologyError(not_found("queue", &declaration.name)))
            }
            None => {
                state.queues.insert(
                    declaration.name.clone(),
                    MemoryQueue {
                        declaration: declaration.clone(),
                        owner: connection_id,
                        messages: VecDeque::new(),
                        consumers: Vec::new(),
                        had_consumer: false,
                        next_consumer: 0,
                    },
                );
                Ok(0)
            }
        }
    }

    async fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.state("queue.bind")?;

        if exchange.is_empty() {
            return Err(SessionError::TopologyError(
                "ACCESS_REFUSED - operation not permitted on the default exchange".to_string(),
            ));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(SessionError::TopologyError(not_found("exchange", exchange)));
        }
        if !state.queues.contains_key(queue) {
            return Err(SessionError::TopologyError(not_found("queue", queue)));
        }

        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.routing_key == routing_key);
        if !exists {
            state.bindings.push(Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn set_prefetch(&mut self, prefetch_count: u16) -> Result<()> {
        let connection_id = self.connection_id;
        let mut state = self.state("basic.qos")?;
        state.prefetch.insert(connection_id, prefetch_count);
        Ok(())
    }

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<()> {
        let mut state = self.state("basic.publish")?;

        let targets = state.route(exchange, routing_key)?;
        if targets.is_empty() {
            debug!(exchange = %exchange, routing_key = %routing_key, "Unroutable message dropped");
        }

        for queue in targets {
            state.dispatch(
                &queue,
                StoredMessage {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    message: message.clone(),
                },
            );
        }
        Ok(())
    }

    async fn consume(&mut self, queue: &str, consumer_tag: &str) -> Result<Deliveries> {
        let connection_id = self.connection_id;
        let mut state = self.state("basic.consume")?;

        debug!(queue = %queue, consumer_tag = %consumer_tag, "Registering consumer");

        let Some(memory_queue) = state.queues.get_mut(queue) else {
            return Err(SessionError::ConsumeError(not_found("queue", queue)));
        };
        if memory_queue.declaration.exclusive && memory_queue.owner != connection_id {
            return Err(SessionError::ConsumeError(format!(
                "RESOURCE_LOCKED - cannot obtain exclusive access to queue '{}'",
                queue
            )));
        }

        let (sender, receiver) = mpsc::unbounded();
        memory_queue.consumers.push(MemoryConsumer {
            connection_id,
            sender,
        });
        memory_queue.had_consumer = true;

        // Auto-ack: everything ready is handed over at once, prefetch does not apply.
        let backlog: Vec<StoredMessage> = memory_queue.messages.drain(..).collect();
        for stored in backlog {
            state.dispatch(queue, stored);
        }

        Ok(receiver.boxed())
    }

    async fn queue_message_count(&mut self, queue: &str) -> Result<Option<u32>> {
        let connection_id = self.connection_id;
        let state = self.state("queue.declare")?;

        match state.queues.get(queue) {
            Some(q) if q.declaration.exclusive && q.owner != connection_id => {
                Err(SessionError::TopologyError(format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to queue '{}'",
                    queue
                )))
            }
            Some(q) => Ok(Some(q.messages.len() as u32)),
            None => Ok(None),
        }
    }

    fn is_open(&self) -> bool {
        self.open && self.broker.lock().open_connections.contains(&self.connection_id)
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.broker.lock();
        let was_open = self.open && state.open_connections.contains(&self.connection_id);
        self.open = false;

        if !was_open {
            return Err(SessionError::AlreadyClosed);
        }

        state.record("channel.close");
        state.record("connection.close");
        state.release_connection(self.connection_id);
        Ok(())
    }

    fn abandon(&mut self) {
        self.open = false;
        self.broker.lock().release_connection(self.connection_id);
    }
}
