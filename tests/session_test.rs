// Session behaviour against the in-process broker.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rabbit_session::rabbitmq::MemoryTransport;
use rabbit_session::{ExchangeType, MemoryBroker, Session, SessionError, SessionState};
use serde::ser::{Error as _, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

fn orders_session(broker: &MemoryBroker) -> Session<MemoryTransport> {
    let mut session = Session::with_transport(broker.connect());
    session
        .set_exchange("orders")
        .set_queue("orders.created")
        .set_routing_key("created");
    session
}

struct Unserializable;

impl Serialize for Unserializable {
    fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        Err(S::Error::custom("refusing to serialize"))
    }
}

#[tokio::test]
async fn test_send_delivers_unicode_json_to_consumer() {
    let broker = MemoryBroker::new();

    let mut sender = orders_session(&broker);
    sender.send(&json!({ "id": 1, "name": "café" })).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut listener = orders_session(&broker);
    let listening = tokio::spawn(async move {
        listener
            .listen_until(
                move |delivery| {
                    let _ = tx.send(delivery);
                    async { Ok(()) }
                },
                async {
                    let _ = stop_rx.await;
                },
            )
            .await
    });

    let delivery = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    stop_tx.send(()).unwrap();
    listening.await.unwrap().unwrap();

    assert_eq!(delivery.content_type.as_deref(), Some("application/json"));
    assert_eq!(delivery.routing_key, "created");
    assert_eq!(delivery.json::<Value>().unwrap(), json!({ "id": 1, "name": "café" }));
    assert!(String::from_utf8(delivery.data.clone()).unwrap().contains("café"));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_typed_payload_round_trips() {
    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct OrderCreated {
        order_id: String,
        items: Vec<String>,
        total: f64,
    }

    let broker = MemoryBroker::new();
    let order = OrderCreated {
        order_id: "ord-42".to_string(),
        items: vec!["crème brûlée".to_string(), "日本茶".to_string()],
        total: 59.99,
    };

    orders_session(&broker).send(&order).await.unwrap();

    let messages = broker.take_messages("orders.created");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].json::<OrderCreated>().unwrap(), order);
}

#[tokio::test]
async fn test_send_closes_session() {
    let broker = MemoryBroker::new();
    let mut session = orders_session(&broker);

    session.send(&json!("hello")).await.unwrap();

    assert_eq!(session.state(), SessionState::Closed);
    assert!(!session.is_open());
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(
        broker.operations(),
        vec![
            "exchange.declare",
            "queue.declare",
            "queue.bind",
            "basic.qos",
            "basic.publish",
            "channel.close",
            "connection.close",
        ]
    );
}

#[tokio::test]
async fn test_send_without_names_makes_no_broker_call() {
    let broker = MemoryBroker::new();
    let mut session = Session::with_transport(broker.connect());

    let missing_both = session.send(&json!({ "id": 1 })).await;
    assert!(matches!(missing_both, Err(SessionError::ConfigurationError(_))));

    session.set_exchange("orders");
    let missing_queue = session.send(&json!({ "id": 1 })).await;
    assert!(matches!(missing_queue, Err(SessionError::ConfigurationError(_))));

    assert!(broker.operations().is_empty());
    assert!(session.is_open());
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_unserializable_payload_fails_before_broker_call() {
    let broker = MemoryBroker::new();
    let mut session = orders_session(&broker);

    let result = session.send(&Unserializable).await;

    assert!(matches!(result, Err(SessionError::SerializationError(_))));
    assert!(broker.operations().is_empty());
    assert!(session.is_open());
    assert_eq!(session.state(), SessionState::Configured);
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_declare_binding_is_idempotent() {
    let broker = MemoryBroker::new();
    let mut session = orders_session(&broker);

    session.declare_binding().await.unwrap();
    session.declare_binding().await.unwrap();

    assert!(broker.has_exchange("orders"));
    assert_eq!(
        broker.bindings("orders.created"),
        vec![("orders".to_string(), "created".to_string())]
    );
    assert_eq!(session.state(), SessionState::Bound);

    let mut second = orders_session(&broker);
    second.declare_binding().await.unwrap();
    second.close().await.unwrap();
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_exchange_type_mismatch_is_a_topology_error() {
    let broker = MemoryBroker::new();
    orders_session(&broker).declare_binding().await.unwrap();

    let mut session = orders_session(&broker);
    session.set_type(ExchangeType::Fanout);

    let result = session.declare_binding().await;
    assert!(matches!(result, Err(SessionError::TopologyError(_))));
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_passive_declare_of_missing_exchange_fails() {
    let broker = MemoryBroker::new();
    let mut session = orders_session(&broker);
    session.set_passive(true);

    assert!(matches!(
        session.declare_exchange().await,
        Err(SessionError::TopologyError(_))
    ));
    assert!(!broker.has_exchange("orders"));
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_count_of_undeclared_queue_is_zero() {
    let broker = MemoryBroker::new();
    let mut session = Session::with_transport(broker.connect());
    session.set_queue("never.declared");

    assert_eq!(session.get_count_messages().await, 0);
    assert_eq!(session.try_count_messages().await.unwrap(), None);
    assert!(!broker.has_queue("never.declared"));
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_count_reports_waiting_messages() {
    let broker = MemoryBroker::new();
    for id in 0..3 {
        orders_session(&broker).send(&json!({ "id": id })).await.unwrap();
    }

    let mut session = orders_session(&broker);
    assert_eq!(session.get_count_messages().await, 3);
    assert_eq!(session.try_count_messages().await.unwrap(), Some(3));
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_count_without_queue_name() {
    let broker = MemoryBroker::new();
    let mut session = Session::with_transport(broker.connect());

    assert_eq!(session.get_count_messages().await, 0);
    assert!(matches!(
        session.try_count_messages().await,
        Err(SessionError::ConfigurationError(_))
    ));
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_close_twice_is_silent() {
    let broker = MemoryBroker::new();
    let mut session = orders_session(&broker);

    session.close().await.unwrap();
    session.close().await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_close_after_broker_side_close_is_silent() {
    let broker = MemoryBroker::new();
    let mut session = orders_session(&broker);
    session.declare_binding().await.unwrap();

    broker.close_all_connections();

    assert!(!session.is_open());
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_listen_returns_when_broker_closes_channel() {
    let broker = MemoryBroker::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut listener = orders_session(&broker);
    let sink = seen.clone();
    let listening = tokio::spawn(async move {
        let result = listener
            .listen(move |delivery| {
                sink.lock().unwrap().push(delivery.json::<Value>().unwrap());
                async { Ok(()) }
            })
            .await;
        (result, listener.state())
    });

    while broker.consumer_count("orders.created") == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    orders_session(&broker).send(&json!({ "id": 7 })).await.unwrap();
    while seen.lock().unwrap().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    broker.close_all_connections();
    let (result, state) = tokio::time::timeout(Duration::from_secs(1), listening)
        .await
        .unwrap()
        .unwrap();

    result.unwrap();
    assert_eq!(state, SessionState::Closed);
    assert_eq!(*seen.lock().unwrap(), vec![json!({ "id": 7 })]);
}

#[tokio::test]
async fn test_listen_until_stops_on_shutdown_and_closes() {
    let broker = MemoryBroker::new();
    let mut listener = orders_session(&broker);

    listener
        .listen_until(|_| async { Ok(()) }, tokio::time::sleep(Duration::from_millis(20)))
        .await
        .unwrap();

    assert_eq!(listener.state(), SessionState::Closed);
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.consumer_count("orders.created"), 0);
}

#[tokio::test]
async fn test_callback_errors_do_not_stop_the_loop() {
    let broker = MemoryBroker::new();
    for id in 0..2 {
        orders_session(&broker).send(&json!({ "id": id })).await.unwrap();
    }

    let calls = Arc::new(Mutex::new(0));
    let counter = calls.clone();
    let mut listener = orders_session(&broker);
    listener
        .listen_until(
            move |_| {
                *counter.lock().unwrap() += 1;
                async { Err(anyhow::anyhow!("handler blew up")) }
            },
            tokio::time::sleep(Duration::from_millis(50)),
        )
        .await
        .unwrap();

    assert_eq!(*calls.lock().unwrap(), 2);
    // Auto-ack: failed callbacks do not put messages back.
    let mut inspector = orders_session(&broker);
    assert_eq!(inspector.get_count_messages().await, 0);
    inspector.close().await.unwrap();
}

#[tokio::test]
async fn test_auto_ack_hands_over_both_messages_before_slow_callback_returns() {
    let broker = MemoryBroker::new();
    for id in 0..2 {
        orders_session(&broker).send(&json!({ "id": id })).await.unwrap();
    }

    let depths = Arc::new(Mutex::new(Vec::new()));
    let recorder = depths.clone();
    let probe = broker.clone();
    let mut listener = orders_session(&broker);
    listener
        .listen_until(
            move |delivery| {
                recorder
                    .lock()
                    .unwrap()
                    .push((delivery.json::<Value>().unwrap(), probe.queue_depth("orders.created")));
                async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(())
                }
            },
            tokio::time::sleep(Duration::from_millis(100)),
        )
        .await
        .unwrap();

    // Callbacks run one at a time, but with no-ack the queue was already empty
    // while the first one was still running.
    assert_eq!(
        *depths.lock().unwrap(),
        vec![(json!({ "id": 0 }), Some(0)), (json!({ "id": 1 }), Some(0))]
    );
}

#[tokio::test]
async fn test_exclusive_queue_rejects_foreign_consumer() {
    let broker = MemoryBroker::new();
    let mut owner = orders_session(&broker);
    owner.set_exclusive(true);
    owner.declare_binding().await.unwrap();

    let mut intruder = orders_session(&broker);
    intruder.set_exclusive(true);
    let result = intruder.listen(|_| async { Ok(()) }).await;

    assert!(matches!(result, Err(SessionError::TopologyError(_))));
    assert_eq!(intruder.state(), SessionState::Closed);
    owner.close().await.unwrap();
}

#[tokio::test]
async fn test_count_of_foreign_exclusive_queue() {
    let broker = MemoryBroker::new();
    let mut owner = orders_session(&broker);
    owner.set_exclusive(true);
    owner.declare_binding().await.unwrap();

    let mut other = orders_session(&broker);
    assert!(matches!(
        other.try_count_messages().await,
        Err(SessionError::TopologyError(_))
    ));
    assert_eq!(other.get_count_messages().await, 0);
    assert!(other.is_open());

    other.close().await.unwrap();
    owner.close().await.unwrap();
}

#[tokio::test]
async fn test_consume_on_locked_queue_is_a_consume_error() {
    use rabbit_session::rabbitmq::topology::QueueDeclaration;
    use rabbit_session::Transport;

    let broker = MemoryBroker::new();
    let mut owner = broker.connect();
    owner
        .declare_queue(&QueueDeclaration {
            name: "private".to_string(),
            passive: false,
            durable: true,
            exclusive: true,
            auto_delete: false,
        })
        .await
        .unwrap();

    let mut other = broker.connect();
    let result = other.consume("private", "").await;
    assert!(matches!(result, Err(SessionError::ConsumeError(_))));
}

#[tokio::test]
async fn test_dropping_unclosed_session_releases_connection() {
    let broker = MemoryBroker::new();
    {
        let mut session = orders_session(&broker);
        session.declare_binding().await.unwrap();
        assert_eq!(broker.open_connections(), 1);
    }
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn test_scoped_closes_after_failure() {
    let broker = MemoryBroker::new();
    let session = orders_session(&broker);

    let result: rabbit_session::Result<()> = session
        .scoped(|s| {
            Box::pin(async move {
                s.declare_binding().await?;
                Err(SessionError::PublishError("simulated".to_string()))
            })
        })
        .await;

    assert!(matches!(result, Err(SessionError::PublishError(_))));
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.operations().last(), Some(&"connection.close"));
}

#[tokio::test]
async fn test_scoped_returns_value() {
    let broker = MemoryBroker::new();
    orders_session(&broker).send(&json!(1)).await.unwrap();

    let count = orders_session(&broker)
        .scoped(|s| Box::pin(async move { Ok(s.get_count_messages().await) }))
        .await
        .unwrap();

    assert_eq!(count, 1);
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn test_direct_exchange_routes_by_key() {
    let broker = MemoryBroker::new();
    orders_session(&broker).declare_binding().await.unwrap();

    let mut session = orders_session(&broker);
    session.set_routing_key("cancelled");
    session.set_queue("orders.cancelled");
    session.send(&json!({ "id": 9 })).await.unwrap();

    assert_eq!(broker.queue_depth("orders.created"), Some(0));
    assert_eq!(broker.queue_depth("orders.cancelled"), Some(1));
}
