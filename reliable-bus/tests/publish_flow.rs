// Publishing through the bus and reading the results back

use parking_lot::Mutex;
use reliable_bus::headers::{HeaderValue, RetryMetadata, ORIGIN_EXCHANGE};
use reliable_bus::memory::{BrokerEvent, InMemoryBroker};
use reliable_bus::{Headers, MessageBus, MessageOptions, ReceiveOptions, Serialized};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Reading {
    sensor: String,
    value: i64,
}

#[tokio::test]
async fn test_batch_is_delivered_in_order_and_acked() {
    let broker = InMemoryBroker::new();
    broker.declare_queue("readings");
    broker.bind("telemetry", "sensor.reading", "readings");
    let bus = MessageBus::new(Arc::new(broker.clone()), MessageOptions::default()).unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let handle = bus
        .receive::<Serialized<Reading>, _>(
            "readings",
            move |reading: Option<Serialized<Reading>>| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().extend(reading.map(Serialized::into_inner));
                    anyhow::Ok(true)
                }
            },
            ReceiveOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let batch: Vec<_> = (0..45)
        .map(|value| {
            Serialized(Reading {
                sensor: "s1".to_string(),
                value,
            })
        })
        .collect();
    bus.send_batch("telemetry", &batch, "sensor.reading", None, &CancellationToken::new())
        .await
        .unwrap();

    tokio::time::timeout(
        Duration::from_secs(60),
        broker.wait_until(|events| {
            events.iter().filter(|e| matches!(e, BrokerEvent::Acked { .. })).count() == 45
        }),
    )
    .await
    .unwrap();

    let values: Vec<i64> = received.lock().iter().map(|r| r.value).collect();
    assert_eq!(values, (0..45).collect::<Vec<_>>());
    assert!(broker
        .events()
        .iter()
        .all(|e| !matches!(e, BrokerEvent::Rejected { .. })));

    handle.cancel();
    handle.closed().await.unwrap();
    assert_eq!(broker.open_channels(), 0);
}

#[tokio::test]
async fn test_caller_headers_kept_and_retry_headers_overridden() {
    let broker = InMemoryBroker::new();
    broker.declare_queue("audit");
    broker.bind("events", "user.login", "audit");
    let bus = MessageBus::new(Arc::new(broker.clone()), MessageOptions::default()).unwrap();

    let headers = Headers::new()
        .with("tenant", "acme")
        .with(ORIGIN_EXCHANGE, "spoofed");
    bus.send(
        "events",
        &"user 42 logged in".to_string(),
        "user.login",
        Some(&headers),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let queued = broker.ready_messages("audit");
    assert_eq!(queued.len(), 1);
    assert_eq!(&queued[0].payload[..], b"user 42 logged in");

    let stored = queued[0].headers.as_ref().unwrap();
    assert_eq!(stored.get("tenant").and_then(HeaderValue::as_text).as_deref(), Some("acme"));
    assert_eq!(
        RetryMetadata::decode(stored, "", ""),
        Some(RetryMetadata::initial("events", "user.login"))
    );
}

#[tokio::test]
async fn test_unroutable_publish_still_confirms() {
    let broker = InMemoryBroker::new();
    let bus = MessageBus::new(Arc::new(broker.clone()), MessageOptions::default()).unwrap();

    bus.send("nowhere", &"lost".to_string(), "nobody", None, &CancellationToken::new())
        .await
        .unwrap();

    assert!(broker.events().contains(&BrokerEvent::Unroutable {
        exchange: "nowhere".into(),
        routing_key: "nobody".into(),
    }));
    assert_eq!(broker.open_channels(), 0);
}
