//! Walks one always-failing message through retries into the dead-letter queue
//! on the in-process broker.

use reliable_bus::{
    memory::{BrokerEvent, InMemoryBroker},
    MessageBus, MessageOptions, ReceiveOptions, Serialized,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Serialize, Deserialize)]
struct Order {
    id: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let options = MessageOptions {
        retry_delay_ms: 100,
        ..MessageOptions::from_env()?
    };
    info!(
        "Options loaded - max retries: {}, retry delay: {:?}",
        options.max_retry_count,
        options.retry_delay()
    );

    let broker = InMemoryBroker::new();
    broker.declare_queue_with_dead_letter("orders", "orders.dead");
    broker.bind("shop", "orders.created", "orders");

    let bus = MessageBus::new(Arc::new(broker.clone()), options.clone())?;
    let shutdown = CancellationToken::new();

    let consumer = bus
        .receive::<Serialized<Order>, _>(
            "orders",
            |order: Option<Serialized<Order>>| async move {
                info!("Handling {:?}; refusing it", order.map(Serialized::into_inner));
                anyhow::Ok(false)
            },
            ReceiveOptions::default(),
            shutdown.clone(),
        )
        .await?;

    bus.send("shop", &Serialized(Order { id: 1 }), "orders.created", None, &shutdown)
        .await?;

    tokio::time::timeout(
        Duration::from_secs(30),
        broker.wait_until(|events| {
            events
                .iter()
                .any(|e| matches!(e, BrokerEvent::DeadLettered { .. }))
        }),
    )
    .await?;

    shutdown.cancel();
    consumer.closed().await?;

    for event in broker.events() {
        info!("{:?}", event);
    }
    info!(
        "Dead-lettered messages waiting in orders.dead: {}",
        broker.ready_count("orders.dead")
    );

    Ok(())
}
