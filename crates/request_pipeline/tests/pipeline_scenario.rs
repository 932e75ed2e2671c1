use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::StreamExt;
use request_pipeline::queue::memory::MemoryBroker;
use request_pipeline::queue::{
    BrokerChannel, ConsumerSettings, DeliveryOutcome, QueueConsumer, QueuePublisher,
};
use request_pipeline::record::WorkRecord;
use request_pipeline::store::{MemoryStore, RecordStore};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn published_record_is_persisted_once_across_redelivery() {
    let broker = MemoryBroker::new();
    let store = Arc::new(MemoryStore::new());
    let publisher = QueuePublisher::new(Arc::new(broker.channel()));
    let consumer = QueueConsumer::new(
        Arc::new(broker.channel()),
        store.clone(),
        ConsumerSettings::default(),
    );
    consumer.start().await.unwrap();

    let start = Utc.with_ymd_and_hms(2025, 7, 29, 9, 0, 0).unwrap();
    let record = WorkRecord::with_id("A1".into(), "caller-app", start);
    publisher.publish("ProcessQueue", &record).await.unwrap();
    publisher.publish("ProcessQueue", &record).await.unwrap();

    let reader = broker.channel();
    let mut deliveries = reader.consume("ProcessQueue", "scenario").await.unwrap();

    let first = deliveries.next().await.unwrap().unwrap();
    assert_eq!(
        consumer.handle_delivery(first).await.unwrap(),
        DeliveryOutcome::Persisted("A1".into())
    );
    assert!(store.exists(&"A1".into()).await.unwrap());

    let second = deliveries.next().await.unwrap().unwrap();
    assert_eq!(
        consumer.handle_delivery(second).await.unwrap(),
        DeliveryOutcome::Duplicate("A1".into())
    );

    let stored = store.get(&"A1".into()).await.unwrap().unwrap();
    assert_eq!(store.len(), 1);
    assert_eq!(stored.source_service(), "caller-app");
    assert_eq!(stored.start_time(), start);
    assert!(stored.end_time().unwrap() >= start);
    assert_eq!(broker.ready_count("ProcessQueue"), 0);
    assert_eq!(broker.unacked_count(), 0);
    assert!(broker.dead_letters("dlx").is_empty());
}

#[tokio::test]
async fn unacknowledged_work_survives_a_consumer_restart() {
    let broker = MemoryBroker::new();
    let store = Arc::new(MemoryStore::new());
    let publisher = QueuePublisher::new(Arc::new(broker.channel()));
    publisher
        .publish("ProcessQueue", &WorkRecord::new("caller-app"))
        .await
        .unwrap();

    // A consumer takes the message and goes away without settling it.
    let crashed = broker.channel();
    let mut deliveries = crashed.consume("ProcessQueue", "crashed").await.unwrap();
    let _taken = deliveries.next().await.unwrap().unwrap();
    drop(deliveries);
    crashed.close().await.unwrap();
    assert_eq!(broker.ready_count("ProcessQueue"), 1);

    let consumer = Arc::new(QueueConsumer::new(
        Arc::new(broker.channel()),
        store.clone(),
        ConsumerSettings::default(),
    ));
    let shutdown = CancellationToken::new();
    let task = tokio::spawn({
        let consumer = consumer.clone();
        let shutdown = shutdown.clone();
        async move { consumer.run(shutdown).await }
    });

    tokio::time::timeout(Duration::from_secs(5), async {
        while store.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    shutdown.cancel();
    task.await.unwrap().unwrap();
    assert_eq!(store.len(), 1);
    assert_eq!(broker.ready_count("ProcessQueue"), 0);
}
