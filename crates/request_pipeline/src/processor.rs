//! Producer-side processing: record work inline or hand it to the queue.

use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use chrono::{DateTime, Utc};
use rand::Rng;
use snafu::{ResultExt, Snafu};

use crate::queue::{QueueError, QueuePublisher};
use crate::record::{RecordId, WorkRecord};
use crate::store::{RecordStore, StoreError};

pub const DEFAULT_SOURCE_SERVICE: &str = "caller-app";

/// Number of records [`Processor::recent`] is usually asked for.
pub const DEFAULT_RECENT_LIMIT: usize = 5;

#[derive(Debug, Snafu)]
pub enum ProcessError {
    #[snafu(display("Failed to store work record: {}", source))]
    Store { source: StoreError },

    #[snafu(display("Failed to enqueue work record: {}", source))]
    Enqueue { source: QueueError },
}

/// A uniformly distributed delay standing in for real work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimulatedWork {
    min: Duration,
    max: Duration,
}

impl SimulatedWork {
    /// Bounds are reordered if given backwards.
    pub fn between(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn pick(&self) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(min..=max))
    }

    pub async fn perform(&self) {
        tokio::time::sleep(self.pick()).await;
    }
}

impl Default for SimulatedWork {
    fn default() -> Self {
        Self::between(Duration::ZERO, Duration::from_secs(5))
    }
}

#[derive(Clone, Debug, Builder)]
pub struct ProcessorSettings {
    #[builder(into, default = DEFAULT_SOURCE_SERVICE.to_string())]
    pub(crate) source_service: String,

    #[builder(default)]
    pub(crate) simulated_work: SimulatedWork,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

pub struct Processor {
    store: Arc<dyn RecordStore>,
    publisher: QueuePublisher,
    settings: ProcessorSettings,
}

impl Processor {
    pub fn new(
        store: Arc<dyn RecordStore>,
        publisher: QueuePublisher,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            store,
            publisher,
            settings,
        }
    }

    /// Stores a new record, performs the work, then stamps its end time.
    pub async fn process_inline(&self) -> Result<RecordId, ProcessError> {
        let mut record = WorkRecord::new(self.settings.source_service.clone());
        self.store.insert(&record).await.context(StoreSnafu)?;

        self.settings.simulated_work.perform().await;

        record.complete(Utc::now());
        self.store.update(&record).await.context(StoreSnafu)?;
        debug!(
            target: "request_pipeline::processor",
            id = %record.id(),
            "Processed work record inline"
        );
        Ok(record.id().clone())
    }

    /// Enqueues a new record and returns its id without waiting for it to be processed.
    pub async fn process_via_queue(&self, queue: &str) -> Result<RecordId, ProcessError> {
        let record = WorkRecord::new(self.settings.source_service.clone());
        self.publisher
            .publish(queue, &record)
            .await
            .context(EnqueueSnafu)?;
        Ok(record.id().clone())
    }

    /// Up to `limit` records, newest start time first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<WorkRecord>, ProcessError> {
        self.store
            .query_recent(DateTime::<Utc>::MIN_UTC, limit)
            .await
            .context(StoreSnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::MemoryBroker;
    use crate::store::MemoryStore;

    fn processor(broker: &MemoryBroker, store: Arc<MemoryStore>) -> Processor {
        let settings = ProcessorSettings::builder()
            .source_service("test-app")
            .simulated_work(SimulatedWork::between(
                Duration::from_millis(100),
                Duration::from_millis(200),
            ))
            .build();
        Processor::new(store, QueuePublisher::new(Arc::new(broker.channel())), settings)
    }

    #[test]
    fn simulated_work_stays_within_bounds() {
        let work = SimulatedWork::between(Duration::from_millis(50), Duration::from_millis(10));
        for _ in 0..100 {
            let picked = work.pick();
            assert!(picked >= Duration::from_millis(10) && picked <= Duration::from_millis(50));
        }
        assert_eq!(
            SimulatedWork::between(Duration::ZERO, Duration::ZERO).pick(),
            Duration::ZERO
        );
    }

    #[tokio::test(start_paused = true)]
    async fn inline_processing_stores_a_completed_record() {
        let store = Arc::new(MemoryStore::new());
        let processor = processor(&MemoryBroker::new(), store.clone());

        let id = processor.process_inline().await.unwrap();

        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.source_service(), "test-app");
        assert!(stored.is_processed());
        assert!(stored.end_time().unwrap() >= stored.start_time());
    }

    #[tokio::test]
    async fn queued_processing_returns_before_anything_is_stored() {
        let broker = MemoryBroker::new();
        let store = Arc::new(MemoryStore::new());
        let processor = processor(&broker, store.clone());

        let id = processor.process_via_queue("ProcessQueue").await.unwrap();

        assert!(store.is_empty());
        assert_eq!(broker.ready_count("ProcessQueue"), 1);
        assert!(!id.as_str().is_empty());
    }

    #[tokio::test]
    async fn enqueue_failures_are_reported() {
        let broker = MemoryBroker::new();
        let processor = processor(&broker, Arc::new(MemoryStore::new()));
        broker.disconnect();

        let result = processor.process_via_queue("ProcessQueue").await;

        assert!(matches!(result, Err(ProcessError::Enqueue { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn recent_lists_newest_first() {
        let store = Arc::new(MemoryStore::new());
        let processor = processor(&MemoryBroker::new(), store.clone());
        let mut ids = Vec::new();
        for _ in 0..7 {
            ids.push(processor.process_inline().await.unwrap());
            // Wall clock drives start times; make them distinct.
            std::thread::sleep(Duration::from_millis(2));
        }

        let recent = processor.recent(DEFAULT_RECENT_LIMIT).await.unwrap();

        assert_eq!(recent.len(), 5);
        let expected: Vec<&RecordId> = ids.iter().rev().take(5).collect();
        let actual: Vec<&RecordId> = recent.iter().map(WorkRecord::id).collect();
        assert_eq!(actual, expected);
    }
}
