use std::sync::Arc;

use bon::Builder;
use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{
    BrokerChannel, DEFAULT_DEAD_LETTER_EXCHANGE, DEFAULT_QUEUE, Delivery, QueueError,
};
use crate::internal_event::{
    DeliveryDiscarded, DeliveryRejected, DuplicateDeliverySkipped, WorkRecordPersisted, emit,
};
use crate::processor::SimulatedWork;
use crate::record::{RecordId, WorkRecord};
use crate::store::{RecordStore, StoreError};

/// What happens to a delivery whose record could not be persisted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Reject without requeue; the broker moves the message to the dead-letter exchange.
    #[default]
    DeadLetter,
    /// Reject with requeue; the broker delivers the message again.
    Requeue,
}

impl FailurePolicy {
    pub const fn requeue(self) -> bool {
        matches!(self, FailurePolicy::Requeue)
    }
}

/// Consumer configuration.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `queue` | `ProcessQueue` | Queue to consume |
/// | `dead_letter_exchange` | `dlx` | Fan-out exchange receiving rejected messages |
/// | `prefetch` | 1 | Unacknowledged deliveries allowed in flight |
/// | `consumer_tag` | `request-pipeline-consumer` | Identifies the subscription on the broker |
/// | `failure_policy` | `DeadLetter` | Fate of messages whose persistence failed |
/// | `simulated_work` | none | Optional delay before persisting each record |
#[derive(Clone, Debug, Builder)]
pub struct ConsumerSettings {
    #[builder(into, default = DEFAULT_QUEUE.to_string())]
    pub(crate) queue: String,

    #[builder(into, default = DEFAULT_DEAD_LETTER_EXCHANGE.to_string())]
    pub(crate) dead_letter_exchange: String,

    #[builder(default = 1)]
    pub(crate) prefetch: u16,

    #[builder(into, default = "request-pipeline-consumer".to_string())]
    pub(crate) consumer_tag: String,

    #[builder(default)]
    pub(crate) failure_policy: FailurePolicy,

    pub(crate) simulated_work: Option<SimulatedWork>,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Terminal state of one delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Stored for the first time, then acknowledged.
    Persisted(RecordId),
    /// Already stored; acknowledged without writing.
    Duplicate(RecordId),
    /// Empty or undecodable body; acknowledged and dropped.
    Discarded,
    /// Persistence failed; negatively acknowledged.
    Rejected { id: RecordId, requeued: bool },
}

/// Persists queued work records, exactly once in effect.
///
/// A delivery moves `Received → Decoded → Persisted → Acknowledged`, or ends rejected when
/// persistence fails. Redelivery of an already stored record is acknowledged as a no-op.
pub struct QueueConsumer {
    channel: Arc<dyn BrokerChannel>,
    store: Arc<dyn RecordStore>,
    settings: ConsumerSettings,
}

impl QueueConsumer {
    pub fn new(
        channel: Arc<dyn BrokerChannel>,
        store: Arc<dyn RecordStore>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            channel,
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Declares the dead-letter topology and applies the prefetch limit.
    pub async fn start(&self) -> Result<(), QueueError> {
        self.channel
            .declare_dead_letter_exchange(&self.settings.dead_letter_exchange)
            .await?;
        self.channel
            .declare_queue(&self.settings.queue, &self.settings.dead_letter_exchange)
            .await?;
        self.channel.set_prefetch(self.settings.prefetch).await
    }

    /// Consumes until `shutdown` fires, then closes the channel.
    ///
    /// A delivery being handled when shutdown arrives is finished first. Losing the broker is
    /// fatal: the delivery stream ending on its own yields [`QueueError::ConnectionLost`].
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), QueueError> {
        self.start().await?;
        let mut deliveries = self
            .channel
            .consume(&self.settings.queue, &self.settings.consumer_tag)
            .await?;
        info!(
            target: "request_pipeline::queue",
            queue = %self.settings.queue,
            prefetch = self.settings.prefetch,
            failure_policy = ?self.settings.failure_policy,
            "Queue consumer started"
        );

        let result = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        if let Err(error) = self.handle_delivery(delivery).await {
                            break Err(error);
                        }
                    }
                    Some(Err(error)) => break Err(error),
                    None => break Err(QueueError::ConnectionLost),
                },
            }
        };
        drop(deliveries);

        if let Err(error) = self.channel.close().await {
            warn!(target: "request_pipeline::queue", %error, "Failed to close consumer channel");
        }
        match &result {
            Ok(()) => info!(target: "request_pipeline::queue", "Queue consumer stopped"),
            Err(error) => error!(target: "request_pipeline::queue", %error, "Queue consumer failed"),
        }
        result
    }

    /// Settles one delivery and reports how.
    ///
    /// Only broker errors (the ack or nack itself failing) are returned as `Err`; everything
    /// about the message is absorbed into the outcome.
    pub async fn handle_delivery(&self, delivery: Delivery) -> Result<DeliveryOutcome, QueueError> {
        if delivery.body.iter().all(u8::is_ascii_whitespace) {
            emit(DeliveryDiscarded {
                delivery_tag: delivery.delivery_tag,
                reason: "empty body",
            });
            delivery.ack().await?;
            return Ok(DeliveryOutcome::Discarded);
        }

        let record = match WorkRecord::from_json(&delivery.body) {
            Ok(record) => record,
            Err(error) => {
                // Nothing could ever decode it, so a retry target does not exist.
                emit(DeliveryDiscarded {
                    delivery_tag: delivery.delivery_tag,
                    reason: &error.to_string(),
                });
                delivery.ack().await?;
                return Ok(DeliveryOutcome::Discarded);
            }
        };

        let id = record.id().clone();
        match self.persist(record, delivery.redelivered).await {
            Ok(outcome) => {
                delivery.ack().await?;
                Ok(outcome)
            }
            Err(error) => {
                let requeue = self.settings.failure_policy.requeue();
                emit(DeliveryRejected {
                    id: Some(&id),
                    requeue,
                    error: &error,
                });
                delivery.nack(requeue).await?;
                Ok(DeliveryOutcome::Rejected {
                    id,
                    requeued: requeue,
                })
            }
        }
    }

    async fn persist(
        &self,
        mut record: WorkRecord,
        redelivered: bool,
    ) -> Result<DeliveryOutcome, StoreError> {
        if let Some(work) = &self.settings.simulated_work {
            work.perform().await;
        }
        record.complete(Utc::now());

        if self.store.exists(record.id()).await? {
            emit(DuplicateDeliverySkipped {
                id: record.id(),
                redelivered,
            });
            return Ok(DeliveryOutcome::Duplicate(record.id().clone()));
        }

        match self.store.insert(&record).await {
            Ok(()) => {
                emit(WorkRecordPersisted {
                    id: record.id(),
                    duration: record.duration().and_then(|d| d.to_std().ok()),
                });
                Ok(DeliveryOutcome::Persisted(record.id().clone()))
            }
            // Lost the race against a concurrent delivery of the same id.
            Err(StoreError::Duplicate { .. }) => {
                emit(DuplicateDeliverySkipped {
                    id: record.id(),
                    redelivered,
                });
                Ok(DeliveryOutcome::Duplicate(record.id().clone()))
            }
            Err(error) => Err(error),
        }
    }
}
