use std::sync::Arc;

use bytes::Bytes;
use snafu::ResultExt;

use super::{BrokerChannel, DEFAULT_DEAD_LETTER_EXCHANGE, EncodeSnafu, QueueError};
use crate::internal_event::{WorkRecordPublished, emit};
use crate::record::WorkRecord;

/// Makes work records durably available for asynchronous processing.
///
/// Every publish re-declares the dead-letter exchange and the target queue; both declarations
/// are idempotent on the broker. Failures are returned to the caller as-is, there is no local
/// retry.
#[derive(Clone)]
pub struct QueuePublisher {
    channel: Arc<dyn BrokerChannel>,
    dead_letter_exchange: String,
}

impl QueuePublisher {
    pub fn new(channel: Arc<dyn BrokerChannel>) -> Self {
        Self::with_dead_letter_exchange(channel, DEFAULT_DEAD_LETTER_EXCHANGE)
    }

    pub fn with_dead_letter_exchange(
        channel: Arc<dyn BrokerChannel>,
        dead_letter_exchange: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            dead_letter_exchange: dead_letter_exchange.into(),
        }
    }

    pub fn dead_letter_exchange(&self) -> &str {
        &self.dead_letter_exchange
    }

    /// Returns once the broker has accepted `record` for durable storage.
    pub async fn publish(&self, queue: &str, record: &WorkRecord) -> Result<(), QueueError> {
        self.channel
            .declare_dead_letter_exchange(&self.dead_letter_exchange)
            .await?;
        self.channel
            .declare_queue(queue, &self.dead_letter_exchange)
            .await?;

        let body = record.to_json().context(EncodeSnafu)?;
        self.channel.publish(queue, Bytes::from(body), true).await?;

        emit(WorkRecordPublished {
            queue,
            id: record.id(),
        });
        Ok(())
    }
}
