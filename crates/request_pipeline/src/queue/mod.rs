//! Durable queue pipeline: publisher, consumer and the broker seam they share.
//!
//! The broker itself is an external collaborator. [`BrokerChannel`] is the narrow slice of it
//! the pipeline uses: declare a fan-out dead-letter exchange, declare a durable queue routed to
//! it, publish persistent messages, limit unacknowledged deliveries and consume.
//! [`memory::MemoryBroker`] implements it in-process; with the `amqp` feature,
//! `amqp::AmqpChannel` talks to RabbitMQ.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod consumer;
pub mod memory;
pub mod publisher;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use snafu::Snafu;

pub use self::consumer::{ConsumerSettings, DeliveryOutcome, FailurePolicy, QueueConsumer};
pub use self::publisher::QueuePublisher;

pub const DEFAULT_QUEUE: &str = "ProcessQueue";
pub const DEFAULT_DEAD_LETTER_EXCHANGE: &str = "dlx";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum QueueError {
    #[snafu(display("Broker error: {}", source))]
    Broker { source: crate::Error },

    #[snafu(display("Failed to encode work record: {}", source))]
    Encode { source: serde_json::Error },

    #[snafu(display("Queue '{}' has not been declared", queue))]
    UnknownQueue { queue: String },

    #[snafu(display("Channel is closed"))]
    ChannelClosed,

    #[snafu(display("Connection to the broker was lost"))]
    ConnectionLost,
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), QueueError>;

    /// Negative acknowledgement. Without `requeue` the broker routes the message to the queue's
    /// dead-letter exchange.
    async fn nack(&self, requeue: bool) -> Result<(), QueueError>;
}

/// One message handed to a consumer.
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub body: Bytes,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        redelivered: bool,
        body: Bytes,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            redelivered,
            body,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<(), QueueError> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), QueueError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, QueueError>>;

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares a durable fan-out exchange. Idempotent.
    async fn declare_dead_letter_exchange(&self, exchange: &str) -> Result<(), QueueError>;

    /// Declares a durable, non-exclusive, non-auto-delete queue whose rejected messages route
    /// to `dead_letter_exchange`. Idempotent.
    async fn declare_queue(&self, queue: &str, dead_letter_exchange: &str)
    -> Result<(), QueueError>;

    /// Publishes `body` to `queue` through the default exchange. Returns once the broker has
    /// accepted the message.
    async fn publish(&self, queue: &str, body: Bytes, persistent: bool) -> Result<(), QueueError>;

    /// Limits delivered-but-unacknowledged messages on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<(), QueueError>;

    /// Starts consuming with manual acknowledgement.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, QueueError>;

    /// Closes the channel; unacknowledged deliveries go back to the broker for redelivery.
    async fn close(&self) -> Result<(), QueueError>;
}
