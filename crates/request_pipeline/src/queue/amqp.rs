//! RabbitMQ-backed [`BrokerChannel`] over AMQP 0-9-1.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};

use super::{Acknowledger, BrokerChannel, Delivery, DeliveryStream, QueueError};

const DEAD_LETTER_ARGUMENT: &str = "x-dead-letter-exchange";
const PERSISTENT_DELIVERY_MODE: u8 = 2;
const TRANSIENT_DELIVERY_MODE: u8 = 1;

pub struct AmqpConnection {
    connection: Connection,
}

impl AmqpConnection {
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(broker_error)?;
        info!(target: "request_pipeline::queue", "Connected to AMQP broker");
        Ok(Self { connection })
    }

    pub async fn channel(&self) -> Result<AmqpChannel, QueueError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(broker_error)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(broker_error)?;
        Ok(AmqpChannel { channel })
    }

    pub async fn close(&self) -> Result<(), QueueError> {
        self.connection
            .close(200, "OK")
            .await
            .map_err(broker_error)
    }
}

pub struct AmqpChannel {
    channel: Channel,
}

fn queue_arguments(dead_letter_exchange: &str) -> FieldTable {
    let mut arguments = FieldTable::default();
    arguments.insert(
        DEAD_LETTER_ARGUMENT.into(),
        AMQPValue::LongString(dead_letter_exchange.into()),
    );
    arguments
}

fn broker_error(error: lapin::Error) -> QueueError {
    QueueError::Broker {
        source: Box::new(error),
    }
}

/// A publish only succeeds once the broker has taken responsibility for the message.
fn confirmation_result(confirmation: Confirmation) -> Result<(), QueueError> {
    match confirmation {
        Confirmation::Ack(_) => Ok(()),
        Confirmation::Nack(_) => Err(QueueError::Broker {
            source: "broker rejected the published message".into(),
        }),
        Confirmation::NotRequested => Err(QueueError::Broker {
            source: "publisher confirms are not enabled on this channel".into(),
        }),
    }
}

fn map_lapin(error: lapin::Error) -> QueueError {
    match error {
        lapin::Error::InvalidChannelState(_) => QueueError::ChannelClosed,
        lapin::Error::InvalidConnectionState(_) => QueueError::ConnectionLost,
        other => broker_error(other),
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_dead_letter_exchange(&self, exchange: &str) -> Result<(), QueueError> {
        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin)
    }

    async fn declare_queue(
        &self,
        queue: &str,
        dead_letter_exchange: &str,
    ) -> Result<(), QueueError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                queue_arguments(dead_letter_exchange),
            )
            .await
            .map(drop)
            .map_err(map_lapin)
    }

    async fn publish(&self, queue: &str, body: Bytes, persistent: bool) -> Result<(), QueueError> {
        let delivery_mode = if persistent {
            PERSISTENT_DELIVERY_MODE
        } else {
            TRANSIENT_DELIVERY_MODE
        };
        self.channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default().with_delivery_mode(delivery_mode),
            )
            .await
            .map_err(map_lapin)?
            .await
            .map_err(map_lapin)
            .and_then(confirmation_result)
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), QueueError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(map_lapin)
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, QueueError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin)?;

        Ok(consumer
            .map(|delivery| {
                delivery.map_err(map_lapin).map(|delivery| {
                    Delivery::new(
                        delivery.delivery_tag,
                        delivery.redelivered,
                        Bytes::from(delivery.data),
                        Box::new(AmqpAcker {
                            acker: delivery.acker,
                        }),
                    )
                })
            })
            .boxed())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.channel.close(200, "OK").await.map_err(map_lapin)
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), QueueError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(map_lapin)
    }

    async fn nack(&self, requeue: bool) -> Result<(), QueueError> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(map_lapin)
    }
}
