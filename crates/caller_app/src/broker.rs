use std::sync::Arc;

use request_pipeline::config::PipelineConfig;
#[cfg(feature = "amqp")]
use request_pipeline::queue::amqp::AmqpConnection;
#[cfg(not(feature = "amqp"))]
use request_pipeline::queue::memory::MemoryBroker;
use request_pipeline::queue::{BrokerChannel, QueueError};

/// The broker this build talks to: RabbitMQ with the `amqp` feature, in-process otherwise.
pub struct Broker {
    #[cfg(feature = "amqp")]
    connection: AmqpConnection,
    #[cfg(not(feature = "amqp"))]
    memory: MemoryBroker,
}

impl Broker {
    #[cfg(feature = "amqp")]
    pub async fn connect(config: &PipelineConfig) -> Result<Self, QueueError> {
        let connection = AmqpConnection::connect(&config.amqp_url).await?;
        Ok(Self { connection })
    }

    #[cfg(not(feature = "amqp"))]
    pub async fn connect(_config: &PipelineConfig) -> Result<Self, QueueError> {
        info!("Using in-process broker; build with the `amqp` feature for RabbitMQ");
        Ok(Self {
            memory: MemoryBroker::new(),
        })
    }

    #[cfg(feature = "amqp")]
    pub async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, QueueError> {
        Ok(Arc::new(self.connection.channel().await?))
    }

    #[cfg(not(feature = "amqp"))]
    pub async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, QueueError> {
        Ok(Arc::new(self.memory.channel()))
    }

    #[cfg(feature = "amqp")]
    pub async fn close(&self) -> Result<(), QueueError> {
        self.connection.close().await
    }

    #[cfg(not(feature = "amqp"))]
    pub async fn close(&self) -> Result<(), QueueError> {
        self.memory.disconnect();
        Ok(())
    }
}
