#[macro_use]
extern crate tracing;

mod broker;
mod console;

use std::sync::Arc;

use request_pipeline::config::PipelineConfig;
use request_pipeline::generator::RequestGenerator;
use request_pipeline::generator::reqwest_integration::ReqwestService;
use request_pipeline::processor::Processor;
use request_pipeline::queue::{QueueConsumer, QueuePublisher};
use request_pipeline::store::{MemoryStore, RecordStore};
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::broker::Broker;
use crate::console::{Console, HELP};

const LOG_FILE_NAME: &str = "caller_app.log";

fn init_tracing() -> Result<WorkerGuard, request_pipeline::Error> {
    let file_appender = tracing_appender::rolling::daily(".", LOG_FILE_NAME);
    let (non_blocking_appender, guard) = tracing_appender::non_blocking(file_appender);

    let default_filter = "info,request_pipeline=info,caller_app=info";
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true)
        .with_level(true);
    let file_layer = fmt::layer()
        .with_writer(non_blocking_appender)
        .with_ansi(false)
        .with_target(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<(), request_pipeline::Error> {
    let _guard = init_tracing()?;

    if dotenvy::dotenv().is_ok() {
        info!(".env file loaded successfully.");
    } else {
        info!("No .env file found. Proceeding with environment variables or defaults.");
    }
    let config = PipelineConfig::from_env();
    let shutdown = CancellationToken::new();

    let generator = Arc::new(RequestGenerator::new(
        ReqwestService::new(),
        config.generator.clone(),
    )?);
    let generator_task = generator.clone().spawn(shutdown.clone());

    let broker = Broker::connect(&config).await?;
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());

    let consumer = QueueConsumer::new(broker.channel().await?, store.clone(), config.consumer.clone());
    let mut consumer_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { consumer.run(shutdown).await }
    });

    let publisher = QueuePublisher::with_dead_letter_exchange(
        broker.channel().await?,
        config.dead_letter_exchange(),
    );
    let processor = Processor::new(store, publisher, config.processor.clone());
    let console = Console::new(generator, processor, config.queue().to_string());
    println!("{}", HELP);

    let consumer_result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down");
            None
        }
        _ = console.run(shutdown.clone()) => {
            info!("Console quit, shutting down");
            None
        }
        result = &mut consumer_task => Some(result),
    };
    shutdown.cancel();

    generator_task.await?;
    let consumer_result = match consumer_result {
        Some(result) => result,
        None => consumer_task.await,
    };
    if let Err(error) = broker.close().await {
        warn!(%error, "Failed to close broker connection");
    }
    consumer_result??;

    info!("Caller app stopped");
    Ok(())
}
