//! Self-throttling request generator and durable work-queue pipeline.
//!
//! Two cooperating pieces live in this crate:
//!
//! 1. **Request generator**: a background loop that, once per configured interval, fires a burst
//!    of concurrent outbound HTTP calls at a target and records whether every call succeeded.
//!    Interval, burst size, target and pause state can be changed while the loop runs.
//! 2. **Queue pipeline**: a publisher that declares a dead-letter topology and enqueues
//!    [`record::WorkRecord`]s durably, and a consumer that persists each record exactly once in
//!    effect despite at-least-once delivery, dead-lettering poison messages instead of looping.
//!
//! # Basic usage
//! ```no_run
//! use std::sync::Arc;
//! use request_pipeline::generator::{GeneratorSettings, RequestGenerator};
//! use request_pipeline::generator::reqwest_integration::ReqwestService;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), request_pipeline::Error> {
//! let settings = GeneratorSettings::builder()
//!     .target_url("http://127.0.0.1:9002/process".to_string())
//!     .burst_count(3)
//!     .build();
//! let generator = Arc::new(RequestGenerator::new(ReqwestService::new(), settings)?);
//! let shutdown = CancellationToken::new();
//! let task = generator.clone().spawn(shutdown.clone());
//!
//! generator.set_interval(2);
//! generator.pause();
//! shutdown.cancel();
//! task.await.ok();
//! # Ok(())
//! # }
//! ```
//!
//! # Concurrency
//! - Runtime configuration is a set of independently atomic cells; there is no cross-field lock.
//! - The generator and the consumer are cooperative tokio tasks honoring a single
//!   [`tokio_util::sync::CancellationToken`].
//!
//! # Metrics
//! Emits metrics and structured logs via the [`internal_event::InternalEvent`] trait.
pub mod config;
pub mod generator;
pub mod internal_event;
pub mod processor;
pub mod queue;
pub mod record;
pub mod store;

#[macro_use]
extern crate tracing;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
