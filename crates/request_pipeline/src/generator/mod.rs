//! Self-throttling outbound request generator.
//!
//! Once per interval, unless paused, the generator fires a burst of concurrent `GET` calls at the
//! configured target, waits for all of them, and records whether every call succeeded. The
//! interval, burst size and target live in a [`RuntimeConfig`] that can be changed while the
//! loop runs; changes apply from the next cycle boundary.

pub mod http;
pub mod reqwest_integration;
pub mod runtime_config;

use std::sync::Arc;
use std::time::Duration;

use ::http::Request as HttpRequest;
use bon::Builder;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt, timeout::Timeout};

use self::http::HttpError;
use self::reqwest_integration::ResponseStatus;
pub use self::runtime_config::{ConfigError, DEFAULT_MAX_BURST, GeneratorStatus, RuntimeConfig};
use crate::internal_event::{
    BurstCycleCompleted, GeneratorPauseChanged, OutboundCallFailed, RuntimeConfigChanged, emit,
};

pub const DEFAULT_TARGET_URL: &str = "http://processor-api:9002/process";

/// Start-up values of the generator.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `interval_secs` | 5 | Wait after each burst before the next one (clamped to ≥ 1) |
/// | `burst_count` | 1 | Concurrent calls per cycle (clamped to `1..=max_burst_count`) |
/// | `max_burst_count` | 1000 | Largest burst any write may set |
/// | `target_url` | `http://processor-api:9002/process` | Destination of every call |
/// | `start_paused` | false | Begin in the paused state |
/// | `pause_poll_interval` | 1s | How often a paused loop re-checks the pause flag |
/// | `request_timeout` | 30s | Per-call deadline; an elapsed call counts as failed |
#[derive(Clone, Debug, Builder)]
pub struct GeneratorSettings {
    #[builder(default = 5)]
    pub(crate) interval_secs: i64,

    #[builder(default = 1)]
    pub(crate) burst_count: i64,

    #[builder(default = DEFAULT_MAX_BURST)]
    pub(crate) max_burst_count: usize,

    #[builder(into, default = DEFAULT_TARGET_URL.to_string())]
    pub(crate) target_url: String,

    #[builder(default)]
    pub(crate) start_paused: bool,

    #[builder(default = Duration::from_secs(1))]
    pub(crate) pause_poll_interval: Duration,

    #[builder(default = Duration::from_secs(30))]
    pub(crate) request_timeout: Duration,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Result of one burst.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CycleOutcome {
    pub calls: usize,
    pub failures: usize,
}

impl CycleOutcome {
    pub const fn succeeded(&self) -> bool {
        self.failures == 0
    }
}

pub struct RequestGenerator<S> {
    config: Arc<RuntimeConfig>,
    service: S,
    pause_poll_interval: Duration,
    request_timeout: Duration,
}

impl<S> RequestGenerator<S> {
    pub fn new(service: S, settings: GeneratorSettings) -> Result<Self, ConfigError> {
        let config = RuntimeConfig::with_max_burst(
            settings.interval_secs,
            settings.burst_count,
            settings.max_burst_count,
            &settings.target_url,
            settings.start_paused,
        )?;
        Ok(Self {
            config: Arc::new(config),
            service,
            pause_poll_interval: settings.pause_poll_interval,
            request_timeout: settings.request_timeout,
        })
    }

    pub fn config(&self) -> &Arc<RuntimeConfig> {
        &self.config
    }

    pub fn set_interval(&self, seconds: i64) -> u64 {
        let stored = self.config.set_interval(seconds);
        emit(RuntimeConfigChanged {
            field: "interval_seconds",
            value: &stored,
        });
        stored
    }

    pub fn set_burst(&self, count: i64) -> usize {
        let stored = self.config.set_burst(count);
        emit(RuntimeConfigChanged {
            field: "burst_count",
            value: &stored,
        });
        stored
    }

    pub fn set_target(&self, url: &str) -> Result<(), ConfigError> {
        self.config.set_target(url)?;
        emit(RuntimeConfigChanged {
            field: "target_url",
            value: &self.config.target_url(),
        });
        Ok(())
    }

    pub fn pause(&self) {
        if self.config.pause() {
            emit(GeneratorPauseChanged { paused: true });
        }
    }

    pub fn resume(&self) {
        if self.config.resume() {
            emit(GeneratorPauseChanged { paused: false });
        }
    }

    pub fn is_paused(&self) -> bool {
        self.config.is_paused()
    }

    /// True only when the last completed cycle fully succeeded and the generator is running.
    pub fn is_healthy(&self) -> bool {
        self.config.is_healthy()
    }

    pub fn status(&self) -> GeneratorStatus {
        self.config.snapshot()
    }
}

impl<S> RequestGenerator<S>
where
    S: Service<HttpRequest<Option<reqwest::Body>>> + Clone + Send + Sync + 'static,
    S::Response: ResponseStatus + Send,
    S::Error: Into<crate::Error>,
    S::Future: Send,
{
    /// Drives the loop until `shutdown` fires.
    ///
    /// Cancellation is observed while waiting (interval or pause poll); an in-flight burst is
    /// always allowed to finish.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            target: "request_pipeline::generator",
            interval_secs = self.config.interval_secs(),
            burst_count = self.config.burst_count(),
            target_url = %self.config.target_url(),
            paused = self.config.is_paused(),
            "Request generator started"
        );

        while !shutdown.is_cancelled() {
            let wait = if self.config.is_paused() {
                self.pause_poll_interval
            } else {
                self.run_cycle().await;
                // Re-read here so a change made during the burst is honored immediately.
                self.config.interval()
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!(target: "request_pipeline::generator", "Request generator stopped");
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Issues one burst and records its outcome.
    ///
    /// All calls are awaited even when one fails early, so a cycle always takes as long as its
    /// slowest call.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let target = self.config.target_url();
        let calls = self.config.burst_count();
        let started = Instant::now();

        let results = join_all((0..calls).map(|_| self.call_once(target.as_str()))).await;
        let failures = results.iter().filter(|result| result.is_err()).count();

        self.config.record_cycle(calls, failures);
        emit(BurstCycleCompleted {
            calls,
            failures,
            elapsed: started.elapsed(),
        });

        CycleOutcome { calls, failures }
    }

    async fn call_once(&self, target: &str) -> Result<(), HttpError> {
        let result = self.send(target).await;
        if let Err(error) = &result {
            emit(OutboundCallFailed { target, error });
        }
        result
    }

    async fn send(&self, target: &str) -> Result<(), HttpError> {
        let request: HttpRequest<Option<reqwest::Body>> = HttpRequest::get(target)
            .body(None)
            .map_err(|e| HttpError::InvalidRequest {
                details: format!("Invalid target '{}': {}", target, e),
            })?;

        let service = Timeout::new(self.service.clone(), self.request_timeout);
        match service.oneshot(request).await {
            Ok(response) if response.is_success() => Ok(()),
            Ok(response) => Err(HttpError::ServerError {
                status: response.status().as_u16(),
                body: String::new(),
            }),
            Err(error) => Err(HttpError::from_boxed(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio_test::{assert_pending, assert_ready_eq, task};
    use tower::service_fn;
    use tower_test::mock;

    use super::*;

    type Request = HttpRequest<Option<reqwest::Body>>;
    type Response = ::http::Response<()>;

    const TARGET: &str = "http://target.test/process";

    fn response(status: u16) -> Response {
        ::http::Response::builder().status(status).body(()).unwrap()
    }

    /// Answers every call with 200 except the `fail_at`-th one (0-based), which gets a 500.
    fn scripted(
        hits: Arc<AtomicUsize>,
        fail_at: Option<usize>,
    ) -> impl Service<Request, Response = Response, Error = HttpError, Future: Send>
    + Clone
    + Send
    + Sync
    + 'static {
        service_fn(move |_request: Request| {
            let n = hits.fetch_add(1, Ordering::SeqCst);
            async move {
                if Some(n) == fail_at {
                    Ok(response(500))
                } else {
                    Ok(response(200))
                }
            }
        })
    }

    fn settings(burst: i64) -> GeneratorSettings {
        GeneratorSettings::builder()
            .burst_count(burst)
            .target_url(TARGET)
            .build()
    }

    #[tokio::test]
    async fn one_failed_call_fails_the_whole_cycle() {
        let hits = Arc::new(AtomicUsize::new(0));
        let generator = RequestGenerator::new(scripted(hits.clone(), Some(1)), settings(3)).unwrap();

        let outcome = generator.run_cycle().await;

        assert_eq!(outcome, CycleOutcome { calls: 3, failures: 1 });
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(!generator.config().last_cycle_succeeded());
        assert!(!generator.is_healthy());
    }

    #[tokio::test]
    async fn all_successful_calls_mark_the_cycle_healthy() {
        let hits = Arc::new(AtomicUsize::new(0));
        let generator = RequestGenerator::new(scripted(hits.clone(), None), settings(3)).unwrap();

        let outcome = generator.run_cycle().await;

        assert!(outcome.succeeded());
        assert!(generator.config().last_cycle_succeeded());
        assert!(generator.is_healthy());
        assert_eq!(generator.status().last_cycle_calls, 3);
    }

    #[tokio::test]
    async fn transport_errors_count_as_failures() {
        let service = service_fn(|_request: Request| async {
            Err::<Response, _>(HttpError::Transport {
                source: "connection refused".into(),
            })
        });
        let generator = RequestGenerator::new(service, settings(2)).unwrap();

        let outcome = generator.run_cycle().await;

        assert_eq!(outcome.failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out_and_fail() {
        let service = service_fn(|_request: Request| async {
            tokio::time::sleep(Duration::from_secs(120)).await;
            Ok::<_, HttpError>(response(200))
        });
        let settings = GeneratorSettings::builder()
            .target_url(TARGET)
            .request_timeout(Duration::from_secs(2))
            .build();
        let generator = RequestGenerator::new(service, settings).unwrap();

        let started = Instant::now();
        let outcome = generator.run_cycle().await;

        assert_eq!(outcome.failures, 1);
        assert!(started.elapsed() < Duration::from_secs(120));
    }

    #[tokio::test]
    async fn burst_waits_for_every_call_even_after_a_failure() {
        let (service, mut handle) = mock::pair::<Request, Response>();
        let generator = RequestGenerator::new(service, settings(3)).unwrap();

        let mut cycle = task::spawn(generator.run_cycle());
        assert_pending!(cycle.poll());

        let mut pending = Vec::new();
        for _ in 0..3 {
            let (request, send) = handle.next_request().await.unwrap();
            assert_eq!(request.uri(), TARGET);
            pending.push(send);
        }
        let last = pending.pop().unwrap();
        let mut pending = pending.into_iter();
        pending.next().unwrap().send_error("boom");
        pending.next().unwrap().send_response(response(200));
        assert_pending!(cycle.poll());

        last.send_response(response(201));
        assert_ready_eq!(cycle.poll(), CycleOutcome { calls: 3, failures: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn paused_generator_issues_nothing_until_resumed() {
        let hits = Arc::new(AtomicUsize::new(0));
        let settings = GeneratorSettings::builder()
            .burst_count(2)
            .target_url(TARGET)
            .start_paused(true)
            .build();
        let generator = Arc::new(RequestGenerator::new(scripted(hits.clone(), None), settings).unwrap());
        let shutdown = CancellationToken::new();
        let task = generator.clone().spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(generator.is_paused());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(generator.config().cycles_completed(), 0);

        generator.resume();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(generator.is_healthy());

        generator.pause();
        assert!(generator.is_paused());
        assert!(!generator.is_healthy());

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn config_changes_apply_from_the_next_cycle() {
        let hits = Arc::new(AtomicUsize::new(0));
        let settings = GeneratorSettings::builder()
            .interval_secs(10)
            .burst_count(1)
            .target_url(TARGET)
            .build();
        let generator = Arc::new(RequestGenerator::new(scripted(hits.clone(), None), settings).unwrap());
        let shutdown = CancellationToken::new();
        let task = generator.clone().spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert_eq!(generator.set_burst(3), 3);
        assert_eq!(generator.set_interval(0), 1);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 4);

        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(generator.config().cycles_completed(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_interval_wait() {
        let hits = Arc::new(AtomicUsize::new(0));
        let settings = GeneratorSettings::builder()
            .interval_secs(3_600)
            .target_url(TARGET)
            .build();
        let generator = Arc::new(RequestGenerator::new(scripted(hits, None), settings).unwrap());
        let shutdown = CancellationToken::new();
        let task = generator.clone().spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_secs(1)).await;
        let cancelled_at = Instant::now();
        shutdown.cancel();
        task.await.unwrap();

        assert!(cancelled_at.elapsed() < Duration::from_secs(1));
        assert_eq!(generator.config().cycles_completed(), 1);
    }

    #[tokio::test]
    async fn oversized_burst_requests_are_capped() {
        let hits = Arc::new(AtomicUsize::new(0));
        let settings = GeneratorSettings::builder()
            .burst_count(2)
            .max_burst_count(8)
            .target_url(TARGET)
            .build();
        let generator = RequestGenerator::new(scripted(hits.clone(), None), settings).unwrap();

        assert_eq!(generator.set_burst(i64::MAX), 8);
        let outcome = generator.run_cycle().await;

        assert_eq!(outcome, CycleOutcome { calls: 8, failures: 0 });
        assert_eq!(hits.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn empty_target_is_rejected_at_construction() {
        let settings = GeneratorSettings::builder().target_url("  ").build();

        let service = service_fn(|_: Request| async { Ok::<_, HttpError>(response(200)) });

        let result = RequestGenerator::new(service, settings);

        assert!(matches!(result, Err(ConfigError::EmptyTarget)));
    }
}
