use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use snafu::Snafu;

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum ConfigError {
    #[snafu(display("Target URL must not be empty"))]
    EmptyTarget,
}

/// Live control block of the request generator.
///
/// Each field is its own atomic cell. Writers update fields one at a time and the loop re-reads
/// them at every cycle boundary, so a reader may briefly pair a new interval with an old burst
/// count. Numeric writes are clamped to at least 1.
#[derive(Debug)]
pub struct RuntimeConfig {
    interval_secs: AtomicU64,
    burst_count: AtomicUsize,
    max_burst: usize,
    target_url: ArcSwap<String>,
    paused: AtomicBool,
    last_cycle_succeeded: AtomicBool,
    cycles_completed: AtomicU64,
    last_cycle_calls: AtomicUsize,
    last_cycle_failures: AtomicUsize,
}

/// Point-in-time view of the generator for the control surface.
///
/// Assembled from independent reads, so it is not a transactional snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorStatus {
    pub interval_seconds: u64,
    pub burst_count: usize,
    pub max_burst_count: usize,
    pub target_url: String,
    pub paused: bool,
    pub healthy: bool,
    pub cycles_completed: u64,
    pub last_cycle_calls: usize,
    pub last_cycle_failures: usize,
}

/// Upper bound on the burst size unless configured otherwise.
pub const DEFAULT_MAX_BURST: usize = 1_000;

fn clamp_positive(value: i64) -> u64 {
    value.max(1) as u64
}

fn clamp_burst(value: i64, max: usize) -> usize {
    clamp_positive(value).min(max as u64) as usize
}

impl RuntimeConfig {
    pub fn new(
        interval_secs: i64,
        burst_count: i64,
        target_url: &str,
        paused: bool,
    ) -> Result<Self, ConfigError> {
        Self::with_max_burst(interval_secs, burst_count, DEFAULT_MAX_BURST, target_url, paused)
    }

    /// Like [`RuntimeConfig::new`], with burst writes capped at `max_burst` (itself at least 1).
    pub fn with_max_burst(
        interval_secs: i64,
        burst_count: i64,
        max_burst: usize,
        target_url: &str,
        paused: bool,
    ) -> Result<Self, ConfigError> {
        let target_url = normalize_target(target_url)?;
        let max_burst = max_burst.max(1);
        Ok(Self {
            interval_secs: AtomicU64::new(clamp_positive(interval_secs)),
            burst_count: AtomicUsize::new(clamp_burst(burst_count, max_burst)),
            max_burst,
            target_url: ArcSwap::from_pointee(target_url),
            paused: AtomicBool::new(paused),
            last_cycle_succeeded: AtomicBool::new(false),
            cycles_completed: AtomicU64::new(0),
            last_cycle_calls: AtomicUsize::new(0),
            last_cycle_failures: AtomicUsize::new(0),
        })
    }

    /// Stores the interval, clamped to at least one second, and returns the stored value.
    pub fn set_interval(&self, seconds: i64) -> u64 {
        let seconds = clamp_positive(seconds);
        self.interval_secs.store(seconds, Ordering::Relaxed);
        seconds
    }

    pub fn interval_secs(&self) -> u64 {
        self.interval_secs.load(Ordering::Relaxed)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs())
    }

    /// Stores the burst size, clamped to `1..=max_burst`, and returns the stored value.
    pub fn set_burst(&self, count: i64) -> usize {
        let count = clamp_burst(count, self.max_burst);
        self.burst_count.store(count, Ordering::Relaxed);
        count
    }

    pub fn burst_count(&self) -> usize {
        self.burst_count.load(Ordering::Relaxed)
    }

    pub fn max_burst(&self) -> usize {
        self.max_burst
    }

    /// Replaces the target with the trimmed `url`. An empty value is rejected and the previous
    /// target stays in place.
    pub fn set_target(&self, url: &str) -> Result<(), ConfigError> {
        let url = normalize_target(url)?;
        self.target_url.store(Arc::new(url));
        Ok(())
    }

    pub fn target_url(&self) -> Arc<String> {
        self.target_url.load_full()
    }

    /// Returns true when the call changed the state.
    pub fn pause(&self) -> bool {
        !self.paused.swap(true, Ordering::Relaxed)
    }

    /// Returns true when the call changed the state.
    pub fn resume(&self) -> bool {
        self.paused.swap(false, Ordering::Relaxed)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn last_cycle_succeeded(&self) -> bool {
        self.last_cycle_succeeded.load(Ordering::Relaxed)
    }

    pub fn is_healthy(&self) -> bool {
        self.last_cycle_succeeded() && !self.is_paused()
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.load(Ordering::Relaxed)
    }

    pub(crate) fn record_cycle(&self, calls: usize, failures: usize) {
        self.last_cycle_calls.store(calls, Ordering::Relaxed);
        self.last_cycle_failures.store(failures, Ordering::Relaxed);
        self.last_cycle_succeeded
            .store(failures == 0, Ordering::Relaxed);
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GeneratorStatus {
        GeneratorStatus {
            interval_seconds: self.interval_secs(),
            burst_count: self.burst_count(),
            max_burst_count: self.max_burst,
            target_url: self.target_url().as_ref().clone(),
            paused: self.is_paused(),
            healthy: self.is_healthy(),
            cycles_completed: self.cycles_completed(),
            last_cycle_calls: self.last_cycle_calls.load(Ordering::Relaxed),
            last_cycle_failures: self.last_cycle_failures.load(Ordering::Relaxed),
        }
    }
}

fn normalize_target(url: &str) -> Result<String, ConfigError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::EmptyTarget);
    }
    Ok(trimmed.to_string())
}
