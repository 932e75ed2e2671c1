use std::fmt;
use std::time::Duration;

use metrics::{counter, gauge, histogram};

use super::InternalEvent;
use crate::generator::http::HttpError;

#[derive(Clone, Copy, Debug)]
pub struct BurstCycleCompleted {
    pub calls: usize,
    pub failures: usize,
    pub elapsed: Duration,
}

impl InternalEvent for BurstCycleCompleted {
    fn emit(self) {
        let outcome = if self.failures == 0 { "success" } else { "failure" };
        counter!("generator_cycles_total", "outcome" => outcome).increment(1);
        counter!("generator_calls_total").increment(self.calls as u64);
        counter!("generator_call_failures_total").increment(self.failures as u64);
        // One value per cycle; the distribution is what matters when diagnosing a slow target.
        histogram!("generator_burst_duration_seconds").record(self.elapsed);

        if self.failures == 0 {
            debug!(
                target: "request_pipeline::generator",
                calls = self.calls,
                elapsed_ms = self.elapsed.as_millis(),
                "Burst completed"
            );
        } else {
            warn!(
                target: "request_pipeline::generator",
                calls = self.calls,
                failures = self.failures,
                elapsed_ms = self.elapsed.as_millis(),
                "Burst completed with failures"
            );
        }
    }
}

#[derive(Debug)]
pub struct OutboundCallFailed<'a> {
    pub target: &'a str,
    pub error: &'a HttpError,
}

impl InternalEvent for OutboundCallFailed<'_> {
    fn emit(self) {
        counter!("generator_call_errors_total", "kind" => self.error.kind()).increment(1);
        debug!(
            target: "request_pipeline::generator",
            target_url = %self.target,
            error = %self.error,
            "Error occurred during burst request"
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct GeneratorPauseChanged {
    pub paused: bool,
}

impl InternalEvent for GeneratorPauseChanged {
    fn emit(self) {
        gauge!("generator_paused").set(if self.paused { 1.0 } else { 0.0 });
        info!(target: "request_pipeline::generator", paused = self.paused, "Generator pause state changed");
    }
}

pub struct RuntimeConfigChanged<'a> {
    pub field: &'static str,
    pub value: &'a dyn fmt::Display,
}

impl fmt::Debug for RuntimeConfigChanged<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeConfigChanged")
            .field("field", &self.field)
            .field("value", &format_args!("{}", self.value))
            .finish()
    }
}

impl InternalEvent for RuntimeConfigChanged<'_> {
    fn emit(self) {
        counter!("generator_config_changes_total", "field" => self.field).increment(1);
        info!(
            target: "request_pipeline::generator",
            field = self.field,
            value = %self.value,
            "Runtime config updated; applies from the next cycle"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_change_debug_shows_the_displayed_value() {
        let burst = 3usize;
        let event = RuntimeConfigChanged {
            field: "burst_count",
            value: &burst,
        };

        assert_eq!(
            format!("{:?}", event),
            r#"RuntimeConfigChanged { field: "burst_count", value: 3 }"#
        );
        event.emit();
    }
}
