use std::time::Duration;

use metrics::{counter, histogram};

use super::InternalEvent;
use crate::record::RecordId;

#[derive(Debug)]
pub struct WorkRecordPublished<'a> {
    pub queue: &'a str,
    pub id: &'a RecordId,
}

impl InternalEvent for WorkRecordPublished<'_> {
    fn emit(self) {
        counter!("queue_published_total").increment(1);
        info!(target: "request_pipeline::queue", queue = %self.queue, id = %self.id, "Published work record to queue");
    }
}

#[derive(Debug)]
pub struct WorkRecordPersisted<'a> {
    pub id: &'a RecordId,
    pub duration: Option<Duration>,
}

impl InternalEvent for WorkRecordPersisted<'_> {
    fn emit(self) {
        counter!("queue_persisted_total").increment(1);
        if let Some(duration) = self.duration {
            histogram!("work_record_duration_seconds").record(duration);
        }
        info!(
            target: "request_pipeline::queue",
            id = %self.id,
            duration_ms = self.duration.map(|d| d.as_millis()),
            "Processed message"
        );
    }
}

#[derive(Debug)]
pub struct DuplicateDeliverySkipped<'a> {
    pub id: &'a RecordId,
    pub redelivered: bool,
}

impl InternalEvent for DuplicateDeliverySkipped<'_> {
    fn emit(self) {
        counter!("queue_duplicates_total").increment(1);
        warn!(
            target: "request_pipeline::queue",
            id = %self.id,
            redelivered = self.redelivered,
            "Duplicate message skipped"
        );
    }
}

#[derive(Debug)]
pub struct DeliveryDiscarded<'a> {
    pub delivery_tag: u64,
    pub reason: &'a str,
}

impl InternalEvent for DeliveryDiscarded<'_> {
    fn emit(self) {
        counter!("queue_discarded_total").increment(1);
        warn!(
            target: "request_pipeline::queue",
            delivery_tag = self.delivery_tag,
            reason = %self.reason,
            "Discarding message that carries no work record"
        );
    }
}

#[derive(Debug)]
pub struct DeliveryRejected<'a> {
    pub id: Option<&'a RecordId>,
    pub requeue: bool,
    pub error: &'a dyn std::error::Error,
}

impl InternalEvent for DeliveryRejected<'_> {
    fn emit(self) {
        let route = if self.requeue { "requeue" } else { "dead_letter" };
        counter!("queue_rejected_total", "route" => route).increment(1);
        error!(
            target: "request_pipeline::queue",
            id = self.id.map(tracing::field::display),
            requeue = self.requeue,
            error = %self.error,
            "Error processing message"
        );
    }
}
