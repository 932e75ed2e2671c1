//! Internal events: one type per notable occurrence, emitted as a metric and a log line.

mod generator;
mod queue;

pub use generator::*;
pub use queue::*;

pub trait InternalEvent: Sized {
    fn emit(self);
}

pub fn emit(event: impl InternalEvent) {
    event.emit()
}
