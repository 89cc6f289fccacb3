//! Progress event publisher boundary.

use std::sync::Arc;

use crate::types::event::ProgressEvent;

/// Fire-and-forget progress event sink.
///
/// `publish` is synchronous and must never block the orchestrator on a slow
/// subscriber. Implementations may drop old progress events under
/// pressure but must deliver terminal events.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

impl<P: EventPublisher + ?Sized> EventPublisher for Arc<P> {
    fn publish(&self, event: ProgressEvent) {
        (**self).publish(event)
    }
}

/// Publisher that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPublisher;

impl EventPublisher for NullPublisher {
    fn publish(&self, _event: ProgressEvent) {}
}
