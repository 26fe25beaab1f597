//! Stash-then-decide output buffering.
//!
//! A scan often cannot tell whether a thread is worth reporting until it has
//! looked at all of it. Lines are stashed in a [`DeferredBatch`] as they are
//! produced and then either committed to a sink in order or dropped
//! wholesale. Dropping the batch without committing discards it.

use super::sink::{ReportEvent, ReportSink};
use crate::domain::RiskLevel;

#[derive(Debug, Default)]
pub struct DeferredBatch {
    events: Vec<ReportEvent>,
}

impl DeferredBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stash(&mut self, event: ReportEvent) {
        self.events.push(event);
    }

    /// Re-rate every stashed event once the batch's overall risk is known.
    pub fn set_priority(&mut self, priority: RiskLevel) {
        for event in &mut self.events {
            event.priority = priority;
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Emit every stashed event in order. Returns how many were emitted.
    pub fn commit(self, sink: &dyn ReportSink) -> usize {
        let count = self.events.len();
        for event in self.events {
            sink.emit(event);
        }
        count
    }

    /// Drop every stashed event. Returns how many were dropped.
    pub fn discard(self) -> usize {
        self.events.len()
    }
}
