//! Delivery event bus: a trait for emitting analytics records from any module.
//!
//! Modules accept an `Arc<dyn EventSink>`. Emission is fire-and-forget: a sink
//! must never block the caller or report failure back into the control flow.

use crate::types::{CampaignType, DeliveryEvent, DeliveryEventType};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: DeliveryEvent);
}

/// No-op sink for tests and deployments without analytics.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: DeliveryEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<DeliveryEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<DeliveryEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_type(&self, event_type: DeliveryEventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: DeliveryEvent) {
        self.events.lock().push(event);
    }
}

/// Builds a `DeliveryEvent` with the optional fields unset; chain the
/// `with_*` helpers to fill them in. `node_id` is left empty for the sink
/// that persists the event to stamp.
pub fn make_event(
    event_type: DeliveryEventType,
    email: impl Into<String>,
    campaign_type: CampaignType,
) -> DeliveryEvent {
    DeliveryEvent {
        event_id: Uuid::new_v4(),
        event_type,
        email: email.into(),
        campaign_type,
        step_index: None,
        segment: None,
        template_id: None,
        message_id: None,
        error: None,
        node_id: String::new(),
        timestamp: Utc::now(),
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::Segment;

    #[test]
    fn test_capture_sink() {
        let sink = capture_sink();
        assert_eq!(sink.count(), 0);

        sink.emit(make_event(
            DeliveryEventType::SequenceCreated,
            "a@x.com",
            CampaignType::Nurture,
        ));
        sink.emit(
            make_event(DeliveryEventType::StepSent, "a@x.com", CampaignType::Nurture)
                .with_step(1)
                .with_segment(Segment::Critical)
                .with_message_id("sg-1"),
        );

        assert_eq!(sink.count(), 2);
        assert_eq!(sink.count_type(DeliveryEventType::StepSent), 1);

        let events = sink.events();
        assert_eq!(events[1].step_index, Some(1));
        assert!(events[1].node_id.is_empty());
        assert_eq!(events[1].message_id.as_deref(), Some("sg-1"));

        sink.clear();
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_noop_sink() {
        let sink = noop_sink();
        sink.emit(make_event(
            DeliveryEventType::StepFailed,
            "a@x.com",
            CampaignType::NoShow,
        ));
    }
}
