//! Turns a sequence record into queued steps.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use outreach_core::event_bus::{make_event, EventSink};
use outreach_core::retry::RetryPolicy;
use outreach_core::types::{DeliveryEventType, ScheduledStep, SequenceRecord, StepHandle};
use outreach_core::OutreachResult;
use outreach_crm::SequenceStore;
use outreach_queue::StepQueue;
use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::SequenceDefinition;
use crate::delay::DelayCalculator;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepFailure {
    pub step_index: u32,
    pub error: String,
    pub retryable: bool,
}

/// Per-step scheduling result. Partial failure is reported here, not as an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleReport {
    pub trigger_time: DateTime<Utc>,
    pub scheduled: Vec<StepHandle>,
    pub failed: Vec<StepFailure>,
}

impl ScheduleReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct StepScheduler {
    queue: Arc<dyn StepQueue>,
    store: Arc<dyn SequenceStore>,
    delays: DelayCalculator,
    retry: RetryPolicy,
    event_sink: Arc<dyn EventSink>,
}

impl StepScheduler {
    pub fn new(
        queue: Arc<dyn StepQueue>,
        store: Arc<dyn SequenceStore>,
        delays: DelayCalculator,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            queue,
            store,
            delays,
            retry,
            event_sink: outreach_core::event_bus::noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Schedule every step of `definition`.
    pub async fn schedule(
        &self,
        record: &SequenceRecord,
        definition: SequenceDefinition,
        trigger_time: DateTime<Utc>,
    ) -> ScheduleReport {
        self.schedule_steps(record, definition, trigger_time, &definition.step_indexes())
            .await
    }

    /// Schedule only `steps`, e.g. the ones a previous attempt failed to queue.
    /// Fire times are always relative to `trigger_time`.
    pub async fn schedule_steps(
        &self,
        record: &SequenceRecord,
        definition: SequenceDefinition,
        trigger_time: DateTime<Utc>,
        steps: &[u32],
    ) -> ScheduleReport {
        let mut report = ScheduleReport {
            trigger_time,
            scheduled: Vec::with_capacity(steps.len()),
            failed: Vec::new(),
        };

        for &step_index in steps {
            match self.schedule_one(record, definition, trigger_time, step_index).await {
                Ok(handle) => {
                    metrics::counter!("sequencer.steps_scheduled").increment(1);
                    self.event_sink.emit(
                        make_event(DeliveryEventType::StepScheduled, &record.email, record.campaign_type)
                            .with_step(step_index)
                            .with_segment(record.segment),
                    );
                    report.scheduled.push(handle);
                }
                Err(e) => {
                    metrics::counter!("sequencer.steps_schedule_failed").increment(1);
                    warn!(
                        key = %record.key(),
                        step = step_index,
                        error = %e,
                        "Failed to schedule step"
                    );
                    self.event_sink.emit(
                        make_event(DeliveryEventType::StepScheduleFailed, &record.email, record.campaign_type)
                            .with_step(step_index)
                            .with_segment(record.segment)
                            .with_error(e.to_string()),
                    );
                    report.failed.push(StepFailure {
                        step_index,
                        error: e.to_string(),
                        retryable: e.is_retryable(),
                    });
                }
            }
        }

        info!(
            key = %record.key(),
            scheduled = report.scheduled.len(),
            failed = report.failed.len(),
            "Sequence steps scheduled"
        );
        report
    }

    async fn schedule_one(
        &self,
        record: &SequenceRecord,
        definition: SequenceDefinition,
        trigger_time: DateTime<Utc>,
        step_index: u32,
    ) -> OutreachResult<StepHandle> {
        definition.step(step_index)?;
        let fire_time = self
            .delays
            .fire_time(record.campaign_type, step_index, trigger_time)?;

        let step = ScheduledStep {
            email: record.email.clone(),
            campaign_type: record.campaign_type,
            step_index,
            segment: record.segment,
            fire_time,
            attempt: 0,
        };
        let handle = self
            .retry
            .run("queue.enqueue", || self.queue.enqueue(&step))
            .await?;

        // The job is already queued and will fire; a stale `pending` flag only
        // means a later duplicate trigger re-enqueues it, which is a no-op.
        if let Err(e) = self
            .store
            .mark_step_scheduled(&record.key(), step_index, handle.fire_time)
            .await
        {
            warn!(key = %record.key(), step = step_index, error = %e, "Step queued but not marked scheduled");
        }
        Ok(handle)
    }
}
