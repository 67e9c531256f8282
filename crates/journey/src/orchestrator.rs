//! Trigger handling: validate, classify, create-if-absent, alert, schedule.

use std::sync::Arc;

use outreach_channels::notify::{Alert, ChatNotifier};
use outreach_core::config::SignalConfig;
use outreach_core::event_bus::{make_event, EventSink};
use outreach_core::types::{
    CampaignType, DeliveryEventType, Segment, SequenceKey, SequenceRecord, TriggerEvent,
};
use outreach_core::{OutreachError, OutreachResult};
use outreach_crm::SequenceStore;
use outreach_segmentation::{classify, normalize_email, validate_event};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog;
use crate::scheduler::{ScheduleReport, StepScheduler};
use crate::state_machine::{OrchestrationState, OrchestrationStateMachine};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OrchestrationOutcome {
    Created {
        record: SequenceRecord,
        schedule: ScheduleReport,
    },
    /// A sequence already exists for the key. `rescheduled` is set when steps
    /// left `pending` by an earlier partial failure were queued again.
    SkippedDuplicate {
        record: SequenceRecord,
        rescheduled: Option<ScheduleReport>,
    },
}

impl OrchestrationOutcome {
    pub fn record(&self) -> &SequenceRecord {
        match self {
            OrchestrationOutcome::Created { record, .. }
            | OrchestrationOutcome::SkippedDuplicate { record, .. } => record,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, OrchestrationOutcome::Created { .. })
    }
}

pub struct SequenceOrchestrator {
    store: Arc<dyn SequenceStore>,
    scheduler: StepScheduler,
    notifier: Arc<dyn ChatNotifier>,
    signals: SignalConfig,
    alert_segment: Segment,
    event_sink: Arc<dyn EventSink>,
}

impl SequenceOrchestrator {
    pub fn new(
        store: Arc<dyn SequenceStore>,
        scheduler: StepScheduler,
        notifier: Arc<dyn ChatNotifier>,
    ) -> Self {
        Self {
            store,
            scheduler,
            notifier,
            signals: SignalConfig::default(),
            alert_segment: Segment::Critical,
            event_sink: outreach_core::event_bus::noop_sink(),
        }
    }

    pub fn with_signal_policy(mut self, signals: SignalConfig) -> Self {
        self.signals = signals;
        self
    }

    pub fn with_alert_segment(mut self, segment: Segment) -> Self {
        self.alert_segment = segment;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Validation errors are returned before any side effect. Store errors
    /// that exhaust retries are returned as-is; nothing has been created when
    /// `create` itself fails.
    pub async fn handle_trigger(&self, event: &TriggerEvent) -> OutreachResult<OrchestrationOutcome> {
        let mut machine = OrchestrationStateMachine::new();

        let subject = match validate_event(event, &self.signals) {
            Ok(subject) => subject,
            Err(e) => {
                metrics::counter!("sequencer.triggers_rejected").increment(1);
                warn!(campaign = %event.campaign_type, error = %e, "Trigger rejected");
                return Err(e);
            }
        };
        let campaign = event.campaign_type;
        let key = SequenceKey::new(subject.email.clone(), campaign);
        let definition = catalog::definition(campaign);

        let segment = classify(&subject.signals);
        machine.transition(OrchestrationState::Classified)?;
        debug!(key = %key, segment = %segment, "Subject classified");

        if let Some(record) = self.store.find_active(&key).await? {
            machine.transition(OrchestrationState::SkippedDuplicate)?;
            return self.skip_duplicate(record, &mut machine).await;
        }

        let record = match self
            .store
            .create(&subject, campaign, segment, definition.len())
            .await
        {
            Ok(record) => record,
            Err(OutreachError::DuplicateSequence { .. }) => {
                machine.transition(OrchestrationState::SkippedDuplicate)?;
                let record = self.store.find(&key).await?.ok_or_else(|| {
                    OutreachError::permanent("crm", format!("sequence {key} exists but cannot be read"))
                })?;
                return self.skip_duplicate(record, &mut machine).await;
            }
            Err(e) => return Err(e),
        };
        machine.transition(OrchestrationState::Created)?;
        metrics::counter!("sequencer.sequences_created", "segment" => segment.as_str()).increment(1);
        info!(
            sequence_id = %record.id,
            key = %key,
            segment = %segment,
            steps = definition.len(),
            "Sequence created"
        );
        self.event_sink.emit(
            make_event(DeliveryEventType::SequenceCreated, &record.email, campaign).with_segment(segment),
        );

        if segment.meets(self.alert_segment) {
            self.spawn_alert(&record);
        }

        let schedule = self
            .scheduler
            .schedule(&record, definition, record.created_at)
            .await;
        machine.transition(OrchestrationState::Scheduled)?;

        Ok(OrchestrationOutcome::Created { record, schedule })
    }

    /// Stop a sequence. Returns `false` when no active sequence exists.
    pub async fn cancel_sequence(
        &self,
        email: &str,
        campaign: CampaignType,
        reason: &str,
    ) -> OutreachResult<bool> {
        let key = SequenceKey::new(normalize_email(email)?, campaign);
        if self.store.find_active(&key).await?.is_none() {
            debug!(key = %key, "No active sequence to cancel");
            return Ok(false);
        }

        self.store.cancel(&key, reason).await?;
        metrics::counter!("sequencer.sequences_cancelled").increment(1);
        self.event_sink.emit(
            make_event(DeliveryEventType::SequenceCancelled, &key.email, campaign).with_error(reason),
        );
        Ok(true)
    }

    async fn skip_duplicate(
        &self,
        record: SequenceRecord,
        machine: &mut OrchestrationStateMachine,
    ) -> OutreachResult<OrchestrationOutcome> {
        metrics::counter!("sequencer.duplicates_skipped").increment(1);
        self.event_sink.emit(
            make_event(DeliveryEventType::SequenceSkipped, &record.email, record.campaign_type)
                .with_segment(record.segment),
        );

        let pending = record.pending_steps();
        if record.any_step_sent() || !record.is_active() || pending.is_empty() {
            info!(key = %record.key(), "Sequence already exists, trigger skipped");
            return Ok(OrchestrationOutcome::SkippedDuplicate {
                record,
                rescheduled: None,
            });
        }

        info!(
            key = %record.key(),
            pending = pending.len(),
            "Sequence exists with unqueued steps, rescheduling them"
        );
        let report = self
            .scheduler
            .schedule_steps(
                &record,
                catalog::definition(record.campaign_type),
                record.created_at,
                &pending,
            )
            .await;
        machine.transition(OrchestrationState::Scheduled)?;

        Ok(OrchestrationOutcome::SkippedDuplicate {
            record,
            rescheduled: Some(report),
        })
    }

    fn spawn_alert(&self, record: &SequenceRecord) {
        let alert = Alert {
            email: record.email.clone(),
            display_name: record.display_name.clone(),
            account_name: record.account_name.clone(),
            campaign_type: record.campaign_type,
            segment: record.segment,
            score: record.score,
        };
        let notifier = self.notifier.clone();
        let sink = self.event_sink.clone();

        tokio::spawn(async move {
            match notifier.notify(&alert).await {
                Ok(()) => {
                    metrics::counter!("sequencer.alerts_sent").increment(1);
                    sink.emit(
                        make_event(DeliveryEventType::AlertRaised, &alert.email, alert.campaign_type)
                            .with_segment(alert.segment),
                    );
                }
                Err(e) => {
                    metrics::counter!("sequencer.alerts_failed").increment(1);
                    warn!(
                        email = %alert.email,
                        notifier = notifier.name(),
                        error = %e,
                        "Chat alert failed"
                    );
                }
            }
        });
    }
}
