//! Executes one due step: re-check state, render, send, record.

use std::sync::Arc;

use chrono::Utc;
use outreach_channels::{
    EmailMessage, EmailProvider, FallbackCatalog, RenderedContent, TemplateSource, TemplateVars,
};
use outreach_core::event_bus::{make_event, EventSink};
use outreach_core::retry::RetryPolicy;
use outreach_core::types::{DeliveryEventType, ScheduledStep, SequenceRecord, SequenceStatus, StepStatus};
use outreach_core::{OutreachError, OutreachResult};
use outreach_crm::SequenceStore;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Sent {
        message_id: String,
        template_id: String,
        used_fallback: bool,
    },
    /// Redelivery of a step that already went out.
    AlreadySent,
    /// No record exists for the step's sequence.
    SequenceMissing,
    Cancelled,
    /// Marked failed on the record. `retryable` tells the worker whether
    /// another delivery attempt is worthwhile.
    Failed { error: String, retryable: bool },
}

impl StepOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            StepOutcome::Sent { .. } => "sent",
            StepOutcome::AlreadySent => "already_sent",
            StepOutcome::SequenceMissing => "sequence_missing",
            StepOutcome::Cancelled => "cancelled",
            StepOutcome::Failed { .. } => "failed",
        }
    }
}

pub struct StepExecutor {
    store: Arc<dyn SequenceStore>,
    templates: Arc<dyn TemplateSource>,
    fallbacks: FallbackCatalog,
    email: Arc<dyn EmailProvider>,
    retry: RetryPolicy,
    event_sink: Arc<dyn EventSink>,
}

impl StepExecutor {
    pub fn new(
        store: Arc<dyn SequenceStore>,
        templates: Arc<dyn TemplateSource>,
        fallbacks: FallbackCatalog,
        email: Arc<dyn EmailProvider>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            templates,
            fallbacks,
            email,
            retry,
            event_sink: outreach_core::event_bus::noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Store failures surface as `Err` so the queue can redeliver; every
    /// other failure is recorded on the sequence and returned as an outcome.
    pub async fn execute(&self, step: &ScheduledStep) -> OutreachResult<StepOutcome> {
        let key = step.key();

        let Some(record) = self.store.find(&key).await? else {
            debug!(key = %key, step = step.step_index, "No sequence for step, skipping");
            return Ok(self.skipped(step, StepOutcome::SequenceMissing));
        };

        if record.status == SequenceStatus::Cancelled {
            debug!(key = %key, step = step.step_index, "Sequence cancelled, skipping");
            return Ok(self.skipped(step, StepOutcome::Cancelled));
        }

        let state = record.step(step.step_index).ok_or(OutreachError::InvalidStep {
            campaign: record.campaign_type,
            step: step.step_index,
            steps: record.step_count(),
        })?;
        if state.status == StepStatus::Sent {
            debug!(key = %key, step = step.step_index, "Step already sent, skipping");
            return Ok(self.skipped(step, StepOutcome::AlreadySent));
        }

        let definition = catalog::definition(record.campaign_type);
        let template_id = definition.template_id(step.step_index, record.segment)?;

        let (template_id, content, used_fallback) = match self.render(&record, &template_id).await {
            Ok(rendered) => rendered,
            Err(e) => return self.fail(&record, step, &template_id, e).await,
        };

        let message = EmailMessage {
            to: record.email.clone(),
            to_name: record.display_name.clone(),
            subject: content.subject,
            body: content.body,
        };
        let idempotency_key = step.job_id();

        let sent = self
            .retry
            .run("email.send", || self.email.send(&message, &idempotency_key))
            .await;
        let message_id = match sent {
            Ok(id) => id,
            Err(e) => return self.fail(&record, step, &template_id, e).await,
        };

        metrics::counter!("executor.sent", "campaign" => record.campaign_type.as_str()).increment(1);
        info!(
            key = %key,
            step = step.step_index,
            template_id = %template_id,
            message_id = %message_id,
            used_fallback,
            "Step sent"
        );
        self.event_sink.emit(
            make_event(DeliveryEventType::StepSent, &record.email, record.campaign_type)
                .with_step(step.step_index)
                .with_segment(record.segment)
                .with_template(template_id.clone())
                .with_message_id(message_id.clone()),
        );
        // The send happened whether or not the write below succeeds.
        self.store
            .mark_step_sent(&key, step.step_index, Utc::now(), &message_id)
            .await?;

        if definition.is_final(step.step_index) {
            self.store.mark_completed(&key).await?;
            self.event_sink.emit(
                make_event(DeliveryEventType::SequenceCompleted, &record.email, record.campaign_type)
                    .with_segment(record.segment),
            );
        }

        Ok(StepOutcome::Sent {
            message_id,
            template_id,
            used_fallback,
        })
    }

    /// Render the step's own template, or the campaign fallback when the
    /// template cannot be resolved.
    async fn render(
        &self,
        record: &SequenceRecord,
        template_id: &str,
    ) -> OutreachResult<(String, RenderedContent, bool)> {
        let vars = template_vars(record);

        let lookup = self
            .retry
            .run("templates.render", || self.templates.render(template_id, &vars))
            .await;
        match lookup {
            Ok(Some(content)) => return Ok((template_id.to_string(), content, false)),
            Ok(None) => warn!(template_id, "Template not found, using fallback"),
            Err(e) => warn!(template_id, error = %e, "Template lookup failed, using fallback"),
        }

        metrics::counter!("executor.fallback_templates").increment(1);
        self.fallbacks
            .render(record.campaign_type, &vars)
            .map(|(id, content)| (id, content, true))
            .ok_or_else(|| {
                OutreachError::permanent(
                    "templates",
                    format!(
                        "template {template_id} unavailable and no fallback for {}",
                        record.campaign_type
                    ),
                )
            })
    }

    async fn fail(
        &self,
        record: &SequenceRecord,
        step: &ScheduledStep,
        template_id: &str,
        error: OutreachError,
    ) -> OutreachResult<StepOutcome> {
        let message = error.to_string();
        metrics::counter!("executor.failed", "kind" => error.kind()).increment(1);
        warn!(
            key = %record.key(),
            step = step.step_index,
            error = %message,
            retryable = error.is_retryable(),
            "Step failed"
        );
        self.event_sink.emit(
            make_event(DeliveryEventType::StepFailed, &record.email, record.campaign_type)
                .with_step(step.step_index)
                .with_segment(record.segment)
                .with_template(template_id)
                .with_error(message.clone()),
        );
        self.store
            .mark_step_failed(&record.key(), step.step_index, &message)
            .await?;

        Ok(StepOutcome::Failed {
            error: message,
            retryable: error.is_retryable(),
        })
    }

    fn skipped(&self, step: &ScheduledStep, outcome: StepOutcome) -> StepOutcome {
        metrics::counter!("executor.skipped", "reason" => outcome.label()).increment(1);
        self.event_sink.emit(
            make_event(DeliveryEventType::StepSkipped, &step.email, step.campaign_type)
                .with_step(step.step_index)
                .with_segment(step.segment)
                .with_error(outcome.label()),
        );
        outcome
    }
}

fn template_vars(record: &SequenceRecord) -> TemplateVars {
    TemplateVars::from([
        ("display_name".to_string(), record.display_name.clone()),
        ("account_name".to_string(), record.account_name.clone()),
        ("segment".to_string(), record.segment.as_str().to_string()),
        ("email".to_string(), record.email.clone()),
    ])
}
