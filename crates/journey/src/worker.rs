//! Polls the step queue and executes due steps.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use outreach_core::retry::RetryPolicy;
use outreach_core::types::ScheduledStep;
use outreach_core::OutreachResult;
use outreach_queue::StepQueue;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::executor::{StepExecutor, StepOutcome};

/// Tally of one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerPass {
    pub claimed: usize,
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
    pub requeued: usize,
    pub dropped: usize,
}

pub struct DueStepWorker {
    queue: Arc<dyn StepQueue>,
    executor: Arc<StepExecutor>,
    redelivery: RetryPolicy,
    batch_size: usize,
    poll_interval: Duration,
}

impl DueStepWorker {
    pub fn new(queue: Arc<dyn StepQueue>, executor: Arc<StepExecutor>, redelivery: RetryPolicy) -> Self {
        Self {
            queue,
            executor,
            redelivery,
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Claim and execute everything due at `now`, up to the batch size.
    pub async fn run_once(&self, now: DateTime<Utc>) -> OutreachResult<WorkerPass> {
        let steps = self.queue.claim_due(now, self.batch_size).await?;
        let mut pass = WorkerPass {
            claimed: steps.len(),
            ..WorkerPass::default()
        };

        for step in steps {
            match self.executor.execute(&step).await {
                Ok(StepOutcome::Sent { .. }) => pass.sent += 1,
                Ok(StepOutcome::AlreadySent | StepOutcome::SequenceMissing | StepOutcome::Cancelled) => {
                    pass.skipped += 1
                }
                Ok(StepOutcome::Failed { retryable: true, .. }) => {
                    self.requeue(step, now, &mut pass).await;
                }
                Ok(StepOutcome::Failed { retryable: false, .. }) => pass.failed += 1,
                Err(e) if e.is_retryable() => {
                    warn!(job_id = %step.job_id(), error = %e, "Step execution hit a transient error");
                    self.requeue(step, now, &mut pass).await;
                }
                Err(e) => {
                    error!(job_id = %step.job_id(), error = %e, "Step execution failed permanently, dropping");
                    metrics::counter!("executor.dropped").increment(1);
                    pass.dropped += 1;
                }
            }
        }

        if pass.claimed > 0 {
            debug!(?pass, "Worker pass complete");
        }
        Ok(pass)
    }

    /// Poll until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            queue = self.queue.name(),
            batch_size = self.batch_size,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Due-step worker started"
        );
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.run_once(Utc::now()).await {
                        metrics::counter!("queue.poll_errors").increment(1);
                        warn!(error = %e, "Failed to poll step queue");
                    }
                }
            }
        }

        info!("Due-step worker stopped");
    }

    async fn requeue(&self, step: ScheduledStep, now: DateTime<Utc>, pass: &mut WorkerPass) {
        if step.attempt >= self.redelivery.max_retries {
            error!(
                job_id = %step.job_id(),
                attempts = step.attempt + 1,
                "Step out of redelivery attempts, dropping"
            );
            metrics::counter!("executor.dropped").increment(1);
            pass.dropped += 1;
            return;
        }

        let backoff = self.redelivery.backoff_for_attempt(step.attempt);
        let next = ScheduledStep {
            attempt: step.attempt + 1,
            fire_time: now + chrono::Duration::milliseconds(backoff.as_millis() as i64),
            ..step
        };
        match self.queue.enqueue(&next).await {
            Ok(handle) => {
                metrics::counter!("queue.requeued").increment(1);
                debug!(job_id = %handle.job_id, fire_time = %handle.fire_time, attempt = next.attempt, "Step requeued");
                pass.requeued += 1;
            }
            Err(e) => {
                error!(job_id = %next.job_id(), error = %e, "Failed to requeue step, dropping");
                pass.dropped += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use outreach_channels::{FallbackCatalog, RecordingEmailProvider, TemplateLibrary};
    use outreach_core::types::{CampaignType, Segment, SignalCounts, Subject};
    use outreach_crm::{CrmSequenceStore, InMemoryCrm, SequenceStore};
    use outreach_queue::InMemoryStepQueue;

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    struct Fixture {
        queue: Arc<InMemoryStepQueue>,
        store: Arc<CrmSequenceStore>,
        email: Arc<RecordingEmailProvider>,
        worker: DueStepWorker,
    }

    fn fixture(redelivery: RetryPolicy) -> Fixture {
        let queue = Arc::new(InMemoryStepQueue::new());
        let store = Arc::new(CrmSequenceStore::new(Arc::new(InMemoryCrm::new()), fast_retry(0)));
        let library = Arc::new(TemplateLibrary::new());
        catalog::seed_library(&library);
        let email = Arc::new(RecordingEmailProvider::new());
        let executor = Arc::new(StepExecutor::new(
            store.clone(),
            library,
            FallbackCatalog::with_defaults(),
            email.clone(),
            RetryPolicy::none(),
        ));
        let worker = DueStepWorker::new(queue.clone(), executor, redelivery).with_batch_size(10);
        Fixture {
            queue,
            store,
            email,
            worker,
        }
    }

    async fn enqueue_sequence(f: &Fixture, now: DateTime<Utc>) {
        let subject = Subject {
            email: "a@x.com".into(),
            display_name: "Ada".into(),
            account_name: "Acme".into(),
            signals: SignalCounts::default(),
            score: None,
        };
        f.store
            .create(&subject, CampaignType::NoShow, Segment::Optimize, 4)
            .await
            .unwrap();
        for (step_index, minutes) in [(1, -5), (2, -1), (3, 60)] {
            f.queue
                .enqueue(&ScheduledStep {
                    email: "a@x.com".into(),
                    campaign_type: CampaignType::NoShow,
                    step_index,
                    segment: Segment::Optimize,
                    fire_time: now + chrono::Duration::minutes(minutes),
                    attempt: 0,
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_executes_only_due_steps() {
        let f = fixture(fast_retry(3));
        let now = Utc::now();
        enqueue_sequence(&f, now).await;

        let pass = f.worker.run_once(now).await.unwrap();
        assert_eq!(pass.claimed, 2);
        assert_eq!(pass.sent, 2);
        assert_eq!(f.email.sent_count(), 2);
        assert_eq!(f.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_is_requeued_with_attempt_bumped() {
        let f = fixture(fast_retry(3));
        let now = Utc::now();
        enqueue_sequence(&f, now).await;
        f.email.fail_next(1, true);

        let pass = f.worker.run_once(now).await.unwrap();
        assert_eq!(pass.requeued, 1);
        assert_eq!(pass.sent, 1);

        let waiting = f.queue.snapshot();
        let retried = waiting.iter().find(|s| s.attempt == 1).unwrap();
        assert!(retried.fire_time > now);

        let later = now + chrono::Duration::seconds(1);
        let pass = f.worker.run_once(later).await.unwrap();
        assert_eq!(pass.sent, 1);
        assert_eq!(f.email.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_requeued() {
        let f = fixture(fast_retry(3));
        let now = Utc::now();
        enqueue_sequence(&f, now).await;
        f.email.fail_next(1, false);

        let pass = f.worker.run_once(now).await.unwrap();
        assert_eq!(pass.failed, 1);
        assert_eq!(pass.requeued, 0);
        assert_eq!(f.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_redelivery_budget_is_bounded() {
        let f = fixture(fast_retry(0));
        let now = Utc::now();
        enqueue_sequence(&f, now).await;
        f.email.fail_next(1, true);

        let pass = f.worker.run_once(now).await.unwrap();
        assert_eq!(pass.dropped, 1);
        assert_eq!(pass.requeued, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture(fast_retry(3));
        let worker = f.worker.with_poll_interval(Duration::from_millis(5));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { worker.run(rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
