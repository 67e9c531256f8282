//! In-process step queue for local runs and tests.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outreach_core::types::{ScheduledStep, StepHandle};
use outreach_core::{OutreachError, OutreachResult};
use parking_lot::Mutex;
use tracing::debug;

use crate::{handle_for, StepQueue};

#[derive(Default)]
pub struct InMemoryStepQueue {
    jobs: Mutex<BTreeMap<String, ScheduledStep>>,
    rejected_steps: Mutex<HashSet<u32>>,
}

impl InMemoryStepQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every enqueue of `step_index` fail with a transient error.
    pub fn reject_step(&self, step_index: u32) {
        self.rejected_steps.lock().insert(step_index);
    }

    pub fn accept_all(&self) {
        self.rejected_steps.lock().clear();
    }

    /// All waiting steps ordered by fire time.
    pub fn snapshot(&self) -> Vec<ScheduledStep> {
        let mut steps: Vec<_> = self.jobs.lock().values().cloned().collect();
        steps.sort_by_key(|s| (s.fire_time, s.step_index));
        steps
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }
}

#[async_trait]
impl StepQueue for InMemoryStepQueue {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn enqueue(&self, step: &ScheduledStep) -> OutreachResult<StepHandle> {
        if self.rejected_steps.lock().contains(&step.step_index) {
            return Err(OutreachError::transient("queue", "injected enqueue failure"));
        }

        let mut jobs = self.jobs.lock();
        let job = jobs.entry(step.job_id()).or_insert_with(|| step.clone());
        debug!(job_id = %job.job_id(), fire_time = %job.fire_time, "Step enqueued");
        Ok(handle_for(job))
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> OutreachResult<Vec<ScheduledStep>> {
        let mut jobs = self.jobs.lock();
        let mut due: Vec<_> = jobs
            .values()
            .filter(|s| s.fire_time <= now)
            .map(|s| (s.fire_time, s.job_id()))
            .collect();
        due.sort();
        due.truncate(limit);

        Ok(due
            .into_iter()
            .filter_map(|(_, job_id)| jobs.remove(&job_id))
            .collect())
    }

    async fn pending(&self) -> OutreachResult<usize> {
        Ok(self.jobs.lock().len())
    }
}
