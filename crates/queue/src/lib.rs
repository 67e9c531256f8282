//! Durable step queue. Steps are held until their fire time and handed to
//! workers at least once.

#![warn(clippy::unwrap_used)]

pub mod memory;
pub mod redis_queue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outreach_core::types::{ScheduledStep, StepHandle};
use outreach_core::OutreachResult;

pub use memory::InMemoryStepQueue;
pub use redis_queue::RedisStepQueue;

#[async_trait]
pub trait StepQueue: Send + Sync {
    fn name(&self) -> &'static str;

    /// Hold `step` until its fire time. Idempotent per job id: enqueuing a job
    /// that is already waiting returns the existing handle unchanged.
    async fn enqueue(&self, step: &ScheduledStep) -> OutreachResult<StepHandle>;

    /// Remove and return up to `limit` steps due at or before `now`, earliest first.
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> OutreachResult<Vec<ScheduledStep>>;

    /// Number of steps still waiting.
    async fn pending(&self) -> OutreachResult<usize>;
}

pub(crate) fn handle_for(step: &ScheduledStep) -> StepHandle {
    StepHandle {
        job_id: step.job_id(),
        step_index: step.step_index,
        fire_time: step.fire_time,
    }
}
