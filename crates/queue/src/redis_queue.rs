//! Redis step queue: a sorted set of job ids scored by fire time (epoch
//! millis) plus a hash of job id → JSON payload.
//!
//! Claiming removes a job before it runs, so a worker crash between claim and
//! execution loses that delivery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outreach_core::config::RedisConfig;
use outreach_core::types::{ScheduledStep, StepHandle};
use outreach_core::{OutreachError, OutreachResult};
use redis::AsyncCommands;
use tracing::{info, warn};

use crate::{handle_for, StepQueue};

const ENQUEUE: &str = r#"
if redis.call('HSETNX', KEYS[2], ARGV[1], ARGV[3]) == 1 then
    redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
    return false
end
return redis.call('HGET', KEYS[2], ARGV[1])
"#;

const CLAIM_DUE: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
local claimed = {}
for _, id in ipairs(ids) do
    if redis.call('ZREM', KEYS[1], id) == 1 then
        local payload = redis.call('HGET', KEYS[2], id)
        redis.call('HDEL', KEYS[2], id)
        if payload then
            table.insert(claimed, payload)
        end
    end
end
return claimed
"#;

pub struct RedisStepQueue {
    client: redis::Client,
    due_key: String,
    jobs_key: String,
    enqueue_script: redis::Script,
    claim_script: redis::Script,
}

impl RedisStepQueue {
    pub async fn new(config: &RedisConfig) -> OutreachResult<Self> {
        info!(url = %config.url, "Connecting step queue to Redis");

        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| OutreachError::Config(format!("invalid redis url: {e}")))?;

        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(classify)?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        info!(response = %pong, "Step queue Redis connection established");

        Ok(Self {
            client,
            due_key: format!("{}:queue:due", config.key_prefix),
            jobs_key: format!("{}:queue:jobs", config.key_prefix),
            enqueue_script: redis::Script::new(ENQUEUE),
            claim_script: redis::Script::new(CLAIM_DUE),
        })
    }

    async fn connection(&self) -> OutreachResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(classify)
    }
}

#[async_trait]
impl StepQueue for RedisStepQueue {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn enqueue(&self, step: &ScheduledStep) -> OutreachResult<StepHandle> {
        let job_id = step.job_id();
        let payload = serde_json::to_string(step)?;

        let mut conn = self.connection().await?;
        let existing: Option<String> = self
            .enqueue_script
            .key(&self.due_key)
            .key(&self.jobs_key)
            .arg(&job_id)
            .arg(step.fire_time.timestamp_millis())
            .arg(payload)
            .invoke_async(&mut conn)
            .await
            .map_err(classify)?;

        match existing {
            None => {
                metrics::counter!("queue.enqueued").increment(1);
                Ok(handle_for(step))
            }
            Some(json) => {
                metrics::counter!("queue.enqueue_duplicates").increment(1);
                let stored: ScheduledStep = serde_json::from_str(&json)?;
                Ok(handle_for(&stored))
            }
        }
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> OutreachResult<Vec<ScheduledStep>> {
        let mut conn = self.connection().await?;
        let payloads: Vec<String> = self
            .claim_script
            .key(&self.due_key)
            .key(&self.jobs_key)
            .arg(now.timestamp_millis())
            .arg(limit)
            .invoke_async(&mut conn)
            .await
            .map_err(classify)?;

        let steps = decode_claimed(payloads);
        metrics::counter!("queue.claimed").increment(steps.len() as u64);
        Ok(steps)
    }

    async fn pending(&self) -> OutreachResult<usize> {
        let mut conn = self.connection().await?;
        conn.zcard(&self.due_key).await.map_err(classify)
    }
}

/// Payloads that no longer parse are dropped with a warning rather than
/// blocking the rest of the batch.
fn decode_claimed(payloads: Vec<String>) -> Vec<ScheduledStep> {
    payloads
        .into_iter()
        .filter_map(|json| match serde_json::from_str::<ScheduledStep>(&json) {
            Ok(step) => Some(step),
            Err(e) => {
                warn!(error = %e, payload = %json, "Dropping unreadable queued step");
                metrics::counter!("queue.corrupt_payloads").increment(1);
                None
            }
        })
        .collect()
}

fn classify(err: redis::RedisError) -> OutreachError {
    if err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || matches!(
            err.kind(),
            redis::ErrorKind::BusyLoadingError
                | redis::ErrorKind::TryAgain
                | redis::ErrorKind::ClusterDown
        )
    {
        OutreachError::transient("queue", err)
    } else {
        OutreachError::permanent("queue", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outreach_core::types::{CampaignType, Segment};

    #[test]
    fn test_claimed_payloads_decode_and_skip_garbage() {
        let step = ScheduledStep {
            email: "a@x.com".into(),
            campaign_type: CampaignType::PostCall,
            step_index: 3,
            segment: Segment::Optimize,
            fire_time: Utc::now(),
            attempt: 1,
        };
        let payloads = vec![
            serde_json::to_string(&step).unwrap(),
            "{not json".to_string(),
        ];

        let decoded = decode_claimed(payloads);
        assert_eq!(decoded, vec![step]);
    }

    #[test]
    fn test_payload_without_attempt_defaults_to_zero() {
        let json = r#"{"email":"a@x.com","campaignType":"nurture","stepIndex":2,"segment":"CRITICAL","fireTime":"2026-01-01T00:00:00Z"}"#;
        let decoded = decode_claimed(vec![json.to_string()]);
        assert_eq!(decoded[0].attempt, 0);
        assert_eq!(decoded[0].step_index, 2);
    }
}
