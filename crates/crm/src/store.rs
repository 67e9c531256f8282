//! Sequence store adapter.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outreach_core::retry::RetryPolicy;
use outreach_core::types::{
    CampaignType, Segment, SequenceKey, SequenceRecord, SequenceStatus, StepState, StepStatus,
    Subject,
};
use outreach_core::{OutreachError, OutreachResult};
use serde_json::Value;
use tracing::{debug, info};

use crate::client::{CrmClient, FieldGuard, PropertyMap};
use crate::schema;

/// Typed contract for sequence persistence. The CRM is the single source of
/// truth; implementations must not cache records across calls.
#[async_trait]
pub trait SequenceStore: Send + Sync {
    /// The record for `key`, only if its status is `active`.
    async fn find_active(&self, key: &SequenceKey) -> OutreachResult<Option<SequenceRecord>>;

    /// The record for `key` in any status.
    async fn find(&self, key: &SequenceKey) -> OutreachResult<Option<SequenceRecord>>;

    /// Create a record with `step_count` pending steps. Fails with
    /// `OutreachError::DuplicateSequence` when a record already exists.
    async fn create(
        &self,
        subject: &Subject,
        campaign_type: CampaignType,
        segment: Segment,
        step_count: usize,
    ) -> OutreachResult<SequenceRecord>;

    /// `pending` → `scheduled`. Any other status is left alone, including one
    /// reached concurrently after this call read the record.
    async fn mark_step_scheduled(
        &self,
        key: &SequenceKey,
        step_index: u32,
        fire_time: DateTime<Utc>,
    ) -> OutreachResult<()>;

    /// Idempotent: a step already `sent` keeps its original timestamp.
    async fn mark_step_sent(
        &self,
        key: &SequenceKey,
        step_index: u32,
        sent_at: DateTime<Utc>,
        message_id: &str,
    ) -> OutreachResult<()>;

    /// Idempotent: never downgrades a `sent` step.
    async fn mark_step_failed(
        &self,
        key: &SequenceKey,
        step_index: u32,
        error: &str,
    ) -> OutreachResult<()>;

    async fn mark_completed(&self, key: &SequenceKey) -> OutreachResult<()>;

    /// Advisory stop. Executors check this flag before every send.
    async fn cancel(&self, key: &SequenceKey, reason: &str) -> OutreachResult<()>;
}

/// `SequenceStore` over a loose-schema `CrmClient`, with every call wrapped
/// in the retry policy.
pub struct CrmSequenceStore {
    client: Arc<dyn CrmClient>,
    retry: RetryPolicy,
}

impl CrmSequenceStore {
    pub fn new(client: Arc<dyn CrmClient>, retry: RetryPolicy) -> Self {
        info!(backend = client.name(), "CRM sequence store initialized");
        Self { client, retry }
    }

    fn object_key(key: &SequenceKey) -> String {
        format!("sequence:{key}")
    }

    async fn load(&self, key: &SequenceKey) -> OutreachResult<Option<SequenceRecord>> {
        let object_key = Self::object_key(key);
        let object = self
            .retry
            .run("crm.get_object", || self.client.get_object(&object_key))
            .await?;
        metrics::counter!("crm.reads").increment(1);
        object
            .map(|o| schema::from_properties(&o.properties))
            .transpose()
    }

    async fn load_existing(&self, key: &SequenceKey) -> OutreachResult<SequenceRecord> {
        self.load(key)
            .await?
            .ok_or_else(|| OutreachError::permanent("crm", format!("sequence {key} not found")))
    }

    async fn write(&self, key: &SequenceKey, properties: PropertyMap) -> OutreachResult<()> {
        let object_key = Self::object_key(key);
        self.retry
            .run("crm.update_properties", || {
                self.client.update_properties(&object_key, properties.clone())
            })
            .await?;
        metrics::counter!("crm.writes").increment(1);
        Ok(())
    }

    /// Write `step` only while its stored status is still one of `from`.
    /// Returns `false` when another writer moved the step first.
    async fn transition_step(
        &self,
        key: &SequenceKey,
        step: &StepState,
        from: &[StepStatus],
    ) -> OutreachResult<bool> {
        let object_key = Self::object_key(key);
        let guard = FieldGuard::new(
            schema::step_field(step.index, "status"),
            from.iter().map(|s| Value::String(s.as_str().into())).collect(),
        );
        let properties = schema::step_properties(step);
        let applied = self
            .retry
            .run("crm.update_if", || {
                self.client.update_if(&object_key, &guard, properties.clone())
            })
            .await?;

        if applied {
            metrics::counter!("crm.writes").increment(1);
        } else {
            metrics::counter!("crm.step_conflicts").increment(1);
            debug!(
                key = %key,
                step = step.index,
                to = step.status.as_str(),
                "Step changed concurrently, transition skipped"
            );
        }
        Ok(applied)
    }
}

const UNSENT: [StepStatus; 3] = [StepStatus::Pending, StepStatus::Scheduled, StepStatus::Failed];

fn step_of<'a>(record: &'a SequenceRecord, step_index: u32) -> OutreachResult<&'a StepState> {
    record.step(step_index).ok_or(OutreachError::InvalidStep {
        campaign: record.campaign_type,
        step: step_index,
        steps: record.step_count(),
    })
}

#[async_trait]
impl SequenceStore for CrmSequenceStore {
    async fn find_active(&self, key: &SequenceKey) -> OutreachResult<Option<SequenceRecord>> {
        Ok(self.load(key).await?.filter(SequenceRecord::is_active))
    }

    async fn find(&self, key: &SequenceKey) -> OutreachResult<Option<SequenceRecord>> {
        self.load(key).await
    }

    async fn create(
        &self,
        subject: &Subject,
        campaign_type: CampaignType,
        segment: Segment,
        step_count: usize,
    ) -> OutreachResult<SequenceRecord> {
        let record = SequenceRecord::new(subject, campaign_type, segment, step_count, Utc::now());
        let key = record.key();
        let object_key = Self::object_key(&key);
        let properties = schema::to_properties(&record);

        let created = self
            .retry
            .run("crm.create_if_absent", || {
                self.client.create_if_absent(&object_key, properties.clone())
            })
            .await?;

        if !created {
            metrics::counter!("crm.create_conflicts").increment(1);
            return Err(OutreachError::DuplicateSequence {
                key: key.to_string(),
            });
        }

        info!(
            sequence_id = %record.id,
            key = %key,
            segment = %segment,
            steps = step_count,
            "Sequence record created"
        );
        Ok(record)
    }

    async fn mark_step_scheduled(
        &self,
        key: &SequenceKey,
        step_index: u32,
        fire_time: DateTime<Utc>,
    ) -> OutreachResult<()> {
        let record = self.load_existing(key).await?;
        let current = step_of(&record, step_index)?;
        if current.status != StepStatus::Pending {
            debug!(key = %key, step = step_index, status = current.status.as_str(), "Step already past pending");
            return Ok(());
        }

        let mut step = current.clone();
        step.status = StepStatus::Scheduled;
        step.fire_time = Some(fire_time);
        self.transition_step(key, &step, &[StepStatus::Pending]).await?;
        Ok(())
    }

    async fn mark_step_sent(
        &self,
        key: &SequenceKey,
        step_index: u32,
        sent_at: DateTime<Utc>,
        message_id: &str,
    ) -> OutreachResult<()> {
        let record = self.load_existing(key).await?;
        let current = step_of(&record, step_index)?;
        if current.status == StepStatus::Sent {
            debug!(key = %key, step = step_index, "Step already marked sent");
            return Ok(());
        }

        let mut step = current.clone();
        step.status = StepStatus::Sent;
        step.sent_at = Some(sent_at);
        step.message_id = Some(message_id.to_string());
        step.last_error = None;
        self.transition_step(key, &step, &UNSENT).await?;
        Ok(())
    }

    async fn mark_step_failed(
        &self,
        key: &SequenceKey,
        step_index: u32,
        error: &str,
    ) -> OutreachResult<()> {
        let record = self.load_existing(key).await?;
        let current = step_of(&record, step_index)?;
        if current.status == StepStatus::Sent {
            debug!(key = %key, step = step_index, "Ignoring failure for a sent step");
            return Ok(());
        }

        let mut step = current.clone();
        step.status = StepStatus::Failed;
        step.last_error = Some(error.to_string());
        self.transition_step(key, &step, &UNSENT).await?;
        Ok(())
    }

    async fn mark_completed(&self, key: &SequenceKey) -> OutreachResult<()> {
        let record = self.load_existing(key).await?;
        if record.status != SequenceStatus::Active {
            return Ok(());
        }

        self.write(
            key,
            PropertyMap::from([
                (
                    schema::STATUS.to_string(),
                    Value::String(SequenceStatus::Completed.as_str().into()),
                ),
                (schema::COMPLETED_AT.to_string(), schema::time_value(Utc::now())),
            ]),
        )
        .await?;
        info!(key = %key, "Sequence completed");
        Ok(())
    }

    async fn cancel(&self, key: &SequenceKey, reason: &str) -> OutreachResult<()> {
        let record = self.load_existing(key).await?;
        if record.status != SequenceStatus::Active {
            return Ok(());
        }

        self.write(
            key,
            PropertyMap::from([
                (
                    schema::STATUS.to_string(),
                    Value::String(SequenceStatus::Cancelled.as_str().into()),
                ),
                (schema::CANCEL_REASON.to_string(), Value::String(reason.to_string())),
            ]),
        )
        .await?;
        info!(key = %key, reason, "Sequence cancelled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::CrmObject;
    use crate::memory::InMemoryCrm;
    use outreach_core::types::SignalCounts;
    use std::sync::Mutex;

    /// Applies a queued write from "another worker" right after the next
    /// read returns, so it lands between the store's read and its write.
    struct InterleavingCrm {
        inner: Arc<InMemoryCrm>,
        after_read: Mutex<Option<(String, PropertyMap)>>,
    }

    #[async_trait]
    impl CrmClient for InterleavingCrm {
        fn name(&self) -> &'static str {
            "interleaving"
        }

        async fn get_object(&self, key: &str) -> OutreachResult<Option<CrmObject>> {
            let object = self.inner.get_object(key).await?;
            let queued = self.after_read.lock().unwrap().take();
            if let Some((object_key, properties)) = queued {
                self.inner.update_properties(&object_key, properties).await?;
            }
            Ok(object)
        }

        async fn create_if_absent(&self, key: &str, properties: PropertyMap) -> OutreachResult<bool> {
            self.inner.create_if_absent(key, properties).await
        }

        async fn update_properties(&self, key: &str, properties: PropertyMap) -> OutreachResult<()> {
            self.inner.update_properties(key, properties).await
        }

        async fn update_if(
            &self,
            key: &str,
            guard: &FieldGuard,
            properties: PropertyMap,
        ) -> OutreachResult<bool> {
            self.inner.update_if(key, guard, properties).await
        }
    }

    fn sent_elsewhere(step_index: u32, message_id: &str) -> PropertyMap {
        schema::step_properties(&StepState {
            index: step_index,
            status: StepStatus::Sent,
            fire_time: None,
            sent_at: Some(Utc::now()),
            message_id: Some(message_id.to_string()),
            last_error: None,
        })
    }

    fn subject(email: &str) -> Subject {
        Subject {
            email: email.into(),
            display_name: "Ada".into(),
            account_name: "Acme".into(),
            signals: SignalCounts::new(2, 1, 2, 3),
            score: None,
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    fn store() -> (Arc<InMemoryCrm>, CrmSequenceStore) {
        let crm = Arc::new(InMemoryCrm::new());
        let store = CrmSequenceStore::new(crm.clone(), fast_retry());
        (crm, store)
    }

    #[tokio::test]
    async fn test_create_then_find() {
        let (_, store) = store();
        let record = store
            .create(&subject("a@x.com"), CampaignType::Nurture, Segment::Critical, 7)
            .await
            .unwrap();

        let found = store.find_active(&record.key()).await.unwrap().unwrap();
        assert_eq!(found.id, record.id);
        assert_eq!(found.steps.len(), 7);
        assert_eq!(found.segment, Segment::Critical);
    }

    #[tokio::test]
    async fn test_second_create_is_duplicate() {
        let (crm, store) = store();
        store
            .create(&subject("a@x.com"), CampaignType::Nurture, Segment::Critical, 7)
            .await
            .unwrap();
        let err = store
            .create(&subject("a@x.com"), CampaignType::Nurture, Segment::Urgent, 7)
            .await
            .unwrap_err();

        assert!(matches!(err, OutreachError::DuplicateSequence { .. }));
        assert_eq!(crm.len(), 1);
    }

    #[tokio::test]
    async fn test_same_subject_different_campaigns_coexist() {
        let (crm, store) = store();
        store
            .create(&subject("a@x.com"), CampaignType::Nurture, Segment::Critical, 7)
            .await
            .unwrap();
        store
            .create(&subject("a@x.com"), CampaignType::NoShow, Segment::Critical, 4)
            .await
            .unwrap();
        assert_eq!(crm.len(), 2);
    }

    #[tokio::test]
    async fn test_mark_sent_is_idempotent() {
        let (_, store) = store();
        let record = store
            .create(&subject("a@x.com"), CampaignType::NoShow, Segment::Urgent, 4)
            .await
            .unwrap();
        let key = record.key();
        let first = Utc::now();

        store.mark_step_sent(&key, 2, first, "sg-1").await.unwrap();
        store
            .mark_step_sent(&key, 2, first + chrono::Duration::minutes(5), "sg-2")
            .await
            .unwrap();

        let found = store.find(&key).await.unwrap().unwrap();
        let step = found.step(2).unwrap();
        assert_eq!(step.status, StepStatus::Sent);
        assert_eq!(step.message_id.as_deref(), Some("sg-1"));
        assert_eq!(step.sent_at.map(|t| t.timestamp()), Some(first.timestamp()));
    }

    #[tokio::test]
    async fn test_failure_never_downgrades_sent() {
        let (_, store) = store();
        let record = store
            .create(&subject("a@x.com"), CampaignType::NoShow, Segment::Urgent, 4)
            .await
            .unwrap();
        let key = record.key();

        store.mark_step_sent(&key, 1, Utc::now(), "sg-1").await.unwrap();
        store.mark_step_failed(&key, 1, "late bounce").await.unwrap();
        store.mark_step_failed(&key, 3, "rejected").await.unwrap();
        store.mark_step_failed(&key, 3, "rejected").await.unwrap();

        let found = store.find(&key).await.unwrap().unwrap();
        assert_eq!(found.step(1).unwrap().status, StepStatus::Sent);
        assert_eq!(found.step(3).unwrap().status, StepStatus::Failed);
        assert_eq!(found.step(3).unwrap().last_error.as_deref(), Some("rejected"));
    }

    #[tokio::test]
    async fn test_scheduled_only_from_pending() {
        let (_, store) = store();
        let record = store
            .create(&subject("a@x.com"), CampaignType::NoShow, Segment::Urgent, 4)
            .await
            .unwrap();
        let key = record.key();
        let now = Utc::now();

        store.mark_step_sent(&key, 1, now, "sg-1").await.unwrap();
        store.mark_step_scheduled(&key, 1, now).await.unwrap();
        store.mark_step_scheduled(&key, 2, now).await.unwrap();

        let found = store.find(&key).await.unwrap().unwrap();
        assert_eq!(found.step(1).unwrap().status, StepStatus::Sent);
        assert_eq!(found.step(2).unwrap().status, StepStatus::Scheduled);
        assert_eq!(found.pending_steps(), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_concurrent_send_survives_late_scheduled_and_failed_marks() {
        let crm = Arc::new(InterleavingCrm {
            inner: Arc::new(InMemoryCrm::new()),
            after_read: Mutex::new(None),
        });
        let store = CrmSequenceStore::new(crm.clone(), fast_retry());
        let record = store
            .create(&subject("a@x.com"), CampaignType::NoShow, Segment::Urgent, 4)
            .await
            .unwrap();
        let key = record.key();
        let object_key = format!("sequence:{key}");

        *crm.after_read.lock().unwrap() = Some((object_key.clone(), sent_elsewhere(1, "sg-1")));
        store.mark_step_scheduled(&key, 1, Utc::now()).await.unwrap();

        *crm.after_read.lock().unwrap() = Some((object_key, sent_elsewhere(2, "sg-2")));
        store.mark_step_failed(&key, 2, "timeout").await.unwrap();

        let found = store.find(&key).await.unwrap().unwrap();
        for (index, message_id) in [(1, "sg-1"), (2, "sg-2")] {
            let step = found.step(index).unwrap();
            assert_eq!(step.status, StepStatus::Sent);
            assert_eq!(step.message_id.as_deref(), Some(message_id));
            assert!(step.sent_at.is_some());
            assert!(step.last_error.is_none());
        }
        assert!(found.any_step_sent());
    }

    #[tokio::test]
    async fn test_concurrent_sends_keep_the_first_message_id() {
        let crm = Arc::new(InterleavingCrm {
            inner: Arc::new(InMemoryCrm::new()),
            after_read: Mutex::new(None),
        });
        let store = CrmSequenceStore::new(crm.clone(), fast_retry());
        let record = store
            .create(&subject("a@x.com"), CampaignType::NoShow, Segment::Urgent, 4)
            .await
            .unwrap();
        let key = record.key();

        *crm.after_read.lock().unwrap() = Some((format!("sequence:{key}"), sent_elsewhere(3, "sg-first")));
        store.mark_step_sent(&key, 3, Utc::now(), "sg-second").await.unwrap();

        let found = store.find(&key).await.unwrap().unwrap();
        assert_eq!(found.step(3).unwrap().message_id.as_deref(), Some("sg-first"));
    }

    #[tokio::test]
    async fn test_out_of_range_step_is_invalid() {
        let (_, store) = store();
        let record = store
            .create(&subject("a@x.com"), CampaignType::NoShow, Segment::Urgent, 4)
            .await
            .unwrap();
        let err = store
            .mark_step_sent(&record.key(), 5, Utc::now(), "sg-1")
            .await
            .unwrap_err();
        assert!(matches!(err, OutreachError::InvalidStep { step: 5, .. }));
    }

    #[tokio::test]
    async fn test_cancelled_and_completed_are_not_active() {
        let (_, store) = store();
        let a = store
            .create(&subject("a@x.com"), CampaignType::NoShow, Segment::Urgent, 4)
            .await
            .unwrap();
        let b = store
            .create(&subject("b@x.com"), CampaignType::NoShow, Segment::Urgent, 4)
            .await
            .unwrap();

        store.cancel(&a.key(), "unsubscribed").await.unwrap();
        store.mark_completed(&b.key()).await.unwrap();
        // Completing a cancelled sequence leaves it cancelled.
        store.mark_completed(&a.key()).await.unwrap();

        assert!(store.find_active(&a.key()).await.unwrap().is_none());
        assert!(store.find_active(&b.key()).await.unwrap().is_none());

        let a = store.find(&a.key()).await.unwrap().unwrap();
        assert_eq!(a.status, SequenceStatus::Cancelled);
        assert_eq!(a.cancel_reason.as_deref(), Some("unsubscribed"));
        let b = store.find(&b.key()).await.unwrap().unwrap();
        assert_eq!(b.status, SequenceStatus::Completed);
        assert!(b.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_transient_crm_failures_are_retried() {
        let (crm, store) = store();
        crm.fail_next(2);
        let record = store
            .create(&subject("a@x.com"), CampaignType::Onboarding, Segment::Optimize, 6)
            .await
            .unwrap();
        assert_eq!(record.steps.len(), 6);
        assert_eq!(crm.len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_transient_error() {
        let (crm, store) = store();
        crm.fail_next(10);
        let err = store
            .find(&SequenceKey::new("a@x.com", CampaignType::Nurture))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_malformed_record_is_permanent() {
        let (crm, store) = store();
        let record = store
            .create(&subject("a@x.com"), CampaignType::NoShow, Segment::Urgent, 4)
            .await
            .unwrap();
        let object_key = format!("sequence:{}", record.key());
        let mut raw = crm.raw(&object_key).unwrap();
        raw.insert("segment".into(), Value::String("SEVERE".into()));
        crm.put_raw(&object_key, raw);

        let err = store.find(&record.key()).await.unwrap_err();
        assert!(matches!(err, OutreachError::Permanent { .. }));
    }
}
