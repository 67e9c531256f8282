use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OutreachError;

// ─── Segments ───────────────────────────────────────────────────────────────

/// Priority classification derived from a subject's signal counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Segment {
    Critical,
    Urgent,
    Optimize,
}

impl Segment {
    pub const ALL: [Segment; 3] = [Segment::Critical, Segment::Urgent, Segment::Optimize];

    pub fn as_str(&self) -> &'static str {
        match self {
            Segment::Critical => "CRITICAL",
            Segment::Urgent => "URGENT",
            Segment::Optimize => "OPTIMIZE",
        }
    }

    /// Lowercase form used inside template ids.
    pub fn slug(&self) -> &'static str {
        match self {
            Segment::Critical => "critical",
            Segment::Urgent => "urgent",
            Segment::Optimize => "optimize",
        }
    }

    /// Higher is more severe.
    pub fn severity(&self) -> u8 {
        match self {
            Segment::Critical => 3,
            Segment::Urgent => 2,
            Segment::Optimize => 1,
        }
    }

    /// True when this segment is at least as severe as `threshold`.
    pub fn meets(&self, threshold: Segment) -> bool {
        self.severity() >= threshold.severity()
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Segment {
    type Err = OutreachError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CRITICAL" => Ok(Segment::Critical),
            "URGENT" => Ok(Segment::Urgent),
            "OPTIMIZE" => Ok(Segment::Optimize),
            other => Err(OutreachError::Validation(format!("unknown segment '{other}'"))),
        }
    }
}

// ─── Campaigns ──────────────────────────────────────────────────────────────

/// Category of outreach sequence. Each owns its own step list and delay table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignType {
    Nurture,
    NoShow,
    PostCall,
    Onboarding,
}

impl CampaignType {
    pub const ALL: [CampaignType; 4] = [
        CampaignType::Nurture,
        CampaignType::NoShow,
        CampaignType::PostCall,
        CampaignType::Onboarding,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignType::Nurture => "nurture",
            CampaignType::NoShow => "no_show",
            CampaignType::PostCall => "post_call",
            CampaignType::Onboarding => "onboarding",
        }
    }
}

impl fmt::Display for CampaignType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignType {
    type Err = OutreachError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "nurture" => Ok(CampaignType::Nurture),
            "no_show" | "noshow" => Ok(CampaignType::NoShow),
            "post_call" | "postcall" => Ok(CampaignType::PostCall),
            "onboarding" => Ok(CampaignType::Onboarding),
            other => Err(OutreachError::Validation(format!(
                "unknown campaign type '{other}'"
            ))),
        }
    }
}

/// Environment mode selecting the delay table unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelayMode {
    /// Offsets are hours.
    #[default]
    Production,
    /// Same integer values, read as minutes. Used for staging and tests.
    Accelerated,
}

// ─── Subjects & triggers ────────────────────────────────────────────────────

/// Validated, non-negative signal counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalCounts {
    pub red: u32,
    pub orange: u32,
    pub yellow: u32,
    pub green: u32,
}

impl SignalCounts {
    pub fn new(red: u32, orange: u32, yellow: u32, green: u32) -> Self {
        Self {
            red,
            orange,
            yellow,
            green,
        }
    }

    pub fn total(&self) -> u64 {
        self.red as u64 + self.orange as u64 + self.yellow as u64 + self.green as u64
    }
}

/// Signal counts exactly as reported by the trigger source. May be negative
/// until validated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedSignals {
    #[serde(default)]
    pub red: i64,
    #[serde(default)]
    pub orange: i64,
    #[serde(default)]
    pub yellow: i64,
    #[serde(default)]
    pub green: i64,
}

/// A business event that starts a sequence (signup, assessment, no-show, payment).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEvent {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub account_name: String,
    #[serde(default)]
    pub signal_counts: Option<ReportedSignals>,
    #[serde(default)]
    pub score: Option<f64>,
    pub campaign_type: CampaignType,
}

/// The lead/contact being sequenced, after validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    /// Trimmed, lowercased identity key.
    pub email: String,
    pub display_name: String,
    pub account_name: String,
    pub signals: SignalCounts,
    pub score: Option<f64>,
}

// ─── Sequence records ───────────────────────────────────────────────────────

/// The uniqueness key for a sequence: one per (subject email, campaign type).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceKey {
    pub email: String,
    pub campaign_type: CampaignType,
}

impl SequenceKey {
    pub fn new(email: impl Into<String>, campaign_type: CampaignType) -> Self {
        Self {
            email: email.into(),
            campaign_type,
        }
    }

    /// Stable id of one step's job, shared by the queue and the email
    /// provider's idempotency key.
    pub fn job_id(&self, step_index: u32) -> String {
        format!("{self}::{step_index}")
    }
}

impl fmt::Display for SequenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.email, self.campaign_type)
    }
}

/// Lifecycle of a sequence record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceStatus {
    Active,
    Completed,
    Cancelled,
}

impl SequenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SequenceStatus::Active => "active",
            SequenceStatus::Completed => "completed",
            SequenceStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for SequenceStatus {
    type Err = OutreachError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SequenceStatus::Active),
            "completed" => Ok(SequenceStatus::Completed),
            "cancelled" => Ok(SequenceStatus::Cancelled),
            other => Err(OutreachError::Validation(format!(
                "unknown sequence status '{other}'"
            ))),
        }
    }
}

/// Delivery status of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Scheduled,
    Sent,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Scheduled => "scheduled",
            StepStatus::Sent => "sent",
            StepStatus::Failed => "failed",
        }
    }
}

impl FromStr for StepStatus {
    type Err = OutreachError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "scheduled" => Ok(StepStatus::Scheduled),
            "sent" => Ok(StepStatus::Sent),
            "failed" => Ok(StepStatus::Failed),
            other => Err(OutreachError::Validation(format!(
                "unknown step status '{other}'"
            ))),
        }
    }
}

/// Per-step delivery state stored on the sequence record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    /// 1-based step index.
    pub index: u32,
    pub status: StepStatus,
    pub fire_time: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub message_id: Option<String>,
    pub last_error: Option<String>,
}

impl StepState {
    pub fn pending(index: u32) -> Self {
        Self {
            index,
            status: StepStatus::Pending,
            fire_time: None,
            sent_at: None,
            message_id: None,
            last_error: None,
        }
    }
}

/// One instantiated run of a campaign's step list for one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceRecord {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub account_name: String,
    pub score: Option<f64>,
    pub campaign_type: CampaignType,
    pub segment: Segment,
    pub status: SequenceStatus,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepState>,
}

impl SequenceRecord {
    /// A fresh record with every step pending.
    pub fn new(
        subject: &Subject,
        campaign_type: CampaignType,
        segment: Segment,
        step_count: usize,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: subject.email.clone(),
            display_name: subject.display_name.clone(),
            account_name: subject.account_name.clone(),
            score: subject.score,
            campaign_type,
            segment,
            status: SequenceStatus::Active,
            cancel_reason: None,
            created_at,
            completed_at: None,
            steps: (1..=step_count as u32).map(StepState::pending).collect(),
        }
    }

    pub fn key(&self) -> SequenceKey {
        SequenceKey::new(self.email.clone(), self.campaign_type)
    }

    pub fn step(&self, index: u32) -> Option<&StepState> {
        self.steps.iter().find(|s| s.index == index)
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn any_step_sent(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Sent)
    }

    /// Steps never handed to the queue (e.g. after a partial scheduling failure).
    pub fn pending_steps(&self) -> Vec<u32> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .map(|s| s.index)
            .collect()
    }

    pub fn is_active(&self) -> bool {
        self.status == SequenceStatus::Active
    }
}

// ─── Scheduled steps ────────────────────────────────────────────────────────

/// Self-contained payload handed to the durable queue for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledStep {
    pub email: String,
    pub campaign_type: CampaignType,
    pub step_index: u32,
    pub segment: Segment,
    pub fire_time: DateTime<Utc>,
    /// Redelivery counter, bumped each time a worker re-enqueues the step.
    #[serde(default)]
    pub attempt: u32,
}

impl ScheduledStep {
    pub fn key(&self) -> SequenceKey {
        SequenceKey::new(self.email.clone(), self.campaign_type)
    }

    pub fn job_id(&self) -> String {
        self.key().job_id(self.step_index)
    }
}

/// Handle returned once a step is accepted by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepHandle {
    pub job_id: String,
    pub step_index: u32,
    pub fire_time: DateTime<Utc>,
}

// ─── Delivery analytics ─────────────────────────────────────────────────────

/// Delivery analytics record, logged to ClickHouse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryEvent {
    pub event_id: Uuid,
    pub event_type: DeliveryEventType,
    pub email: String,
    pub campaign_type: CampaignType,
    pub step_index: Option<u32>,
    pub segment: Option<Segment>,
    pub template_id: Option<String>,
    pub message_id: Option<String>,
    pub error: Option<String>,
    /// Set by the persisting sink from the configured node id.
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
}

impl DeliveryEvent {
    pub fn with_step(mut self, step_index: u32) -> Self {
        self.step_index = Some(step_index);
        self
    }

    pub fn with_segment(mut self, segment: Segment) -> Self {
        self.segment = Some(segment);
        self
    }

    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryEventType {
    SequenceCreated,
    SequenceSkipped,
    SequenceCompleted,
    SequenceCancelled,
    StepScheduled,
    StepScheduleFailed,
    StepSent,
    StepFailed,
    StepSkipped,
    AlertRaised,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject() -> Subject {
        Subject {
            email: "a@x.com".into(),
            display_name: "Ada".into(),
            account_name: "Acme".into(),
            signals: SignalCounts::new(2, 1, 2, 3),
            score: Some(41.5),
        }
    }

    #[test]
    fn test_trigger_event_wire_format() {
        let raw = r#"{
            "email": "a@x.com",
            "displayName": "Ada",
            "accountName": "Acme",
            "signalCounts": {"red": 2, "orange": 1, "yellow": 2, "green": 3},
            "campaignType": "nurture"
        }"#;
        let event: TriggerEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.campaign_type, CampaignType::Nurture);
        assert_eq!(event.signal_counts.unwrap().red, 2);
        assert!(event.score.is_none());
    }

    #[test]
    fn test_campaign_type_parsing() {
        assert_eq!("no-show".parse::<CampaignType>().unwrap(), CampaignType::NoShow);
        assert_eq!("Post_Call".parse::<CampaignType>().unwrap(), CampaignType::PostCall);
        assert!("webinar".parse::<CampaignType>().is_err());
    }

    #[test]
    fn test_new_record_has_pending_steps() {
        let record = SequenceRecord::new(
            &subject(),
            CampaignType::Nurture,
            Segment::Critical,
            7,
            Utc::now(),
        );
        assert_eq!(record.step_count(), 7);
        assert_eq!(record.pending_steps(), vec![1, 2, 3, 4, 5, 6, 7]);
        assert!(!record.any_step_sent());
        assert_eq!(record.key().to_string(), "a@x.com::nurture");
        assert_eq!(record.key().job_id(3), "a@x.com::nurture::3");
    }

    #[test]
    fn test_segment_threshold() {
        assert!(Segment::Critical.meets(Segment::Critical));
        assert!(Segment::Critical.meets(Segment::Urgent));
        assert!(!Segment::Urgent.meets(Segment::Critical));
        assert!(Segment::Optimize.meets(Segment::Optimize));
    }

    #[test]
    fn test_scheduled_step_attempt_defaults_to_zero() {
        let raw = r#"{
            "email": "a@x.com",
            "campaignType": "no_show",
            "stepIndex": 2,
            "segment": "URGENT",
            "fireTime": "2026-01-01T00:00:00Z"
        }"#;
        let step: ScheduledStep = serde_json::from_str(raw).unwrap();
        assert_eq!(step.attempt, 0);
        assert_eq!(step.job_id(), "a@x.com::no_show::2");
    }
}
