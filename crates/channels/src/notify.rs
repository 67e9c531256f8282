//! Chat alerts for high-priority sequences.

use std::time::Duration;

use async_trait::async_trait;
use outreach_core::types::{CampaignType, Segment};
use outreach_core::{OutreachError, OutreachResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub email: String,
    pub display_name: String,
    pub account_name: String,
    pub campaign_type: CampaignType,
    pub segment: Segment,
    pub score: Option<f64>,
}

impl Alert {
    pub fn text(&self) -> String {
        let who = if self.display_name.is_empty() {
            self.email.clone()
        } else {
            format!("{} <{}>", self.display_name, self.email)
        };
        let mut text = format!(
            "*{} lead* entered the {} sequence: {}",
            self.segment, self.campaign_type, who
        );
        if !self.account_name.is_empty() {
            text.push_str(&format!(" ({})", self.account_name));
        }
        if let Some(score) = self.score {
            text.push_str(&format!(", score {score:.0}"));
        }
        text
    }
}

#[async_trait]
pub trait ChatNotifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn notify(&self, alert: &Alert) -> OutreachResult<()>;
}

/// Posts to a Slack incoming webhook.
pub struct SlackNotifier {
    webhook_url: String,
    http: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: impl Into<String>) -> OutreachResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| OutreachError::Config(format!("slack http client: {e}")))?;
        Ok(Self {
            webhook_url: webhook_url.into(),
            http,
        })
    }
}

#[async_trait]
impl ChatNotifier for SlackNotifier {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn notify(&self, alert: &Alert) -> OutreachResult<()> {
        let resp = self
            .http
            .post(&self.webhook_url)
            .json(&serde_json::json!({ "text": alert.text() }))
            .send()
            .await
            .map_err(|e| OutreachError::transient("slack", e))?;

        if resp.status().is_success() {
            info!(email = %alert.email, segment = %alert.segment, "Slack alert sent");
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(OutreachError::permanent("slack", format!("{status}: {body}")))
        }
    }
}

pub struct NoopNotifier;

#[async_trait]
impl ChatNotifier for NoopNotifier {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn notify(&self, alert: &Alert) -> OutreachResult<()> {
        debug!(email = %alert.email, "Alerting disabled, dropping alert");
        Ok(())
    }
}

/// Captures alerts in memory. Can be told to fail every call.
#[derive(Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<Alert>>,
    failing: Mutex<bool>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            alerts: Mutex::new(Vec::new()),
            failing: Mutex::new(true),
        }
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }
}

#[async_trait]
impl ChatNotifier for RecordingNotifier {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn notify(&self, alert: &Alert) -> OutreachResult<()> {
        if *self.failing.lock() {
            return Err(OutreachError::transient("chat", "injected webhook failure"));
        }
        self.alerts.lock().push(alert.clone());
        Ok(())
    }
}
