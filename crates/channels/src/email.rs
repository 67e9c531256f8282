//! Email delivery via SendGrid, plus a recording provider for dry runs.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use outreach_core::config::SendGridConfig;
use outreach_core::{OutreachError, OutreachResult};
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    pub to_name: String,
    pub subject: String,
    pub body: String,
}

/// Outbound email transport. `idempotency_key` is stable per sequence step,
/// so a retried send must not produce a second email.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the provider's message id.
    async fn send(&self, message: &EmailMessage, idempotency_key: &str) -> OutreachResult<String>;
}

/// SendGrid v3 mail send.
pub struct SendGridProvider {
    config: SendGridConfig,
    http: reqwest::Client,
}

impl SendGridProvider {
    pub fn new(config: SendGridConfig) -> OutreachResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| OutreachError::Config(format!("sendgrid http client: {e}")))?;

        info!(
            from = %config.from_email,
            click_tracking = config.click_tracking,
            open_tracking = config.open_tracking,
            "SendGrid provider initialized"
        );
        Ok(Self { config, http })
    }

    fn payload(&self, message: &EmailMessage, idempotency_key: &str) -> serde_json::Value {
        serde_json::json!({
            "personalizations": [{
                "to": [{"email": message.to, "name": message.to_name}],
                "custom_args": {
                    "idempotency_key": idempotency_key
                }
            }],
            "from": {
                "email": self.config.from_email,
                "name": self.config.from_name
            },
            "subject": message.subject,
            "content": [{
                "type": "text/html",
                "value": message.body
            }],
            "tracking_settings": {
                "click_tracking": {"enable": self.config.click_tracking},
                "open_tracking": {"enable": self.config.open_tracking}
            }
        })
    }
}

#[async_trait]
impl EmailProvider for SendGridProvider {
    fn name(&self) -> &'static str {
        "sendgrid"
    }

    async fn send(&self, message: &EmailMessage, idempotency_key: &str) -> OutreachResult<String> {
        let url = format!("{}/v3/mail/send", self.config.base_url.trim_end_matches('/'));
        debug!(to = %message.to, subject = %message.subject, idempotency_key, "Sending email via SendGrid");

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .header("Idempotency-Key", idempotency_key)
            .json(&self.payload(message, idempotency_key))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    OutreachError::transient("sendgrid", e)
                } else {
                    OutreachError::permanent("sendgrid", e)
                }
            })?;

        let status = resp.status();
        if status.is_success() {
            let message_id = resp
                .headers()
                .get("x-message-id")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .unwrap_or_else(|| format!("sg-{}", uuid::Uuid::new_v4()));
            metrics::counter!("sendgrid.emails_sent").increment(1);
            return Ok(message_id);
        }

        let body = resp.text().await.unwrap_or_default();
        metrics::counter!("sendgrid.errors", "status" => status.as_u16().to_string()).increment(1);
        let message = format!("{status}: {body}");
        if is_retryable_status(status) {
            warn!(status = %status, "SendGrid rejected send, will retry");
            Err(OutreachError::transient("sendgrid", message))
        } else {
            Err(OutreachError::permanent("sendgrid", message))
        }
    }
}

/// Rate limiting and server-side failures are worth another attempt.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEmail {
    pub idempotency_key: String,
    pub message_id: String,
    pub message: EmailMessage,
}

/// Keeps sent messages in memory instead of delivering them. Deduplicates on
/// the idempotency key the way SendGrid does.
#[derive(Default)]
pub struct RecordingEmailProvider {
    sent: Mutex<Vec<SentEmail>>,
    by_key: DashMap<String, String>,
    /// Upcoming failures; `true` entries are retryable.
    failures: Mutex<VecDeque<bool>>,
}

impl RecordingEmailProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` sends.
    pub fn fail_next(&self, n: usize, retryable: bool) {
        self.failures.lock().extend(std::iter::repeat(retryable).take(n));
    }

    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl EmailProvider for RecordingEmailProvider {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, message: &EmailMessage, idempotency_key: &str) -> OutreachResult<String> {
        if let Some(retryable) = self.failures.lock().pop_front() {
            return Err(if retryable {
                OutreachError::transient("email", "injected provider timeout")
            } else {
                OutreachError::permanent("email", "injected provider rejection")
            });
        }

        if let Some(existing) = self.by_key.get(idempotency_key) {
            debug!(idempotency_key, "Duplicate send suppressed");
            return Ok(existing.clone());
        }

        let mut sent = self.sent.lock();
        let message_id = format!("rec-{}", sent.len() + 1);
        sent.push(SentEmail {
            idempotency_key: idempotency_key.to_string(),
            message_id: message_id.clone(),
            message: message.clone(),
        });
        self.by_key.insert(idempotency_key.to_string(), message_id.clone());
        info!(to = %message.to, subject = %message.subject, message_id = %message_id, "Email recorded");
        Ok(message_id)
    }
}
