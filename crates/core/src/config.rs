use serde::Deserialize;

use crate::retry::RetryPolicy;
use crate::types::{DelayMode, Segment};

/// Root application configuration. Loaded from environment variables
/// with the prefix `OUTREACH__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub sequencer: SequencerConfig,
    #[serde(default)]
    pub signals: SignalConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
    #[serde(default)]
    pub sendgrid: SendGridConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SequencerConfig {
    /// `production` (hours) or `accelerated` (minutes).
    #[serde(default)]
    pub mode: DelayMode,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_worker_batch_size")]
    pub batch_size: usize,
    /// Segments at or above this severity raise a chat alert on creation.
    #[serde(default = "default_alert_segment")]
    pub alert_segment: Segment,
}

/// How strictly incoming signal counts are checked before classification.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignalConfig {
    /// When set, the four counts must sum to exactly this value.
    #[serde(default)]
    pub expected_total: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Use Redis for the CRM store and the step queue instead of in-memory backends.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_clickhouse_url")]
    pub url: String,
    #[serde(default = "default_clickhouse_db")]
    pub database: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendGridConfig {
    /// Empty means dry-run: messages are recorded locally instead of sent.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_from_email")]
    pub from_email: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    #[serde(default = "default_sendgrid_base_url")]
    pub base_url: String,
    #[serde(default = "default_sendgrid_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_tracking")]
    pub click_tracking: bool,
    #[serde(default = "default_tracking")]
    pub open_tracking: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertConfig {
    /// Slack incoming-webhook URL. Alerts are disabled when unset.
    #[serde(default)]
    pub slack_webhook_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_worker_batch_size() -> usize {
    100
}
fn default_alert_segment() -> Segment {
    Segment::Critical
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_key_prefix() -> String {
    "outreach".to_string()
}
fn default_clickhouse_url() -> String {
    "http://localhost:8123".to_string()
}
fn default_clickhouse_db() -> String {
    "outreach".to_string()
}
fn default_batch_size() -> usize {
    1000
}
fn default_flush_interval_ms() -> u64 {
    1000
}
fn default_from_email() -> String {
    "hello@example.com".to_string()
}
fn default_from_name() -> String {
    "Outreach".to_string()
}
fn default_sendgrid_base_url() -> String {
    "https://api.sendgrid.com".to_string()
}
fn default_sendgrid_timeout_ms() -> u64 {
    10_000
}
fn default_tracking() -> bool {
    true
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            mode: DelayMode::default(),
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_worker_batch_size(),
            alert_segment: default_alert_segment(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_clickhouse_url(),
            database: default_clickhouse_db(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl Default for SendGridConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            from_email: default_from_email(),
            from_name: default_from_name(),
            base_url: default_sendgrid_base_url(),
            timeout_ms: default_sendgrid_timeout_ms(),
            click_tracking: default_tracking(),
            open_tracking: default_tracking(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_host(),
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            sequencer: SequencerConfig::default(),
            signals: SignalConfig::default(),
            retry: RetryPolicy::default(),
            redis: RedisConfig::default(),
            clickhouse: ClickHouseConfig::default(),
            sendgrid: SendGridConfig::default(),
            alerts: AlertConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    /// (e.g. `OUTREACH__SEQUENCER__MODE=accelerated`).
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("OUTREACH")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
