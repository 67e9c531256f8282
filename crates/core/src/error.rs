use thiserror::Error;

use crate::types::CampaignType;

pub type OutreachResult<T> = Result<T, OutreachError>;

#[derive(Error, Debug)]
pub enum OutreachError {
    /// Malformed trigger event. Rejected before any side effect, never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A sequence already exists for the (email, campaign) key.
    #[error("Sequence already exists for {key}")]
    DuplicateSequence { key: String },

    #[error("Invalid step {step} for campaign {campaign} ({steps} steps defined)")]
    InvalidStep {
        campaign: CampaignType,
        step: u32,
        steps: usize,
    },

    /// Timeouts, connection resets, rate limits. Retried under a `RetryPolicy`.
    #[error("Transient {service} error: {message}")]
    Transient {
        service: &'static str,
        message: String,
    },

    /// Malformed schema, rejected payloads, missing templates. Never retried.
    #[error("Permanent {service} error: {message}")]
    Permanent {
        service: &'static str,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl OutreachError {
    pub fn transient(service: &'static str, message: impl std::fmt::Display) -> Self {
        Self::Transient {
            service,
            message: message.to_string(),
        }
    }

    pub fn permanent(service: &'static str, message: impl std::fmt::Display) -> Self {
        Self::Permanent {
            service,
            message: message.to_string(),
        }
    }

    /// Only transient collaborator failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Short label used for metrics and analytics records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::DuplicateSequence { .. } => "duplicate_sequence",
            Self::InvalidStep { .. } => "invalid_step",
            Self::Transient { .. } => "transient",
            Self::Permanent { .. } => "permanent",
            Self::Config(_) => "config",
            Self::Serialization(_) => "serialization",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<config::ConfigError> for OutreachError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
