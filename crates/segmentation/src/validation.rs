//! Trigger validation. Runs before classification and before any side effect.

use outreach_core::config::SignalConfig;
use outreach_core::types::{ReportedSignals, SignalCounts, Subject, TriggerEvent};
use outreach_core::{OutreachError, OutreachResult};
use tracing::debug;

/// Validate a trigger event into a `Subject`.
///
/// Fails with `OutreachError::Validation` when the email is missing or
/// malformed, a signal count is negative, the score is not finite, or the
/// counts do not sum to `policy.expected_total` (when configured). Absent
/// signal counts are treated as all zero.
pub fn validate_event(event: &TriggerEvent, policy: &SignalConfig) -> OutreachResult<Subject> {
    let email = normalize_email(&event.email)?;
    let signals = validate_signals(event.signal_counts.as_ref(), policy)?;

    if let Some(score) = event.score {
        if !score.is_finite() {
            return Err(OutreachError::Validation(format!(
                "score must be a finite number, got {score}"
            )));
        }
    }

    debug!(email = %email, campaign = %event.campaign_type, "Trigger event validated");

    Ok(Subject {
        email,
        display_name: event.display_name.trim().to_string(),
        account_name: event.account_name.trim().to_string(),
        signals,
        score: event.score,
    })
}

/// Trim and lowercase an email, rejecting anything that is not `local@domain.tld`.
pub fn normalize_email(raw: &str) -> OutreachResult<String> {
    let email = raw.trim().to_ascii_lowercase();
    if email.is_empty() {
        return Err(OutreachError::Validation("email is required".into()));
    }
    if !is_well_formed(&email) {
        return Err(OutreachError::Validation(format!(
            "email '{email}' is malformed"
        )));
    }
    Ok(email)
}

fn is_well_formed(email: &str) -> bool {
    if email.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !domain.contains("..")
}

pub fn validate_signals(
    reported: Option<&ReportedSignals>,
    policy: &SignalConfig,
) -> OutreachResult<SignalCounts> {
    let Some(r) = reported else {
        return Ok(SignalCounts::default());
    };

    let counts = SignalCounts::new(
        non_negative("red", r.red)?,
        non_negative("orange", r.orange)?,
        non_negative("yellow", r.yellow)?,
        non_negative("green", r.green)?,
    );

    if let Some(expected) = policy.expected_total {
        if counts.total() != expected as u64 {
            return Err(OutreachError::Validation(format!(
                "signal counts sum to {}, expected {expected}",
                counts.total()
            )));
        }
    }

    Ok(counts)
}

fn non_negative(name: &str, value: i64) -> OutreachResult<u32> {
    u32::try_from(value).map_err(|_| {
        OutreachError::Validation(format!("signal count '{name}' out of range: {value}"))
    })
}
