//! Translation between `SequenceRecord` and the CRM's flat property names.
//!
//! Per-step fields are stored as independent properties (`step_3_status`,
//! `step_3_sent_at`, ...) so that updates to different steps never overwrite
//! each other.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use outreach_core::types::{
    CampaignType, Segment, SequenceRecord, SequenceStatus, StepState, StepStatus,
};
use outreach_core::{OutreachError, OutreachResult};
use serde_json::Value;
use uuid::Uuid;

use crate::client::PropertyMap;

pub const SEQUENCE_ID: &str = "sequence_id";
pub const EMAIL: &str = "email";
pub const DISPLAY_NAME: &str = "display_name";
pub const ACCOUNT_NAME: &str = "account_name";
pub const SCORE: &str = "score";
pub const CAMPAIGN_TYPE: &str = "campaign_type";
pub const SEGMENT: &str = "segment";
pub const STATUS: &str = "sequence_status";
pub const CANCEL_REASON: &str = "cancel_reason";
pub const CREATED_AT: &str = "created_at";
pub const COMPLETED_AT: &str = "completed_at";
pub const STEP_COUNT: &str = "step_count";

pub fn step_field(index: u32, field: &str) -> String {
    format!("step_{index}_{field}")
}

pub fn to_properties(record: &SequenceRecord) -> PropertyMap {
    let mut props = PropertyMap::new();
    props.insert(SEQUENCE_ID.into(), Value::String(record.id.to_string()));
    props.insert(EMAIL.into(), Value::String(record.email.clone()));
    props.insert(DISPLAY_NAME.into(), Value::String(record.display_name.clone()));
    props.insert(ACCOUNT_NAME.into(), Value::String(record.account_name.clone()));
    props.insert(SCORE.into(), record.score.map(Value::from).unwrap_or(Value::Null));
    props.insert(
        CAMPAIGN_TYPE.into(),
        Value::String(record.campaign_type.as_str().into()),
    );
    props.insert(SEGMENT.into(), Value::String(record.segment.as_str().into()));
    props.insert(STATUS.into(), Value::String(record.status.as_str().into()));
    props.insert(CANCEL_REASON.into(), opt_string(record.cancel_reason.as_deref()));
    props.insert(CREATED_AT.into(), time_value(record.created_at));
    props.insert(COMPLETED_AT.into(), opt_time(record.completed_at));
    props.insert(STEP_COUNT.into(), Value::from(record.steps.len() as u64));
    for step in &record.steps {
        props.extend(step_properties(step));
    }
    props
}

/// The properties owned by a single step.
pub fn step_properties(step: &StepState) -> PropertyMap {
    let i = step.index;
    PropertyMap::from([
        (step_field(i, "status"), Value::String(step.status.as_str().into())),
        (step_field(i, "fire_time"), opt_time(step.fire_time)),
        (step_field(i, "sent_at"), opt_time(step.sent_at)),
        (step_field(i, "message_id"), opt_string(step.message_id.as_deref())),
        (step_field(i, "error"), opt_string(step.last_error.as_deref())),
    ])
}

pub fn from_properties(props: &PropertyMap) -> OutreachResult<SequenceRecord> {
    let step_count = props
        .get(STEP_COUNT)
        .and_then(Value::as_u64)
        .ok_or_else(|| malformed(STEP_COUNT, "missing or not an integer"))?;

    let steps = (1..=step_count as u32)
        .map(|i| {
            Ok(StepState {
                index: i,
                status: parse_field(props, &step_field(i, "status"))?,
                fire_time: opt_time_field(props, &step_field(i, "fire_time"))?,
                sent_at: opt_time_field(props, &step_field(i, "sent_at"))?,
                message_id: opt_str_field(props, &step_field(i, "message_id"))?,
                last_error: opt_str_field(props, &step_field(i, "error"))?,
            })
        })
        .collect::<OutreachResult<Vec<_>>>()?;

    let id = Uuid::parse_str(str_field(props, SEQUENCE_ID)?)
        .map_err(|e| malformed(SEQUENCE_ID, e))?;

    let score = match props.get(SCORE) {
        None | Some(Value::Null) => None,
        Some(v) => Some(v.as_f64().ok_or_else(|| malformed(SCORE, "not a number"))?),
    };

    Ok(SequenceRecord {
        id,
        email: str_field(props, EMAIL)?.to_string(),
        display_name: opt_str_field(props, DISPLAY_NAME)?.unwrap_or_default(),
        account_name: opt_str_field(props, ACCOUNT_NAME)?.unwrap_or_default(),
        score,
        campaign_type: parse_field::<CampaignType>(props, CAMPAIGN_TYPE)?,
        segment: parse_field::<Segment>(props, SEGMENT)?,
        status: parse_field::<SequenceStatus>(props, STATUS)?,
        cancel_reason: opt_str_field(props, CANCEL_REASON)?,
        created_at: time_field(props, CREATED_AT)?,
        completed_at: opt_time_field(props, COMPLETED_AT)?,
        steps,
    })
}

pub fn time_value(t: DateTime<Utc>) -> Value {
    Value::String(t.to_rfc3339())
}

fn opt_time(t: Option<DateTime<Utc>>) -> Value {
    t.map(time_value).unwrap_or(Value::Null)
}

fn opt_string(s: Option<&str>) -> Value {
    s.map(|s| Value::String(s.to_string())).unwrap_or(Value::Null)
}

fn malformed(field: &str, reason: impl std::fmt::Display) -> OutreachError {
    OutreachError::permanent("crm", format!("malformed property '{field}': {reason}"))
}

fn str_field<'a>(props: &'a PropertyMap, field: &str) -> OutreachResult<&'a str> {
    props
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(field, "missing or not a string"))
}

fn opt_str_field(props: &PropertyMap, field: &str) -> OutreachResult<Option<String>> {
    match props.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(malformed(field, format!("expected string, got {other}"))),
    }
}

fn parse_field<T>(props: &PropertyMap, field: &str) -> OutreachResult<T>
where
    T: FromStr<Err = OutreachError>,
{
    str_field(props, field)?
        .parse()
        .map_err(|e: OutreachError| malformed(field, e))
}

fn time_field(props: &PropertyMap, field: &str) -> OutreachResult<DateTime<Utc>> {
    parse_time(field, str_field(props, field)?)
}

fn opt_time_field(props: &PropertyMap, field: &str) -> OutreachResult<Option<DateTime<Utc>>> {
    opt_str_field(props, field)?
        .map(|s| parse_time(field, &s))
        .transpose()
}

fn parse_time(field: &str, raw: &str) -> OutreachResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| malformed(field, e))
}
