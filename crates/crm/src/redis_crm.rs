//! Redis-backed CRM client. Each object is a hash whose fields hold
//! JSON-encoded property values.

use std::collections::HashMap;

use async_trait::async_trait;
use outreach_core::config::RedisConfig;
use outreach_core::{OutreachError, OutreachResult};
use redis::AsyncCommands;
use serde_json::Value;
use tracing::info;

use crate::client::{CrmClient, CrmObject, FieldGuard, PropertyMap};

const CREATE_IF_ABSENT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV))
return 1
"#;

const UPDATE_EXISTING: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
if #ARGV > 0 then
    redis.call('HSET', KEYS[1], unpack(ARGV))
end
return 1
"#;

// ARGV: guard field, allowed count n, n allowed values, then field/value pairs.
// Returns -1 for a missing object, 0 when the guard fails, 1 when written.
const UPDATE_IF: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -1
end
local current = redis.call('HGET', KEYS[1], ARGV[1])
local allowed = tonumber(ARGV[2])
local matched = false
for i = 3, 2 + allowed do
    if current == ARGV[i] then
        matched = true
        break
    end
end
if not matched then
    return 0
end
if #ARGV > 2 + allowed then
    redis.call('HSET', KEYS[1], unpack(ARGV, 3 + allowed))
end
return 1
"#;

pub struct RedisCrm {
    client: redis::Client,
    prefix: String,
    create_script: redis::Script,
    update_script: redis::Script,
    update_if_script: redis::Script,
}

impl RedisCrm {
    pub async fn new(config: &RedisConfig) -> OutreachResult<Self> {
        info!(url = %config.url, "Connecting CRM store to Redis");

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
        info!(response = %pong, "CRM Redis connection established");

        Ok(Self {
            client,
            prefix: format!("{}:crm", config.key_prefix),
            create_script: redis::Script::new(CREATE_IF_ABSENT),
            update_script: redis::Script::new(UPDATE_EXISTING),
            update_if_script: redis::Script::new(UPDATE_IF),
        })
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }

    async fn connection(&self) -> OutreachResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(classify)
    }

    async fn write_with(
        &self,
        script: &redis::Script,
        key: &str,
        properties: &PropertyMap,
    ) -> OutreachResult<bool> {
        let mut invocation = script.prepare_invoke();
        invocation.key(self.redis_key(key));
        for (field, value) in encode_fields(properties)? {
            invocation.arg(field).arg(value);
        }

        let mut conn = self.connection().await?;
        let written: i32 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(written == 1)
    }
}

#[async_trait]
impl CrmClient for RedisCrm {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get_object(&self, key: &str) -> OutreachResult<Option<CrmObject>> {
        let mut conn = self.connection().await?;
        let raw: HashMap<String, String> = conn
            .hgetall(self.redis_key(key))
            .await
            .map_err(classify)?;

        if raw.is_empty() {
            return Ok(None);
        }
        Ok(Some(CrmObject {
            key: key.to_string(),
            properties: decode_fields(raw)?,
        }))
    }

    async fn create_if_absent(&self, key: &str, properties: PropertyMap) -> OutreachResult<bool> {
        self.write_with(&self.create_script, key, &properties).await
    }

    async fn update_properties(&self, key: &str, properties: PropertyMap) -> OutreachResult<()> {
        if self.write_with(&self.update_script, key, &properties).await? {
            Ok(())
        } else {
            Err(OutreachError::permanent("crm", format!("object {key} not found")))
        }
    }

    async fn update_if(
        &self,
        key: &str,
        guard: &FieldGuard,
        properties: PropertyMap,
    ) -> OutreachResult<bool> {
        let mut invocation = self.update_if_script.prepare_invoke();
        invocation.key(self.redis_key(key));
        for arg in guard_args(guard)? {
            invocation.arg(arg);
        }
        for (field, value) in encode_fields(&properties)? {
            invocation.arg(field).arg(value);
        }

        let mut conn = self.connection().await?;
        let result: i32 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(classify)?;
        match result {
            1 => Ok(true),
            0 => Ok(false),
            _ => Err(OutreachError::permanent("crm", format!("object {key} not found"))),
        }
    }
}

/// Leading script arguments for a guard, with values encoded the way
/// `encode_fields` stores them so the script can compare raw strings.
fn guard_args(guard: &FieldGuard) -> OutreachResult<Vec<String>> {
    let mut args = Vec::with_capacity(guard.allowed.len() + 2);
    args.push(guard.field.clone());
    args.push(guard.allowed.len().to_string());
    for value in &guard.allowed {
        args.push(serde_json::to_string(value)?);
    }
    Ok(args)
}

fn encode_fields(properties: &PropertyMap) -> OutreachResult<Vec<(String, String)>> {
    properties
        .iter()
        .map(|(field, value)| Ok((field.clone(), serde_json::to_string(value)?)))
        .collect()
}

fn decode_fields(raw: HashMap<String, String>) -> OutreachResult<PropertyMap> {
    raw.into_iter()
        .map(|(field, json)| {
            let value: Value = serde_json::from_str(&json).map_err(|e| {
                OutreachError::permanent("crm", format!("field '{field}' is not JSON: {e}"))
            })?;
            Ok((field, value))
        })
        .collect()
}

/// Connection trouble and server back-pressure are transient; everything
/// else means the request itself is wrong.
fn classify(err: redis::RedisError) -> OutreachError {
    let transient = err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || matches!(
            err.kind(),
            redis::ErrorKind::BusyLoadingError
                | redis::ErrorKind::TryAgain
                | redis::ErrorKind::ClusterDown
        );

    if transient {
        OutreachError::transient("crm", err)
    } else {
        OutreachError::permanent("crm", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fields_survive_json_encoding() {
        let props = PropertyMap::from([
            ("email".to_string(), json!("a@x.com")),
            ("score".to_string(), json!(72.5)),
            ("cancel_reason".to_string(), Value::Null),
            ("step_count".to_string(), json!(4)),
        ]);

        let encoded: HashMap<String, String> = encode_fields(&props).unwrap().into_iter().collect();
        assert_eq!(encoded["email"], "\"a@x.com\"");
        assert_eq!(encoded["cancel_reason"], "null");

        assert_eq!(decode_fields(encoded).unwrap(), props);
    }

    #[test]
    fn test_guard_args_match_stored_encoding() {
        let guard = FieldGuard::new("step_1_status", vec![json!("pending"), json!("failed")]);
        let args = guard_args(&guard).unwrap();
        assert_eq!(args, vec!["step_1_status", "2", "\"pending\"", "\"failed\""]);

        let stored: HashMap<String, String> =
            encode_fields(&PropertyMap::from([("step_1_status".to_string(), json!("pending"))]))
                .unwrap()
                .into_iter()
                .collect();
        assert_eq!(stored["step_1_status"], args[2]);
    }

    #[test]
    fn test_non_json_field_is_permanent() {
        let raw = HashMap::from([("email".to_string(), "a@x.com".to_string())]);
        let err = decode_fields(raw).unwrap_err();
        assert!(matches!(err, OutreachError::Permanent { .. }));
    }

    #[test]
    fn test_error_classification() {
        let io = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(classify(io).is_retryable());

        let busy = redis::RedisError::from((redis::ErrorKind::BusyLoadingError, "loading"));
        assert!(classify(busy).is_retryable());

        let wrong_type = redis::RedisError::from((redis::ErrorKind::TypeError, "WRONGTYPE"));
        assert!(!classify(wrong_type).is_retryable());
    }
}
