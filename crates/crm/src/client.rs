use std::collections::HashMap;

use async_trait::async_trait;
use outreach_core::OutreachResult;

/// Loose, field-name keyed properties as the CRM stores them.
pub type PropertyMap = HashMap<String, serde_json::Value>;

/// Precondition for a conditional update: `field` must currently hold one
/// of the `allowed` values.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldGuard {
    pub field: String,
    pub allowed: Vec<serde_json::Value>,
}

impl FieldGuard {
    pub fn new(field: impl Into<String>, allowed: Vec<serde_json::Value>) -> Self {
        Self {
            field: field.into(),
            allowed,
        }
    }

    pub fn admits(&self, properties: &PropertyMap) -> bool {
        properties
            .get(&self.field)
            .is_some_and(|current| self.allowed.contains(current))
    }
}

/// A raw CRM object.
#[derive(Debug, Clone, PartialEq)]
pub struct CrmObject {
    pub key: String,
    pub properties: PropertyMap,
}

/// Transport-level contract for the external CRM database.
///
/// Implementations classify failures as `OutreachError::Transient` (retry
/// worthwhile) or `OutreachError::Permanent` (schema or request is wrong).
#[async_trait]
pub trait CrmClient: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_object(&self, key: &str) -> OutreachResult<Option<CrmObject>>;

    /// Atomically create the object. Returns `false` without writing
    /// anything when an object already exists under `key`.
    async fn create_if_absent(&self, key: &str, properties: PropertyMap) -> OutreachResult<bool>;

    /// Merge `properties` into an existing object. Fields not named are left
    /// untouched. Fails permanently when the object does not exist.
    async fn update_properties(&self, key: &str, properties: PropertyMap) -> OutreachResult<()>;

    /// Merge `properties` only if `guard` holds, checked and applied as one
    /// atomic step. Returns `false` without writing when the guard fails.
    /// Fails permanently when the object does not exist.
    async fn update_if(
        &self,
        key: &str,
        guard: &FieldGuard,
        properties: PropertyMap,
    ) -> OutreachResult<bool>;
}
