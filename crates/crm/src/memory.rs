//! In-process CRM backed by DashMap. Used for local runs and tests.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use outreach_core::{OutreachError, OutreachResult};

use crate::client::{CrmClient, CrmObject, FieldGuard, PropertyMap};

#[derive(Default)]
pub struct InMemoryCrm {
    objects: DashMap<String, PropertyMap>,
    /// Number of upcoming calls that fail with a transient error.
    fail_next: AtomicU32,
    /// Like `fail_next`, but only for property updates.
    fail_next_writes: AtomicU32,
}

impl InMemoryCrm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` property updates fail with a transient error. Reads
    /// and creates are unaffected.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_next_writes.store(n, Ordering::SeqCst);
    }

    /// Overwrite raw properties, bypassing the adapter.
    pub fn put_raw(&self, key: &str, properties: PropertyMap) {
        self.objects.insert(key.to_string(), properties);
    }

    pub fn raw(&self, key: &str) -> Option<PropertyMap> {
        self.objects.get(key).map(|p| p.clone())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn injected_failure(&self) -> OutreachResult<()> {
        take_failure(&self.fail_next)
    }

    fn injected_write_failure(&self) -> OutreachResult<()> {
        self.injected_failure()?;
        take_failure(&self.fail_next_writes)
    }
}

#[async_trait]
impl CrmClient for InMemoryCrm {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get_object(&self, key: &str) -> OutreachResult<Option<CrmObject>> {
        self.injected_failure()?;
        Ok(self.objects.get(key).map(|p| CrmObject {
            key: key.to_string(),
            properties: p.clone(),
        }))
    }

    async fn create_if_absent(&self, key: &str, properties: PropertyMap) -> OutreachResult<bool> {
        self.injected_failure()?;
        match self.objects.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(properties);
                Ok(true)
            }
        }
    }

    async fn update_properties(&self, key: &str, properties: PropertyMap) -> OutreachResult<()> {
        self.injected_write_failure()?;
        let mut entry = self
            .objects
            .get_mut(key)
            .ok_or_else(|| OutreachError::permanent("crm", format!("object {key} not found")))?;
        entry.extend(properties);
        Ok(())
    }

    async fn update_if(
        &self,
        key: &str,
        guard: &FieldGuard,
        properties: PropertyMap,
    ) -> OutreachResult<bool> {
        self.injected_write_failure()?;
        // The shard write lock is held from the guard check through the merge.
        let mut entry = self
            .objects
            .get_mut(key)
            .ok_or_else(|| OutreachError::permanent("crm", format!("object {key} not found")))?;
        if !guard.admits(&entry) {
            return Ok(false);
        }
        entry.extend(properties);
        Ok(true)
    }
}

fn take_failure(counter: &AtomicU32) -> OutreachResult<()> {
    match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
        Ok(_) => Err(OutreachError::transient("crm", "injected timeout")),
        Err(_) => Ok(()),
    }
}
