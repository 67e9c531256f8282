//! CRM boundary: the sequence store adapter and the CRM clients behind it.
//!
//! `SequenceStore` is the strongly typed contract the sequencer talks to.
//! `CrmSequenceStore` implements it on top of any `CrmClient`, which speaks the
//! CRM's loose property-map representation. The adapter is the only place that
//! translates between the two.

#![warn(clippy::unwrap_used)]

pub mod client;
pub mod memory;
pub mod redis_crm;
pub mod schema;
pub mod store;

pub use client::{CrmClient, CrmObject, FieldGuard, PropertyMap};
pub use memory::InMemoryCrm;
pub use redis_crm::RedisCrm;
pub use store::{CrmSequenceStore, SequenceStore};
