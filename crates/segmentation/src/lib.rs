//! Priority segmentation. Classifies subjects into CRITICAL / URGENT /
//! OPTIMIZE from their signal counts, and validates trigger events before
//! any classification runs.

pub mod classifier;
pub mod validation;

pub use classifier::classify;
pub use validation::{normalize_email, validate_event, validate_signals};
