pub mod config;
pub mod error;
pub mod event_bus;
pub mod retry;
pub mod types;

pub use config::AppConfig;
pub use error::{OutreachError, OutreachResult};
pub use retry::RetryPolicy;
