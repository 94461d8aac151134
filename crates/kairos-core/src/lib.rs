//! `kairos-core`: configuration, shared error type and the small set of
//! types every other Kairos crate agrees on.

pub mod config;
pub mod error;
pub mod types;

pub use config::{DatabaseConfig, KairosConfig, TaskConfig};
pub use error::{KairosError, Result};
pub use types::TriggerKind;
