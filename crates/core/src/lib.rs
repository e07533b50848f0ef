//! Shared data contracts for the Cadence journey runner: domain types,
//! configuration, error taxonomy, lifecycle events and the template resolver.

pub mod config;
pub mod error;
pub mod event_bus;
pub mod templates;
pub mod types;

pub use config::AppConfig;
pub use error::{CadenceError, CadenceResult, GatewayError, StoreError};
