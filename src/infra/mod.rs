//! Infrastructure adapters and runtime bootstrap.

pub mod disk_store;
pub mod error;
pub mod telemetry;
