//! Deduplicating multi-tier artifact cache.
//!
//! [`cache`] holds the engine and its tiers, [`config`] the layered settings
//! and [`infra`] the on-disk store and telemetry bootstrap.

pub mod cache;
pub mod config;
pub mod infra;
