//! Fleetwatch Core Library
//!
//! Core types, configuration and utilities shared by the Fleetwatch
//! multi-cluster watch pipeline.

pub mod config;
pub mod error;
pub mod types;
pub mod utils;

pub use config::FleetConfig;
pub use error::{Error, Result};

/// Fleetwatch version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Replica count assumed when a spec does not set one
pub const DEFAULT_REPLICAS: i32 = 1;

/// Default lease object name used for leader election
pub const DEFAULT_LEASE_NAME: &str = "fleetwatch-leader";

/// Duration written to a lease when its holder releases it voluntarily
pub const RELEASED_LEASE_DURATION_MS: u64 = 1_000;
