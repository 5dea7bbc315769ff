//! Shared domain types for Gigflow.
//!
//! This crate contains the types used across the Gigflow orchestrator:
//! workflow definitions and executions, browser session handles, the error
//! taxonomy, orchestrator configuration, and observability snapshots.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror,
//! toml.

pub mod config;
pub mod error;
pub mod metrics;
pub mod session;
pub mod workflow;
