//! Infrastructure adapters for Gigflow.
//!
//! Implements the core's consumed interfaces against real external
//! services. Currently: the remote browser host HTTP API.

pub mod browserhost;

pub use browserhost::BrowserHostClient;
