//! Gigflow orchestration core.
//!
//! The Director drives pools of remote browser sessions through DAG-shaped
//! workflows: admission and priority scheduling, bounded concurrency, session
//! allocation with task-kind affinity, per-step retries, periodic in-memory
//! checkpointing, and failure recovery.
//!
//! External capabilities are consumed through traits: the browser-action
//! layer behind [`action::ActionHandler`], the remote browser host behind
//! [`session::provider::SessionProvider`]. Persistence and transport are
//! layered by callers; this crate is a library, not a server.

pub mod action;
pub mod director;
pub mod session;
pub mod workflow;

pub use director::Director;
