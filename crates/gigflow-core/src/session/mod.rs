//! Session management: pool bookkeeping, task-kind brokerage, and the
//! provider trait for the remote browser host.

pub mod broker;
pub mod pool;
pub mod provider;

pub use broker::{SessionBroker, SessionLease};
pub use pool::SessionPool;
pub use provider::{CreatedSession, SessionProvider};
