//! The consumed interface to the remote browser host.
//!
//! The pool drives session lifecycles exclusively through this trait;
//! `gigflow-infra` implements it over HTTP. Boxed-future methods keep it
//! dyn-compatible for `Arc<dyn SessionProvider>` wiring.

use std::future::Future;
use std::pin::Pin;

use gigflow_types::error::DirectorError;
use gigflow_types::session::SessionConfig;

/// Boxed future returned by provider methods.
pub type ProviderFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, DirectorError>> + Send + 'a>>;

/// Remote session coordinates returned by a successful create.
#[derive(Debug, Clone)]
pub struct CreatedSession {
    /// Provider-side session id.
    pub remote_id: String,
    /// Endpoint for connecting automation tooling to the browser.
    pub connect_url: String,
}

/// Remote browser host operations the pool depends on.
///
/// `create` failures propagate to the caller; `health` and `close` failures
/// degrade (unhealthy / best-effort) at the call sites.
pub trait SessionProvider: Send + Sync {
    /// Provision a new remote browser session.
    fn create<'a>(&'a self, config: &'a SessionConfig) -> ProviderFuture<'a, CreatedSession>;

    /// Tear down a remote session.
    fn close<'a>(&'a self, remote_id: &'a str) -> ProviderFuture<'a, ()>;

    /// Probe whether the remote session is alive and running.
    fn health<'a>(&'a self, remote_id: &'a str) -> ProviderFuture<'a, bool>;
}

// ---------------------------------------------------------------------------
// Test fake
// ---------------------------------------------------------------------------
