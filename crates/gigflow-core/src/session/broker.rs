//! Session brokerage: task-kind affinity and per-session mutual exclusion
//! on top of the pool.
//!
//! Sessions carry state (logins, cookies, open tabs), so the broker tags
//! each one with the kind of work it has been doing and prefers to hand the
//! same kind back to the same session. A per-session async mutex guarantees
//! no two holders ever share a session; the returned [`SessionLease`] keeps
//! that lock until it is released.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use gigflow_types::error::DirectorError;
use gigflow_types::session::TaskKind;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use super::pool::SessionPool;

// ---------------------------------------------------------------------------
// SessionLease
// ---------------------------------------------------------------------------

/// Exclusive hold on one session.
///
/// The embedded owned guard is the per-session mutex; dropping the lease
/// frees the mutex, but the session only re-enters the pool's available
/// queue through [`SessionBroker::release`].
#[derive(Debug)]
pub struct SessionLease {
    session_id: String,
    kind: TaskKind,
    _guard: OwnedMutexGuard<()>,
}

impl SessionLease {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }
}

// ---------------------------------------------------------------------------
// SessionBroker
// ---------------------------------------------------------------------------

/// Hands out sessions with task-kind affinity, health-aware refresh, and a
/// bounded acquire wait.
pub struct SessionBroker {
    pool: Arc<SessionPool>,
    /// session id -> the kind of work it is dedicated to.
    assignments: DashMap<String, TaskKind>,
    /// session id -> per-session exclusion lock.
    locks: DashMap<String, Arc<Mutex<()>>>,
    acquire_timeout: Duration,
}

impl SessionBroker {
    pub fn new(pool: Arc<SessionPool>, acquire_timeout: Duration) -> Self {
        Self {
            pool,
            assignments: DashMap::new(),
            locks: DashMap::new(),
            acquire_timeout,
        }
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// The kind a session is currently dedicated to.
    pub fn assignment_of(&self, session_id: &str) -> Option<TaskKind> {
        self.assignments.get(session_id).map(|entry| *entry.value())
    }

    /// Snapshot of all assignments.
    pub fn assignments_snapshot(&self) -> HashMap<String, TaskKind> {
        self.assignments
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Acquisition
    // -----------------------------------------------------------------------

    /// Acquire an exclusive session for the given task kind.
    ///
    /// Preference order: a free session already dedicated to `kind` (with a
    /// health probe and refresh when it has gone bad), then any session the
    /// pool can hand out or create. Fails with `SessionExhausted` when
    /// nothing becomes available within the acquire timeout.
    pub async fn acquire(&self, kind: TaskKind) -> Result<SessionLease, DirectorError> {
        match tokio::time::timeout(self.acquire_timeout, self.acquire_inner(kind)).await {
            Ok(result) => result,
            Err(_) => Err(DirectorError::SessionExhausted {
                kind,
                waited_secs: self.acquire_timeout.as_secs(),
            }),
        }
    }

    async fn acquire_inner(&self, kind: TaskKind) -> Result<SessionLease, DirectorError> {
        if let Some(lease) = self.try_acquire_dedicated(kind).await {
            return Ok(lease);
        }

        // Nothing dedicated is free: take anything the pool can give us and
        // dedicate it to this kind.
        match self.pool.get_or_create(self.acquire_timeout).await {
            Ok(session_id) => Ok(self.lease_new(session_id, kind).await),
            Err(DirectorError::SessionExhausted { waited_secs, .. }) => {
                Err(DirectorError::SessionExhausted { kind, waited_secs })
            }
            Err(e) => Err(e),
        }
    }

    /// Scan sessions dedicated to `kind` for one that is free and healthy.
    async fn try_acquire_dedicated(&self, kind: TaskKind) -> Option<SessionLease> {
        let candidates: Vec<String> = self
            .assignments
            .iter()
            .filter(|entry| *entry.value() == kind)
            .map(|entry| entry.key().clone())
            .collect();

        for session_id in candidates {
            let lock = self.lock_for(&session_id);
            let Ok(guard) = lock.try_lock_owned() else {
                continue; // leased elsewhere
            };

            if !self.pool.contains(&session_id).await {
                // Closed behind our back; forget it.
                self.assignments.remove(&session_id);
                self.locks.remove(&session_id);
                continue;
            }
            if !self.pool.acquire_specific(&session_id).await {
                continue; // out of circulation right now
            }

            if self.pool.probe_health(&session_id).await {
                self.pool.touch(&session_id).await;
                tracing::debug!(session_id = session_id.as_str(), %kind, "acquired dedicated session");
                return Some(SessionLease {
                    session_id,
                    kind,
                    _guard: guard,
                });
            }

            // Unhealthy: replace it and hand out the replacement.
            match self.pool.refresh(&session_id).await {
                Ok(new_id) => {
                    self.assignments.remove(&session_id);
                    self.locks.remove(&session_id);
                    drop(guard);
                    tracing::info!(old = session_id.as_str(), new = new_id.as_str(), "refreshed unhealthy dedicated session");
                    return Some(self.lease_new(new_id, kind).await);
                }
                Err(e) => {
                    tracing::error!(session_id = session_id.as_str(), error = %e, "failed to refresh unhealthy session");
                    self.assignments.remove(&session_id);
                    self.locks.remove(&session_id);
                    continue;
                }
            }
        }
        None
    }

    /// Dedicate and lock a session the pool just handed out.
    async fn lease_new(&self, session_id: String, kind: TaskKind) -> SessionLease {
        let lock = Arc::new(Mutex::new(()));
        // Uncontended: the session is in the pool's in_use partition and not
        // yet published in assignments.
        let guard = Arc::clone(&lock).lock_owned().await;
        self.locks.insert(session_id.clone(), lock);
        self.assignments.insert(session_id.clone(), kind);
        tracing::debug!(session_id = session_id.as_str(), %kind, "dedicated session to task kind");
        SessionLease {
            session_id,
            kind,
            _guard: guard,
        }
    }

    fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Return a leased session to the pool and free its exclusion lock.
    pub async fn release(&self, lease: SessionLease) {
        self.pool.release(&lease.session_id).await;
        tracing::debug!(session_id = lease.session_id.as_str(), "released session lease");
        // Guard drops with the lease.
    }

    /// Run `f` with an exclusively held session, releasing on every exit
    /// path including handler errors.
    pub async fn with_session<F, Fut, T>(&self, kind: TaskKind, f: F) -> Result<T, DirectorError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<T, DirectorError>>,
    {
        let lease = self.acquire(kind).await?;
        let session_id = lease.session_id().to_string();
        let result = f(session_id).await;
        self.release(lease).await;
        result
    }

    // -----------------------------------------------------------------------
    // Background sweeps
    // -----------------------------------------------------------------------

    /// Probe every tracked session once; logs the unhealthy count.
    ///
    /// Observational only -- remediation happens on acquire (refresh) and in
    /// the cleanup sweep.
    pub async fn health_sweep(&self) -> usize {
        let ids = self.pool.tracked_ids().await;
        let mut unhealthy = 0;
        for id in &ids {
            if !self.pool.probe_health(id).await {
                unhealthy += 1;
            }
        }
        if unhealthy > 0 {
            tracing::warn!(unhealthy, total = ids.len(), "health sweep found unhealthy sessions");
        }
        unhealthy
    }

    /// Close expired/errored/unhealthy/idle sessions and drop their
    /// assignments. Returns how many were closed.
    pub async fn cleanup_sweep(&self) -> usize {
        let closed = self.pool.cleanup_expired().await;
        let tracked: std::collections::HashSet<String> =
            self.pool.tracked_ids().await.into_iter().collect();
        self.assignments.retain(|id, _| tracked.contains(id));
        self.locks.retain(|id, _| tracked.contains(id));
        closed
    }

    /// Spawn the periodic health and cleanup sweeps.
    pub fn spawn_sweeps(
        self: &Arc<Self>,
        health_interval: Duration,
        cleanup_interval: Duration,
        shutdown: CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let health_broker = Arc::clone(self);
        let health_shutdown = shutdown.clone();
        let health = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = health_shutdown.cancelled() => break,
                    _ = tokio::time::sleep(health_interval) => {
                        health_broker.health_sweep().await;
                    }
                }
            }
        });

        let cleanup_broker = Arc::clone(self);
        let cleanup = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(cleanup_interval) => {
                        cleanup_broker.cleanup_sweep().await;
                    }
                }
            }
        });

        vec![health, cleanup]
    }

    /// Close every session and forget all assignments.
    pub async fn shutdown(&self) {
        let closed = self.pool.close_all().await;
        self.assignments.clear();
        self.locks.clear();
        tracing::info!(closed, "session broker shut down");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::provider::fake::FakeProvider;

    fn broker_with(provider: Arc<FakeProvider>, max_size: usize) -> Arc<SessionBroker> {
        let pool = Arc::new(SessionPool::new(provider, max_size, 1800, 1800));
        Arc::new(SessionBroker::new(pool, Duration::from_millis(200)))
    }

    #[tokio::test]
    async fn acquire_creates_and_dedicates_a_session() {
        let provider = Arc::new(FakeProvider::new());
        let broker = broker_with(provider.clone(), 2);

        let lease = broker.acquire(TaskKind::JobDiscovery).await.unwrap();
        assert_eq!(broker.assignment_of(lease.session_id()), Some(TaskKind::JobDiscovery));
        assert_eq!(provider.created_count(), 1);
        broker.release(lease).await;
    }

    #[tokio::test]
    async fn released_dedicated_session_is_reused_for_same_kind() {
        let provider = Arc::new(FakeProvider::new());
        let broker = broker_with(provider.clone(), 3);

        let lease = broker.acquire(TaskKind::ProposalSubmission).await.unwrap();
        let first_id = lease.session_id().to_string();
        broker.release(lease).await;

        let lease = broker.acquire(TaskKind::ProposalSubmission).await.unwrap();
        assert_eq!(lease.session_id(), first_id, "affinity should reuse the same session");
        assert_eq!(provider.created_count(), 1, "no second session created");
        broker.release(lease).await;
    }

    #[tokio::test]
    async fn concurrent_acquires_never_share_a_session() {
        let provider = Arc::new(FakeProvider::new());
        let broker = broker_with(provider, 4);

        let a = broker.acquire(TaskKind::General).await.unwrap();
        let b = broker.acquire(TaskKind::General).await.unwrap();
        assert_ne!(a.session_id(), b.session_id());
        broker.release(a).await;
        broker.release(b).await;
    }

    #[tokio::test]
    async fn unhealthy_dedicated_session_is_refreshed_on_acquire() {
        let provider = Arc::new(FakeProvider::new());
        let broker = broker_with(provider.clone(), 2);

        let lease = broker.acquire(TaskKind::JobDiscovery).await.unwrap();
        let old_id = lease.session_id().to_string();
        broker.release(lease).await;

        let remote = broker.pool().handle(&old_id).await.unwrap().remote_id.unwrap();
        provider.mark_unhealthy(&remote);

        let lease = broker.acquire(TaskKind::JobDiscovery).await.unwrap();
        assert_ne!(lease.session_id(), old_id);
        assert_eq!(
            broker.assignment_of(lease.session_id()),
            Some(TaskKind::JobDiscovery)
        );
        assert!(broker.assignment_of(&old_id).is_none(), "old id forgotten");
        assert_eq!(provider.closed_count(), 1);
        broker.release(lease).await;
    }

    #[tokio::test]
    async fn acquire_times_out_when_everything_is_leased() {
        let provider = Arc::new(FakeProvider::new());
        let broker = broker_with(provider, 1);

        let held = broker.acquire(TaskKind::General).await.unwrap();
        let err = broker.acquire(TaskKind::JobDiscovery).await.unwrap_err();
        match err {
            DirectorError::SessionExhausted { kind, .. } => {
                assert_eq!(kind, TaskKind::JobDiscovery)
            }
            other => panic!("expected SessionExhausted, got {other}"),
        }
        broker.release(held).await;
    }

    #[tokio::test]
    async fn with_session_releases_on_error() {
        let provider = Arc::new(FakeProvider::new());
        let broker = broker_with(provider, 1);

        let result: Result<(), DirectorError> = broker
            .with_session(TaskKind::General, |_id| async {
                Err(DirectorError::Validation("boom".to_string()))
            })
            .await;
        assert!(result.is_err());

        // The session must be available again despite the error.
        let lease = broker.acquire(TaskKind::General).await.unwrap();
        broker.release(lease).await;
    }

    #[tokio::test]
    async fn cleanup_sweep_forgets_closed_sessions() {
        let provider = Arc::new(FakeProvider::new());
        let broker = broker_with(provider, 2);

        let lease = broker.acquire(TaskKind::General).await.unwrap();
        let id = lease.session_id().to_string();
        broker.release(lease).await;

        // Force the session bad, then sweep.
        broker.pool().record_error(&id).await;
        broker.pool().record_error(&id).await;
        broker.pool().record_error(&id).await;
        broker.pool().record_error(&id).await;
        let closed = broker.cleanup_sweep().await;
        assert_eq!(closed, 1);
        assert!(broker.assignment_of(&id).is_none());
    }

    #[tokio::test]
    async fn health_sweep_counts_unhealthy_without_closing() {
        let provider = Arc::new(FakeProvider::new());
        let broker = broker_with(provider.clone(), 2);

        let lease = broker.acquire(TaskKind::General).await.unwrap();
        let id = lease.session_id().to_string();
        broker.release(lease).await;

        let remote = broker.pool().handle(&id).await.unwrap().remote_id.unwrap();
        provider.mark_unhealthy(&remote);

        assert_eq!(broker.health_sweep().await, 1);
        assert!(broker.pool().contains(&id).await, "sweep observes, does not close");
    }
}
