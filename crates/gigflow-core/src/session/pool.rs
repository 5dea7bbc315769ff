//! Bounded session pool.
//!
//! Tracks every known session handle and partitions the usable ones into
//! `available` and `in_use`. Invariant: the partitions are disjoint, and
//! every id is in at most one of the two. All bookkeeping sits behind a
//! single coarse lock; remote-provider calls happen outside it.
//!
//! A session that is released while no longer usable simply leaves
//! circulation (stays tracked, never re-enters `available`) until the
//! cleanup sweep closes it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gigflow_types::error::DirectorError;
use gigflow_types::session::{
    MAX_SESSION_ERRORS, PoolStats, SessionConfig, SessionHandle, SessionStatus, TaskKind,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::provider::SessionProvider;

/// Re-poll interval while waiting for a session in `get_or_create`.
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_secs(1);

struct PoolInner {
    sessions: HashMap<String, SessionHandle>,
    available: VecDeque<String>,
    in_use: HashSet<String>,
}

/// Bounded collection of browser sessions backed by a remote provider.
pub struct SessionPool {
    provider: Arc<dyn SessionProvider>,
    max_size: usize,
    max_age: chrono::Duration,
    idle_timeout: chrono::Duration,
    inner: Mutex<PoolInner>,
}

impl SessionPool {
    pub fn new(
        provider: Arc<dyn SessionProvider>,
        max_size: usize,
        max_age_secs: u64,
        idle_timeout_secs: u64,
    ) -> Self {
        Self {
            provider,
            max_size,
            max_age: chrono::Duration::seconds(max_age_secs as i64),
            idle_timeout: chrono::Duration::seconds(idle_timeout_secs as i64),
            inner: Mutex::new(PoolInner {
                sessions: HashMap::new(),
                available: VecDeque::new(),
                in_use: HashSet::new(),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Partition bookkeeping
    // -----------------------------------------------------------------------

    /// Track a session. Usable sessions join the available queue.
    pub async fn add(&self, handle: SessionHandle) {
        let mut inner = self.inner.lock().await;
        let id = handle.id.clone();
        let usable = handle.is_usable();
        inner.sessions.insert(id.clone(), handle);
        if usable && !inner.in_use.contains(&id) {
            inner.available.push_back(id);
        }
    }

    /// Pop the oldest available session, moving it to `in_use`.
    pub async fn acquire(&self) -> Option<String> {
        let mut inner = self.inner.lock().await;
        let id = inner.available.pop_front()?;
        inner.in_use.insert(id.clone());
        Some(id)
    }

    /// Move a specific session from `available` to `in_use`.
    ///
    /// Returns false when the session is not currently available.
    pub async fn acquire_specific(&self, session_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(pos) = inner.available.iter().position(|id| id == session_id) else {
            return false;
        };
        inner.available.remove(pos);
        inner.in_use.insert(session_id.to_string());
        true
    }

    /// Return a session to circulation.
    ///
    /// Only sessions whose status is still usable re-enter `available`;
    /// anything else just leaves `in_use` and waits for cleanup.
    pub async fn release(&self, session_id: &str) {
        let mut inner = self.inner.lock().await;
        if !inner.in_use.remove(session_id) {
            return;
        }
        let usable = match inner.sessions.get_mut(session_id) {
            Some(handle) => {
                handle.last_used = Utc::now();
                handle.is_usable()
            }
            None => false,
        };
        if usable {
            inner.available.push_back(session_id.to_string());
        } else {
            tracing::debug!(session_id, "released session no longer usable, dropping from circulation");
        }
    }

    /// Purge a session from all bookkeeping.
    pub async fn remove(&self, session_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.sessions.remove(session_id);
        inner.available.retain(|id| id != session_id);
        inner.in_use.remove(session_id);
    }

    // -----------------------------------------------------------------------
    // Lifecycle against the provider
    // -----------------------------------------------------------------------

    /// Provision a new session, respecting the pool bound.
    ///
    /// The new session is handed to the caller in the `in_use` partition.
    pub async fn create(&self, config: SessionConfig) -> Result<String, DirectorError> {
        let id = format!("session-{}", Uuid::now_v7());

        // Reserve the slot under the lock so concurrent creates cannot
        // overshoot max_size; the handle sits in Creating until the remote
        // call settles.
        {
            let mut inner = self.inner.lock().await;
            if inner.sessions.len() >= self.max_size {
                return Err(DirectorError::PoolAtCapacity(self.max_size));
            }
            let handle = SessionHandle::new(id.clone(), config.clone());
            inner.sessions.insert(id.clone(), handle);
            inner.in_use.insert(id.clone());
        }

        match self.provider.create(&config).await {
            Ok(created) => {
                let mut inner = self.inner.lock().await;
                if let Some(handle) = inner.sessions.get_mut(&id) {
                    handle.remote_id = Some(created.remote_id.clone());
                    handle.connect_url = Some(created.connect_url);
                    handle.status = SessionStatus::Active;
                    handle.last_used = Utc::now();
                }
                tracing::info!(session_id = id.as_str(), remote_id = created.remote_id.as_str(), "created browser session");
                Ok(id)
            }
            Err(e) => {
                let mut inner = self.inner.lock().await;
                inner.sessions.remove(&id);
                inner.in_use.remove(&id);
                tracing::error!(session_id = id.as_str(), error = %e, "failed to create browser session");
                Err(e)
            }
        }
    }

    /// Close a session on the remote side (best-effort) and purge it.
    pub async fn close(&self, session_id: &str) -> bool {
        let remote_id = {
            let mut inner = self.inner.lock().await;
            match inner.sessions.get_mut(session_id) {
                Some(handle) => {
                    handle.status = SessionStatus::Closed;
                    handle.remote_id.clone()
                }
                None => return false,
            }
        };

        if let Some(remote_id) = remote_id {
            if let Err(e) = self.provider.close(&remote_id).await {
                tracing::warn!(session_id, error = %e, "remote close failed, purging anyway");
            }
        }

        self.remove(session_id).await;
        tracing::info!(session_id, "closed browser session");
        true
    }

    /// Replace a session: close the old one, create a new one with the same
    /// configuration, and carry the context data over.
    pub async fn refresh(&self, session_id: &str) -> Result<String, DirectorError> {
        let old = self
            .handle(session_id)
            .await
            .ok_or_else(|| DirectorError::Validation(format!("session '{session_id}' not tracked")))?;

        self.close(session_id).await;
        let new_id = self.create(old.config.clone()).await?;

        if !old.context_data.is_empty() {
            let mut inner = self.inner.lock().await;
            if let Some(handle) = inner.sessions.get_mut(&new_id) {
                handle.context_data = old.context_data;
            }
        }

        tracing::info!(old = session_id, new = new_id.as_str(), "refreshed browser session");
        Ok(new_id)
    }

    /// Acquire an available session or create one, waiting (re-polling once
    /// a second) when the pool is full, up to `timeout`.
    pub async fn get_or_create(&self, timeout: Duration) -> Result<String, DirectorError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(id) = self.acquire().await {
                self.touch(&id).await;
                return Ok(id);
            }
            match self.create(SessionConfig::default()).await {
                Ok(id) => return Ok(id),
                Err(DirectorError::PoolAtCapacity(_)) => {
                    if tokio::time::Instant::now() >= deadline {
                        break;
                    }
                    tracing::debug!("session pool full, waiting for a release");
                    tokio::time::sleep(ACQUIRE_POLL_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(DirectorError::SessionExhausted {
            kind: TaskKind::General,
            waited_secs: timeout.as_secs(),
        })
    }

    // -----------------------------------------------------------------------
    // Health
    // -----------------------------------------------------------------------

    /// Probe one session: local checks (status, age, error count) plus a
    /// provider-side ping. Demotes Active handles that fail to Unhealthy and
    /// stamps Expired when past the age bound.
    pub async fn probe_health(&self, session_id: &str) -> bool {
        let Some(snapshot) = self.handle(session_id).await else {
            return false;
        };

        let mut healthy = snapshot.status == SessionStatus::Active;
        let expired = snapshot.age() > self.max_age;
        if expired {
            healthy = false;
        }
        if snapshot.error_count > MAX_SESSION_ERRORS {
            healthy = false;
        }

        if healthy {
            if let Some(remote_id) = snapshot.remote_id.as_deref() {
                healthy = self.provider.health(remote_id).await.unwrap_or(false);
            }
        }

        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.sessions.get_mut(session_id) {
            handle.last_health_check = Utc::now();
            if expired {
                handle.status = SessionStatus::Expired;
            } else if !healthy && handle.status == SessionStatus::Active {
                handle.status = SessionStatus::Unhealthy;
            }
        }
        healthy
    }

    /// Stamp a session as just used.
    pub async fn touch(&self, session_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.sessions.get_mut(session_id) {
            handle.last_used = Utc::now();
        }
    }

    /// Count a task error against a session; demotes it once past the bound.
    pub async fn record_error(&self, session_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.sessions.get_mut(session_id) {
            handle.error_count += 1;
            if handle.error_count > MAX_SESSION_ERRORS && handle.status == SessionStatus::Active {
                handle.status = SessionStatus::Unhealthy;
                tracing::warn!(session_id, errors = handle.error_count, "session demoted to unhealthy");
            }
        }
    }

    /// Close sessions that are expired by age, errored, unhealthy, or idle
    /// beyond the threshold. Returns how many were closed.
    pub async fn cleanup_expired(&self) -> usize {
        let doomed: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .sessions
                .values()
                .filter(|handle| {
                    matches!(
                        handle.status,
                        SessionStatus::Expired | SessionStatus::Error | SessionStatus::Unhealthy
                    ) || handle.age() > self.max_age
                        || (handle.status == SessionStatus::Idle
                            && handle.idle_time() > self.idle_timeout)
                })
                .map(|handle| handle.id.clone())
                .collect()
        };

        let mut closed = 0;
        for id in &doomed {
            if self.close(id).await {
                closed += 1;
            }
        }
        if closed > 0 {
            tracing::info!(closed, "cleaned up expired or unhealthy sessions");
        }
        closed
    }

    /// Close every tracked session.
    pub async fn close_all(&self) -> usize {
        let ids = self.tracked_ids().await;
        let mut closed = 0;
        for id in &ids {
            if self.close(id).await {
                closed += 1;
            }
        }
        closed
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub async fn contains(&self, session_id: &str) -> bool {
        self.inner.lock().await.sessions.contains_key(session_id)
    }

    /// Snapshot of one handle.
    pub async fn handle(&self, session_id: &str) -> Option<SessionHandle> {
        self.inner.lock().await.sessions.get(session_id).cloned()
    }

    pub async fn tracked_ids(&self) -> Vec<String> {
        self.inner.lock().await.sessions.keys().cloned().collect()
    }

    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        let mut status_breakdown: HashMap<String, usize> = HashMap::new();
        for handle in inner.sessions.values() {
            let key = serde_json::to_value(handle.status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "unknown".to_string());
            *status_breakdown.entry(key).or_insert(0) += 1;
        }
        PoolStats {
            total_sessions: inner.sessions.len(),
            available_sessions: inner.available.len(),
            in_use_sessions: inner.in_use.len(),
            max_size: self.max_size,
            status_breakdown,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
