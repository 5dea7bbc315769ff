//! Browser session domain types.
//!
//! A session is an exclusive-use handle to a remote hosted browser. The
//! orchestrator tracks sessions in a bounded pool; the remote side is reached
//! through the `SessionProvider` trait in `gigflow-core` (implemented over
//! HTTP in `gigflow-infra`).

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Consecutive errors after which a session is considered unhealthy.
pub const MAX_SESSION_ERRORS: u32 = 3;

// ---------------------------------------------------------------------------
// Session status
// ---------------------------------------------------------------------------

/// Lifecycle status of a browser session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Remote session is being provisioned.
    Creating,
    /// Ready for use.
    Active,
    /// Tracked but not recently used.
    Idle,
    /// Failed a health probe or accumulated too many errors.
    Unhealthy,
    /// Exceeded its maximum age.
    Expired,
    /// Closed on the remote side.
    Closed,
    /// Provisioning or remote call failed.
    Error,
}

// ---------------------------------------------------------------------------
// Task kind (session affinity tags)
// ---------------------------------------------------------------------------

/// The kind of automation task a session is dedicated to.
///
/// Sessions carry state (login, cookies, open tabs), so the broker prefers to
/// hand the same kind of work to the same session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    JobDiscovery,
    ProposalSubmission,
    ProfileManagement,
    #[default]
    General,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskKind::JobDiscovery => "job_discovery",
            TaskKind::ProposalSubmission => "proposal_submission",
            TaskKind::ProfileManagement => "profile_management",
            TaskKind::General => "general",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Session configuration
// ---------------------------------------------------------------------------

/// Options forwarded to the remote browser host when creating a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Route traffic through the host's proxy pool.
    #[serde(default = "default_true")]
    pub proxies: bool,
    /// Enable anti-bot-detection measures.
    #[serde(default = "default_true")]
    pub stealth: bool,
    /// Keep the remote browser alive between connections.
    #[serde(default = "default_true")]
    pub keep_alive: bool,
    /// Remote-side session timeout in seconds.
    #[serde(default = "default_session_timeout")]
    pub timeout_secs: u64,
    /// Browser viewport dimensions.
    #[serde(default)]
    pub viewport: Viewport,
    /// Optional user-agent override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Optional human-readable session name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_session_timeout() -> u64 {
    1800
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            proxies: true,
            stealth: true,
            keep_alive: true,
            timeout_secs: default_session_timeout(),
            viewport: Viewport::default(),
            user_agent: None,
            name: None,
        }
    }
}

/// Browser viewport dimensions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

// ---------------------------------------------------------------------------
// Session handle
// ---------------------------------------------------------------------------

/// Local bookkeeping for one remote browser session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHandle {
    /// Pool-local session id.
    pub id: String,
    /// The configuration the session was created with.
    pub config: SessionConfig,
    /// Current lifecycle status.
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub last_health_check: DateTime<Utc>,
    /// Consecutive task errors observed on this session.
    pub error_count: u32,
    /// Provider-side session id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    /// WebSocket/CDP endpoint for connecting to the remote browser.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_url: Option<String>,
    /// Arbitrary per-session state carried across refreshes.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context_data: HashMap<String, Value>,
}

impl SessionHandle {
    /// Create a handle in the `Creating` state.
    pub fn new(id: impl Into<String>, config: SessionConfig) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            config,
            status: SessionStatus::Creating,
            created_at: now,
            last_used: now,
            last_health_check: now,
            error_count: 0,
            remote_id: None,
            connect_url: None,
            context_data: HashMap::new(),
        }
    }

    /// Time since the session was created.
    pub fn age(&self) -> Duration {
        Utc::now() - self.created_at
    }

    /// Time since the session was last used.
    pub fn idle_time(&self) -> Duration {
        Utc::now() - self.last_used
    }

    /// Whether the session may be handed out or returned to the pool.
    pub fn is_usable(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

// ---------------------------------------------------------------------------
// Pool statistics
// ---------------------------------------------------------------------------

/// Point-in-time view of the session pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_sessions: usize,
    pub available_sessions: usize,
    pub in_use_sessions: usize,
    pub max_size: usize,
    /// Session count per status (snake_case status name).
    pub status_breakdown: HashMap<String, usize>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
