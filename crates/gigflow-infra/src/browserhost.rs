//! HTTP client for the remote browser host.
//!
//! Implements [`SessionProvider`] over the host's REST API:
//!
//! - `POST /v1/sessions` provisions a browser (201 expected)
//! - `DELETE /v1/sessions/{id}` tears one down (200/204 accepted; 404 means
//!   it is already gone, which is fine)
//! - `GET /v1/sessions/{id}` reports status; the session is healthy only
//!   while the host says "RUNNING"
//!
//! Create failures propagate to the pool; health and close degrade to
//! unhealthy / best-effort.

use gigflow_core::session::provider::{CreatedSession, ProviderFuture, SessionProvider};
use gigflow_types::error::DirectorError;
use gigflow_types::session::SessionConfig;
use serde::Deserialize;
use serde_json::{Value, json};

/// Remote status string the host reports for a live session.
const REMOTE_RUNNING_STATUS: &str = "RUNNING";

#[derive(Debug, Deserialize)]
struct CreateSessionResponse {
    id: String,
    #[serde(rename = "connectUrl")]
    connect_url: String,
}

#[derive(Debug, Deserialize)]
struct SessionStatusResponse {
    status: String,
}

/// Client for the remote browser-hosting API.
pub struct BrowserHostClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    project_id: String,
}

impl BrowserHostClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            project_id: project_id.into(),
        }
    }

    fn sessions_url(&self) -> String {
        format!("{}/v1/sessions", self.base_url)
    }

    fn session_url(&self, remote_id: &str) -> String {
        format!("{}/v1/sessions/{remote_id}", self.base_url)
    }

    /// Request body for session creation.
    fn create_payload(&self, config: &SessionConfig) -> Value {
        let mut payload = json!({
            "projectId": self.project_id,
            "proxies": config.proxies,
            "stealth": config.stealth,
            "keepAlive": config.keep_alive,
            "timeout": config.timeout_secs,
            "viewport": {
                "width": config.viewport.width,
                "height": config.viewport.height,
            },
        });
        if let Some(user_agent) = &config.user_agent {
            payload["userAgent"] = json!(user_agent);
        }
        if let Some(name) = &config.name {
            payload["name"] = json!(name);
        }
        payload
    }
}

impl SessionProvider for BrowserHostClient {
    fn create<'a>(&'a self, config: &'a SessionConfig) -> ProviderFuture<'a, CreatedSession> {
        Box::pin(async move {
            let response = self
                .http
                .post(self.sessions_url())
                .bearer_auth(&self.api_key)
                .json(&self.create_payload(config))
                .send()
                .await
                .map_err(|e| DirectorError::Provider(format!("create request failed: {e}")))?;

            let status = response.status();
            if status != reqwest::StatusCode::CREATED {
                let body = response.text().await.unwrap_or_default();
                return Err(DirectorError::Provider(format!(
                    "browser host returned {status} on create: {body}"
                )));
            }

            let created: CreateSessionResponse = response
                .json()
                .await
                .map_err(|e| DirectorError::Provider(format!("malformed create response: {e}")))?;

            tracing::info!(remote_id = created.id.as_str(), "provisioned remote browser session");
            Ok(CreatedSession {
                remote_id: created.id,
                connect_url: created.connect_url,
            })
        })
    }

    fn close<'a>(&'a self, remote_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let response = self
                .http
                .delete(self.session_url(remote_id))
                .bearer_auth(&self.api_key)
                .send()
                .await
                .map_err(|e| DirectorError::Provider(format!("close request failed: {e}")))?;

            let status = response.status();
            // 404 means the host already dropped it.
            if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
                tracing::debug!(remote_id, "closed remote browser session");
                Ok(())
            } else {
                let body = response.text().await.unwrap_or_default();
                Err(DirectorError::Provider(format!(
                    "browser host returned {status} on close: {body}"
                )))
            }
        })
    }

    fn health<'a>(&'a self, remote_id: &'a str) -> ProviderFuture<'a, bool> {
        Box::pin(async move {
            let response = self
                .http
                .get(self.session_url(remote_id))
                .bearer_auth(&self.api_key)
                .send()
                .await
                .map_err(|e| DirectorError::Provider(format!("health request failed: {e}")))?;

            if !response.status().is_success() {
                return Ok(false);
            }
            let status: SessionStatusResponse = match response.json().await {
                Ok(parsed) => parsed,
                Err(_) => return Ok(false),
            };
            Ok(status.status == REMOTE_RUNNING_STATUS)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_payload_carries_session_options() {
        let client = BrowserHostClient::new("https://host.test/", "key", "proj-1");
        let config = SessionConfig {
            user_agent: Some("Mozilla/5.0".to_string()),
            name: Some("job_discovery_session".to_string()),
            ..SessionConfig::default()
        };

        let payload = client.create_payload(&config);
        assert_eq!(payload["projectId"], "proj-1");
        assert_eq!(payload["proxies"], true);
        assert_eq!(payload["stealth"], true);
        assert_eq!(payload["keepAlive"], true);
        assert_eq!(payload["timeout"], 1800);
        assert_eq!(payload["viewport"]["width"], 1920);
        assert_eq!(payload["viewport"]["height"], 1080);
        assert_eq!(payload["userAgent"], "Mozilla/5.0");
        assert_eq!(payload["name"], "job_discovery_session");
    }

    #[test]
    fn create_payload_omits_absent_optionals() {
        let client = BrowserHostClient::new("https://host.test", "key", "proj-1");
        let payload = client.create_payload(&SessionConfig::default());
        assert!(payload.get("userAgent").is_none());
        assert!(payload.get("name").is_none());
    }

    #[test]
    fn urls_normalize_trailing_slash() {
        let client = BrowserHostClient::new("https://host.test/", "key", "proj");
        assert_eq!(client.sessions_url(), "https://host.test/v1/sessions");
        assert_eq!(
            client.session_url("abc-123"),
            "https://host.test/v1/sessions/abc-123"
        );
    }

    #[test]
    fn status_response_parses() {
        let parsed: SessionStatusResponse =
            serde_json::from_str(r#"{"status":"RUNNING","region":"us-west"}"#).unwrap();
        assert_eq!(parsed.status, REMOTE_RUNNING_STATUS);
    }
}
