use serde::Deserialize;

use crate::errors::RiftError;

/// Success body of the token endpoint.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
    identity: String,
    room: String,
}

/// Failure body of the token endpoint (HTTP 500).
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
}

/// Body of the health probe.
#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
}

/// A signed join credential scoped to one (identity, room) pair.
///
/// Fetched fresh for every connect attempt and consumed by that attempt;
/// never cached or reused across rooms.
#[derive(Debug, Clone)]
pub struct JoinCredential {
    pub token: String,
    pub identity: String,
    pub room: String,
}

/// Seam for the credential fetcher so the session controller can be
/// exercised without a live token server.
pub trait TokenProvider: Send + Sync + 'static {
    fn fetch(
        &self,
        identity: &str,
        room: &str,
    ) -> impl Future<Output = Result<JoinCredential, RiftError>> + Send;
}

/// Client for the short-lived credential endpoint.
pub struct TokenClient {
    base_url: String,
    http: reqwest::Client,
}

impl TokenClient {
    /// `base_url` is the token server root, e.g. `http://localhost:3001`.
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn token_url(&self, identity: &str, room: &str) -> String {
        format!(
            "{}/token?identity={}&room={}",
            self.base_url,
            urlencoding::encode(identity),
            urlencoding::encode(room),
        )
    }

    /// Probe the token server's `/health` endpoint.
    pub async fn health(&self) -> Result<(), RiftError> {
        let url = format!("{}/health", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| RiftError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(RiftError::Http(format!(
                "health probe returned status {}",
                resp.status()
            )));
        }

        let body: HealthResponse = resp
            .json()
            .await
            .map_err(|e| RiftError::Http(format!("invalid health response: {e}")))?;

        if body.status != "ok" {
            return Err(RiftError::Http(format!(
                "health probe reported status '{}'",
                body.status
            )));
        }
        Ok(())
    }
}

impl TokenProvider for TokenClient {
    async fn fetch(&self, identity: &str, room: &str) -> Result<JoinCredential, RiftError> {
        let url = self.token_url(identity, room);
        tracing::info!("requesting join credential: {url}");

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| RiftError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            // The endpoint reports failures as `{"error": "..."}`.
            let detail = match resp.json::<TokenErrorResponse>().await {
                Ok(body) => body.error,
                Err(_) => format!("status {status}"),
            };
            return Err(RiftError::Credential(detail));
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| RiftError::Credential(format!("malformed token response: {e}")))?;

        Ok(JoinCredential {
            token: body.token,
            identity: body.identity,
            room: body.room,
        })
    }
}
