use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use shared::{
    domain::{SessionId, UserId},
    error::ApiError,
    protocol::{SessionSummary, UserProfile, WireMessage},
};

use crate::directory::Directory;

/// Server-side listing of the signed-in identity's sessions, used by the
/// registry refresh to reconcile the in-memory set.
#[async_trait]
pub trait SessionListing: Send + Sync {
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>>;
}

pub struct MissingListing;

#[async_trait]
impl SessionListing for MissingListing {
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        Err(anyhow!("session listing api is unavailable"))
    }
}

/// History backfill, consulted by the application when in-memory and cached
/// pages run out. Returns messages ordered oldest first.
#[async_trait]
pub trait HistoryFetch: Send + Sync {
    async fn fetch_history(
        &self,
        session_id: &SessionId,
        before_seq: i64,
    ) -> Result<Vec<WireMessage>>;
}

/// HTTP client for the directory and session-listing endpoints.
pub struct ApiClient {
    http: Client,
    base_url: String,
    uid: UserId,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, uid: UserId) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            uid,
        }
    }

    async fn decode_error(response: reqwest::Response) -> anyhow::Error {
        let status = response.status();
        match response.json::<ApiError>().await {
            Ok(api_err) => anyhow!("api request failed: {api_err}"),
            Err(_) => anyhow!("api request failed with status {status}"),
        }
    }
}

#[async_trait]
impl Directory for ApiClient {
    async fn resolve_users(&self, ids: &[UserId]) -> Result<Vec<UserProfile>> {
        let joined = ids
            .iter()
            .map(|id| id.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let response = self
            .http
            .get(format!("{}/api/users", self.base_url))
            .query(&[("ids", joined.as_str())])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::decode_error(response).await);
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl SessionListing for ApiClient {
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let response = self
            .http
            .get(format!("{}/api/sessions", self.base_url))
            .query(&[("uid", self.uid.as_str())])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::decode_error(response).await);
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl HistoryFetch for ApiClient {
    async fn fetch_history(
        &self,
        session_id: &SessionId,
        before_seq: i64,
    ) -> Result<Vec<WireMessage>> {
        let before = before_seq.to_string();
        let response = self
            .http
            .get(format!("{}/api/messages/history", self.base_url))
            .query(&[
                ("uid", self.uid.as_str()),
                ("sid", session_id.as_str()),
                ("before_seq", before.as_str()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::decode_error(response).await);
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
