//! Hub REST API
//!
//! The socket carries the sync protocol; vault membership goes over plain
//! HTTP with the account token.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error)]
pub enum HubApiError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Hub rejected the request: {0}")]
    Rejected(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToggleVaultRequest {
    model_version_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleVaultResponse {
    #[serde(default)]
    pub success: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultStatusEntry {
    pub model_version_id: i64,
    /// Present when the version currently sits in the user's vault
    #[serde(default)]
    pub vault_item: Option<VaultItem>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultItem {
    pub vault_id: i64,
}

/// Vault operations the agent needs from the hub. Tests substitute a stub.
#[async_trait]
pub trait VaultApi: Send + Sync {
    /// Flip vault membership for a model version.
    async fn toggle_vault_item(
        &self,
        model_version_id: i64,
    ) -> Result<ToggleVaultResponse, HubApiError>;

    /// Current vault membership for the given model versions.
    async fn vault_status(
        &self,
        model_version_ids: &[i64],
    ) -> Result<Vec<VaultStatusEntry>, HubApiError>;
}

pub struct HubClient {
    base_url: String,
    api_token: Option<String>,
    http: reqwest::Client,
}

impl HubClient {
    pub fn new(base_url: impl Into<String>, api_token: Option<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        Self {
            base_url,
            api_token,
            http: reqwest::Client::new(),
        }
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl VaultApi for HubClient {
    async fn toggle_vault_item(
        &self,
        model_version_id: i64,
    ) -> Result<ToggleVaultResponse, HubApiError> {
        debug!(model_version_id, "Toggling vault membership");

        let response = self
            .authorized(self.http.post(format!("{}/api/vault/toggle", self.base_url)))
            .json(&ToggleVaultRequest { model_version_id })
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| HubApiError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(HubApiError::Rejected(format!("HTTP {}", response.status())));
        }

        response
            .json()
            .await
            .map_err(|e| HubApiError::InvalidResponse(e.to_string()))
    }

    async fn vault_status(
        &self,
        model_version_ids: &[i64],
    ) -> Result<Vec<VaultStatusEntry>, HubApiError> {
        let ids = model_version_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let response = self
            .authorized(self.http.get(format!("{}/api/vault/status", self.base_url)))
            .query(&[("modelVersionIds", ids.as_str())])
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| HubApiError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(HubApiError::Rejected(format!("HTTP {}", response.status())));
        }

        response
            .json()
            .await
            .map_err(|e| HubApiError::InvalidResponse(e.to_string()))
    }
}
