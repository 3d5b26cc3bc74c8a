//! API client for communicating with the fleet controller

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// A non-success response from the controller, carrying the machine-readable
/// error kind used for exit-code mapping
#[derive(Debug, Clone, Error)]
#[error("API error ({status}): {message}")]
pub struct ApiFailure {
    pub status: u16,
    pub kind: String,
    pub message: String,
}

/// API client for the fleet controller
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        Self::parse(response).await
    }

    /// Make a POST request with JSON body
    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .context("Failed to send request")?;

        Self::parse(response).await
    }

    /// Make a POST request with no body
    pub async fn post_empty<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .post(url)
            .send()
            .await
            .context("Failed to send request")?;

        Self::parse(response).await
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let (kind, message) = match serde_json::from_str::<ErrorResponse>(&body) {
                Ok(err) => (err.kind, err.error),
                Err(_) => ("unknown".to_string(), body),
            };
            return Err(ApiFailure {
                status: status.as_u16(),
                kind,
                message,
            }
            .into());
        }
        response.json().await.context("Failed to parse response")
    }
}

// API wire types, mirroring the controller's JSON

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub region: String,
    pub zone: String,
    pub resource_type: String,
}

impl std::fmt::Display for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.region, self.zone, self.resource_type)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SwitchRequest {
    pub source_resource_id: String,
    pub constraints: Constraints,
    pub variant: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Constraints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_family: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    pub min_capacity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchAccepted {
    pub record_id: String,
    pub chosen_pool: Pool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchRecord {
    pub record_id: String,
    pub source_resource_id: String,
    pub tenant_id: String,
    pub chosen_pool: Option<Pool>,
    pub replacement_resource_id: Option<String>,
    pub phase_reached: String,
    pub outcome: Option<String>,
    pub reason: Option<String>,
    pub cost_delta: Option<f64>,
    pub drain_timed_out: bool,
    pub created_at: i64,
    pub closed_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedResource {
    pub resource_id: String,
    pub pool: Pool,
    pub lifecycle: String,
    pub tenant_id: String,
    pub environment: String,
    pub status: String,
    pub termination_attempted_at: Option<i64>,
    pub termination_confirmed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoisonEntry {
    pub pool: Pool,
    pub poisoned: bool,
    pub interruption_count: u32,
    pub poisoned_at: i64,
    pub poison_expires_at: i64,
    pub triggering_tenant_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlModel {
    pub model_id: String,
    pub version: String,
    pub status: String,
    pub is_active_production: bool,
    pub trained_at: i64,
    pub validation_accuracy: Option<f32>,
}
