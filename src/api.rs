//! Client for the Daytona Admin API.
//!
//! One client serves both services: the scaler lists runners through it and
//! the proxy validates preview credentials and exchanges signed tokens. It
//! carries the base URL and API key; every call sends `Authorization:
//! Bearer <key>`.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::proxy::{AuthKeyValidator, AuthUrlProvider, BearerValidator, TokenExchanger};

/// Timeout for the per-tick runner listing.
const LIST_RUNNERS_TIMEOUT: Duration = Duration::from_secs(10);

/// A runner as reported by the Admin API. Read-only to the core.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Runner {
    pub id: String,
    /// Reachable IP of the node the runner lives on. May be empty while the
    /// agent is still registering.
    #[serde(default)]
    pub domain: String,
    /// Self-reported capacity in cores, from the Docker-visible cgroup.
    #[serde(default)]
    pub cpu_capacity: f32,
    /// Self-reported capacity in GiB.
    #[serde(default)]
    pub memory_capacity: f32,
    #[serde(default)]
    pub allocated_cpu: f32,
    #[serde(default)]
    pub allocated_memory: f32,
    #[serde(default)]
    pub allocated_disk: f32,
    #[serde(default)]
    pub started_sandboxes: u32,
    #[serde(default)]
    pub snapshot_count: u32,
    #[serde(default)]
    pub unschedulable: bool,
}

impl Runner {
    /// Any allocated resource or hosted workload marks the runner Active.
    pub fn is_active(&self) -> bool {
        self.allocated_cpu > 0.0
            || self.allocated_memory > 0.0
            || self.allocated_disk > 0.0
            || self.started_sandboxes > 0
            || self.snapshot_count > 0
    }

    /// Empty and cordoned: safe to drain away.
    pub fn is_deletable(&self) -> bool {
        !self.is_active() && self.unschedulable
    }

    /// Empty but still accepting sandboxes.
    pub fn is_idle(&self) -> bool {
        !self.is_active() && !self.unschedulable
    }
}

#[derive(Debug, Deserialize)]
struct ValidationResponse {
    valid: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeResponse {
    sandbox_id: String,
}

#[derive(Debug, Deserialize)]
struct AuthUrlResponse {
    url: String,
}

/// HTTP client for the Daytona Admin API.
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
    }

    async fn into_json<T: for<'de> Deserialize<'de>>(resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Admin API error ({status}): {body}");
        }
        resp.json().await.context("failed to parse Admin API response")
    }

    /// List all runners registered in a region.
    pub async fn list_runners(&self, region_id: &str) -> Result<Vec<Runner>> {
        let resp = self
            .get("/runners")
            .query(&[("region", region_id)])
            .timeout(LIST_RUNNERS_TIMEOUT)
            .send()
            .await
            .context("runner listing request failed")?;
        Self::into_json(resp).await
    }
}

#[async_trait]
impl BearerValidator for ApiClient {
    async fn validate_bearer(&self, sandbox_id: &str, token: &str) -> Result<bool> {
        let resp = self
            .post(&format!("/preview/{sandbox_id}/validate/bearer"))
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await
            .context("bearer validation request failed")?;
        let body: ValidationResponse = Self::into_json(resp).await?;
        Ok(body.valid)
    }
}

#[async_trait]
impl AuthKeyValidator for ApiClient {
    async fn validate_auth_key(&self, sandbox_id: &str, auth_key: &str) -> Result<bool> {
        let resp = self
            .post(&format!("/preview/{sandbox_id}/validate/auth-key"))
            .json(&serde_json::json!({ "authKey": auth_key }))
            .send()
            .await
            .context("auth key validation request failed")?;
        let body: ValidationResponse = Self::into_json(resp).await?;
        Ok(body.valid)
    }
}

#[async_trait]
impl TokenExchanger for ApiClient {
    async fn exchange_token(&self, token: &str, port: u16) -> Result<String> {
        let resp = self
            .post("/preview/token/exchange")
            .json(&serde_json::json!({ "token": token, "port": port }))
            .send()
            .await
            .context("preview token exchange request failed")?;
        let body: ExchangeResponse = Self::into_json(resp).await?;
        Ok(body.sandbox_id)
    }
}

#[async_trait]
impl AuthUrlProvider for ApiClient {
    async fn auth_url(&self, id_or_token: &str, original_uri: &str) -> Result<String> {
        let resp = self
            .get("/preview/auth-url")
            .query(&[("target", id_or_token), ("redirect", original_uri)])
            .send()
            .await
            .context("auth URL request failed")?;
        let body: AuthUrlResponse = Self::into_json(resp).await?;
        Ok(body.url)
    }
}
