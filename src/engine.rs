use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::Value;

use crate::models::QueueSnapshot;

/// HTTP client for the local generation engine (ComfyUI). Every call
/// carries an explicit timeout; callers treat failures as transient and
/// retry on their own schedule.
#[derive(Debug, Clone)]
pub struct EngineClient {
    base_url: String,
    client: Client,
}

/// Raw engine response forwarded as-is by the proxy handlers.
#[derive(Debug, Clone)]
pub struct EngineResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl EngineClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build engine HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Websocket endpoint for the push-event channel.
    pub fn ws_url(&self) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            format!("ws://{}", self.base_url)
        };
        format!("{ws_base}/ws")
    }

    /// Current pending/running queue entries.
    pub async fn queue(&self) -> Result<QueueSnapshot> {
        let response = self
            .client
            .get(format!("{}/queue", self.base_url))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .context("Engine queue request failed")?
            .error_for_status()
            .context("Engine queue returned an error status")?;
        response
            .json::<QueueSnapshot>()
            .await
            .context("Failed to decode engine queue response")
    }

    /// Independent probe used by the idle monitor; any failure is treated
    /// as "not empty" so teardown stays conservative.
    pub async fn queue_is_empty(&self) -> bool {
        match self.queue().await {
            Ok(snapshot) => snapshot.is_empty(),
            Err(_) => false,
        }
    }

    pub async fn submit_prompt(&self, body: &Value) -> Result<EngineResponse> {
        let response = self
            .client
            .post(format!("{}/prompt", self.base_url))
            .timeout(Duration::from_secs(60))
            .json(body)
            .send()
            .await
            .context("Engine prompt submission failed")?;
        Self::into_engine_response(response).await
    }

    pub async fn queue_raw(&self) -> Result<EngineResponse> {
        self.raw_get("/queue", Duration::from_secs(10)).await
    }

    pub async fn object_info(&self) -> Result<EngineResponse> {
        self.raw_get("/object_info", Duration::from_secs(15)).await
    }

    pub async fn history_all(&self) -> Result<EngineResponse> {
        self.raw_get("/history", Duration::from_secs(30)).await
    }

    pub async fn history(&self, prompt_id: &str) -> Result<EngineResponse> {
        self.raw_get(&format!("/history/{prompt_id}"), Duration::from_secs(30))
            .await
    }

    pub async fn system_stats(&self) -> Result<EngineResponse> {
        self.raw_get("/system_stats", Duration::from_secs(5)).await
    }

    async fn raw_get(&self, path: &str, timeout: Duration) -> Result<EngineResponse> {
        let response = self
            .client
            .get(format!("{}{path}", self.base_url))
            .timeout(timeout)
            .send()
            .await
            .with_context(|| format!("Engine request failed: {path}"))?;
        Self::into_engine_response(response).await
    }

    async fn into_engine_response(response: reqwest::Response) -> Result<EngineResponse> {
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let body = response
            .bytes()
            .await
            .context("Failed to read engine response body")?
            .to_vec();
        Ok(EngineResponse {
            status,
            content_type,
            body,
        })
    }
}
