//! Base station HTTP client
//!
//! The base station relays a "user stream active" flag to the camera, which
//! is what brings a sleeping battery camera's RTSP server up.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::BaseStationConfig;
use crate::error::{AppError, Result, StreamError};
use crate::stream::{NoopActivator, StreamActivator};

#[derive(Serialize)]
struct UserStreamRequest {
    active: bool,
}

/// Client for the base station's camera endpoints
pub struct BaseStationClient {
    client: reqwest::Client,
    base_url: String,
}

impl BaseStationClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Activator for `config`: the HTTP client when a URL is configured, a
    /// no-op otherwise
    pub fn activator(config: &BaseStationConfig) -> Result<Arc<dyn StreamActivator>> {
        match config.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
            Some(url) => Ok(Arc::new(Self::new(
                url,
                Duration::from_millis(config.request_timeout_ms as u64),
            )?)),
            None => Ok(Arc::new(NoopActivator)),
        }
    }

    fn user_stream_url(&self, camera_id: &str) -> String {
        format!("{}/cameras/{}/userstream", self.base_url, camera_id)
    }
}

#[async_trait]
impl StreamActivator for BaseStationClient {
    async fn set_stream_active(&self, camera_id: &str, active: bool) -> std::result::Result<(), StreamError> {
        let url = self.user_stream_url(camera_id);
        debug!("POST {} active={}", url, active);

        let response = self
            .client
            .post(&url)
            .json(&UserStreamRequest { active })
            .send()
            .await
            .map_err(|e| StreamError::UpstreamUnresponsive(e.to_string()))?;

        if !response.status().is_success() {
            return Err(StreamError::UpstreamUnresponsive(format!(
                "base station returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
