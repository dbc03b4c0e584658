//! Configuration handlers
//!
//! - GET   /api/config          - full configuration
//! - PATCH /api/config/stream   - stream session timing
//! - PATCH /api/config/sensors  - sensor auto-reset defaults
//!
//! Stream timings (including the spawn settle window) and sensor defaults
//! are read per request and apply to the next start. The port range, base station and web settings are read at
//! startup only.

use axum::{extract::State, Json};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use crate::config::{AppConfig, SensorConfig, StreamConfig};
use crate::error::{AppError, Result};
use crate::state::AppState;

pub async fn get_all_config(State(state): State<Arc<AppState>>) -> Json<AppConfig> {
    Json((*state.config.get()).clone())
}

/// Partial stream configuration update
#[derive(Debug, Default, Deserialize)]
pub struct StreamConfigUpdate {
    pub keepalive_timeout_ms: Option<u32>,
    pub refresh_window_ms: Option<u32>,
    pub cooldown_ms: Option<u32>,
    pub spawn_settle_ms: Option<u32>,
    pub spawn_retries: Option<u32>,
    pub wake_timeout_ms: Option<u32>,
    pub receiver_binary: Option<String>,
    pub rtsp_path: Option<String>,
}

impl StreamConfigUpdate {
    pub fn validate(&self) -> Result<()> {
        if let Some(ref path) = self.rtsp_path {
            if !path.starts_with('/') {
                return Err(AppError::BadRequest("rtsp_path must start with '/'".into()));
            }
        }
        Ok(())
    }

    pub fn apply_to(&self, config: &mut StreamConfig) {
        if let Some(v) = self.keepalive_timeout_ms {
            config.keepalive_timeout_ms = v;
        }
        if let Some(v) = self.refresh_window_ms {
            config.refresh_window_ms = v;
        }
        if let Some(v) = self.cooldown_ms {
            config.cooldown_ms = v;
        }
        if let Some(v) = self.spawn_settle_ms {
            config.spawn_settle_ms = v;
        }
        if let Some(v) = self.spawn_retries {
            config.spawn_retries = v;
        }
        if let Some(v) = self.wake_timeout_ms {
            config.wake_timeout_ms = v;
        }
        if let Some(ref binary) = self.receiver_binary {
            config.receiver_binary = binary.trim().to_string();
        }
        if let Some(ref path) = self.rtsp_path {
            config.rtsp_path = path.clone();
        }
    }
}

pub async fn update_stream_config(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StreamConfigUpdate>,
) -> Result<Json<StreamConfig>> {
    req.validate()?;
    state.config.update(|config| req.apply_to(&mut config.stream)).await?;

    let stream = state.config.get().stream.clone();
    info!(
        "Stream config updated: keepalive={}ms cooldown={}ms",
        stream.keepalive_timeout_ms, stream.cooldown_ms
    );
    Ok(Json(stream))
}

#[derive(Debug, Default, Deserialize)]
pub struct SensorConfigUpdate {
    pub motion_reset_secs: Option<u32>,
    pub button_reset_secs: Option<u32>,
}

impl SensorConfigUpdate {
    pub fn validate(&self) -> Result<()> {
        for secs in [self.motion_reset_secs, self.button_reset_secs].into_iter().flatten() {
            if !(1..=86_400).contains(&secs) {
                return Err(AppError::BadRequest(
                    "Sensor reset must be between 1 and 86400 seconds".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn apply_to(&self, config: &mut SensorConfig) {
        if let Some(v) = self.motion_reset_secs {
            config.motion_reset_secs = v;
        }
        if let Some(v) = self.button_reset_secs {
            config.button_reset_secs = v;
        }
    }
}

pub async fn update_sensor_config(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SensorConfigUpdate>,
) -> Result<Json<SensorConfig>> {
    req.validate()?;
    state.config.update(|config| req.apply_to(&mut config.sensors)).await?;
    Ok(Json(state.config.get().sensors.clone()))
}
