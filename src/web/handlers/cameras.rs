//! Camera registry, settings and sensor handlers

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use super::ActionResponse;
use crate::camera::{CameraInfo, Setting};
use crate::config::CameraRecord;
use crate::error::Result;
use crate::state::AppState;

/// List registered cameras
pub async fn list_cameras(State(state): State<Arc<AppState>>) -> Result<Json<Vec<CameraRecord>>> {
    Ok(Json(state.cameras.list().await?))
}

#[derive(Deserialize)]
pub struct CreateCameraRequest {
    pub name: String,
    pub host: Option<String>,
    pub model: Option<String>,
}

/// Register a camera
pub async fn create_camera(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateCameraRequest>,
) -> Result<Json<CameraRecord>> {
    let record = state
        .cameras
        .create_camera(&req.name, req.host, req.model)
        .await?;
    Ok(Json(record))
}

/// Camera record plus sensor flags
pub async fn get_camera(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CameraInfo>> {
    let device = state.cameras.get(&id).await?;
    Ok(Json(device.info()))
}

pub async fn get_settings(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Setting>>> {
    let device = state.cameras.get(&id).await?;
    Ok(Json(device.get_settings().await?))
}

#[derive(Deserialize)]
pub struct PutSettingRequest {
    pub key: String,
    #[serde(default)]
    pub value: Value,
}

/// Store one setting; responds with the full settings list
pub async fn put_setting(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<PutSettingRequest>,
) -> Result<Json<Vec<Setting>>> {
    let device = state.cameras.get(&id).await?;
    device.put_setting(&req.key, &req.value).await?;
    Ok(Json(device.get_settings().await?))
}

pub async fn motion_detected(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>> {
    let device = state.cameras.get(&id).await?;
    device.on_motion_detected().await?;
    Ok(ActionResponse::ok("Motion detected"))
}

pub async fn button_pressed(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>> {
    let device = state.cameras.get(&id).await?;
    device.on_button_pressed();
    Ok(ActionResponse::ok("Button pressed"))
}
