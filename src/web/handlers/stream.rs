//! Stream session handlers

use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use super::ActionResponse;
use crate::camera::{StreamOption, StreamRequestOptions};
use crate::error::Result;
use crate::state::AppState;
use crate::stream::{StreamDescriptor, StreamStatus};

pub async fn stream_options(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<StreamOption>>> {
    let device = state.cameras.get(&id).await?;
    Ok(Json(device.get_video_stream_options().await?))
}

/// Start, join or refresh a stream
///
/// The body is optional; `refreshAt` marks a refresh of the running session.
pub async fn stream_start(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    options: Option<Json<StreamRequestOptions>>,
) -> Result<Json<StreamDescriptor>> {
    let options = options.map(|Json(o)| o).unwrap_or_default();
    let device = state.cameras.get(&id).await?;
    Ok(Json(device.get_video_stream(&options).await?))
}

pub async fn stream_stop(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>> {
    let device = state.cameras.get(&id).await?;
    device.stop_stream().await;
    Ok(ActionResponse::ok("Stream stopped"))
}

pub async fn stream_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StreamStatus>> {
    let device = state.cameras.get(&id).await?;
    Ok(Json(device.stream_status().await))
}
