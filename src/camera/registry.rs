//! Camera registry
//!
//! Cameras are persisted through `DeviceStorage`; a `CameraDevice` (and with
//! it the camera's stream controller) is created the first time the camera is
//! used and lives until shutdown.

use parking_lot::Mutex as SyncMutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::device::CameraDevice;
use crate::config::{CameraRecord, DeviceStorage, SharedConfig};
use crate::error::{AppError, Result};
use crate::events::SystemEvent;
use crate::stream::ControllerDeps;

/// Registry of cameras and their live devices
pub struct CameraRegistry {
    storage: Arc<dyn DeviceStorage>,
    config: SharedConfig,
    deps: ControllerDeps,
    devices: Mutex<HashMap<String, Arc<CameraDevice>>>,
    rng: SyncMutex<Box<dyn RngCore + Send>>,
}

impl CameraRegistry {
    pub fn new(storage: Arc<dyn DeviceStorage>, config: SharedConfig, deps: ControllerDeps) -> Self {
        Self::with_rng(storage, config, deps, Box::new(StdRng::from_entropy()))
    }

    /// Registry drawing camera ids from `rng`
    pub fn with_rng(
        storage: Arc<dyn DeviceStorage>,
        config: SharedConfig,
        deps: ControllerDeps,
        rng: Box<dyn RngCore + Send>,
    ) -> Self {
        Self {
            storage,
            config,
            deps,
            devices: Mutex::new(HashMap::new()),
            rng: SyncMutex::new(rng),
        }
    }

    pub async fn list(&self) -> Result<Vec<CameraRecord>> {
        self.storage.list_cameras().await
    }

    /// Device for `camera_id`, created on first use
    pub async fn get(&self, camera_id: &str) -> Result<Arc<CameraDevice>> {
        let mut devices = self.devices.lock().await;
        if let Some(device) = devices.get(camera_id) {
            return Ok(device.clone());
        }

        let record = self
            .storage
            .list_cameras()
            .await?
            .into_iter()
            .find(|c| c.id == camera_id)
            .ok_or_else(|| AppError::NotFound(format!("Camera {} not found", camera_id)))?;

        let device = Arc::new(CameraDevice::new(
            record,
            self.storage.clone(),
            self.config.clone(),
            self.deps.clone(),
        ));
        devices.insert(camera_id.to_string(), device.clone());
        Ok(device)
    }

    /// Register a new camera under a random 8-hex-digit id
    pub async fn create_camera(
        &self,
        name: &str,
        host: Option<String>,
        model: Option<String>,
    ) -> Result<CameraRecord> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::BadRequest("Camera name is required".to_string()));
        }

        let existing = self.storage.list_cameras().await?;
        let id = loop {
            let candidate = format!("{:08x}", self.rng.lock().next_u32());
            if !existing.iter().any(|c| c.id == candidate) {
                break candidate;
            }
        };

        let record = CameraRecord {
            id,
            name: name.to_string(),
            host: host.filter(|h| !h.trim().is_empty()),
            model: model.filter(|m| !m.trim().is_empty()),
        };
        self.storage.insert_camera(&record).await?;

        info!("Camera {} registered as {}", record.name, record.id);
        self.deps.events.publish(SystemEvent::CameraAdded {
            camera_id: record.id.clone(),
            name: record.name.clone(),
        });
        Ok(record)
    }

    /// Stop every live stream
    pub async fn stop_all(&self) {
        let devices: Vec<_> = self.devices.lock().await.values().cloned().collect();
        futures::future::join_all(devices.iter().map(|d| d.stop_stream())).await;
        info!("Stopped streams of {} camera(s)", devices.len());
    }
}
