use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::camera::CameraRegistry;
use crate::config::ConfigStore;
use crate::events::EventBus;

/// Application-wide state shared across handlers
pub struct AppState {
    /// Configuration store
    pub config: ConfigStore,
    /// Registered cameras and their stream controllers
    pub cameras: Arc<CameraRegistry>,
    /// Event bus for real-time notifications
    pub events: Arc<EventBus>,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
    /// Data directory path
    data_dir: PathBuf,
}

impl AppState {
    pub fn new(
        config: ConfigStore,
        cameras: Arc<CameraRegistry>,
        events: Arc<EventBus>,
        shutdown_tx: broadcast::Sender<()>,
        data_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            cameras,
            events,
            shutdown_tx,
            data_dir,
        })
    }

    /// Get data directory path
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Subscribe to shutdown signal
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}
