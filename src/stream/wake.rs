//! Camera wake/sleep signalling

use async_trait::async_trait;

use crate::error::StreamError;

/// Best-effort signal telling the camera a stream consumer is (or is no
/// longer) attached. Battery cameras sleep aggressively and need this nudge
/// before their RTSP server answers.
#[async_trait]
pub trait StreamActivator: Send + Sync {
    async fn set_stream_active(&self, camera_id: &str, active: bool) -> Result<(), StreamError>;
}

/// Activator for deployments without a base station
pub struct NoopActivator;

#[async_trait]
impl StreamActivator for NoopActivator {
    async fn set_stream_active(&self, camera_id: &str, active: bool) -> Result<(), StreamError> {
        tracing::trace!(camera = %camera_id, active, "No base station configured, skipping wake signal");
        Ok(())
    }
}
