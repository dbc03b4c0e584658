//! System event types
//!
//! Defines all event types that can be broadcast through the event bus.

use serde::{Deserialize, Serialize};

/// System event enumeration
///
/// Serialized as `{"event": "stream.state_changed", "data": {...}}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SystemEvent {
    /// A camera's stream controller changed state
    #[serde(rename = "stream.state_changed")]
    StreamStateChanged {
        camera_id: String,
        /// "idle", "cooldown", "starting", "active"
        state: String,
        /// Transport port while starting/active
        #[serde(skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },

    /// A start attempt failed and the controller returned to idle
    #[serde(rename = "stream.start_failed")]
    StreamStartFailed { camera_id: String, error: String },

    /// An active pipeline exited on its own
    #[serde(rename = "stream.pipeline_exited")]
    StreamPipelineExited {
        camera_id: String,
        /// Exit description from the supervisor
        reason: String,
    },

    /// Motion flag changed
    #[serde(rename = "sensor.motion")]
    MotionChanged { camera_id: String, detected: bool },

    /// Doorbell button flag changed
    #[serde(rename = "sensor.button")]
    ButtonChanged { camera_id: String, pressed: bool },

    /// Camera added to the registry
    #[serde(rename = "system.camera_added")]
    CameraAdded { camera_id: String, name: String },
}

impl SystemEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::StreamStateChanged { .. } => "stream.state_changed",
            Self::StreamStartFailed { .. } => "stream.start_failed",
            Self::StreamPipelineExited { .. } => "stream.pipeline_exited",
            Self::MotionChanged { .. } => "sensor.motion",
            Self::ButtonChanged { .. } => "sensor.button",
            Self::CameraAdded { .. } => "system.camera_added",
        }
    }

    /// Camera the event refers to
    pub fn camera_id(&self) -> &str {
        match self {
            Self::StreamStateChanged { camera_id, .. }
            | Self::StreamStartFailed { camera_id, .. }
            | Self::StreamPipelineExited { camera_id, .. }
            | Self::MotionChanged { camera_id, .. }
            | Self::ButtonChanged { camera_id, .. }
            | Self::CameraAdded { camera_id, .. } => camera_id,
        }
    }

    /// Whether a subscription topic (`*`, `stream.*`, or an exact name)
    /// selects this event
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();
        match topic.strip_suffix(".*") {
            Some(prefix) => event_name
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.')),
            None => event_name == topic,
        }
    }
}
