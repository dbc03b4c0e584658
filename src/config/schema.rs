use serde::{Deserialize, Serialize};
use std::time::Duration;
use typeshare::typeshare;

/// Main application configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Web server settings
    pub web: WebConfig,
    /// Stream session lifecycle settings
    pub stream: StreamConfig,
    /// Base station (wake signal) settings
    pub base_station: BaseStationConfig,
    /// Motion/doorbell sensor settings
    pub sensors: SensorConfig,
    /// Hardware models known to ship without a microphone
    pub models_without_audio: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            web: WebConfig::default(),
            stream: StreamConfig::default(),
            base_station: BaseStationConfig::default(),
            sensors: SensorConfig::default(),
            models_without_audio: vec!["VMC3030".to_string()],
        }
    }
}

impl AppConfig {
    /// Whether a camera model lacks audio hardware
    pub fn model_lacks_audio(&self, model: Option<&str>) -> bool {
        model.is_some_and(|m| self.models_without_audio.iter().any(|known| known == m))
    }
}

/// Web server configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// Bind address
    pub bind_address: String,
    /// HTTP port
    pub http_port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 8090,
        }
    }
}

/// Stream session configuration
///
/// All durations are stored in milliseconds so the JSON blob stays readable.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// First port of the ephemeral transport range
    pub port_range_start: u16,
    /// Last port of the ephemeral transport range (inclusive)
    pub port_range_end: u16,
    /// Random probes before giving up on finding a free port
    pub port_probe_attempts: u32,
    /// Pipeline is torn down this long after the last start/refresh
    pub keepalive_timeout_ms: u32,
    /// Caller-visible refresh deadline, relative to the last start/refresh
    pub refresh_window_ms: u32,
    /// Enforced idle period after a stop
    pub cooldown_ms: u32,
    /// A pipeline alive after this long counts as started
    pub spawn_settle_ms: u32,
    /// Extra start attempts (with a fresh port) when the pipeline dies during settle
    pub spawn_retries: u32,
    /// Upper bound on waiting for the camera wake signal
    pub wake_timeout_ms: u32,
    /// Receiver/remuxer executable
    pub receiver_binary: String,
    /// RTSP path on the camera
    pub rtsp_path: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            port_range_start: 30000,
            port_range_end: 60000,
            port_probe_attempts: 10,
            keepalive_timeout_ms: 11_000,
            refresh_window_ms: 40_000,
            cooldown_ms: 10_000,
            spawn_settle_ms: 200,
            spawn_retries: 2,
            wake_timeout_ms: 5_000,
            receiver_binary: "gst-launch-1.0".to_string(),
            rtsp_path: "/live".to_string(),
        }
    }
}

impl StreamConfig {
    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms as u64)
    }

    pub fn refresh_window(&self) -> Duration {
        Duration::from_millis(self.refresh_window_ms as u64)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms as u64)
    }

    pub fn spawn_settle(&self) -> Duration {
        Duration::from_millis(self.spawn_settle_ms as u64)
    }

    pub fn wake_timeout(&self) -> Duration {
        Duration::from_millis(self.wake_timeout_ms as u64)
    }

    /// Validate internal consistency
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.port_range_start == 0 || self.port_range_start > self.port_range_end {
            return Err(format!(
                "invalid port range {}-{}",
                self.port_range_start, self.port_range_end
            ));
        }
        if self.port_probe_attempts == 0 {
            return Err("port_probe_attempts must be at least 1".into());
        }
        if self.keepalive_timeout_ms == 0 {
            return Err("keepalive_timeout_ms must be positive".into());
        }
        if self.refresh_window_ms < self.keepalive_timeout_ms {
            return Err("refresh_window_ms must not be shorter than keepalive_timeout_ms".into());
        }
        if self.receiver_binary.trim().is_empty() {
            return Err("receiver_binary is required".into());
        }
        Ok(())
    }
}

/// Base station API configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseStationConfig {
    /// Base URL of the base station API (wake signals are skipped when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// HTTP request timeout
    pub request_timeout_ms: u32,
}

impl Default for BaseStationConfig {
    fn default() -> Self {
        Self {
            url: None,
            request_timeout_ms: 5_000,
        }
    }
}

/// Detection sensor configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Motion flag auto-reset when a camera has no override
    pub motion_reset_secs: u32,
    /// Doorbell button flag auto-reset
    pub button_reset_secs: u32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            motion_reset_secs: 30,
            button_reset_secs: 10,
        }
    }
}
