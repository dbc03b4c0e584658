//! Camera device facade
//!
//! Resolves a camera's settings and the live application configuration into
//! stream requests for its controller, and owns the camera's motion and
//! doorbell detection flags.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use typeshare::typeshare;

use super::settings::{normalize_setting, CameraSettings, Setting};
use crate::config::{AppConfig, CameraRecord, DeviceStorage, SharedConfig};
use crate::error::Result;
use crate::events::SystemEvent;
use crate::stream::{
    AutoResetFlag, ControllerDeps, PipelineSource, RefreshToken, StreamController,
    StreamDescriptor, StreamRequest, StreamStatus,
};

/// The only stream a camera offers
pub const DEFAULT_STREAM_ID: &str = "channel0";

#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CodecInfo {
    pub codec: String,
}

/// Stream offered by a camera
#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamOption {
    pub id: String,
    pub name: String,
    pub video: CodecInfo,
    /// `null` when the camera streams without audio
    pub audio: Option<CodecInfo>,
}

/// Options a caller sends with a stream request
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequestOptions {
    /// Stream option id; unknown ids use the default stream
    pub id: Option<String>,
    /// Present when the caller refreshes a stream it already holds
    pub refresh_at: Option<i64>,
    /// Session the caller was handed, checked on refresh
    pub session_id: Option<u64>,
}

/// One registered camera
pub struct CameraDevice {
    record: CameraRecord,
    storage: Arc<dyn DeviceStorage>,
    config: SharedConfig,
    controller: Arc<StreamController>,
    motion: AutoResetFlag,
    button: AutoResetFlag,
}

impl CameraDevice {
    pub fn new(
        record: CameraRecord,
        storage: Arc<dyn DeviceStorage>,
        config: SharedConfig,
        deps: ControllerDeps,
    ) -> Self {
        let motion = {
            let (events, camera_id) = (deps.events.clone(), record.id.clone());
            AutoResetFlag::new(move |detected| {
                events.publish(SystemEvent::MotionChanged {
                    camera_id: camera_id.clone(),
                    detected,
                })
            })
        };
        let button = {
            let (events, camera_id) = (deps.events.clone(), record.id.clone());
            AutoResetFlag::new(move |pressed| {
                events.publish(SystemEvent::ButtonChanged {
                    camera_id: camera_id.clone(),
                    pressed,
                })
            })
        };

        let stream_config = config.load().stream.clone();
        let controller = StreamController::new(record.id.clone(), deps, stream_config);

        Self {
            record,
            storage,
            config,
            controller,
            motion,
            button,
        }
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn record(&self) -> &CameraRecord {
        &self.record
    }

    async fn settings(&self, config: &AppConfig) -> Result<CameraSettings> {
        CameraSettings::load(
            self.storage.as_ref(),
            &self.record.id,
            config.sensors.motion_reset_secs,
        )
        .await
    }

    fn audio_disabled(&self, settings: &CameraSettings, config: &AppConfig) -> bool {
        settings.audio_disabled || config.model_lacks_audio(self.record.model.as_deref())
    }

    /// Start, join or refresh this camera's stream
    ///
    /// `options.refresh_at` marks the request as a refresh of a stream the
    /// caller already holds.
    pub async fn get_video_stream(&self, options: &StreamRequestOptions) -> Result<StreamDescriptor> {
        let config = self.config.load_full();
        let settings = self.settings(&config).await?;

        if let Some(id) = options.id.as_deref().filter(|id| *id != DEFAULT_STREAM_ID) {
            debug!(camera = %self.record.id, "Unknown stream option '{}', using {}", id, DEFAULT_STREAM_ID);
        }

        let request = StreamRequest {
            config: config.stream.clone(),
            source: PipelineSource {
                host: self.record.host.clone(),
                receiver_override: settings.receiver_override.clone(),
                reader_override: settings.reader_override.clone(),
                audio_enabled: !self.audio_disabled(&settings, &config),
                debug: settings.pipeline_debug,
            },
            stream_options_id: DEFAULT_STREAM_ID.to_string(),
        };
        let token = options.refresh_at.map(|_| RefreshToken {
            session_id: options.session_id,
        });

        Ok(self.controller.start_or_refresh(&request, token).await?)
    }

    pub async fn get_video_stream_options(&self) -> Result<Vec<StreamOption>> {
        let config = self.config.load_full();
        let settings = self.settings(&config).await?;
        let audio = (!self.audio_disabled(&settings, &config)).then(|| CodecInfo {
            codec: "opus".to_string(),
        });

        Ok(vec![StreamOption {
            id: DEFAULT_STREAM_ID.to_string(),
            name: "Stream 1".to_string(),
            video: CodecInfo {
                codec: "h264".to_string(),
            },
            audio,
        }])
    }

    pub async fn stop_stream(&self) {
        self.controller.stop().await;
    }

    pub async fn stream_status(&self) -> StreamStatus {
        self.controller.status().await
    }

    pub async fn get_settings(&self) -> Result<Vec<Setting>> {
        let config = self.config.load_full();
        let settings = self.settings(&config).await?;
        Ok(settings.describe(self.audio_disabled(&settings, &config)))
    }

    /// Validate and persist one setting; takes effect on the next start
    pub async fn put_setting(&self, key: &str, value: &Value) -> Result<()> {
        let (key, stored) = normalize_setting(key, value)?;
        self.storage
            .set_item(&self.record.id, key.as_str(), &stored)
            .await?;
        info!(camera = %self.record.id, "Setting {} updated", key.as_str());
        Ok(())
    }

    /// Set the motion flag; it clears after `sensorAutoResetSeconds` without
    /// further motion
    pub async fn on_motion_detected(&self) -> Result<()> {
        let config = self.config.load_full();
        let settings = self.settings(&config).await?;
        self.motion
            .trigger(Duration::from_secs(settings.sensor_reset_secs as u64));
        Ok(())
    }

    /// Set the doorbell flag; it clears after the configured button window
    pub fn on_button_pressed(&self) {
        let secs = self.config.load().sensors.button_reset_secs;
        self.button.trigger(Duration::from_secs(secs as u64));
    }

    pub fn motion_detected(&self) -> bool {
        self.motion.get()
    }

    pub fn button_pressed(&self) -> bool {
        self.button.get()
    }

    pub fn info(&self) -> CameraInfo {
        CameraInfo {
            record: self.record.clone(),
            motion_detected: self.motion_detected(),
            button_pressed: self.button_pressed(),
        }
    }
}

/// Camera listing entry with live sensor state
#[derive(Debug, Clone, Serialize)]
pub struct CameraInfo {
    #[serde(flatten)]
    pub record: CameraRecord,
    pub motion_detected: bool,
    pub button_pressed: bool,
}
