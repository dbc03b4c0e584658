//! Per-camera settings
//!
//! Values are persisted as strings through `DeviceStorage`; this module owns
//! the typed view, validation and the descriptive listing shown to clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::DeviceStorage;
use crate::error::{AppError, Result};
use crate::stream::split_command_line;

/// Upper bound for `sensorAutoResetSeconds` (one day)
const MAX_SENSOR_RESET_SECS: u64 = 86_400;

/// Setting value type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingType {
    String,
    Integer,
    Boolean,
}

/// Known setting keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    ReceiverInputOverride,
    ReaderInputOverride,
    SensorAutoResetSeconds,
    AudioDisabled,
    PipelineDebug,
}

impl SettingKey {
    pub const ALL: [SettingKey; 5] = [
        SettingKey::ReceiverInputOverride,
        SettingKey::ReaderInputOverride,
        SettingKey::SensorAutoResetSeconds,
        SettingKey::AudioDisabled,
        SettingKey::PipelineDebug,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReceiverInputOverride => "receiverInputOverride",
            Self::ReaderInputOverride => "readerInputOverride",
            Self::SensorAutoResetSeconds => "sensorAutoResetSeconds",
            Self::AudioDisabled => "audioDisabled",
            Self::PipelineDebug => "pipelineDebug",
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == key)
    }

    pub fn setting_type(&self) -> SettingType {
        match self {
            Self::ReceiverInputOverride | Self::ReaderInputOverride => SettingType::String,
            Self::SensorAutoResetSeconds => SettingType::Integer,
            Self::AudioDisabled | Self::PipelineDebug => SettingType::Boolean,
        }
    }

    fn title(&self) -> &'static str {
        match self {
            Self::ReceiverInputOverride => "Receiver Input Override",
            Self::ReaderInputOverride => "Reader Input Override",
            Self::SensorAutoResetSeconds => "Sensor Auto-Reset",
            Self::AudioDisabled => "No Audio",
            Self::PipelineDebug => "Pipeline Debug",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            Self::ReceiverInputOverride => {
                "Optional override of the gst-launch-1.0 arguments. {port} is replaced with the allocated port."
            }
            Self::ReaderInputOverride => {
                "Optional override of the reader input arguments. {port} is replaced with the allocated port."
            }
            Self::SensorAutoResetSeconds => {
                "Time to wait in seconds before clearing the motion detected state."
            }
            Self::AudioDisabled => {
                "Enable if the camera has no microphone or to mute audio."
            }
            Self::PipelineDebug => "Enable verbose GStreamer output in the service log.",
        }
    }

    fn placeholder(&self) -> Option<&'static str> {
        match self {
            Self::ReceiverInputOverride => Some("rtspsrc location=rtsp://192.168.1.100/live ..."),
            Self::ReaderInputOverride => Some("-f mpegts -i udp://127.0.0.1:{port}"),
            _ => None,
        }
    }
}

/// Setting as listed to clients
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Setting {
    pub key: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    #[serde(rename = "type")]
    pub setting_type: SettingType,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<&'static str>,
}

/// Typed settings of one camera
#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    pub receiver_override: Option<String>,
    pub reader_override: Option<String>,
    pub sensor_reset_secs: u32,
    pub audio_disabled: bool,
    pub pipeline_debug: bool,
}

impl CameraSettings {
    /// Read every setting, falling back to defaults for missing or unparsable
    /// values.
    pub async fn load(
        storage: &dyn DeviceStorage,
        camera_id: &str,
        default_sensor_secs: u32,
    ) -> Result<Self> {
        let get = |key: SettingKey| storage.get_item(camera_id, key.as_str());

        let sensor_reset_secs = get(SettingKey::SensorAutoResetSeconds)
            .await?
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(default_sensor_secs);

        Ok(Self {
            receiver_override: non_blank(get(SettingKey::ReceiverInputOverride).await?),
            reader_override: non_blank(get(SettingKey::ReaderInputOverride).await?),
            sensor_reset_secs,
            audio_disabled: get(SettingKey::AudioDisabled).await?.as_deref() == Some("true"),
            pipeline_debug: get(SettingKey::PipelineDebug).await?.as_deref() == Some("true"),
        })
    }

    /// Descriptive listing; `audio_disabled` is the effective value, which
    /// also accounts for models without a microphone.
    pub fn describe(&self, audio_disabled: bool) -> Vec<Setting> {
        SettingKey::ALL
            .into_iter()
            .map(|key| {
                let value = match key {
                    SettingKey::ReceiverInputOverride => optional_string(&self.receiver_override),
                    SettingKey::ReaderInputOverride => optional_string(&self.reader_override),
                    SettingKey::SensorAutoResetSeconds => Value::from(self.sensor_reset_secs),
                    SettingKey::AudioDisabled => Value::Bool(audio_disabled),
                    SettingKey::PipelineDebug => Value::Bool(self.pipeline_debug),
                };
                Setting {
                    key: key.as_str(),
                    title: key.title(),
                    description: key.description(),
                    setting_type: key.setting_type(),
                    value,
                    placeholder: key.placeholder(),
                }
            })
            .collect()
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn optional_string(value: &Option<String>) -> Value {
    value.clone().map(Value::String).unwrap_or(Value::Null)
}

/// Validate `value` for `key` and return the string to persist
///
/// Strings accept `null` to clear the override. Integers and booleans also
/// accept their string forms, since form-based clients send everything as
/// text.
pub fn normalize_setting(key: &str, value: &Value) -> Result<(SettingKey, String)> {
    let setting = SettingKey::parse(key)
        .ok_or_else(|| AppError::BadRequest(format!("Unknown setting '{}'", key)))?;

    let wrong_type = || {
        AppError::BadRequest(format!(
            "Setting '{}' expects a {:?} value",
            key,
            setting.setting_type()
        ))
    };

    let stored = match setting.setting_type() {
        SettingType::String => {
            let text = match value {
                Value::Null => String::new(),
                Value::String(s) => s.trim().to_string(),
                _ => return Err(wrong_type()),
            };
            if !text.is_empty() {
                split_command_line(&text).map_err(|e| AppError::BadRequest(e.to_string()))?;
            }
            text
        }
        SettingType::Integer => {
            let secs = match value {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.trim().parse::<u64>().ok(),
                _ => None,
            }
            .ok_or_else(wrong_type)?;
            if secs == 0 || secs > MAX_SENSOR_RESET_SECS {
                return Err(AppError::BadRequest(format!(
                    "Setting '{}' must be between 1 and {}",
                    key, MAX_SENSOR_RESET_SECS
                )));
            }
            secs.to_string()
        }
        SettingType::Boolean => match value {
            Value::Bool(b) => b.to_string(),
            Value::String(s) if s == "true" || s == "false" => s.clone(),
            _ => return Err(wrong_type()),
        },
    };

    Ok((setting, stored))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryDeviceStorage;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_load_defaults() {
        let storage = MemoryDeviceStorage::new();
        let settings = CameraSettings::load(&storage, "cam1", 30).await.unwrap();
        assert_eq!(
            settings,
            CameraSettings {
                receiver_override: None,
                reader_override: None,
                sensor_reset_secs: 30,
                audio_disabled: false,
                pipeline_debug: false,
            }
        );
    }

    #[tokio::test]
    async fn test_load_stored_values() {
        let storage = MemoryDeviceStorage::new();
        storage.set_item("cam1", "sensorAutoResetSeconds", "45").await.unwrap();
        storage.set_item("cam1", "audioDisabled", "true").await.unwrap();
        storage.set_item("cam1", "readerInputOverride", "  ").await.unwrap();
        storage
            .set_item("cam1", "receiverInputOverride", "videotestsrc ! fakesink")
            .await
            .unwrap();

        let settings = CameraSettings::load(&storage, "cam1", 30).await.unwrap();
        assert_eq!(settings.sensor_reset_secs, 45);
        assert!(settings.audio_disabled);
        assert_eq!(settings.reader_override, None);
        assert_eq!(
            settings.receiver_override.as_deref(),
            Some("videotestsrc ! fakesink")
        );
    }

    #[tokio::test]
    async fn test_unparsable_integer_falls_back() {
        let storage = MemoryDeviceStorage::new();
        storage.set_item("cam1", "sensorAutoResetSeconds", "soon").await.unwrap();
        let settings = CameraSettings::load(&storage, "cam1", 30).await.unwrap();
        assert_eq!(settings.sensor_reset_secs, 30);
    }

    #[test]
    fn test_normalize_accepts_typed_and_text_values() {
        assert_eq!(
            normalize_setting("audioDisabled", &json!(true)).unwrap(),
            (SettingKey::AudioDisabled, "true".to_string())
        );
        assert_eq!(
            assert_ok!(normalize_setting("pipelineDebug", &json!("false"))).1,
            "false"
        );
        assert_eq!(
            normalize_setting("sensorAutoResetSeconds", &json!("15")).unwrap().1,
            "15"
        );
        assert_eq!(
            normalize_setting("readerInputOverride", &Value::Null).unwrap().1,
            ""
        );
    }

    #[test]
    fn test_normalize_rejects_bad_input() {
        assert!(matches!(
            normalize_setting("gstDebug", &json!(true)),
            Err(AppError::BadRequest(_))
        ));
        assert_err!(normalize_setting("audioDisabled", &json!("yes")));
        assert_err!(normalize_setting("sensorAutoResetSeconds", &json!(-5)));
        assert_err!(normalize_setting("sensorAutoResetSeconds", &json!(0)));
        assert_err!(normalize_setting("receiverInputOverride", &json!(42)));
        assert_err!(normalize_setting("receiverInputOverride", &json!("rtspsrc 'open")));
    }

    #[test]
    fn test_describe_lists_every_key() {
        let settings = CameraSettings {
            receiver_override: None,
            reader_override: Some("-i udp://127.0.0.1:{port}".to_string()),
            sensor_reset_secs: 30,
            audio_disabled: false,
            pipeline_debug: true,
        };
        let listing = settings.describe(true);
        assert_eq!(listing.len(), 5);

        let json = serde_json::to_value(&listing).unwrap();
        assert_eq!(json[0]["key"], "receiverInputOverride");
        assert_eq!(json[0]["value"], Value::Null);
        assert_eq!(json[1]["value"], "-i udp://127.0.0.1:{port}");
        assert_eq!(json[2]["type"], "integer");
        assert_eq!(json[3]["value"], true);
        assert!(json[3].get("placeholder").is_none());
    }
}
