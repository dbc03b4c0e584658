//! Camera devices
//!
//! A camera is a registry entry plus a stream controller, its per-camera
//! settings and its sensor flags.

pub mod base_station;
pub mod device;
pub mod registry;
pub mod settings;

pub use base_station::BaseStationClient;
pub use device::{CameraDevice, CameraInfo, CodecInfo, StreamOption, StreamRequestOptions, DEFAULT_STREAM_ID};
pub use registry::CameraRegistry;
pub use settings::{normalize_setting, CameraSettings, Setting, SettingKey, SettingType};
