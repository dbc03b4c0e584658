//! Configuration: application settings and per-camera device storage

mod device_store;
mod schema;
mod store;

pub use device_store::{CameraRecord, DeviceStorage, MemoryDeviceStorage, SqliteDeviceStorage};
pub use schema::*;
pub use store::{ConfigChange, ConfigStore, SharedConfig};
