//! Per-camera persistence: the camera registry and raw setting values.
//!
//! Devices receive a `DeviceStorage` trait object instead of reaching into a
//! host-provided storage, so tests can run against `MemoryDeviceStorage`.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};
use std::collections::{BTreeMap, HashMap};
use typeshare::typeshare;

use crate::error::Result;

/// Persisted camera entry
#[typeshare]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CameraRecord {
    /// Stable camera identity
    pub id: String,
    /// Display name
    pub name: String,
    /// Camera network address (RTSP source host)
    pub host: Option<String>,
    /// Hardware model number
    pub model: Option<String>,
}

/// Storage for camera records and their string-valued settings
#[async_trait]
pub trait DeviceStorage: Send + Sync {
    async fn list_cameras(&self) -> Result<Vec<CameraRecord>>;

    async fn insert_camera(&self, record: &CameraRecord) -> Result<()>;

    async fn get_item(&self, camera_id: &str, key: &str) -> Result<Option<String>>;

    async fn set_item(&self, camera_id: &str, key: &str, value: &str) -> Result<()>;
}

/// `DeviceStorage` backed by the configuration database
#[derive(Clone)]
pub struct SqliteDeviceStorage {
    pool: Pool<Sqlite>,
}

impl SqliteDeviceStorage {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceStorage for SqliteDeviceStorage {
    async fn list_cameras(&self) -> Result<Vec<CameraRecord>> {
        let rows = sqlx::query_as::<_, CameraRecord>(
            "SELECT id, name, host, model FROM cameras ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn insert_camera(&self, record: &CameraRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cameras (id, name, host, model)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET name = ?2, host = ?3, model = ?4
            "#,
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.host)
        .bind(&record.model)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_item(&self, camera_id: &str, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM camera_settings WHERE camera_id = ?1 AND key = ?2")
                .bind(camera_id)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn set_item(&self, camera_id: &str, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO camera_settings (camera_id, key, value, updated_at)
            VALUES (?1, ?2, ?3, datetime('now'))
            ON CONFLICT(camera_id, key) DO UPDATE SET value = ?3, updated_at = datetime('now')
            "#,
        )
        .bind(camera_id)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory `DeviceStorage`
#[derive(Default)]
pub struct MemoryDeviceStorage {
    cameras: Mutex<BTreeMap<String, CameraRecord>>,
    items: Mutex<HashMap<(String, String), String>>,
}

impl MemoryDeviceStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceStorage for MemoryDeviceStorage {
    async fn list_cameras(&self) -> Result<Vec<CameraRecord>> {
        Ok(self.cameras.lock().values().cloned().collect())
    }

    async fn insert_camera(&self, record: &CameraRecord) -> Result<()> {
        self.cameras
            .lock()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_item(&self, camera_id: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .items
            .lock()
            .get(&(camera_id.to_string(), key.to_string()))
            .cloned())
    }

    async fn set_item(&self, camera_id: &str, key: &str, value: &str) -> Result<()> {
        self.items
            .lock()
            .insert((camera_id.to_string(), key.to_string()), value.to_string());
        Ok(())
    }
}
