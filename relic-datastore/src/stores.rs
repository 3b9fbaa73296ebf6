//! Durable watermark, checkpoint and restore-watermark stores.
//!
//! Each store is a small trait with backend variants selected by
//! configuration. Absence and unreadable state degrade to "no prior
//! state"; an unknown version tag is a configuration error and aborts.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Error};
use async_trait::async_trait;

use relic_api_types::{
    control_key, Checkpoint, RestoreWatermark, Watermark, CHECKPOINT_KEY_NAME,
    CHECKPOINT_VERSION, RESTORE_WATERMARK_KEY_NAME, RESTORE_WATERMARK_VERSION,
    WATERMARK_KEY_NAME, WATERMARK_VERSION,
};
use relic_object_store::{ObjectStore, StoreError};
use relic_source::SourcePool;

/// Abort on a mismatched version tag, but let other shapes fall through
/// to the (lenient) full parse.
fn check_version_tag(data: &[u8], expected: &str, what: &str) -> Result<(), Error> {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(data) {
        if let Some(version) = json.get("version").and_then(|v| v.as_str()) {
            if version != expected {
                bail!("unsupported {} version '{}'", what, version);
            }
        }
    }
    Ok(())
}

#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn load(&self, database: &str, table: &str) -> Result<Option<Watermark>, Error>;
    async fn save(&self, watermark: &Watermark) -> Result<(), Error>;
}

/// Watermark under `{db}/{table}/.watermark.json` in the bucket.
pub struct ObjectWatermarkStore {
    store: Arc<ObjectStore>,
}

impl ObjectWatermarkStore {
    pub fn new(store: Arc<ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl WatermarkStore for ObjectWatermarkStore {
    async fn load(&self, database: &str, table: &str) -> Result<Option<Watermark>, Error> {
        let key = control_key(database, table, WATERMARK_KEY_NAME);
        let data = match self.store.get(&key).await {
            Ok(data) => data,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(err) => {
                log::warn!("unable to load watermark '{}' - {}", key, err);
                return Ok(None);
            }
        };
        check_version_tag(&data, WATERMARK_VERSION, "watermark")?;
        match Watermark::from_slice(&data) {
            Ok(watermark) => Ok(Some(watermark)),
            Err(err) => {
                log::warn!("ignoring unreadable watermark '{}' - {}", key, err);
                Ok(None)
            }
        }
    }

    async fn save(&self, watermark: &Watermark) -> Result<(), Error> {
        let key = control_key(&watermark.database, &watermark.table, WATERMARK_KEY_NAME);
        let data = serde_json::to_vec_pretty(watermark)?;
        self.store.put(&key, data).await?;
        Ok(())
    }
}

/// Watermark in the reserved `archiver_watermarks` table of the source
/// database.
pub struct DatabaseWatermarkStore {
    pool: Arc<SourcePool>,
}

impl DatabaseWatermarkStore {
    pub fn new(pool: Arc<SourcePool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WatermarkStore for DatabaseWatermarkStore {
    async fn load(&self, database: &str, table: &str) -> Result<Option<Watermark>, Error> {
        let client = self.pool.client().await?;
        match relic_source::state_tables::load_watermark(&client, database, table).await {
            Ok(watermark) => Ok(watermark),
            Err(err) => {
                log::warn!("unable to load watermark for {}.{} - {}", database, table, err);
                Ok(None)
            }
        }
    }

    async fn save(&self, watermark: &Watermark) -> Result<(), Error> {
        let client = self.pool.client().await?;
        relic_source::state_tables::save_watermark(&client, watermark).await?;
        Ok(())
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, database: &str, table: &str) -> Result<Option<Checkpoint>, Error>;
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), Error>;
    async fn delete(&self, database: &str, table: &str) -> Result<(), Error>;
}

/// Checkpoint under `{db}/{table}/.checkpoint.json` in the bucket.
pub struct ObjectCheckpointStore {
    store: Arc<ObjectStore>,
}

impl ObjectCheckpointStore {
    pub fn new(store: Arc<ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CheckpointStore for ObjectCheckpointStore {
    async fn load(&self, database: &str, table: &str) -> Result<Option<Checkpoint>, Error> {
        let key = control_key(database, table, CHECKPOINT_KEY_NAME);
        let data = match self.store.get(&key).await {
            Ok(data) => data,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(err) => {
                log::warn!("unable to load checkpoint '{}' - {}", key, err);
                return Ok(None);
            }
        };
        check_version_tag(&data, CHECKPOINT_VERSION, "checkpoint")?;
        match Checkpoint::from_slice(&data) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(err) => {
                log::warn!("ignoring unreadable checkpoint '{}' - {}", key, err);
                Ok(None)
            }
        }
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), Error> {
        let key = control_key(&checkpoint.database, &checkpoint.table, CHECKPOINT_KEY_NAME);
        let data = serde_json::to_vec_pretty(checkpoint)?;
        self.store.put(&key, data).await?;
        Ok(())
    }

    async fn delete(&self, database: &str, table: &str) -> Result<(), Error> {
        let key = control_key(database, table, CHECKPOINT_KEY_NAME);
        self.store.delete(&key).await?;
        Ok(())
    }
}

/// Checkpoint files in a local directory, named
/// `{db}_{table}.checkpoint.json`.
pub struct LocalCheckpointStore {
    dir: PathBuf,
}

impl LocalCheckpointStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path(&self, database: &str, table: &str) -> PathBuf {
        self.dir.join(format!("{}_{}.checkpoint.json", database, table))
    }
}

#[async_trait]
impl CheckpointStore for LocalCheckpointStore {
    async fn load(&self, database: &str, table: &str) -> Result<Option<Checkpoint>, Error> {
        let path = self.path(database, table);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                log::warn!("unable to read checkpoint {:?} - {}", path, err);
                return Ok(None);
            }
        };
        check_version_tag(&data, CHECKPOINT_VERSION, "checkpoint")?;
        match Checkpoint::from_slice(&data) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(err) => {
                log::warn!("ignoring unreadable checkpoint {:?} - {}", path, err);
                Ok(None)
            }
        }
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), Error> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path(&checkpoint.database, &checkpoint.table);
        std::fs::write(&path, serde_json::to_vec_pretty(checkpoint)?)?;
        Ok(())
    }

    async fn delete(&self, database: &str, table: &str) -> Result<(), Error> {
        let path = self.path(database, table);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
pub trait RestoreWatermarkStore: Send + Sync {
    async fn load(&self, database: &str, table: &str) -> Result<Option<RestoreWatermark>, Error>;
    async fn save(&self, watermark: &RestoreWatermark) -> Result<(), Error>;
}

pub struct ObjectRestoreWatermarkStore {
    store: Arc<ObjectStore>,
}

impl ObjectRestoreWatermarkStore {
    pub fn new(store: Arc<ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RestoreWatermarkStore for ObjectRestoreWatermarkStore {
    async fn load(&self, database: &str, table: &str) -> Result<Option<RestoreWatermark>, Error> {
        let key = control_key(database, table, RESTORE_WATERMARK_KEY_NAME);
        let data = match self.store.get(&key).await {
            Ok(data) => data,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(err) => {
                log::warn!("unable to load restore watermark '{}' - {}", key, err);
                return Ok(None);
            }
        };
        check_version_tag(&data, RESTORE_WATERMARK_VERSION, "restore watermark")?;
        match RestoreWatermark::from_slice(&data) {
            Ok(watermark) => Ok(Some(watermark)),
            Err(err) => {
                log::warn!("ignoring unreadable restore watermark '{}' - {}", key, err);
                Ok(None)
            }
        }
    }

    async fn save(&self, watermark: &RestoreWatermark) -> Result<(), Error> {
        let key = control_key(&watermark.database, &watermark.table, RESTORE_WATERMARK_KEY_NAME);
        self.store.put(&key, serde_json::to_vec_pretty(watermark)?).await?;
        Ok(())
    }
}

pub struct DatabaseRestoreWatermarkStore {
    pool: Arc<SourcePool>,
}

impl DatabaseRestoreWatermarkStore {
    pub fn new(pool: Arc<SourcePool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RestoreWatermarkStore for DatabaseRestoreWatermarkStore {
    async fn load(&self, database: &str, table: &str) -> Result<Option<RestoreWatermark>, Error> {
        let client = self.pool.client().await?;
        match relic_source::state_tables::load_restore_watermark(&client, database, table).await {
            Ok(watermark) => Ok(watermark),
            Err(err) => {
                log::warn!(
                    "unable to load restore watermark for {}.{} - {}",
                    database,
                    table,
                    err
                );
                Ok(None)
            }
        }
    }

    async fn save(&self, watermark: &RestoreWatermark) -> Result<(), Error> {
        let client = self.pool.client().await?;
        relic_source::state_tables::save_restore_watermark(&client, watermark).await?;
        Ok(())
    }
}

/// `both` backend: the bucket is consulted first on load, and saves go to
/// both places.
pub struct BothRestoreWatermarkStore {
    object: ObjectRestoreWatermarkStore,
    database: DatabaseRestoreWatermarkStore,
}

impl BothRestoreWatermarkStore {
    pub fn new(store: Arc<ObjectStore>, pool: Arc<SourcePool>) -> Self {
        Self {
            object: ObjectRestoreWatermarkStore::new(store),
            database: DatabaseRestoreWatermarkStore::new(pool),
        }
    }
}

#[async_trait]
impl RestoreWatermarkStore for BothRestoreWatermarkStore {
    async fn load(&self, database: &str, table: &str) -> Result<Option<RestoreWatermark>, Error> {
        if let Some(watermark) = self.object.load(database, table).await? {
            return Ok(Some(watermark));
        }
        self.database.load(database, table).await
    }

    async fn save(&self, watermark: &RestoreWatermark) -> Result<(), Error> {
        self.object.save(watermark).await?;
        self.database.save(watermark).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Utc;
    use relic_api_types::Cursor;
    use relic_api_types::Value;

    #[tokio::test]
    async fn local_checkpoints_round_trip_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalCheckpointStore::new(dir.path().to_path_buf());

        assert!(store.load("app", "t").await.unwrap().is_none());

        let cursor = Cursor {
            last_timestamp: Utc::now(),
            last_primary_key: Value::Int(37),
        };
        let checkpoint = Checkpoint {
            version: CHECKPOINT_VERSION.to_string(),
            database: "app".into(),
            table: "t".into(),
            schema: "public".into(),
            batch_number: 37,
            last_timestamp: Some(cursor.last_timestamp),
            last_primary_key: Some(cursor.last_primary_key.to_pk_string()),
            records_archived: 370,
            batches_processed: 37,
            checkpoint_time: Utc::now(),
            batch_id: Some("aabbccddeeff0011".into()),
        };
        store.save(&checkpoint).await.unwrap();

        let loaded = store.load("app", "t").await.unwrap().unwrap();
        assert_eq!(loaded.batch_number, 37);
        assert_eq!(loaded.cursor().unwrap().last_primary_key, Value::Int(37));

        store.delete("app", "t").await.unwrap();
        assert!(store.load("app", "t").await.unwrap().is_none());
        // deleting again is harmless
        store.delete("app", "t").await.unwrap();
    }

    #[tokio::test]
    async fn unknown_checkpoint_version_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalCheckpointStore::new(dir.path().to_path_buf());
        let path = dir.path().join("app_t.checkpoint.json");
        std::fs::write(&path, br#"{"version": "7.0", "database": "app"}"#).unwrap();
        let err = store.load("app", "t").await.unwrap_err();
        assert!(err.to_string().contains("unsupported checkpoint version"));
    }

    #[tokio::test]
    async fn garbage_checkpoint_degrades_to_fresh_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalCheckpointStore::new(dir.path().to_path_buf());
        let path = dir.path().join("app_t.checkpoint.json");
        std::fs::write(&path, b"not json at all").unwrap();
        assert!(store.load("app", "t").await.unwrap().is_none());
    }
}
