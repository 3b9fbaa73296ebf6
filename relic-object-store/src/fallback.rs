//! Local disk spool for payloads whose upload failed terminally.
//!
//! Spooling never masks the upload failure; it only preserves the bytes
//! and the intended key so an operator can replay them.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::StoreError;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FallbackMeta {
    pub s3_key: String,
    pub saved_at: DateTime<Utc>,
    pub file_size: u64,
    pub error: String,
}

pub struct LocalFallback {
    dir: PathBuf,
    retention_days: u32,
}

impl LocalFallback {
    pub fn new(dir: PathBuf, retention_days: u32) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&dir)
            .map_err(|err| StoreError::Fatal(format!("unable to create fallback dir: {}", err)))?;
        Ok(Self { dir, retention_days })
    }

    fn spool_name(key: &str, saved_at: DateTime<Utc>) -> String {
        let safe_key = key.replace(['/', '\\'], "_");
        let mut name = format!("{}_{}", saved_at.format("%Y%m%d_%H%M%S"), safe_key);
        name.truncate(255);
        name
    }

    /// Store the payload plus a `.meta.json` intent record.
    pub fn save_failed_upload(
        &self,
        key: &str,
        data: &[u8],
        error: &str,
    ) -> Result<PathBuf, StoreError> {
        let saved_at = Utc::now();
        let path = self.dir.join(Self::spool_name(key, saved_at));
        std::fs::write(&path, data)
            .map_err(|err| StoreError::Fatal(format!("unable to write fallback file: {}", err)))?;

        let meta = FallbackMeta {
            s3_key: key.to_string(),
            saved_at,
            file_size: data.len() as u64,
            error: error.to_string(),
        };
        let meta_path = meta_path_for(&path);
        std::fs::write(&meta_path, serde_json::to_vec_pretty(&meta).unwrap())
            .map_err(|err| StoreError::Fatal(format!("unable to write fallback meta: {}", err)))?;
        Ok(path)
    }

    /// Delete spooled entries older than the retention window. Returns
    /// the number of payload files removed.
    pub fn sweep(&self) -> Result<usize, StoreError> {
        let threshold = Utc::now() - Duration::days(self.retention_days as i64);
        let mut removed = 0;
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|err| StoreError::Fatal(format!("unable to read fallback dir: {}", err)))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || path.to_string_lossy().ends_with(".meta.json") {
                continue;
            }
            let saved_at = read_saved_at(&path).unwrap_or_else(|| file_mtime(&path));
            if saved_at < threshold {
                let meta_path = meta_path_for(&path);
                if std::fs::remove_file(&path).is_ok() {
                    removed += 1;
                    let _ = std::fs::remove_file(meta_path);
                }
            }
        }
        if removed > 0 {
            log::info!("removed {} expired fallback entries", removed);
        }
        Ok(removed)
    }
}

fn meta_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".meta.json");
    path.with_file_name(name)
}

fn read_saved_at(path: &Path) -> Option<DateTime<Utc>> {
    let data = std::fs::read(meta_path_for(path)).ok()?;
    let meta: FallbackMeta = serde_json::from_slice(&data).ok()?;
    Some(meta.saved_at)
}

fn file_mtime(path: &Path) -> DateTime<Utc> {
    path.metadata()
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}
