use anyhow::{bail, Error};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::TableSchema;

pub const METADATA_VERSION: &str = "1.0";
pub const MANIFEST_VERSION: &str = "1.0";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchInfo {
    pub database: String,
    pub table: String,
    pub schema: String,
    pub batch_number: u32,
    pub batch_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataInfo {
    pub record_count: u64,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub compression_ratio: f64,
}

/// Hex-encoded SHA-256 sums, computed on the uncompressed JSONL bytes
/// first and then on the gzip output.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checksums {
    pub jsonl_sha256: String,
    pub compressed_sha256: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TimestampRange {
    pub min: Option<DateTime<Utc>>,
    pub max: Option<DateTime<Utc>>,
}

/// The `.metadata.json` sidecar. Sufficient on its own to validate and
/// restore the batch it describes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub version: String,
    pub batch_info: BatchInfo,
    pub data_info: DataInfo,
    pub checksums: Checksums,
    pub timestamp_range: TimestampRange,
    pub archived_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_schema: Option<TableSchema>,
}

impl ArchiveMetadata {
    pub fn to_json_pretty(&self) -> Result<String, Error> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, Error> {
        let metadata: ArchiveMetadata = serde_json::from_slice(data)?;
        if metadata.version != METADATA_VERSION {
            bail!("unsupported metadata version '{}'", metadata.version);
        }
        Ok(metadata)
    }
}

/// The `.manifest.json` sidecar, written after the deleting transaction
/// commits. Records exactly which primary keys left the source.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeletionManifest {
    pub version: String,
    pub database: String,
    pub table: String,
    pub schema: String,
    pub batch_number: u32,
    pub batch_id: String,
    pub primary_key_column: String,
    pub primary_keys: Vec<String>,
    pub deleted_count: u64,
    pub deleted_at: DateTime<Utc>,
}

impl DeletionManifest {
    pub fn to_json_pretty(&self) -> Result<String, Error> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, Error> {
        let manifest: DeletionManifest = serde_json::from_slice(data)?;
        if manifest.version != MANIFEST_VERSION {
            bail!("unsupported manifest version '{}'", manifest.version);
        }
        Ok(manifest)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn metadata_version_is_checked() {
        let json = serde_json::json!({
            "version": "9.9",
            "batch_info": {
                "database": "app", "table": "t", "schema": "public",
                "batch_number": 1, "batch_id": "00ff00ff00ff00ff",
            },
            "data_info": {
                "record_count": 0, "uncompressed_size": 0,
                "compressed_size": 0, "compression_ratio": 0.0,
            },
            "checksums": { "jsonl_sha256": "", "compressed_sha256": "" },
            "timestamp_range": { "min": null, "max": null },
            "archived_at": "2026-01-06T00:00:00Z",
        });
        let err = ArchiveMetadata::from_slice(json.to_string().as_bytes()).unwrap_err();
        assert!(err.to_string().contains("unsupported metadata version"));
    }
}
