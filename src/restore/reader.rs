//! Reading archives back out of the bucket.

use anyhow::{Context, Error};

use relic_api_types::{
    metadata_key_for, ArchiveMetadata, TableSchema, FIELD_BATCH_ID, FIELD_SOURCE_DATABASE,
    FIELD_SOURCE_TABLE,
};
use relic_datastore::{decompress, parse_records, verify_checksums, JsonRecord};
use relic_object_store::{ObjectStore, StoreError};

/// A downloaded and decoded archive, ready for restore.
#[derive(Debug)]
pub struct DecodedArchive {
    pub key: String,
    /// The sidecar is preferred but optional; without it the provenance
    /// fields of the first record stand in.
    pub metadata: Option<ArchiveMetadata>,
    pub records: Vec<JsonRecord>,
    pub compressed_size: u64,
}

impl DecodedArchive {
    fn record_field(&self, field: &str) -> Option<String> {
        self.records
            .first()
            .and_then(|record| record.get(field))
            .and_then(|value| value.as_str())
            .map(String::from)
    }

    pub fn database_name(&self) -> Option<String> {
        match &self.metadata {
            Some(metadata) => Some(metadata.batch_info.database.clone()),
            None => self.record_field(FIELD_SOURCE_DATABASE),
        }
    }

    pub fn table_name(&self) -> Option<String> {
        match &self.metadata {
            Some(metadata) => Some(metadata.batch_info.table.clone()),
            None => self.record_field(FIELD_SOURCE_TABLE),
        }
    }

    pub fn schema_name(&self) -> String {
        self.metadata
            .as_ref()
            .map(|metadata| metadata.batch_info.schema.clone())
            .unwrap_or_else(|| "public".to_string())
    }

    pub fn batch_id(&self) -> Option<String> {
        match &self.metadata {
            Some(metadata) => Some(metadata.batch_info.batch_id.clone()),
            None => self.record_field(FIELD_BATCH_ID),
        }
    }

    pub fn table_schema(&self) -> Option<&TableSchema> {
        self.metadata.as_ref().and_then(|m| m.table_schema.as_ref())
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

/// Decode compressed archive bytes plus an optional metadata sidecar.
/// Checksums are validated when the sidecar provides them.
pub fn decode_archive(
    key: &str,
    compressed: &[u8],
    metadata_bytes: Option<&[u8]>,
    validate_checksum: bool,
) -> Result<DecodedArchive, Error> {
    let metadata = match metadata_bytes {
        Some(bytes) => match ArchiveMetadata::from_slice(bytes) {
            Ok(metadata) => Some(metadata),
            Err(err) => {
                log::warn!("unreadable metadata sidecar for '{}' - {}", key, err);
                None
            }
        },
        None => {
            log::warn!(
                "no metadata sidecar for '{}', falling back to embedded provenance fields",
                key
            );
            None
        }
    };

    let jsonl = decompress(compressed).with_context(|| format!("archive '{}'", key))?;

    if validate_checksum {
        match &metadata {
            Some(metadata) => verify_checksums(&jsonl, compressed, &metadata.checksums)
                .with_context(|| format!("archive '{}'", key))?,
            None => log::warn!(
                "checksum validation requested but '{}' has no metadata",
                key
            ),
        }
    }

    let records = parse_records(&jsonl).with_context(|| format!("archive '{}'", key))?;

    Ok(DecodedArchive {
        key: key.to_string(),
        metadata,
        records,
        compressed_size: compressed.len() as u64,
    })
}

/// Download and decode one archive by data key.
pub async fn fetch_archive(
    store: &ObjectStore,
    key: &str,
    validate_checksum: bool,
) -> Result<DecodedArchive, Error> {
    let compressed = store
        .get(key)
        .await
        .with_context(|| format!("unable to read archive '{}'", key))?;
    let metadata_bytes = match store.get(&metadata_key_for(key)).await {
        Ok(bytes) => Some(bytes),
        Err(StoreError::NotFound(_)) => None,
        Err(err) => {
            log::warn!("unable to read metadata sidecar for '{}' - {}", key, err);
            None
        }
    };
    decode_archive(key, &compressed, metadata_bytes.as_deref(), validate_checksum)
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::{TimeZone, Utc};
    use relic_api_types::{BatchInfo, Checksums, DataInfo, TimestampRange, Value, METADATA_VERSION};
    use relic_datastore::{checksums, compress, encode_batch, RowContext};

    fn build_archive() -> (Vec<u8>, ArchiveMetadata) {
        let rows = vec![
            vec![
                ("id".to_string(), Value::Int(1)),
                ("action".to_string(), Value::Text("login".into())),
            ],
            vec![
                ("id".to_string(), Value::Int(2)),
                ("action".to_string(), Value::Text("logout".into())),
            ],
        ];
        let archived_at = Utc.with_ymd_and_hms(2026, 1, 6, 0, 0, 0).unwrap();
        let context = RowContext {
            batch_id: "aabb000011223344",
            database: "app",
            table: "audit_logs",
            archived_at,
        };
        let jsonl = encode_batch(&rows, &context).unwrap();
        let compressed = compress(&jsonl, 6).unwrap();
        let sums = checksums(&jsonl, &compressed);
        let metadata = ArchiveMetadata {
            version: METADATA_VERSION.to_string(),
            batch_info: BatchInfo {
                database: "app".into(),
                table: "audit_logs".into(),
                schema: "public".into(),
                batch_number: 1,
                batch_id: "aabb000011223344".into(),
            },
            data_info: DataInfo {
                record_count: 2,
                uncompressed_size: jsonl.len() as u64,
                compressed_size: compressed.len() as u64,
                compression_ratio: compressed.len() as f64 / jsonl.len() as f64,
            },
            checksums: sums,
            timestamp_range: TimestampRange::default(),
            archived_at,
            table_schema: None,
        };
        (compressed, metadata)
    }

    #[test]
    fn decode_with_metadata_validates_checksums() {
        let (compressed, metadata) = build_archive();
        let metadata_bytes = serde_json::to_vec(&metadata).unwrap();
        let decoded =
            decode_archive("k.jsonl.gz", &compressed, Some(metadata_bytes.as_slice()), true).unwrap();
        assert_eq!(decoded.record_count(), 2);
        assert_eq!(decoded.database_name().as_deref(), Some("app"));
        assert_eq!(decoded.table_name().as_deref(), Some("audit_logs"));
        assert_eq!(decoded.schema_name(), "public");
    }

    #[test]
    fn corrupted_payload_fails_checksum_validation() {
        let (compressed, mut metadata) = build_archive();
        metadata.checksums = Checksums {
            jsonl_sha256: "00".repeat(32),
            compressed_sha256: "00".repeat(32),
        };
        let metadata_bytes = serde_json::to_vec(&metadata).unwrap();
        let err =
            decode_archive("k.jsonl.gz", &compressed, Some(metadata_bytes.as_slice()), true).unwrap_err();
        assert!(format!("{:#}", err).contains("checksum mismatch"));

        // validation can be opted out
        decode_archive("k.jsonl.gz", &compressed, Some(metadata_bytes.as_slice()), false).unwrap();
    }

    #[test]
    fn missing_metadata_falls_back_to_embedded_fields() {
        let (compressed, _) = build_archive();
        let decoded = decode_archive("k.jsonl.gz", &compressed, None, true).unwrap();
        assert_eq!(decoded.database_name().as_deref(), Some("app"));
        assert_eq!(decoded.table_name().as_deref(), Some("audit_logs"));
        assert_eq!(decoded.batch_id().as_deref(), Some("aabb000011223344"));
        assert_eq!(decoded.schema_name(), "public");
    }
}
