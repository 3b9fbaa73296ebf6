//! Offline integrity check over an archive set. Read-only.

use std::collections::BTreeSet;
use std::fmt;

use anyhow::Error;
use serde::{Deserialize, Serialize};

use relic_api_types::{metadata_key_for, ArchiveMetadata, DATA_SUFFIX, METADATA_SUFFIX};
use relic_datastore::{count_lines, decompress, verify_checksums};
use relic_object_store::{ObjectStore, StoreError};

/// Inventory of one prefix: which data and metadata files pair up.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KeyInventory {
    /// Data files with a metadata sidecar.
    pub paired: Vec<String>,
    /// Data files missing their sidecar.
    pub orphaned_data: Vec<String>,
    /// Sidecars whose data file is gone.
    pub orphaned_metadata: Vec<String>,
}

/// Pair data keys with metadata keys; everything else (manifests,
/// control files) is ignored.
pub fn pair_keys(keys: &[String]) -> KeyInventory {
    let data: BTreeSet<&String> = keys.iter().filter(|k| k.ends_with(DATA_SUFFIX)).collect();
    let metadata: BTreeSet<&String> =
        keys.iter().filter(|k| k.ends_with(METADATA_SUFFIX)).collect();

    let mut inventory = KeyInventory::default();
    for key in &data {
        let sidecar = metadata_key_for(key);
        if metadata.contains(&sidecar) {
            inventory.paired.push((*key).clone());
        } else {
            inventory.orphaned_data.push((*key).clone());
        }
    }
    for key in &metadata {
        let data_key = key
            .strip_suffix(METADATA_SUFFIX)
            .map(|stem| format!("{}{}", stem, DATA_SUFFIX))
            .unwrap_or_default();
        if !data.contains(&data_key) {
            inventory.orphaned_metadata.push((*key).clone());
        }
    }
    inventory
}

/// Problems found in a single archive.
#[derive(Clone, Debug, Default)]
pub struct ArchiveCheck {
    pub checksum_failure: bool,
    pub count_mismatch: bool,
    pub errors: Vec<String>,
}

impl ArchiveCheck {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Verify one data/metadata pair: the sidecar parses, the checksums
/// match, and the line count equals the recorded record count.
pub fn validate_archive_bytes(compressed: &[u8], metadata_bytes: &[u8]) -> ArchiveCheck {
    let mut check = ArchiveCheck::default();

    let metadata = match ArchiveMetadata::from_slice(metadata_bytes) {
        Ok(metadata) => metadata,
        Err(err) => {
            check.errors.push(format!("unreadable metadata - {}", err));
            return check;
        }
    };

    let jsonl = match decompress(compressed) {
        Ok(jsonl) => jsonl,
        Err(err) => {
            check.errors.push(err.to_string());
            return check;
        }
    };

    if let Err(err) = verify_checksums(&jsonl, compressed, &metadata.checksums) {
        check.checksum_failure = true;
        check.errors.push(err.to_string());
    }

    let lines = count_lines(&jsonl);
    if lines != metadata.data_info.record_count {
        check.count_mismatch = true;
        check.errors.push(format!(
            "record count mismatch: metadata says {}, found {} lines",
            metadata.data_info.record_count, lines
        ));
    }

    check
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub total_archives: u64,
    pub valid_archives: u64,
    pub invalid_archives: u64,
    pub orphaned_data_files: Vec<String>,
    pub orphaned_metadata_files: Vec<String>,
    pub checksum_failures: Vec<String>,
    pub record_count_mismatches: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.invalid_archives == 0
            && self.orphaned_data_files.is_empty()
            && self.orphaned_metadata_files.is_empty()
            && self.checksum_failures.is_empty()
            && self.record_count_mismatches.is_empty()
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Archive validation: {} archive(s) checked", self.total_archives)?;
        writeln!(f, "  valid:   {}", self.valid_archives)?;
        writeln!(f, "  invalid: {}", self.invalid_archives)?;
        writeln!(f, "  status:  {}", if self.is_valid() { "VALID" } else { "INVALID" })?;
        for (label, list) in [
            ("orphaned data files", &self.orphaned_data_files),
            ("orphaned metadata files", &self.orphaned_metadata_files),
            ("checksum failures", &self.checksum_failures),
            ("record count mismatches", &self.record_count_mismatches),
        ] {
            if !list.is_empty() {
                writeln!(f, "  {} ({}):", label, list.len())?;
                for key in list.iter().take(10) {
                    writeln!(f, "    - {}", key)?;
                }
                if list.len() > 10 {
                    writeln!(f, "    ... and {} more", list.len() - 10)?;
                }
            }
        }
        for error in self.errors.iter().take(5) {
            writeln!(f, "  error: {}", error)?;
        }
        Ok(())
    }
}

/// Validate every archive under a prefix. Never mutates anything.
pub async fn validate_prefix(store: &ObjectStore, prefix: &str) -> Result<ValidationReport, Error> {
    let keys: Vec<String> = store
        .list(prefix)
        .await?
        .into_iter()
        .map(|object| object.key)
        .collect();
    let inventory = pair_keys(&keys);

    let mut report = ValidationReport {
        total_archives: (inventory.paired.len() + inventory.orphaned_data.len()) as u64,
        orphaned_data_files: inventory.orphaned_data.clone(),
        orphaned_metadata_files: inventory.orphaned_metadata.clone(),
        ..Default::default()
    };
    report.invalid_archives += inventory.orphaned_data.len() as u64;

    for key in &inventory.paired {
        let compressed = match store.get(key).await {
            Ok(data) => data,
            Err(StoreError::NotFound(_)) => {
                report.invalid_archives += 1;
                report.errors.push(format!("{}: data file vanished during validation", key));
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        let metadata_bytes = match store.get(&metadata_key_for(key)).await {
            Ok(data) => data,
            Err(StoreError::NotFound(_)) => {
                report.invalid_archives += 1;
                report.orphaned_data_files.push(key.clone());
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        let check = validate_archive_bytes(&compressed, &metadata_bytes);
        if check.is_valid() {
            report.valid_archives += 1;
        } else {
            report.invalid_archives += 1;
            if check.checksum_failure {
                report.checksum_failures.push(key.clone());
            }
            if check.count_mismatch {
                report.record_count_mismatches.push(key.clone());
            }
            for error in check.errors {
                report.errors.push(format!("{}: {}", key, error));
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::{TimeZone, Utc};
    use relic_api_types::{
        BatchInfo, Checksums, DataInfo, TimestampRange, Value, METADATA_VERSION,
    };
    use relic_datastore::{checksums, compress, encode_batch, RowContext};

    fn data_key(batch: u32) -> String {
        format!(
            "app/t/year=2026/month=01/day=06/t_20260106T000000Z_batch_{:03}.jsonl.gz",
            batch
        )
    }

    #[test]
    fn pairing_flags_orphans_on_both_sides() {
        let keys = vec![
            data_key(1),
            metadata_key_for(&data_key(1)),
            data_key(2), // no sidecar
            metadata_key_for(&data_key(3)), // no data
            "app/t/.watermark.json".to_string(),
            relic_api_types::manifest_key_for(&data_key(1)),
        ];
        let inventory = pair_keys(&keys);
        assert_eq!(inventory.paired, vec![data_key(1)]);
        assert_eq!(inventory.orphaned_data, vec![data_key(2)]);
        assert_eq!(inventory.orphaned_metadata, vec![metadata_key_for(&data_key(3))]);
    }

    fn archive_pair(record_count_override: Option<u64>) -> (Vec<u8>, Vec<u8>) {
        let rows = vec![vec![("id".to_string(), Value::Int(1))]];
        let context = RowContext {
            batch_id: "0011223344556677",
            database: "app",
            table: "t",
            archived_at: Utc.with_ymd_and_hms(2026, 1, 6, 0, 0, 0).unwrap(),
        };
        let jsonl = encode_batch(&rows, &context).unwrap();
        let compressed = compress(&jsonl, 6).unwrap();
        let sums = checksums(&jsonl, &compressed);
        let metadata = ArchiveMetadata {
            version: METADATA_VERSION.to_string(),
            batch_info: BatchInfo {
                database: "app".into(),
                table: "t".into(),
                schema: "public".into(),
                batch_number: 1,
                batch_id: "0011223344556677".into(),
            },
            data_info: DataInfo {
                record_count: record_count_override.unwrap_or(1),
                uncompressed_size: jsonl.len() as u64,
                compressed_size: compressed.len() as u64,
                compression_ratio: 0.5,
            },
            checksums: sums,
            timestamp_range: TimestampRange::default(),
            archived_at: Utc.with_ymd_and_hms(2026, 1, 6, 0, 0, 0).unwrap(),
            table_schema: None,
        };
        (compressed, serde_json::to_vec(&metadata).unwrap())
    }

    #[test]
    fn intact_archives_validate() {
        let (compressed, metadata) = archive_pair(None);
        let check = validate_archive_bytes(&compressed, &metadata);
        assert!(check.is_valid(), "{:?}", check.errors);
    }

    #[test]
    fn count_mismatch_is_detected() {
        let (compressed, metadata) = archive_pair(Some(5));
        let check = validate_archive_bytes(&compressed, &metadata);
        assert!(check.count_mismatch);
        assert!(!check.is_valid());
    }

    #[test]
    fn tampered_bytes_fail_the_checksum() {
        let (mut compressed, metadata) = archive_pair(None);
        let last = compressed.len() - 1;
        compressed[last] ^= 0x01;
        let check = validate_archive_bytes(&compressed, &metadata);
        assert!(check.checksum_failure || !check.errors.is_empty());
        assert!(!check.is_valid());
    }

    #[test]
    fn report_formatting_is_stable() {
        let report = ValidationReport {
            total_archives: 2,
            valid_archives: 1,
            invalid_archives: 1,
            orphaned_data_files: vec![data_key(2)],
            ..Default::default()
        };
        let text = report.to_string();
        assert!(text.contains("INVALID"));
        assert!(text.contains("orphaned data files (1)"));
        assert!(!report.is_valid());
    }
}
