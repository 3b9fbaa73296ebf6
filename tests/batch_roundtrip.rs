//! Round-trip fidelity of the archive wire format: rows serialized,
//! compressed and checksummed by the archiver decode back into the same
//! values through the restore reader.

use chrono::{TimeZone, Utc};

use relic_api_types::{
    batch_id, ArchiveKey, ArchiveMetadata, BatchInfo, DataInfo, TimestampRange, Value,
    METADATA_VERSION,
};
use relic_archiver::restore::decode_archive;
use relic_datastore::{checksums, compress, count_lines, encode_batch, RowContext};

fn audit_log_rows() -> Vec<relic_api_types::Row> {
    let actions = [
        "SQL' OR '1'='1",
        "double \" quote",
        "newline\nin the middle",
        "tab\tseparated",
        "中文日志条目",
        "Русский журнал",
        "emoji 🦀🔥",
    ];
    actions
        .iter()
        .enumerate()
        .map(|(idx, action)| {
            vec![
                ("id".to_string(), Value::Int(idx as i64 + 1)),
                ("user_id".to_string(), Value::Int(1000 + idx as i64)),
                ("action".to_string(), Value::Text(action.to_string())),
                (
                    "metadata".to_string(),
                    Value::Json(serde_json::json!({"ip": "10.0.0.1", "n": idx})),
                ),
                (
                    "created_at".to_string(),
                    Value::TimestampTz(Utc.with_ymd_and_hms(2025, 9, 1, 8, 0, idx as u32).unwrap()),
                ),
            ]
        })
        .collect()
}

#[test]
fn archived_batch_restores_byte_equal_values() {
    let rows = audit_log_rows();
    let archived_at = Utc.with_ymd_and_hms(2026, 1, 6, 12, 0, 0).unwrap();
    let id = batch_id("app", "audit_logs", 1);

    let context = RowContext {
        batch_id: &id,
        database: "app",
        table: "audit_logs",
        archived_at,
    };
    let jsonl = encode_batch(&rows, &context).unwrap();
    let compressed = compress(&jsonl, 6).unwrap();
    let sums = checksums(&jsonl, &compressed);

    // the three-way count equality the orchestrator enforces
    assert_eq!(count_lines(&jsonl), rows.len() as u64);

    let metadata = ArchiveMetadata {
        version: METADATA_VERSION.to_string(),
        batch_info: BatchInfo {
            database: "app".into(),
            table: "audit_logs".into(),
            schema: "public".into(),
            batch_number: 1,
            batch_id: id.clone(),
        },
        data_info: DataInfo {
            record_count: rows.len() as u64,
            uncompressed_size: jsonl.len() as u64,
            compressed_size: compressed.len() as u64,
            compression_ratio: compressed.len() as f64 / jsonl.len() as f64,
        },
        checksums: sums,
        timestamp_range: TimestampRange {
            min: Some(Utc.with_ymd_and_hms(2025, 9, 1, 8, 0, 0).unwrap()),
            max: Some(Utc.with_ymd_and_hms(2025, 9, 1, 8, 0, 6).unwrap()),
        },
        archived_at,
        table_schema: None,
    };
    let metadata_bytes = serde_json::to_vec(&metadata).unwrap();

    let key = ArchiveKey {
        database: "app".into(),
        table: "audit_logs".into(),
        archived_at,
        batch_number: 1,
    };
    let decoded =
        decode_archive(&key.data_key(), &compressed, Some(metadata_bytes.as_slice()), true).unwrap();

    assert_eq!(decoded.record_count(), rows.len());
    assert_eq!(decoded.database_name().as_deref(), Some("app"));
    assert_eq!(decoded.batch_id().as_deref(), Some(id.as_str()));

    // every original value comes back byte-equal, modulo the four
    // reserved provenance fields
    for (row, record) in rows.iter().zip(decoded.records.iter()) {
        for (name, value) in row {
            assert_eq!(
                record.get(name).unwrap(),
                &value.to_json(),
                "column '{}' did not round-trip",
                name
            );
        }
        assert_eq!(record.get("_source_database").unwrap(), "app");
        assert_eq!(record.get("_source_table").unwrap(), "audit_logs");
        assert_eq!(record.get("_batch_id").unwrap(), id.as_str());
        assert!(record.contains_key("_archived_at"));
    }
}

#[test]
fn metadata_line_and_key_invariants_hold_together() {
    let rows = audit_log_rows();
    let archived_at = Utc.with_ymd_and_hms(2026, 1, 6, 12, 0, 0).unwrap();
    let id = batch_id("app", "audit_logs", 42);
    let context = RowContext {
        batch_id: &id,
        database: "app",
        table: "audit_logs",
        archived_at,
    };
    let jsonl = encode_batch(&rows, &context).unwrap();

    let key = ArchiveKey {
        database: "app".into(),
        table: "audit_logs".into(),
        archived_at,
        batch_number: 42,
    };

    // line_count(data) == record_count == |primary_keys|
    let pk_count = rows.len() as u64;
    assert_eq!(count_lines(&jsonl), pk_count);

    // the object key parses back to the same batch coordinates
    let parsed = ArchiveKey::parse(&key.data_key()).unwrap();
    assert_eq!(parsed, key);
    assert_eq!(parsed.batch_number, 42);

    // sidecars land next to the data file
    assert!(key.metadata_key().ends_with("_batch_042.metadata.json"));
    assert!(key.manifest_key().ends_with("_batch_042.manifest.json"));
}
