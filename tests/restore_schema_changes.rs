//! Restoring an archive whose schema snapshot no longer matches the
//! live table: the migration strategies must coerce, fill or abort.

use chrono::{TimeZone, Utc};
use serde_json::Value as Json;

use relic_api_types::{
    ArchiveMetadata, BatchInfo, ColumnInfo, DataInfo, MigrationStrategy, PrimaryKeyInfo,
    TableSchema, TimestampRange, Value, METADATA_VERSION,
};
use relic_archiver::restore::decode_archive;
use relic_archiver::restore::migrate::{compare_schemas, transform_record};
use relic_datastore::{checksums, compress, encode_batch, RowContext};

fn column(name: &str, data_type: &str, nullable: bool, position: i32) -> ColumnInfo {
    ColumnInfo {
        name: name.into(),
        data_type: data_type.into(),
        udt_name: None,
        character_maximum_length: None,
        numeric_precision: None,
        numeric_scale: None,
        is_nullable: nullable,
        default: None,
        ordinal_position: position,
    }
}

fn schema_with(amount_type: &str) -> TableSchema {
    TableSchema {
        table_name: "payments".into(),
        schema_name: "public".into(),
        columns: vec![
            column("id", "bigint", false, 1),
            column("amount", amount_type, true, 2),
        ],
        primary_key: Some(PrimaryKeyInfo {
            constraint_name: "payments_pkey".into(),
            columns: vec!["id".into()],
        }),
        foreign_keys: vec![],
        indexes: vec![],
        check_constraints: vec![],
        unique_constraints: vec![],
    }
}

fn archived_payments() -> (Vec<u8>, Vec<u8>) {
    // NUMERIC amounts serialize as strings to preserve precision
    let rows = vec![
        vec![
            ("id".to_string(), Value::Int(1)),
            ("amount".to_string(), Value::Decimal("19.99".parse().unwrap())),
        ],
        vec![
            ("id".to_string(), Value::Int(2)),
            ("amount".to_string(), Value::Decimal("0.01".parse().unwrap())),
        ],
    ];
    let archived_at = Utc.with_ymd_and_hms(2026, 1, 6, 0, 0, 0).unwrap();
    let context = RowContext {
        batch_id: "00aa11bb22cc33dd",
        database: "app",
        table: "payments",
        archived_at,
    };
    let jsonl = encode_batch(&rows, &context).unwrap();
    let compressed = compress(&jsonl, 6).unwrap();
    let sums = checksums(&jsonl, &compressed);
    let metadata = ArchiveMetadata {
        version: METADATA_VERSION.to_string(),
        batch_info: BatchInfo {
            database: "app".into(),
            table: "payments".into(),
            schema: "public".into(),
            batch_number: 1,
            batch_id: "00aa11bb22cc33dd".into(),
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
        table_schema: Some(schema_with("numeric")),
    };
    (compressed, serde_json::to_vec(&metadata).unwrap())
}

#[test]
fn numeric_column_coerces_into_double_precision_under_transform() {
    let (compressed, metadata_bytes) = archived_payments();
    let decoded = decode_archive(
        "app/payments/year=2026/month=01/day=06/payments_20260106T000000Z_batch_001.jsonl.gz",
        &compressed,
        Some(metadata_bytes.as_slice()),
        true,
    )
    .unwrap();

    let archived_schema = decoded.table_schema().unwrap().clone();
    let current_schema = schema_with("double precision");
    let diff = compare_schemas(&archived_schema, &current_schema);
    assert!(diff.has_changes());

    let transformed: Vec<_> = decoded
        .records
        .iter()
        .map(|record| transform_record(record, &diff, MigrationStrategy::Transform).unwrap())
        .collect();

    // values coerce, row count unchanged
    assert_eq!(transformed.len(), 2);
    assert_eq!(transformed[0]["amount"], Json::from(19.99));
    assert_eq!(transformed[1]["amount"], Json::from(0.01));
}

#[test]
fn the_same_change_aborts_under_strict() {
    let (compressed, metadata_bytes) = archived_payments();
    let decoded = decode_archive(
        "app/payments/year=2026/month=01/day=06/payments_20260106T000000Z_batch_001.jsonl.gz",
        &compressed,
        Some(metadata_bytes.as_slice()),
        true,
    )
    .unwrap();

    let diff = compare_schemas(
        decoded.table_schema().unwrap(),
        &schema_with("double precision"),
    );
    let err = transform_record(&decoded.records[0], &diff, MigrationStrategy::Strict).unwrap_err();
    assert!(err.to_string().contains("column types changed"));
}
