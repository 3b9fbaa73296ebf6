use super::*;

use relic_api_types::{CheckpointStorageKind, EncryptionMode, LockKind};

const MINIMAL: &str = r#"
version: "1.0"
s3:
  bucket: cold-archives
databases:
  - name: app
    host: db.internal
    user: archiver
    password_env: APP_DB_PASSWORD
    tables:
      - name: audit_logs
        timestamp_column: created_at
        primary_key: id
"#;

#[test]
fn minimal_config_parses_with_defaults() {
    let config = parse_config(MINIMAL).unwrap();
    assert_eq!(config.version, "1.0");
    assert_eq!(config.s3.region, "us-east-1");
    assert_eq!(config.s3.storage_class, "STANDARD_IA");
    assert_eq!(config.s3.encryption, EncryptionMode::SseS3);
    assert_eq!(config.defaults.batch_size, 10_000);
    assert_eq!(config.defaults.lock_type, LockKind::Postgresql);
    assert_eq!(config.defaults.checkpoint_storage_type, CheckpointStorageKind::S3);

    // defaults merged onto the table
    let table = &config.databases[0].tables[0];
    assert_eq!(table.retention_days, Some(90));
    assert_eq!(table.batch_size, Some(10_000));
    assert_eq!(table.schema_name, "public");
    assert!(config.restore_watermark.enabled);
}

#[test]
fn per_table_overrides_win() {
    let raw = MINIMAL.replace(
        "        primary_key: id\n",
        "        primary_key: id\n        retention_days: 30\n        batch_size: 500\n",
    );
    let config = parse_config(&raw).unwrap();
    let table = &config.databases[0].tables[0];
    assert_eq!(config.retention_days(table), 30);
    assert_eq!(config.batch_size(table), 500);
}

#[test]
fn unsupported_version_is_rejected() {
    let raw = MINIMAL.replace("version: \"1.0\"", "version: \"3.0\"");
    let err = parse_config(&raw).unwrap_err();
    assert!(err.to_string().contains("unsupported configuration version"));
}

#[test]
fn both_password_sources_conflict() {
    let raw = MINIMAL.replace(
        "    password_env: APP_DB_PASSWORD\n",
        "    password_env: APP_DB_PASSWORD\n    password: hunter2\n",
    );
    let err = parse_config(&raw).unwrap_err();
    assert!(err.to_string().contains("mutually exclusive"));
}

#[test]
fn missing_password_source_is_rejected() {
    let raw = MINIMAL.replace("    password_env: APP_DB_PASSWORD\n", "");
    assert!(parse_config(&raw).is_err());
}

#[test]
fn compression_level_range_is_enforced() {
    let raw = MINIMAL.replace(
        "databases:",
        "defaults:\n  compression_level: 12\ndatabases:",
    );
    let err = parse_config(&raw).unwrap_err();
    assert!(err.to_string().contains("compression_level"));
}

#[test]
fn file_lock_requires_a_directory() {
    let raw = MINIMAL.replace("databases:", "defaults:\n  lock_type: file\ndatabases:");
    let err = parse_config(&raw).unwrap_err();
    assert!(err.to_string().contains("lock_file_dir"));
}

#[test]
fn env_substitution_with_defaults() {
    std::env::set_var("RELIC_TEST_BUCKET", "bucket-from-env");
    let raw = MINIMAL.replace("bucket: cold-archives", "bucket: ${RELIC_TEST_BUCKET}");
    let config = parse_config(&raw).unwrap();
    assert_eq!(config.s3.bucket, "bucket-from-env");

    let raw = MINIMAL.replace(
        "  bucket: cold-archives",
        "  bucket: ${RELIC_TEST_UNSET_BUCKET:-fallback-bucket}\n  prefix: ${RELIC_TEST_UNSET_PREFIX:-}",
    );
    let config = parse_config(&raw).unwrap();
    assert_eq!(config.s3.bucket, "fallback-bucket");
    assert_eq!(config.s3.prefix, "");
}

#[test]
fn missing_env_var_without_default_fails() {
    let raw = MINIMAL.replace("bucket: cold-archives", "bucket: ${RELIC_TEST_NO_SUCH_VAR}");
    let err = parse_config(&raw).unwrap_err();
    assert!(format!("{:#}", err).contains("RELIC_TEST_NO_SUCH_VAR"));
}

#[test]
fn substitution_inside_longer_strings() {
    std::env::set_var("RELIC_TEST_REGION", "eu-central-1");
    let out = substitute_env_str("region is ${RELIC_TEST_REGION}, rest ${X:-kept}").unwrap();
    assert_eq!(out, "region is eu-central-1, rest kept");
}
