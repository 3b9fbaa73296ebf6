//! The restore engine: reverse pipeline from bucket to table.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{bail, format_err, Context, Error};
use chrono::{NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use uuid::Uuid;

use relic_api_types::{
    table_prefix, ArchiveKey, ConflictStrategy, MigrationStrategy, RestoreWatermark, Value,
    RESERVED_FIELDS, RESTORE_WATERMARK_VERSION,
};
use relic_datastore::{JsonRecord, RestoreWatermarkStore};
use relic_object_store::ObjectStore;
use relic_source::row::PkArray;
use relic_source::{introspect, restore as source_restore, SourceError, SourcePool};

use crate::restore::migrate::{compare_schemas, transform_record};
use crate::restore::reader::{fetch_archive, DecodedArchive};

#[derive(Clone, Debug)]
pub struct RestoreOptions {
    pub conflict_strategy: ConflictStrategy,
    pub migration_strategy: MigrationStrategy,
    pub batch_size: usize,
    /// Commit every N insert batches (1 = per batch).
    pub commit_frequency: usize,
    pub drop_indexes: bool,
    pub validate_checksum: bool,
    pub detect_conflicts: bool,
    pub dry_run: bool,
    pub ignore_watermark: bool,
    /// Target table override when the archive metadata lacks one.
    pub table: Option<String>,
    pub schema: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            conflict_strategy: ConflictStrategy::Skip,
            migration_strategy: MigrationStrategy::Lenient,
            batch_size: 1000,
            commit_frequency: 1,
            drop_indexes: false,
            validate_checksum: true,
            detect_conflicts: true,
            dry_run: false,
            ignore_watermark: false,
            table: None,
            schema: None,
            start_date: None,
            end_date: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RestoreFileStats {
    pub key: String,
    pub records_processed: u64,
    pub records_restored: u64,
    pub records_skipped: u64,
    pub records_failed: u64,
    pub conflicts_detected: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RestoreSummary {
    pub files_processed: u64,
    pub files_failed: u64,
    /// Filtered out by the restore watermark before any read.
    pub files_skipped: u64,
    pub records_processed: u64,
    pub records_restored: u64,
    pub records_skipped: u64,
    pub records_failed: u64,
    pub conflicts_detected: u64,
    pub per_file: Vec<RestoreFileStats>,
    pub errors: Vec<String>,
}

impl RestoreSummary {
    fn add(&mut self, stats: RestoreFileStats) {
        self.files_processed += 1;
        self.records_processed += stats.records_processed;
        self.records_restored += stats.records_restored;
        self.records_skipped += stats.records_skipped;
        self.records_failed += stats.records_failed;
        self.conflicts_detected += stats.conflicts_detected;
        self.per_file.push(stats);
    }
}

/// Drop keys already covered by the restore watermark: anything dated
/// before the last restored archive, plus the last restored key itself.
/// A different key with the same date is processed and left to conflict
/// resolution.
pub fn filter_restorable_keys(
    keys: Vec<String>,
    watermark: Option<&RestoreWatermark>,
) -> Vec<String> {
    let watermark = match watermark {
        Some(watermark) => watermark,
        None => return keys,
    };
    let last_date = watermark.last_restored_date.date_naive();
    keys.into_iter()
        .filter(|key| {
            if *key == watermark.last_restored_s3_key {
                return false;
            }
            match ArchiveKey::parse(key) {
                Ok(parsed) => parsed.partition_date() >= last_date,
                Err(_) => true,
            }
        })
        .collect()
}

fn pk_value_from_json(value: &Json) -> Value {
    match value {
        Json::String(s) => match Uuid::parse_str(s) {
            Ok(uuid) => Value::Uuid(uuid),
            Err(_) => Value::Text(s.clone()),
        },
        other => Value::from_json(other),
    }
}

pub struct RestoreEngine {
    pool: Arc<SourcePool>,
    store: Arc<ObjectStore>,
    watermarks: Option<Box<dyn RestoreWatermarkStore>>,
    update_watermark_after_each: bool,
}

impl RestoreEngine {
    pub fn new(
        pool: Arc<SourcePool>,
        store: Arc<ObjectStore>,
        watermarks: Option<Box<dyn RestoreWatermarkStore>>,
        update_watermark_after_each: bool,
    ) -> Self {
        Self { pool, store, watermarks, update_watermark_after_each }
    }

    /// Restore one archive addressed by its data key.
    pub async fn restore_single(
        &self,
        key: &str,
        options: &RestoreOptions,
    ) -> Result<RestoreFileStats, Error> {
        let decoded = fetch_archive(&self.store, key, options.validate_checksum).await?;
        self.restore_archive(decoded, options).await
    }

    /// Restore every archive of a table, optionally within a
    /// `[start_date, end_date]` window, skipping what the restore
    /// watermark already covers.
    pub async fn restore_table(
        &self,
        database: &str,
        table: &str,
        options: &RestoreOptions,
    ) -> Result<RestoreSummary, Error> {
        let keys = self
            .store
            .list_archives(
                &table_prefix(database, table),
                options.start_date,
                options.end_date,
            )
            .await?;
        let total_listed = keys.len();

        let watermark = match (&self.watermarks, options.ignore_watermark) {
            (Some(store), false) => store.load(database, table).await?,
            _ => None,
        };
        let keys = filter_restorable_keys(keys, watermark.as_ref());

        let mut summary = RestoreSummary {
            files_skipped: (total_listed - keys.len()) as u64,
            ..Default::default()
        };
        let mut archives_restored = watermark
            .as_ref()
            .map(|w| w.total_archives_restored)
            .unwrap_or(0);
        let mut highest: Option<(chrono::DateTime<Utc>, String)> = watermark
            .as_ref()
            .map(|w| (w.last_restored_date, w.last_restored_s3_key.clone()));

        log::info!(
            "restoring {}.{}: {} archives ({} skipped by watermark)",
            database,
            table,
            keys.len(),
            summary.files_skipped
        );

        for key in keys {
            match self.restore_single(&key, options).await {
                Ok(stats) => {
                    let restored_this_file = stats.records_restored;
                    summary.add(stats);
                    if options.dry_run {
                        continue;
                    }
                    archives_restored += 1;
                    let restored_date = ArchiveKey::parse(&key)
                        .map(|parsed| {
                            Utc.from_utc_datetime(
                                &parsed.partition_date().and_hms_opt(0, 0, 0).unwrap(),
                            )
                        })
                        .unwrap_or_else(|_| Utc::now());
                    if highest
                        .as_ref()
                        .map(|(date, _)| restored_date >= *date)
                        .unwrap_or(true)
                    {
                        highest = Some((restored_date, key.clone()));
                    }
                    if self.update_watermark_after_each {
                        self.save_watermark(database, table, &highest, archives_restored).await;
                    }
                    log::debug!("restored '{}' ({} records)", key, restored_this_file);
                }
                Err(err) => {
                    log::error!("restore of '{}' failed - {:#}", key, err);
                    summary.files_failed += 1;
                    summary.errors.push(format!("{}: {:#}", key, err));
                }
            }
        }

        if !options.dry_run && !self.update_watermark_after_each {
            self.save_watermark(database, table, &highest, archives_restored).await;
        }

        Ok(summary)
    }

    async fn save_watermark(
        &self,
        database: &str,
        table: &str,
        highest: &Option<(chrono::DateTime<Utc>, String)>,
        archives_restored: u64,
    ) {
        let (store, (date, key)) = match (&self.watermarks, highest) {
            (Some(store), Some(highest)) => (store, highest),
            _ => return,
        };
        let watermark = RestoreWatermark {
            version: RESTORE_WATERMARK_VERSION.to_string(),
            database: database.to_string(),
            table: table.to_string(),
            last_restored_date: *date,
            last_restored_s3_key: key.clone(),
            total_archives_restored: archives_restored,
            updated_at: Utc::now(),
        };
        if let Err(err) = store.save(&watermark).await {
            log::warn!("restore watermark update failed (non-critical) - {}", err);
        }
    }

    /// Restore a decoded archive: schema reconciliation, conflict
    /// handling, batched inserts.
    pub async fn restore_archive(
        &self,
        decoded: DecodedArchive,
        options: &RestoreOptions,
    ) -> Result<RestoreFileStats, Error> {
        let table = options
            .table
            .clone()
            .or_else(|| decoded.table_name())
            .ok_or_else(|| {
                format_err!(
                    "target table not found in archive metadata; pass --table explicitly"
                )
            })?;
        let schema = options
            .schema
            .clone()
            .unwrap_or_else(|| decoded.schema_name());

        let mut stats = RestoreFileStats {
            key: decoded.key.clone(),
            records_processed: decoded.record_count() as u64,
            records_restored: 0,
            records_skipped: 0,
            records_failed: 0,
            conflicts_detected: 0,
            skip_reason: None,
        };
        if decoded.records.is_empty() || options.dry_run {
            return Ok(stats);
        }
        let original_count = decoded.records.len();

        // live table shape
        let client = self.pool.client().await?;
        let current_schema =
            match introspect::detect_table_schema(&client, &schema, &table).await {
                Ok(schema) => Some(schema),
                Err(err) => {
                    log::warn!(
                        "unable to detect current schema of {}.{}, restoring without migration - {}",
                        schema,
                        table,
                        err
                    );
                    None
                }
            };
        drop(client);

        // schema reconciliation
        let archived_schema = decoded.table_schema().cloned();
        let mut records = decoded.records;
        if let (Some(archived), Some(current)) = (&archived_schema, &current_schema) {
            if options.migration_strategy != MigrationStrategy::None {
                let diff = compare_schemas(archived, current);
                if diff.has_changes() {
                    log::warn!(
                        "schema differences on {}.{}: {}",
                        schema,
                        table,
                        diff.report()
                    );
                    let mut transformed = Vec::with_capacity(records.len());
                    for record in &records {
                        match transform_record(record, &diff, options.migration_strategy) {
                            Ok(record) => transformed.push(record),
                            Err(err) => {
                                if options.migration_strategy == MigrationStrategy::Strict {
                                    return Err(err.context("schema migration failed"));
                                }
                                log::warn!("record transformation failed, skipping - {}", err);
                                stats.records_failed += 1;
                            }
                        }
                    }
                    records = transformed;
                }
            }
        }
        if records.is_empty() {
            return Ok(stats);
        }

        // column order follows the live table where known
        let columns: Vec<String> = match &current_schema {
            Some(current) => current
                .columns
                .iter()
                .map(|c| c.name.clone())
                .filter(|name| records[0].contains_key(name))
                .collect(),
            None => records[0]
                .keys()
                .filter(|name| !RESERVED_FIELDS.contains(&name.as_str()))
                .cloned()
                .collect(),
        };
        if columns.is_empty() {
            bail!("no restorable columns in '{}'", decoded.key);
        }

        let primary_key: Option<String> = current_schema
            .as_ref()
            .and_then(|s| s.primary_key_column())
            .or_else(|| archived_schema.as_ref().and_then(|s| s.primary_key_column()))
            .map(String::from);

        // conflict pre-detection
        if options.detect_conflicts {
            if let Some(pk) = &primary_key {
                match self.detect_conflicts(&schema, &table, pk, &records).await {
                    Ok(existing) if !existing.is_empty() => {
                        stats.conflicts_detected = existing.len() as u64;
                        log::info!(
                            "{} conflicting keys already present in {}.{}",
                            existing.len(),
                            schema,
                            table
                        );
                        match options.conflict_strategy {
                            ConflictStrategy::Skip => {
                                let existing: HashSet<String> = existing.into_iter().collect();
                                records.retain(|record| {
                                    record
                                        .get(pk)
                                        .map(|value| {
                                            !existing
                                                .contains(&pk_value_from_json(value).to_pk_string())
                                        })
                                        .unwrap_or(true)
                                });
                                stats.records_skipped =
                                    original_count as u64 - records.len() as u64 - stats.records_failed;
                                stats.skip_reason = Some("conflict".to_string());
                            }
                            ConflictStrategy::Fail => {
                                bail!(
                                    "{} conflicting keys present and conflict strategy is 'fail'",
                                    stats.conflicts_detected
                                );
                            }
                            ConflictStrategy::Overwrite | ConflictStrategy::Upsert => {}
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        log::warn!("conflict detection failed, proceeding without - {}", err)
                    }
                }
            }
        }
        if records.is_empty() {
            return Ok(stats);
        }

        // indexes are always restored, even when the inserts fail
        let mut client = self.pool.client().await?;
        let dropped = if options.drop_indexes {
            let indexes = source_restore::list_non_pk_indexes(&client, &schema, &table).await?;
            for index in &indexes {
                if let Err(err) = source_restore::drop_index(&client, &schema, &index.name).await {
                    log::warn!("unable to drop index '{}' - {}", index.name, err);
                }
            }
            indexes
        } else {
            Vec::new()
        };

        let insert_result = self
            .insert_records(&mut client, &schema, &table, &columns, &records, primary_key.as_deref(), options)
            .await;

        for index in &dropped {
            if let Err(err) = source_restore::execute_ddl(&client, &index.definition).await {
                log::warn!("unable to restore index '{}' - {}", index.name, err);
            }
        }

        let restored = insert_result
            .with_context(|| format!("restore into {}.{} failed", schema, table))?;
        stats.records_restored = restored;
        if options.conflict_strategy == ConflictStrategy::Skip && stats.conflicts_detected == 0 {
            stats.records_skipped = records.len() as u64 - restored;
            if stats.records_skipped > 0 {
                stats.skip_reason = Some("conflict".to_string());
            }
        }
        Ok(stats)
    }

    async fn detect_conflicts(
        &self,
        schema: &str,
        table: &str,
        primary_key: &str,
        records: &[JsonRecord],
    ) -> Result<Vec<String>, Error> {
        let pks: Vec<Value> = records
            .iter()
            .filter_map(|record| record.get(primary_key))
            .map(pk_value_from_json)
            .collect();
        if pks.is_empty() {
            return Ok(Vec::new());
        }
        let pk_array = PkArray::try_from_values(&pks)?;
        let client = self.pool.client().await?;
        Ok(source_restore::existing_pks(&client, schema, table, primary_key, &pk_array).await?)
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_records(
        &self,
        client: &mut relic_source::Client,
        schema: &str,
        table: &str,
        columns: &[String],
        records: &[JsonRecord],
        primary_key: Option<&str>,
        options: &RestoreOptions,
    ) -> Result<u64, Error> {
        let sql = source_restore::insert_sql(
            schema,
            table,
            columns,
            options.conflict_strategy,
            primary_key,
        )?;

        let batches: Vec<&[JsonRecord]> = records.chunks(options.batch_size.max(1)).collect();
        let mut restored = 0;
        for group in batches.chunks(options.commit_frequency.max(1)) {
            let txn = client.transaction().await.map_err(SourceError::from)?;
            for batch in group {
                let rows: Vec<Vec<Value>> = batch
                    .iter()
                    .map(|record| {
                        columns
                            .iter()
                            .map(|column| {
                                record
                                    .get(column)
                                    .map(Value::from_json)
                                    .unwrap_or(Value::Null)
                            })
                            .collect()
                    })
                    .collect();
                restored += source_restore::insert_rows(&txn, &sql, &rows).await?;
            }
            txn.commit().await.map_err(SourceError::from)?;
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn watermark(date: &str, key: &str) -> RestoreWatermark {
        RestoreWatermark {
            version: RESTORE_WATERMARK_VERSION.to_string(),
            database: "app".into(),
            table: "audit_logs".into(),
            last_restored_date: format!("{}T00:00:00Z", date).parse().unwrap(),
            last_restored_s3_key: key.to_string(),
            total_archives_restored: 3,
            updated_at: Utc::now(),
        }
    }

    fn key(day: u32, batch: u32) -> String {
        format!(
            "app/audit_logs/year=2026/month=01/day={:02}/audit_logs_202601{:02}T000000Z_batch_{:03}.jsonl.gz",
            day, day, batch
        )
    }

    #[test]
    fn watermark_filtering_follows_the_skip_rules() {
        let last = key(5, 2);
        let keys = vec![key(4, 1), key(5, 1), last.clone(), key(5, 3), key(6, 1)];
        let filtered = filter_restorable_keys(keys, Some(&watermark("2026-01-05", &last)));
        // earlier dates and the exact last key are skipped; same-date
        // different keys stay
        assert_eq!(filtered, vec![key(5, 1), key(5, 3), key(6, 1)]);
    }

    #[test]
    fn no_watermark_means_no_filtering() {
        let keys = vec![key(1, 1), key(2, 1)];
        assert_eq!(filter_restorable_keys(keys.clone(), None), keys);
    }

    #[test]
    fn unparseable_keys_pass_through() {
        let keys = vec!["app/audit_logs/oddball.jsonl.gz".to_string()];
        let filtered = filter_restorable_keys(keys.clone(), Some(&watermark("2026-01-05", "x")));
        assert_eq!(filtered, keys);
    }

    #[test]
    fn pk_values_recognize_uuids() {
        assert_eq!(
            pk_value_from_json(&Json::String("not-a-uuid".into())),
            Value::Text("not-a-uuid".into())
        );
        assert!(matches!(
            pk_value_from_json(&Json::String(
                "6ba7b810-9dad-11d1-80b4-00c04fd430c8".into()
            )),
            Value::Uuid(_)
        ));
        assert_eq!(pk_value_from_json(&Json::from(7)), Value::Int(7));
    }
}
