//! Per-table archival state machine.
//!
//! For every table, under the database-level lock: policy gates, schema
//! snapshot, cursor load, then the batch loop. A batch is selected and
//! row-locked inside one transaction; its rows are deleted through the
//! same transaction only after the upload has been verified, so any
//! failure before the commit leaves the source untouched.

use std::sync::Arc;

use anyhow::{bail, format_err, Context, Error};
use chrono::Utc;

use relic_api_types::{
    batch_id, table_prefix, ArchiveKey, ArchiveMetadata, BatchInfo, Checkpoint, Cursor, DataInfo,
    DeletionManifest, TableSchema, Value, Watermark, CHECKPOINT_VERSION, MANIFEST_VERSION,
    METADATA_VERSION,
};
use relic_config::{ArchiverConfig, DatabaseConfig, TableConfig};
use relic_datastore::{
    checksums, compress, count_lines, encode_batch, CheckpointStore, LocalCheckpointStore,
    ObjectCheckpointStore, ObjectWatermarkStore, DatabaseWatermarkStore, RowContext,
    WatermarkStore,
};
use relic_object_store::ObjectStore;
use relic_source::batch::{self as source_batch, TableRef};
use relic_source::row::PkArray;
use relic_source::{introspect, restore as source_restore, SourceError, SourcePool};

use crate::archive::batch;
use crate::archive::drift::{self, DriftChange};
use crate::archive::driver::{TableStats, TableStatus};
use crate::archive::policy::{check_encryption_gate, LegalHoldChecker, RetentionEnforcer};
use crate::archive::sample;
use crate::audit::{AuditEvent, AuditEventType, AuditTrail};
use crate::lock_manager::LockManager;
use crate::shutdown::Shutdown;
use crate::ArchiveError;

use relic_api_types::{CheckpointStorageKind, VacuumStrategy, WatermarkStorageKind};

pub(crate) struct BatchResult {
    pub record_count: u64,
    pub cursor: Cursor,
}

/// Archives every configured table of one database.
pub struct DatabaseArchiver {
    config: Arc<ArchiverConfig>,
    db_config: DatabaseConfig,
    pool: Arc<SourcePool>,
    store: Arc<ObjectStore>,
    watermarks: Box<dyn WatermarkStore>,
    checkpoints: Box<dyn CheckpointStore>,
    lock_manager: LockManager,
    legal_holds: LegalHoldChecker,
    retention: RetentionEnforcer,
    audit: Arc<AuditTrail>,
    shutdown: Shutdown,
    dry_run: bool,
}

impl DatabaseArchiver {
    pub fn new(
        config: Arc<ArchiverConfig>,
        db_config: DatabaseConfig,
        store: Arc<ObjectStore>,
        audit: Arc<AuditTrail>,
        shutdown: Shutdown,
        dry_run: bool,
    ) -> Result<Self, Error> {
        let pool_size = config.pool_size(&db_config);
        let pool = Arc::new(
            SourcePool::new(&db_config, pool_size)
                .with_context(|| format!("unable to set up pool for '{}'", db_config.name))?,
        );

        let watermarks: Box<dyn WatermarkStore> = match config.defaults.watermark_storage_type {
            WatermarkStorageKind::S3 => Box::new(ObjectWatermarkStore::new(Arc::clone(&store))),
            WatermarkStorageKind::Database => {
                Box::new(DatabaseWatermarkStore::new(Arc::clone(&pool)))
            }
        };
        let checkpoints: Box<dyn CheckpointStore> = match config.defaults.checkpoint_storage_type {
            CheckpointStorageKind::S3 => Box::new(ObjectCheckpointStore::new(Arc::clone(&store))),
            CheckpointStorageKind::Local => {
                let dir = config
                    .defaults
                    .checkpoint_local_dir
                    .as_ref()
                    .ok_or_else(|| format_err!("checkpoint_local_dir not configured"))?;
                Box::new(LocalCheckpointStore::new(dir.into()))
            }
        };

        Ok(Self {
            lock_manager: LockManager::new(&config.defaults),
            legal_holds: LegalHoldChecker::new(config.legal_holds.clone()),
            retention: RetentionEnforcer::new(config.compliance.clone()),
            config,
            db_config,
            pool,
            store,
            watermarks,
            checkpoints,
            audit,
            shutdown,
            dry_run,
        })
    }

    pub fn database(&self) -> &str {
        &self.db_config.name
    }

    /// Archive every table, serially, under the database lock. Table
    /// failures are recorded and do not abort the remaining tables.
    pub async fn run(&self) -> crate::archive::driver::DatabaseStats {
        use crate::archive::driver::{DatabaseStats, DatabaseStatus};

        let mut stats = DatabaseStats::new(&self.db_config.name);

        if let Err(err) = self.pool.check().await {
            stats.fail(format!("database connection failed - {}", err));
            return stats;
        }

        let lock = if self.dry_run {
            None
        } else {
            let lock_key = format!("database:{}", self.db_config.name);
            match self.lock_manager.acquire(&lock_key, Some(&self.pool)).await {
                Ok(lock) => Some(lock),
                Err(err @ crate::lock_manager::LockError::Busy(_))
                | Err(err @ crate::lock_manager::LockError::HeldLocally(_)) => {
                    log::error!(
                        "skipping database '{}': {} (another instance may be running)",
                        self.db_config.name,
                        err
                    );
                    stats.status = DatabaseStatus::SkippedLockBusy;
                    stats.error = Some(err.to_string());
                    stats.finish();
                    return stats;
                }
                Err(err) => {
                    stats.fail(format!("lock acquisition failed - {}", err));
                    return stats;
                }
            }
        };

        if !self.dry_run {
            if let Err(err) = self.store.validate_bucket().await {
                stats.fail(format!("bucket validation failed - {}", err));
                if let Some(lock) = lock {
                    self.lock_manager.release(lock).await;
                }
                return stats;
            }
            if let Err(err) = self.store.sweep_fallback() {
                log::warn!("fallback sweep failed - {}", err);
            }
        }

        for table_config in &self.db_config.tables {
            if self.shutdown.is_cancelled() {
                log::info!("cancellation requested, stopping table loop");
                break;
            }
            let table_stats = self.archive_table(table_config).await;
            stats.add_table(table_stats);
        }

        if let Some(lock) = lock {
            self.lock_manager.release(lock).await;
        }
        stats.finish();
        stats
    }

    async fn archive_table(&self, table_config: &TableConfig) -> TableStats {
        let started = Utc::now();
        let mut stats = TableStats::new(&table_config.name, &table_config.schema_name);

        let result = self.archive_table_inner(table_config, &mut stats).await;
        let duration = (Utc::now() - started).num_milliseconds() as f64 / 1000.0;
        stats.duration_seconds = duration;

        match result {
            Ok(()) => {
                if stats.status != TableStatus::Skipped {
                    stats.status = TableStatus::Archived;
                    self.audit.record(
                        AuditEvent::new(
                            AuditEventType::ArchiveSuccess,
                            &self.db_config.name,
                            &table_config.name,
                            "success",
                        )
                        .schema(&table_config.schema_name)
                        .records(stats.records_archived_total)
                        .duration(duration),
                    );
                }
            }
            Err(err) => {
                log::error!(
                    "archival of {}.{} failed - {:#}",
                    self.db_config.name,
                    table_config.name,
                    err
                );
                stats.status = TableStatus::Failed;
                stats.error = Some(format!("{:#}", err));
                self.audit.record(
                    AuditEvent::new(
                        AuditEventType::ArchiveFailure,
                        &self.db_config.name,
                        &table_config.name,
                        "failed",
                    )
                    .schema(&table_config.schema_name)
                    .records(stats.records_archived_this_run)
                    .duration(duration)
                    .error(format!("{:#}", err)),
                );
            }
        }
        stats
    }

    async fn archive_table_inner(
        &self,
        table_config: &TableConfig,
        stats: &mut TableStats,
    ) -> Result<(), Error> {
        let database = self.db_config.name.as_str();
        let table = table_config.name.as_str();
        let retention_days = self.config.retention_days(table_config);
        let defaults = &self.config.defaults;

        let table_ref = TableRef {
            schema: table_config.schema_name.clone(),
            name: table_config.name.clone(),
            timestamp_column: table_config.timestamp_column.clone(),
            primary_key: table_config.primary_key.clone(),
        };

        // S0: policy gates
        if let Some(hold) = self
            .legal_holds
            .check(&self.pool, database, table, &table_config.schema_name)
            .await
        {
            log::warn!(
                "table {}.{} has an active legal hold (reason: {}, requestor: {}) - skipping",
                database,
                table,
                hold.reason,
                hold.requestor
            );
            stats.status = TableStatus::Skipped;
            stats.skip_reason = Some(format!("legal hold: {}", hold.reason));
            self.audit.record(
                AuditEvent::new(AuditEventType::ArchiveSkipped, database, table, "skipped")
                    .schema(&table_config.schema_name)
                    .error(format!("legal hold active: {}", hold.reason)),
            );
            return Ok(());
        }
        self.retention.validate(table_config, retention_days)?;
        check_encryption_gate(table_config, &self.config.s3, self.config.compliance.as_ref())?;

        self.audit.record(
            AuditEvent::new(AuditEventType::ArchiveStart, database, table, "started")
                .schema(&table_config.schema_name),
        );

        // S1: schema snapshot (informational, non-fatal)
        let client = self.pool.client().await?;
        let tz_aware = match introspect::timestamp_column_is_tz_aware(
            &client,
            &table_config.schema_name,
            table,
            &table_config.timestamp_column,
        )
        .await
        {
            Ok(aware) => aware,
            Err(err) => {
                log::warn!(
                    "unable to determine timestamp column type for {}.{}, assuming timezone-naive - {}",
                    database,
                    table,
                    err
                );
                false
            }
        };
        let table_schema =
            match introspect::detect_table_schema(&client, &table_config.schema_name, table).await
            {
                Ok(schema) => Some(schema),
                Err(err) => {
                    log::warn!("schema detection failed for {}.{} - {}", database, table, err);
                    None
                }
            };

        // drift gate against the last archived snapshot
        if let Some(current) = &table_schema {
            if let Some(archived) =
                drift::load_latest_archived_schema(&self.store, database, table).await
            {
                let changes = drift::detect_drift(&archived, current);
                if !changes.is_empty() {
                    let summary = changes
                        .iter()
                        .map(DriftChange::to_string)
                        .collect::<Vec<_>>()
                        .join("; ");
                    self.audit.record(
                        AuditEvent::new(AuditEventType::SchemaDrift, database, table, "drift")
                            .schema(&table_config.schema_name)
                            .error(summary.clone()),
                    );
                    if defaults.fail_on_schema_drift {
                        bail!("schema drift detected: {}", summary);
                    }
                    log::warn!("schema drift on {}.{}: {}", database, table, summary);
                }
            }
        }

        // advisory progress figure, never gates deletion
        let cutoff_ts = batch::cutoff(Utc::now(), retention_days, defaults.safety_buffer_days);
        let cutoff_bind = batch::cutoff_value(cutoff_ts, tz_aware);
        let eligible =
            source_batch::count_eligible(&client, &table_ref, &cutoff_bind).await? as u64;
        drop(client);
        stats.eligible = eligible;
        log::info!(
            "{}.{}: {} records eligible (cutoff {})",
            database,
            table,
            eligible,
            cutoff_ts
        );

        // S2: checkpoint > watermark > fresh
        let checkpoint = if self.dry_run {
            None
        } else {
            self.checkpoints.load(database, table).await?
        };
        if checkpoint.is_some() {
            // resuming an interrupted run: clear abandoned multipart
            // uploads, but only those old enough that no live peer can
            // still own them
            let max_age = chrono::Duration::seconds(defaults.lock_ttl_seconds as i64);
            match self
                .store
                .cleanup_orphaned_uploads(Some(&table_prefix(database, table)), max_age)
                .await
            {
                Ok((0, _)) => {}
                Ok((aborted, failed)) => log::info!(
                    "aborted {} orphaned multipart uploads ({} failures)",
                    aborted,
                    failed
                ),
                Err(err) => log::warn!("multipart cleanup failed - {}", err),
            }
        }

        let (mut cursor, mut batch_number, mut records_total, mut batches_total) = match &checkpoint
        {
            Some(checkpoint) => {
                log::info!(
                    "resuming {}.{} from checkpoint at batch {} ({} records archived)",
                    database,
                    table,
                    checkpoint.batch_number,
                    checkpoint.records_archived
                );
                (
                    checkpoint.cursor(),
                    checkpoint.batch_number,
                    checkpoint.records_archived,
                    checkpoint.batches_processed,
                )
            }
            None => {
                let watermark = if self.dry_run {
                    None
                } else {
                    self.watermarks.load(database, table).await?
                };
                (watermark.map(|w| w.cursor()), 0, 0, 0)
            }
        };

        stats.records_archived_total = records_total;

        if eligible == 0 && checkpoint.is_none() {
            log::info!("{}.{}: no records to archive", database, table);
            return Ok(());
        }

        let mut first_batch = true;
        loop {
            self.shutdown.check()?;
            batch_number += 1;

            let schema_for_batch = if first_batch { table_schema.clone() } else { None };
            let result = self
                .process_batch_with_retry(
                    &table_ref,
                    table_config,
                    batch_number,
                    cursor.clone(),
                    &cutoff_bind,
                    tz_aware,
                    schema_for_batch,
                )
                .await?;

            let result = match result {
                Some(result) => result,
                None => break,
            };
            first_batch = false;

            if let Some(previous) = &cursor {
                if previous.cmp_position(&result.cursor) == std::cmp::Ordering::Greater {
                    log::error!(
                        "cursor went backwards on {}.{} at batch {}",
                        database,
                        table,
                        batch_number
                    );
                }
            }
            cursor = Some(result.cursor.clone());

            records_total += result.record_count;
            batches_total += 1;
            stats.records_archived_this_run += result.record_count;
            stats.records_archived_total = records_total;
            stats.batches_processed += 1;

            if !self.dry_run {
                if batch_number % defaults.checkpoint_interval == 0 {
                    let checkpoint = Checkpoint {
                        version: CHECKPOINT_VERSION.to_string(),
                        database: database.to_string(),
                        table: table.to_string(),
                        schema: table_config.schema_name.clone(),
                        batch_number,
                        last_timestamp: Some(result.cursor.last_timestamp),
                        last_primary_key: Some(result.cursor.last_primary_key.to_pk_string()),
                        records_archived: records_total,
                        batches_processed: batches_total,
                        checkpoint_time: Utc::now(),
                        batch_id: Some(batch_id(database, table, batch_number)),
                    };
                    if let Err(err) = self.checkpoints.save(&checkpoint).await {
                        log::warn!("checkpoint save failed (non-critical) - {}", err);
                    }
                }

                let watermark = Watermark::new(database, table, &result.cursor);
                if let Err(err) = self.watermarks.save(&watermark).await {
                    log::warn!("watermark update failed (non-critical) - {}", err);
                }
            }

            if defaults.sleep_between_batches > 0 {
                self.shutdown
                    .sleep(std::time::Duration::from_secs(defaults.sleep_between_batches))
                    .await;
            }
        }

        // S9: cleanup. Deleting the checkpoint is the authoritative
        // "table done" marker.
        if !self.dry_run {
            if let Err(err) = self.checkpoints.delete(database, table).await {
                log::warn!("checkpoint deletion failed (non-critical) - {}", err);
            }
            if defaults.vacuum_after
                && defaults.vacuum_strategy != VacuumStrategy::None
                && stats.records_archived_this_run > 0
            {
                let client = self.pool.client().await?;
                if let Err(err) = source_restore::vacuum_table(
                    &client,
                    defaults.vacuum_strategy,
                    &table_config.schema_name,
                    table,
                )
                .await
                {
                    log::warn!("vacuum of {}.{} failed (non-critical) - {}", database, table, err);
                }
            }
        }

        log::info!(
            "{}.{}: archived {} records in {} batches this run",
            database,
            table,
            stats.records_archived_this_run,
            stats.batches_processed
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_batch_with_retry(
        &self,
        table_ref: &TableRef,
        table_config: &TableConfig,
        batch_number: u32,
        cursor: Option<Cursor>,
        cutoff: &Value,
        tz_aware: bool,
        table_schema: Option<TableSchema>,
    ) -> Result<Option<BatchResult>, Error> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .process_batch(
                    table_ref,
                    table_config,
                    batch_number,
                    cursor.as_ref(),
                    cutoff,
                    tz_aware,
                    table_schema.clone(),
                )
                .await;
            match result {
                Ok(result) => return Ok(result),
                Err(err)
                    if attempt < 3
                        && is_transient_source_error(&err)
                        && !self.shutdown.is_cancelled() =>
                {
                    // transaction rolled back, the cursor has not moved;
                    // the same batch is retried from scratch
                    log::warn!(
                        "transient source error in batch {} (attempt {}/3), retrying - {:#}",
                        batch_number,
                        attempt,
                        err
                    );
                    self.shutdown
                        .sleep(std::time::Duration::from_secs(1 << attempt))
                        .await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// S3-S8 for one batch: select under lock, serialize, compress,
    /// upload, verify counts, delete, commit. Post-commit: manifest,
    /// sample verification.
    #[allow(clippy::too_many_arguments)]
    async fn process_batch(
        &self,
        table_ref: &TableRef,
        table_config: &TableConfig,
        batch_number: u32,
        cursor: Option<&Cursor>,
        cutoff: &Value,
        tz_aware: bool,
        table_schema: Option<TableSchema>,
    ) -> Result<Option<BatchResult>, Error> {
        let database = self.db_config.name.as_str();
        let table = table_config.name.as_str();
        let batch_size = self.config.batch_size(table_config);

        let mut client = self.pool.client().await.map_err(Error::from)?;
        let txn = client.transaction().await.map_err(SourceError::from)?;

        // S3: SELECT ... FOR UPDATE SKIP LOCKED
        let rows =
            source_batch::select_batch(&txn, table_ref, cutoff, cursor, batch_size, tz_aware)
                .await?;
        if rows.is_empty() {
            return Ok(None);
        }
        let memory_count = rows.len() as u64;

        let primary_keys = batch::extract_primary_keys(&rows, &table_config.primary_key)?;
        let pk_array = PkArray::try_from_values(&primary_keys)?;
        let db_count = source_batch::count_matching_pks(&txn, table_ref, &pk_array).await?;

        let next_cursor = batch::last_cursor(
            &rows,
            &table_config.timestamp_column,
            &table_config.primary_key,
        )
        .ok_or_else(|| format_err!("batch has no usable cursor position"))?;

        // S4/S5: serialize and compress, checksumming both forms
        let archived_at = Utc::now();
        let id = batch_id(database, table, batch_number);
        let context = RowContext {
            batch_id: &id,
            database,
            table,
            archived_at,
        };
        let jsonl = encode_batch(&rows, &context)?;
        let jsonl_lines = count_lines(&jsonl);
        let compressed = compress(&jsonl, self.config.defaults.compression_level)?;
        let sums = checksums(&jsonl, &compressed);
        let range = batch::timestamp_range(&rows, &table_config.timestamp_column);

        let archive_key = ArchiveKey {
            database: database.to_string(),
            table: table.to_string(),
            archived_at,
            batch_number,
        };
        let metadata = ArchiveMetadata {
            version: METADATA_VERSION.to_string(),
            batch_info: BatchInfo {
                database: database.to_string(),
                table: table.to_string(),
                schema: table_config.schema_name.clone(),
                batch_number,
                batch_id: id.clone(),
            },
            data_info: DataInfo {
                record_count: memory_count,
                uncompressed_size: jsonl.len() as u64,
                compressed_size: compressed.len() as u64,
                compression_ratio: if jsonl.is_empty() {
                    0.0
                } else {
                    compressed.len() as f64 / jsonl.len() as f64
                },
            },
            checksums: sums,
            timestamp_range: range,
            archived_at,
            table_schema,
        };

        // S6: upload data and metadata
        if !self.dry_run {
            self.store
                .put(&archive_key.data_key(), compressed.clone())
                .await
                .with_context(|| format!("upload of batch {} failed", batch_number))?;
            self.store
                .put(
                    &archive_key.metadata_key(),
                    metadata.to_json_pretty()?.into_bytes(),
                )
                .await
                .with_context(|| format!("metadata upload of batch {} failed", batch_number))?;
        }

        // S7: count equality across source, memory and serialized form
        if db_count as u64 != memory_count || memory_count != jsonl_lines {
            return Err(ArchiveError::Verification(format!(
                "count mismatch in batch {}: db={} memory={} jsonl={}",
                batch_number, db_count, memory_count, jsonl_lines
            ))
            .into());
        }

        if self.dry_run {
            // S8 skipped entirely; rolling back releases the row locks
            txn.rollback().await.map_err(SourceError::from)?;
            log::info!(
                "dry-run: batch {} of {}.{} would archive {} records",
                batch_number,
                database,
                table,
                memory_count
            );
            return Ok(Some(BatchResult { record_count: memory_count, cursor: next_cursor }));
        }

        // S8: delete in the same transaction that selected the rows, and
        // verify the affected count before the commit makes it final
        let deleted = source_batch::delete_by_pks(&txn, table_ref, &pk_array).await?;
        if deleted != primary_keys.len() as u64 {
            return Err(ArchiveError::Verification(format!(
                "delete count mismatch in batch {}: expected {}, got {}",
                batch_number,
                primary_keys.len(),
                deleted
            ))
            .into());
        }
        txn.commit().await.map_err(SourceError::from)?;

        log::debug!(
            "batch {} of {}.{}: {} records archived and deleted",
            batch_number,
            database,
            table,
            memory_count
        );

        // Post-commit: nothing below can undo the archival; failures are
        // logged, audited and retried on the next opportunity.
        let manifest = DeletionManifest {
            version: MANIFEST_VERSION.to_string(),
            database: database.to_string(),
            table: table.to_string(),
            schema: table_config.schema_name.clone(),
            batch_number,
            batch_id: id,
            primary_key_column: table_config.primary_key.clone(),
            primary_keys: primary_keys.iter().map(Value::to_pk_string).collect(),
            deleted_count: deleted,
            deleted_at: Utc::now(),
        };
        match manifest.to_json_pretty() {
            Ok(json) => {
                if let Err(err) = self
                    .store
                    .put(&archive_key.manifest_key(), json.into_bytes())
                    .await
                {
                    log::error!(
                        "deletion manifest upload failed for batch {} (non-critical) - {}",
                        batch_number,
                        err
                    );
                }
            }
            Err(err) => log::error!("unable to encode deletion manifest - {}", err),
        }

        let samples = sample::select_samples(&primary_keys, sample::DEFAULT_SAMPLE_RATE);
        if let Err(err) = sample::verify_samples(
            &self.pool,
            &self.store,
            table_ref,
            &archive_key.data_key(),
            &samples,
        )
        .await
        {
            log::warn!(
                "sample verification failed for batch {} (non-critical) - {:#}",
                batch_number,
                err
            );
            self.audit.record(
                AuditEvent::new(
                    AuditEventType::SampleVerificationFailure,
                    database,
                    table,
                    "sample_verification_failed",
                )
                .schema(&table_config.schema_name)
                .batch(batch_number)
                .error(format!("{:#}", err)),
            );
        }

        Ok(Some(BatchResult { record_count: memory_count, cursor: next_cursor }))
    }
}

fn is_transient_source_error(err: &Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<SourceError>()
            .map(SourceError::is_transient)
            .unwrap_or(false)
    })
}
