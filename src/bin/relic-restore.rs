//! Restore binary: lists archives and loads them back into the source
//! database.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, format_err, Error};
use chrono::NaiveDate;
use clap::Parser;

use relic_api_types::{table_prefix, ArchiveKey, ConflictStrategy, MigrationStrategy,
    RestoreWatermarkStorageKind};
use relic_archiver::audit::{AuditEvent, AuditEventType, AuditTrail};
use relic_archiver::logging;
use relic_archiver::restore::{RestoreEngine, RestoreOptions};
use relic_archiver::validate::validate_prefix;
use relic_config::{ArchiverConfig, DatabaseConfig};
use relic_datastore::{
    BothRestoreWatermarkStore, DatabaseRestoreWatermarkStore, ObjectRestoreWatermarkStore,
    RestoreWatermarkStore,
};
use relic_object_store::ObjectStore;
use relic_source::SourcePool;

#[derive(Parser)]
#[command(name = "relic-restore", version, about = "Restore archived batches into the database")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Restore a single archive by its data key.
    #[arg(long, conflicts_with = "restore_all")]
    s3_key: Option<String>,

    /// Restore every matching archive of --database/--table. Without
    /// this (and without --s3-key) matching archives are only listed.
    #[arg(long)]
    restore_all: bool,

    /// Run an offline integrity check over the matching archives
    /// instead of restoring them.
    #[arg(long, conflicts_with_all = ["restore_all", "s3_key"])]
    validate: bool,

    #[arg(long)]
    database: Option<String>,

    #[arg(long)]
    table: Option<String>,

    /// Target schema override (defaults to the archived schema).
    #[arg(long)]
    schema: Option<String>,

    /// skip | overwrite | upsert | fail
    #[arg(long, default_value = "skip")]
    conflict_strategy: String,

    /// strict | lenient | transform | none
    #[arg(long, default_value = "lenient")]
    schema_migration_strategy: String,

    #[arg(long, default_value_t = 1000)]
    batch_size: usize,

    /// Commit every N insert batches.
    #[arg(long, default_value_t = 1)]
    commit_frequency: usize,

    /// Drop non-primary-key indexes during the restore and recreate
    /// them afterwards.
    #[arg(long)]
    drop_indexes: bool,

    #[arg(long)]
    no_validate_checksum: bool,

    #[arg(long)]
    no_detect_conflicts: bool,

    #[arg(long)]
    dry_run: bool,

    /// Process archives even if the restore watermark says they were
    /// already restored.
    #[arg(long)]
    ignore_watermark: bool,

    /// Partition-date window start (YYYY-MM-DD, inclusive).
    #[arg(long)]
    start_date: Option<NaiveDate>,

    /// Partition-date window end (YYYY-MM-DD, inclusive).
    #[arg(long)]
    end_date: Option<NaiveDate>,

    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format ('console' or 'json').
    #[arg(long, default_value = "console")]
    log_format: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let code = tokio::select! {
        result = run(args) => match result {
            Ok(code) => code,
            Err(err) => {
                eprintln!("Error: {:#}", err);
                1
            }
        },
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted");
            130
        }
    };
    std::process::exit(code);
}

fn select_database<'a>(
    config: &'a ArchiverConfig,
    name: Option<&str>,
) -> Result<&'a DatabaseConfig, Error> {
    match name {
        Some(name) => config
            .databases
            .iter()
            .find(|db| db.name == name)
            .ok_or_else(|| format_err!("database '{}' not found in configuration", name)),
        None if config.databases.len() == 1 => Ok(&config.databases[0]),
        None => bail!("--database is required when the configuration lists several databases"),
    }
}

fn watermark_store(
    config: &ArchiverConfig,
    store: &Arc<ObjectStore>,
    pool: &Arc<SourcePool>,
) -> Option<Box<dyn RestoreWatermarkStore>> {
    if !config.restore_watermark.enabled {
        return None;
    }
    Some(match config.restore_watermark.storage_type {
        RestoreWatermarkStorageKind::S3 => {
            Box::new(ObjectRestoreWatermarkStore::new(Arc::clone(store)))
        }
        RestoreWatermarkStorageKind::Database => {
            Box::new(DatabaseRestoreWatermarkStore::new(Arc::clone(pool)))
        }
        RestoreWatermarkStorageKind::Both => {
            Box::new(BothRestoreWatermarkStore::new(Arc::clone(store), Arc::clone(pool)))
        }
    })
}

async fn run(args: Args) -> Result<i32, Error> {
    logging::init(&args.log_level, args.log_format.parse()?)?;

    let config = relic_config::load_config(&args.config)?;
    let store = Arc::new(ObjectStore::new(&config.s3).await?);

    let options = RestoreOptions {
        conflict_strategy: args
            .conflict_strategy
            .parse::<ConflictStrategy>()
            .map_err(|_| format_err!("invalid conflict strategy '{}'", args.conflict_strategy))?,
        migration_strategy: args
            .schema_migration_strategy
            .parse::<MigrationStrategy>()
            .map_err(|_| {
                format_err!(
                    "invalid schema migration strategy '{}'",
                    args.schema_migration_strategy
                )
            })?,
        batch_size: args.batch_size,
        commit_frequency: args.commit_frequency,
        drop_indexes: args.drop_indexes,
        validate_checksum: !args.no_validate_checksum,
        detect_conflicts: !args.no_detect_conflicts,
        dry_run: args.dry_run,
        ignore_watermark: args.ignore_watermark,
        table: args.table.clone(),
        schema: args.schema.clone(),
        start_date: args.start_date,
        end_date: args.end_date,
    };

    if let Some(key) = &args.s3_key {
        // single-archive mode; the key itself names database and table
        let parsed = ArchiveKey::parse(key).ok();
        let database_name = args
            .database
            .clone()
            .or_else(|| parsed.as_ref().map(|k| k.database.clone()));
        let db_config = select_database(&config, database_name.as_deref())?;
        let pool = Arc::new(SourcePool::new(db_config, config.pool_size(db_config))?);
        let watermarks = watermark_store(&config, &store, &pool);
        let engine = RestoreEngine::new(
            pool,
            Arc::clone(&store),
            watermarks,
            config.restore_watermark.update_after_each_archive,
        );

        let stats = engine.restore_single(key, &options).await?;
        println!("Restore summary for {}", key);
        println!("  processed: {}", stats.records_processed);
        println!("  restored:  {}", stats.records_restored);
        println!(
            "  skipped:   {}{}",
            stats.records_skipped,
            stats
                .skip_reason
                .as_ref()
                .map(|r| format!(" ({})", r))
                .unwrap_or_default()
        );
        println!("  failed:    {}", stats.records_failed);
        println!("  conflicts: {}", stats.conflicts_detected);
        return Ok(if stats.records_failed == 0 { 0 } else { 1 });
    }

    let db_config = select_database(&config, args.database.as_deref())?;
    let table = args
        .table
        .clone()
        .ok_or_else(|| format_err!("--table is required without --s3-key"))?;

    if args.validate {
        let report =
            validate_prefix(&store, &table_prefix(&db_config.name, &table)).await?;
        print!("{}", report);
        return Ok(if report.is_valid() { 0 } else { 1 });
    }

    if !args.restore_all {
        // list mode
        let keys = store
            .list_archives(
                &table_prefix(&db_config.name, &table),
                args.start_date,
                args.end_date,
            )
            .await?;
        if keys.is_empty() {
            println!("No archives found for {}.{}", db_config.name, table);
        } else {
            println!("Archives for {}.{}:", db_config.name, table);
            for key in &keys {
                println!("  {}", key);
            }
            println!("{} archive(s); pass --restore-all to restore them", keys.len());
        }
        return Ok(0);
    }

    let pool = Arc::new(SourcePool::new(db_config, config.pool_size(db_config))?);
    let watermarks = watermark_store(&config, &store, &pool);
    let engine = RestoreEngine::new(
        pool,
        Arc::clone(&store),
        watermarks,
        config.restore_watermark.update_after_each_archive,
    );

    let audit = AuditTrail::new(config.defaults.audit_trail_storage_type);
    audit.record(AuditEvent::new(
        AuditEventType::RestoreStart,
        &db_config.name,
        &table,
        "started",
    ));
    let started = std::time::Instant::now();
    let result = engine.restore_table(&db_config.name, &table, &options).await;
    let duration = started.elapsed().as_secs_f64();
    match &result {
        Ok(summary) if summary.files_failed == 0 => audit.record(
            AuditEvent::new(AuditEventType::RestoreSuccess, &db_config.name, &table, "success")
                .records(summary.records_restored)
                .duration(duration),
        ),
        Ok(summary) => audit.record(
            AuditEvent::new(AuditEventType::RestoreFailure, &db_config.name, &table, "partial")
                .records(summary.records_restored)
                .duration(duration)
                .error(format!("{} file(s) failed", summary.files_failed)),
        ),
        Err(err) => audit.record(
            AuditEvent::new(AuditEventType::RestoreFailure, &db_config.name, &table, "failed")
                .duration(duration)
                .error(format!("{:#}", err)),
        ),
    }
    audit.flush(&store).await;
    let summary = result?;

    println!("Restore summary for {}.{}", db_config.name, table);
    println!(
        "  files:     {} processed, {} failed, {} skipped by watermark",
        summary.files_processed, summary.files_failed, summary.files_skipped
    );
    println!("  records:   {} processed", summary.records_processed);
    println!("  restored:  {}", summary.records_restored);
    println!("  skipped:   {}", summary.records_skipped);
    println!("  failed:    {}", summary.records_failed);
    println!("  conflicts: {}", summary.conflicts_detected);
    for error in &summary.errors {
        println!("  error: {}", error);
    }

    Ok(if summary.files_failed == 0 && summary.records_failed == 0 {
        0
    } else {
        1
    })
}
