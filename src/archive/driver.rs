//! Multi-target driver: runs the per-database archivers sequentially or
//! bounded-parallel and reduces their outcomes into one run summary.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use relic_api_types::RunStatus;
use relic_config::ArchiverConfig;
use relic_object_store::ObjectStore;

use crate::archive::orchestrator::DatabaseArchiver;
use crate::audit::AuditTrail;
use crate::shutdown::Shutdown;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Archived,
    Skipped,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableStats {
    pub table: String,
    pub schema: String,
    pub status: TableStatus,
    pub eligible: u64,
    pub records_archived_this_run: u64,
    /// Includes records carried over from a resumed checkpoint.
    pub records_archived_total: u64,
    pub batches_processed: u64,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TableStats {
    pub fn new(table: &str, schema: &str) -> Self {
        Self {
            table: table.to_string(),
            schema: schema.to_string(),
            status: TableStatus::Archived,
            eligible: 0,
            records_archived_this_run: 0,
            records_archived_total: 0,
            batches_processed: 0,
            duration_seconds: 0.0,
            skip_reason: None,
            error: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseStatus {
    Completed,
    Failed,
    /// Another live run holds the database lock; skipped with an
    /// explicit reason, other databases proceed.
    SkippedLockBusy,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub database: String,
    pub status: DatabaseStatus,
    pub tables_processed: u64,
    pub tables_failed: u64,
    pub tables_skipped: u64,
    pub records_archived: u64,
    pub batches_processed: u64,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub table_stats: Vec<TableStats>,
}

impl DatabaseStats {
    pub fn new(database: &str) -> Self {
        Self {
            database: database.to_string(),
            status: DatabaseStatus::Completed,
            tables_processed: 0,
            tables_failed: 0,
            tables_skipped: 0,
            records_archived: 0,
            batches_processed: 0,
            start_time: Utc::now(),
            end_time: None,
            error: None,
            table_stats: Vec::new(),
        }
    }

    pub fn add_table(&mut self, stats: TableStats) {
        match stats.status {
            TableStatus::Archived => self.tables_processed += 1,
            TableStatus::Skipped => self.tables_skipped += 1,
            TableStatus::Failed => self.tables_failed += 1,
        }
        self.records_archived += stats.records_archived_this_run;
        self.batches_processed += stats.batches_processed;
        self.table_stats.push(stats);
    }

    pub fn fail(&mut self, error: String) {
        log::error!("database '{}' failed - {}", self.database, error);
        self.status = DatabaseStatus::Failed;
        self.error = Some(error);
        self.finish();
    }

    pub fn finish(&mut self) {
        self.end_time = Some(Utc::now());
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub status: RunStatus,
    pub interrupted: bool,
    pub databases_processed: u64,
    pub databases_failed: u64,
    pub tables_processed: u64,
    pub tables_failed: u64,
    pub tables_skipped: u64,
    pub records_archived_this_run: u64,
    pub records_archived_total: u64,
    pub batches_processed: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub database_stats: Vec<DatabaseStats>,
}

impl RunSummary {
    pub fn elapsed_seconds(&self) -> f64 {
        (self.end_time - self.start_time).num_milliseconds() as f64 / 1000.0
    }
}

/// Reduce per-database outcomes into the run status: `success` iff no
/// database and no table failed, `failure` iff nothing succeeded,
/// `partial` otherwise.
pub fn summarize(
    start_time: DateTime<Utc>,
    interrupted: bool,
    database_stats: Vec<DatabaseStats>,
) -> RunSummary {
    let mut summary = RunSummary {
        status: RunStatus::Success,
        interrupted,
        databases_processed: 0,
        databases_failed: 0,
        tables_processed: 0,
        tables_failed: 0,
        tables_skipped: 0,
        records_archived_this_run: 0,
        records_archived_total: 0,
        batches_processed: 0,
        start_time,
        end_time: Utc::now(),
        database_stats: Vec::new(),
    };

    for stats in &database_stats {
        match stats.status {
            DatabaseStatus::Completed if stats.tables_failed == 0 => {
                summary.databases_processed += 1
            }
            DatabaseStatus::Completed => {
                summary.databases_processed += 1;
                // table failures surface through tables_failed below
            }
            DatabaseStatus::Failed | DatabaseStatus::SkippedLockBusy => {
                summary.databases_failed += 1
            }
        }
        summary.tables_processed += stats.tables_processed;
        summary.tables_failed += stats.tables_failed;
        summary.tables_skipped += stats.tables_skipped;
        summary.records_archived_this_run += stats.records_archived;
        summary.batches_processed += stats.batches_processed;
        summary.records_archived_total += stats
            .table_stats
            .iter()
            .map(|t| t.records_archived_total)
            .sum::<u64>();
    }

    let nothing_failed = summary.databases_failed == 0 && summary.tables_failed == 0;
    let anything_succeeded = summary.databases_processed > 0 || summary.tables_processed > 0;
    summary.status = if nothing_failed && !interrupted {
        RunStatus::Success
    } else if anything_succeeded {
        RunStatus::Partial
    } else {
        RunStatus::Failure
    };

    summary.database_stats = database_stats;
    summary
}

/// Run archival across every configured database.
pub async fn run_archival(
    config: Arc<ArchiverConfig>,
    store: Arc<ObjectStore>,
    audit: Arc<AuditTrail>,
    shutdown: Shutdown,
    dry_run: bool,
) -> RunSummary {
    let start_time = Utc::now();
    log::info!(
        "starting archival run {} ({} databases{})",
        audit.run_id(),
        config.databases.len(),
        if dry_run { ", dry-run" } else { "" }
    );

    let mut database_stats = Vec::new();

    if config.defaults.parallel_databases && config.databases.len() > 1 {
        let limit = config.defaults.max_parallel_databases as usize;
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut tasks = JoinSet::new();

        for db_config in config.databases.clone() {
            let config = Arc::clone(&config);
            let store = Arc::clone(&store);
            let audit = Arc::clone(&audit);
            let shutdown = shutdown.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                archive_one_database(config, db_config, store, audit, shutdown, dry_run).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(stats) => database_stats.push(stats),
                Err(err) => log::error!("database task panicked - {}", err),
            }
        }
    } else {
        for db_config in config.databases.clone() {
            if shutdown.is_cancelled() {
                break;
            }
            let stats = archive_one_database(
                Arc::clone(&config),
                db_config,
                Arc::clone(&store),
                Arc::clone(&audit),
                shutdown.clone(),
                dry_run,
            )
            .await;
            database_stats.push(stats);
        }
    }

    let summary = summarize(start_time, shutdown.is_cancelled(), database_stats);
    log::info!(
        "archival run finished: status={} databases={}/{} tables={}/{} records={} elapsed={:.1}s",
        summary.status,
        summary.databases_processed,
        summary.databases_processed + summary.databases_failed,
        summary.tables_processed,
        summary.tables_processed + summary.tables_failed + summary.tables_skipped,
        summary.records_archived_this_run,
        summary.elapsed_seconds(),
    );
    summary
}

async fn archive_one_database(
    config: Arc<ArchiverConfig>,
    db_config: relic_config::DatabaseConfig,
    store: Arc<ObjectStore>,
    audit: Arc<AuditTrail>,
    shutdown: Shutdown,
    dry_run: bool,
) -> DatabaseStats {
    let database = db_config.name.clone();
    match DatabaseArchiver::new(config, db_config, store, audit, shutdown, dry_run) {
        Ok(archiver) => archiver.run().await,
        Err(err) => {
            let mut stats = DatabaseStats::new(&database);
            stats.fail(format!("{:#}", err));
            stats
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn db(status: DatabaseStatus, processed: u64, failed: u64) -> DatabaseStats {
        let mut stats = DatabaseStats::new("app");
        stats.status = status;
        stats.tables_processed = processed;
        stats.tables_failed = failed;
        stats
    }

    #[test]
    fn all_clean_is_success() {
        let summary = summarize(Utc::now(), false, vec![db(DatabaseStatus::Completed, 3, 0)]);
        assert_eq!(summary.status, RunStatus::Success);
    }

    #[test]
    fn mixed_outcomes_are_partial() {
        let summary = summarize(
            Utc::now(),
            false,
            vec![
                db(DatabaseStatus::Completed, 2, 0),
                db(DatabaseStatus::Failed, 0, 0),
            ],
        );
        assert_eq!(summary.status, RunStatus::Partial);

        let summary = summarize(Utc::now(), false, vec![db(DatabaseStatus::Completed, 2, 1)]);
        assert_eq!(summary.status, RunStatus::Partial);
    }

    #[test]
    fn nothing_succeeding_is_failure() {
        let summary = summarize(
            Utc::now(),
            false,
            vec![
                db(DatabaseStatus::Failed, 0, 0),
                db(DatabaseStatus::SkippedLockBusy, 0, 0),
            ],
        );
        assert_eq!(summary.status, RunStatus::Failure);
    }

    #[test]
    fn skipped_tables_do_not_fail_the_run() {
        let mut stats = db(DatabaseStatus::Completed, 1, 0);
        stats.tables_skipped = 2;
        let summary = summarize(Utc::now(), false, vec![stats]);
        assert_eq!(summary.status, RunStatus::Success);
        assert_eq!(summary.tables_skipped, 2);
    }

    #[test]
    fn interruption_downgrades_success() {
        let summary = summarize(Utc::now(), true, vec![db(DatabaseStatus::Completed, 1, 0)]);
        assert_eq!(summary.status, RunStatus::Partial);
        assert!(summary.interrupted);
    }
}
