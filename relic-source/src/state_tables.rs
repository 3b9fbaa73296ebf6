//! Reserved archiver tables inside the source database, used when the
//! watermark backends are configured as `database`.

use chrono::{DateTime, Utc};
use deadpool_postgres::Client;

use relic_api_types::{RestoreWatermark, Watermark, RESTORE_WATERMARK_VERSION, WATERMARK_VERSION};

use crate::SourceError;

const UNDEFINED_TABLE: &str = "42P01";

fn is_undefined_table(err: &tokio_postgres::Error) -> bool {
    err.code().map(|code| code.code()) == Some(UNDEFINED_TABLE)
}

pub async fn ensure_watermark_table(client: &Client) -> Result<(), SourceError> {
    client
        .batch_execute(
            "CREATE TABLE IF NOT EXISTS archiver_watermarks ( \
                 database_name TEXT NOT NULL, \
                 table_name TEXT NOT NULL, \
                 last_timestamp TIMESTAMPTZ NOT NULL, \
                 last_primary_key TEXT, \
                 updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
                 PRIMARY KEY (database_name, table_name) \
             )",
        )
        .await?;
    Ok(())
}

pub async fn load_watermark(
    client: &Client,
    database: &str,
    table: &str,
) -> Result<Option<Watermark>, SourceError> {
    let result = client
        .query_opt(
            "SELECT last_timestamp, last_primary_key, updated_at \
             FROM archiver_watermarks WHERE database_name = $1 AND table_name = $2",
            &[&database, &table],
        )
        .await;
    let row = match result {
        Ok(row) => row,
        // table not created yet, treated as first run
        Err(err) if is_undefined_table(&err) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    Ok(row.map(|row| Watermark {
        version: WATERMARK_VERSION.to_string(),
        database: database.to_string(),
        table: table.to_string(),
        last_timestamp: row.get("last_timestamp"),
        last_primary_key: row
            .get::<_, Option<String>>("last_primary_key")
            .unwrap_or_default(),
        updated_at: row.get("updated_at"),
    }))
}

pub async fn save_watermark(client: &Client, watermark: &Watermark) -> Result<(), SourceError> {
    ensure_watermark_table(client).await?;
    client
        .execute(
            "INSERT INTO archiver_watermarks \
                 (database_name, table_name, last_timestamp, last_primary_key, updated_at) \
             VALUES ($1, $2, $3, $4, NOW()) \
             ON CONFLICT (database_name, table_name) DO UPDATE SET \
                 last_timestamp = EXCLUDED.last_timestamp, \
                 last_primary_key = EXCLUDED.last_primary_key, \
                 updated_at = NOW()",
            &[
                &watermark.database,
                &watermark.table,
                &watermark.last_timestamp,
                &watermark.last_primary_key,
            ],
        )
        .await?;
    Ok(())
}

pub async fn ensure_restore_watermark_table(client: &Client) -> Result<(), SourceError> {
    client
        .batch_execute(
            "CREATE TABLE IF NOT EXISTS archiver_restore_watermarks ( \
                 database_name TEXT NOT NULL, \
                 table_name TEXT NOT NULL, \
                 last_restored_date TIMESTAMPTZ NOT NULL, \
                 last_restored_s3_key TEXT NOT NULL, \
                 total_archives_restored BIGINT NOT NULL DEFAULT 0, \
                 updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
                 PRIMARY KEY (database_name, table_name) \
             )",
        )
        .await?;
    Ok(())
}

pub async fn load_restore_watermark(
    client: &Client,
    database: &str,
    table: &str,
) -> Result<Option<RestoreWatermark>, SourceError> {
    let result = client
        .query_opt(
            "SELECT last_restored_date, last_restored_s3_key, \
                    total_archives_restored, updated_at \
             FROM archiver_restore_watermarks \
             WHERE database_name = $1 AND table_name = $2",
            &[&database, &table],
        )
        .await;
    let row = match result {
        Ok(row) => row,
        Err(err) if is_undefined_table(&err) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    Ok(row.map(|row| RestoreWatermark {
        version: RESTORE_WATERMARK_VERSION.to_string(),
        database: database.to_string(),
        table: table.to_string(),
        last_restored_date: row.get::<_, DateTime<Utc>>("last_restored_date"),
        last_restored_s3_key: row.get("last_restored_s3_key"),
        total_archives_restored: row.get::<_, i64>("total_archives_restored") as u64,
        updated_at: row.get("updated_at"),
    }))
}

pub async fn save_restore_watermark(
    client: &Client,
    watermark: &RestoreWatermark,
) -> Result<(), SourceError> {
    ensure_restore_watermark_table(client).await?;
    client
        .execute(
            "INSERT INTO archiver_restore_watermarks \
                 (database_name, table_name, last_restored_date, last_restored_s3_key, \
                  total_archives_restored, updated_at) \
             VALUES ($1, $2, $3, $4, $5, NOW()) \
             ON CONFLICT (database_name, table_name) DO UPDATE SET \
                 last_restored_date = EXCLUDED.last_restored_date, \
                 last_restored_s3_key = EXCLUDED.last_restored_s3_key, \
                 total_archives_restored = EXCLUDED.total_archives_restored, \
                 updated_at = NOW()",
            &[
                &watermark.database,
                &watermark.table,
                &watermark.last_restored_date,
                &watermark.last_restored_s3_key,
                &(watermark.total_archives_restored as i64),
            ],
        )
        .await?;
    Ok(())
}
