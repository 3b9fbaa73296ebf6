//! Cursor-ordered batch selection and the verify-then-delete statements.

use chrono::{DateTime, Utc};
use deadpool_postgres::{Client, Transaction};
use tokio_postgres::types::ToSql;

use relic_api_types::{Cursor, Row, Value};

use crate::row::{row_to_values, PkArray, SqlParam};
use crate::{quote_ident, quote_qualified, SourceError};

/// Identifies one archivable table together with its ordering columns.
#[derive(Clone, Debug)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
    pub timestamp_column: String,
    pub primary_key: String,
}

impl TableRef {
    pub fn qualified(&self) -> String {
        quote_qualified(&self.schema, &self.name)
    }

    fn ts(&self) -> String {
        quote_ident(&self.timestamp_column)
    }

    fn pk(&self) -> String {
        quote_ident(&self.primary_key)
    }
}

/// Build the batch selection statement. Rows are locked with
/// `FOR UPDATE SKIP LOCKED` so concurrent workers never select
/// overlapping rows while racing writers can proceed.
pub fn select_batch_sql(table: &TableRef, with_cursor: bool) -> String {
    if with_cursor {
        format!(
            "SELECT * FROM {table} \
             WHERE {ts} < $1 AND ({ts} > $2 OR ({ts} = $2 AND {pk} > $3)) \
             ORDER BY {ts}, {pk} LIMIT $4 FOR UPDATE SKIP LOCKED",
            table = table.qualified(),
            ts = table.ts(),
            pk = table.pk(),
        )
    } else {
        format!(
            "SELECT * FROM {table} WHERE {ts} < $1 \
             ORDER BY {ts}, {pk} LIMIT $2 FOR UPDATE SKIP LOCKED",
            table = table.qualified(),
            ts = table.ts(),
            pk = table.pk(),
        )
    }
}

fn timestamp_bind(ts: DateTime<Utc>, tz_aware: bool) -> Value {
    if tz_aware {
        Value::TimestampTz(ts)
    } else {
        Value::Timestamp(ts.naive_utc())
    }
}

/// Select the next batch inside the caller's transaction.
///
/// `cutoff` must already be expressed to match the timestamp column's
/// timezone awareness; the cursor is rebound the same way.
pub async fn select_batch(
    txn: &Transaction<'_>,
    table: &TableRef,
    cutoff: &Value,
    cursor: Option<&Cursor>,
    batch_size: u32,
    tz_aware: bool,
) -> Result<Vec<Row>, SourceError> {
    let sql = select_batch_sql(table, cursor.is_some());
    let limit = batch_size as i64;

    let rows = match cursor {
        Some(cursor) => {
            let last_ts = timestamp_bind(cursor.last_timestamp, tz_aware);
            let params: [&(dyn ToSql + Sync); 4] = [
                &SqlParam(cutoff),
                &SqlParam(&last_ts),
                &SqlParam(&cursor.last_primary_key),
                &limit,
            ];
            txn.query(&sql, &params).await?
        }
        None => {
            let params: [&(dyn ToSql + Sync); 2] = [&SqlParam(cutoff), &limit];
            txn.query(&sql, &params).await?
        }
    };

    rows.iter().map(row_to_values).collect()
}

/// Advisory-only count of rows eligible under the cutoff. Never gates
/// deletion.
pub async fn count_eligible(
    client: &Client,
    table: &TableRef,
    cutoff: &Value,
) -> Result<i64, SourceError> {
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE {} < $1",
        table.qualified(),
        table.ts(),
    );
    let row = client.query_one(&sql, &[&SqlParam(cutoff)]).await?;
    Ok(row.get::<_, i64>(0))
}

/// Count the rows matching the batch's primary keys, inside the batch
/// transaction. This is the count the verifier compares against.
pub async fn count_matching_pks(
    txn: &Transaction<'_>,
    table: &TableRef,
    pks: &PkArray,
) -> Result<i64, SourceError> {
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE {} = ANY($1)",
        table.qualified(),
        table.pk(),
    );
    let row = txn.query_one(&sql, &[pks.as_param()]).await?;
    Ok(row.get::<_, i64>(0))
}

/// Delete the batch rows; returns the affected row count. Runs in the
/// same transaction that selected (and locked) the rows.
pub async fn delete_by_pks(
    txn: &Transaction<'_>,
    table: &TableRef,
    pks: &PkArray,
) -> Result<u64, SourceError> {
    let sql = format!(
        "DELETE FROM {} WHERE {} = ANY($1)",
        table.qualified(),
        table.pk(),
    );
    Ok(txn.execute(&sql, &[pks.as_param()]).await?)
}

/// Count rows with the given keys outside any transaction; used by the
/// post-deletion sample verifier.
pub async fn count_pks(
    client: &Client,
    table: &TableRef,
    pks: &PkArray,
) -> Result<i64, SourceError> {
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE {} = ANY($1)",
        table.qualified(),
        table.pk(),
    );
    let row = client.query_one(&sql, &[pks.as_param()]).await?;
    Ok(row.get::<_, i64>(0))
}

#[cfg(test)]
mod test {
    use super::*;

    fn table() -> TableRef {
        TableRef {
            schema: "public".into(),
            name: "audit_logs".into(),
            timestamp_column: "created_at".into(),
            primary_key: "id".into(),
        }
    }

    #[test]
    fn first_batch_has_no_cursor_predicate() {
        let sql = select_batch_sql(&table(), false);
        assert_eq!(
            sql,
            "SELECT * FROM \"public\".\"audit_logs\" WHERE \"created_at\" < $1 \
             ORDER BY \"created_at\", \"id\" LIMIT $2 FOR UPDATE SKIP LOCKED"
        );
    }

    #[test]
    fn cursor_predicate_is_strictly_after() {
        let sql = select_batch_sql(&table(), true);
        assert!(sql.contains(
            "(\"created_at\" > $2 OR (\"created_at\" = $2 AND \"id\" > $3))"
        ));
        assert!(sql.ends_with("FOR UPDATE SKIP LOCKED"));
        assert!(sql.contains("ORDER BY \"created_at\", \"id\""));
    }
}
