//! Restore-side bulk inserts, conflict probing, and index management.

use anyhow::format_err;
use deadpool_postgres::{Client, Transaction};
use tokio_postgres::types::ToSql;

use relic_api_types::{ConflictStrategy, Value, VacuumStrategy};

use crate::row::{PkArray, SqlParam};
use crate::{quote_ident, quote_qualified, SourceError};

/// Build the insert statement for one conflict strategy. Overwrite and
/// upsert need the primary key column as the conflict target.
pub fn insert_sql(
    schema: &str,
    table: &str,
    columns: &[String],
    strategy: ConflictStrategy,
    primary_key: Option<&str>,
) -> Result<String, SourceError> {
    let target = quote_qualified(schema, table);
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=columns.len())
        .map(|i| format!("${}", i))
        .collect::<Vec<_>>()
        .join(", ");

    let sql = match strategy {
        ConflictStrategy::Fail => format!(
            "INSERT INTO {} ({}) VALUES ({})",
            target, column_list, placeholders
        ),
        ConflictStrategy::Skip => format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT DO NOTHING",
            target, column_list, placeholders
        ),
        ConflictStrategy::Overwrite | ConflictStrategy::Upsert => {
            let pk = primary_key.ok_or_else(|| {
                SourceError::Other(format_err!(
                    "conflict strategy '{}' requires a primary key on {}.{}",
                    strategy,
                    schema,
                    table
                ))
            })?;
            let update_clause = columns
                .iter()
                .filter(|c| c.as_str() != pk)
                .map(|c| format!("{col} = EXCLUDED.{col}", col = quote_ident(c)))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {}",
                target,
                column_list,
                placeholders,
                quote_ident(pk),
                update_clause
            )
        }
    };
    Ok(sql)
}

/// Insert a slice of prepared rows through one prepared statement;
/// returns the number of rows actually written (skipped conflicts do not
/// count).
pub async fn insert_rows(
    txn: &Transaction<'_>,
    sql: &str,
    rows: &[Vec<Value>],
) -> Result<u64, SourceError> {
    let statement = txn.prepare(sql).await?;
    let mut written = 0;
    for row in rows {
        let params: Vec<SqlParam> = row.iter().map(SqlParam).collect();
        let param_refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        written += txn.execute(&statement, &param_refs).await?;
    }
    Ok(written)
}

/// Primary keys (as text) that already exist in the target table.
pub async fn existing_pks(
    client: &Client,
    schema: &str,
    table: &str,
    primary_key: &str,
    pks: &PkArray,
) -> Result<Vec<String>, SourceError> {
    let sql = format!(
        "SELECT {pk}::text FROM {} WHERE {pk} = ANY($1)",
        quote_qualified(schema, table),
        pk = quote_ident(primary_key),
    );
    let rows = client.query(&sql, &[pks.as_param()]).await?;
    Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
}

/// A droppable index with enough DDL to recreate it.
#[derive(Clone, Debug)]
pub struct IndexDdl {
    pub name: String,
    pub definition: String,
}

pub async fn list_non_pk_indexes(
    client: &Client,
    schema: &str,
    table: &str,
) -> Result<Vec<IndexDdl>, SourceError> {
    let rows = client
        .query(
            "SELECT indexname, indexdef FROM pg_indexes \
             WHERE schemaname = $1 AND tablename = $2 \
               AND indexname NOT LIKE '%_pkey'",
            &[&schema, &table],
        )
        .await?;
    Ok(rows
        .iter()
        .map(|row| IndexDdl {
            name: row.get("indexname"),
            definition: row.get("indexdef"),
        })
        .collect())
}

pub async fn drop_index(client: &Client, schema: &str, name: &str) -> Result<(), SourceError> {
    let sql = format!("DROP INDEX IF EXISTS {}", quote_qualified(schema, name));
    client.batch_execute(&sql).await?;
    Ok(())
}

pub async fn execute_ddl(client: &Client, ddl: &str) -> Result<(), SourceError> {
    client.batch_execute(ddl).await?;
    Ok(())
}

/// Post-archival maintenance. VACUUM cannot run inside a transaction, so
/// this always uses a plain client.
pub async fn vacuum_table(
    client: &Client,
    strategy: VacuumStrategy,
    schema: &str,
    table: &str,
) -> Result<(), SourceError> {
    let target = quote_qualified(schema, table);
    let sql = match strategy {
        VacuumStrategy::None => return Ok(()),
        VacuumStrategy::Analyze => format!("ANALYZE {}", target),
        VacuumStrategy::Standard => format!("VACUUM (ANALYZE) {}", target),
        VacuumStrategy::Full => format!("VACUUM (FULL, ANALYZE) {}", target),
    };
    client.batch_execute(&sql).await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn cols() -> Vec<String> {
        vec!["id".into(), "action".into(), "created_at".into()]
    }

    #[test]
    fn skip_uses_do_nothing() {
        let sql = insert_sql("public", "t", &cols(), ConflictStrategy::Skip, Some("id")).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"t\" (\"id\", \"action\", \"created_at\") \
             VALUES ($1, $2, $3) ON CONFLICT DO NOTHING"
        );
    }

    #[test]
    fn upsert_updates_all_non_pk_columns() {
        let sql = insert_sql("public", "t", &cols(), ConflictStrategy::Upsert, Some("id")).unwrap();
        assert!(sql.contains("ON CONFLICT (\"id\") DO UPDATE SET"));
        assert!(sql.contains("\"action\" = EXCLUDED.\"action\""));
        assert!(sql.contains("\"created_at\" = EXCLUDED.\"created_at\""));
        assert!(!sql.contains("\"id\" = EXCLUDED.\"id\""));
    }

    #[test]
    fn fail_is_a_plain_insert() {
        let sql = insert_sql("public", "t", &cols(), ConflictStrategy::Fail, None).unwrap();
        assert!(!sql.contains("ON CONFLICT"));
    }

    #[test]
    fn overwrite_without_pk_is_an_error() {
        assert!(insert_sql("public", "t", &cols(), ConflictStrategy::Overwrite, None).is_err());
    }
}
