//! Schema introspection against `information_schema` and `pg_catalog`.

use deadpool_postgres::Client;

use relic_api_types::{
    CheckConstraintInfo, ColumnInfo, ForeignKeyInfo, IndexInfo, PrimaryKeyInfo, TableSchema,
    UniqueConstraintInfo,
};

use crate::SourceError;

/// Whether the timestamp column is `TIMESTAMPTZ`. On lookup failure the
/// caller should assume timezone-naive, which is the safer binding.
pub async fn timestamp_column_is_tz_aware(
    client: &Client,
    schema: &str,
    table: &str,
    column: &str,
) -> Result<bool, SourceError> {
    let row = client
        .query_opt(
            "SELECT data_type FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 AND column_name = $3",
            &[&schema, &table, &column],
        )
        .await?;
    Ok(match row {
        Some(row) => row.get::<_, String>(0) == "timestamp with time zone",
        None => false,
    })
}

/// Introspect the complete normalized shape of a table.
pub async fn detect_table_schema(
    client: &Client,
    schema: &str,
    table: &str,
) -> Result<TableSchema, SourceError> {
    Ok(TableSchema {
        table_name: table.to_string(),
        schema_name: schema.to_string(),
        columns: get_columns(client, schema, table).await?,
        primary_key: get_primary_key(client, schema, table).await?,
        foreign_keys: get_foreign_keys(client, schema, table).await?,
        indexes: get_indexes(client, schema, table).await?,
        check_constraints: get_check_constraints(client, schema, table).await?,
        unique_constraints: get_unique_constraints(client, schema, table).await?,
    })
}

async fn get_columns(
    client: &Client,
    schema: &str,
    table: &str,
) -> Result<Vec<ColumnInfo>, SourceError> {
    let rows = client
        .query(
            "SELECT c.column_name, c.data_type, c.udt_name, \
                    c.character_maximum_length, c.numeric_precision, c.numeric_scale, \
                    c.is_nullable, c.column_default, c.ordinal_position \
             FROM information_schema.columns c \
             WHERE c.table_schema = $1 AND c.table_name = $2 \
             ORDER BY c.ordinal_position",
            &[&schema, &table],
        )
        .await?;

    Ok(rows
        .iter()
        .map(|row| ColumnInfo {
            name: row.get("column_name"),
            data_type: row.get("data_type"),
            udt_name: row.get("udt_name"),
            character_maximum_length: row.get("character_maximum_length"),
            numeric_precision: row.get("numeric_precision"),
            numeric_scale: row.get("numeric_scale"),
            is_nullable: row.get::<_, String>("is_nullable") == "YES",
            default: row.get("column_default"),
            ordinal_position: row.get("ordinal_position"),
        })
        .collect())
}

async fn get_primary_key(
    client: &Client,
    schema: &str,
    table: &str,
) -> Result<Option<PrimaryKeyInfo>, SourceError> {
    let row = client
        .query_opt(
            "SELECT tc.constraint_name, \
                    array_agg(kcu.column_name ORDER BY kcu.ordinal_position) AS columns \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON tc.constraint_name = kcu.constraint_name \
              AND tc.table_schema = kcu.table_schema \
              AND tc.table_name = kcu.table_name \
             WHERE tc.table_schema = $1 AND tc.table_name = $2 \
               AND tc.constraint_type = 'PRIMARY KEY' \
             GROUP BY tc.constraint_name",
            &[&schema, &table],
        )
        .await?;

    Ok(row.map(|row| PrimaryKeyInfo {
        constraint_name: row.get("constraint_name"),
        columns: row.get("columns"),
    }))
}

async fn get_foreign_keys(
    client: &Client,
    schema: &str,
    table: &str,
) -> Result<Vec<ForeignKeyInfo>, SourceError> {
    let rows = client
        .query(
            "SELECT tc.constraint_name, kcu.column_name, \
                    ccu.table_schema AS foreign_table_schema, \
                    ccu.table_name AS foreign_table_name, \
                    ccu.column_name AS foreign_column_name \
             FROM information_schema.table_constraints AS tc \
             JOIN information_schema.key_column_usage AS kcu \
               ON tc.constraint_name = kcu.constraint_name \
              AND tc.table_schema = kcu.table_schema \
             JOIN information_schema.constraint_column_usage AS ccu \
               ON ccu.constraint_name = tc.constraint_name \
              AND ccu.table_schema = tc.table_schema \
             WHERE tc.constraint_type = 'FOREIGN KEY' \
               AND tc.table_schema = $1 AND tc.table_name = $2 \
             ORDER BY tc.constraint_name, kcu.ordinal_position",
            &[&schema, &table],
        )
        .await?;

    let mut result: Vec<ForeignKeyInfo> = Vec::new();
    for row in rows {
        let constraint_name: String = row.get("constraint_name");
        let column: String = row.get("column_name");
        let referenced_column: String = row.get("foreign_column_name");
        match result.iter_mut().find(|fk| fk.constraint_name == constraint_name) {
            Some(fk) => {
                fk.columns.push(column);
                fk.referenced_columns.push(referenced_column);
            }
            None => result.push(ForeignKeyInfo {
                constraint_name,
                columns: vec![column],
                referenced_schema: row.get("foreign_table_schema"),
                referenced_table: row.get("foreign_table_name"),
                referenced_columns: vec![referenced_column],
            }),
        }
    }
    Ok(result)
}

async fn get_indexes(
    client: &Client,
    schema: &str,
    table: &str,
) -> Result<Vec<IndexInfo>, SourceError> {
    let rows = client
        .query(
            "SELECT i.indexname, i.indexdef, \
                    array_agg(a.attname ORDER BY array_position(ix.indkey, a.attnum)) AS columns, \
                    ix.indisunique \
             FROM pg_indexes i \
             JOIN pg_class c ON c.relname = i.indexname \
             JOIN pg_index ix ON ix.indexrelid = c.oid \
             JOIN pg_class t ON t.oid = ix.indrelid \
             JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey) \
             WHERE i.schemaname = $1 AND i.tablename = $2 AND NOT ix.indisprimary \
             GROUP BY i.indexname, i.indexdef, ix.indisunique \
             ORDER BY i.indexname",
            &[&schema, &table],
        )
        .await?;

    Ok(rows
        .iter()
        .map(|row| IndexInfo {
            name: row.get("indexname"),
            definition: row.get("indexdef"),
            columns: row.get("columns"),
            is_unique: row.get("indisunique"),
        })
        .collect())
}

async fn get_check_constraints(
    client: &Client,
    schema: &str,
    table: &str,
) -> Result<Vec<CheckConstraintInfo>, SourceError> {
    let rows = client
        .query(
            "SELECT cc.constraint_name, cc.check_clause \
             FROM information_schema.check_constraints cc \
             WHERE cc.constraint_name IN ( \
                 SELECT constraint_name FROM information_schema.table_constraints \
                 WHERE table_schema = $1 AND table_name = $2 AND constraint_type = 'CHECK')",
            &[&schema, &table],
        )
        .await?;

    Ok(rows
        .iter()
        .map(|row| CheckConstraintInfo {
            constraint_name: row.get("constraint_name"),
            check_clause: row.get("check_clause"),
        })
        .collect())
}

async fn get_unique_constraints(
    client: &Client,
    schema: &str,
    table: &str,
) -> Result<Vec<UniqueConstraintInfo>, SourceError> {
    let rows = client
        .query(
            "SELECT tc.constraint_name, \
                    array_agg(kcu.column_name ORDER BY kcu.ordinal_position) AS columns \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON tc.constraint_name = kcu.constraint_name \
              AND tc.table_schema = kcu.table_schema \
              AND tc.table_name = kcu.table_name \
             WHERE tc.table_schema = $1 AND tc.table_name = $2 \
               AND tc.constraint_type = 'UNIQUE' \
             GROUP BY tc.constraint_name",
            &[&schema, &table],
        )
        .await?;

    Ok(rows
        .iter()
        .map(|row| UniqueConstraintInfo {
            constraint_name: row.get("constraint_name"),
            columns: row.get("columns"),
        })
        .collect())
}
