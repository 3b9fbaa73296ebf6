//! Schema reconciliation between an archived batch and the live table.

use anyhow::{bail, Error};
use serde_json::Value as Json;

use relic_api_types::{ColumnInfo, MigrationStrategy, TableSchema};
use relic_datastore::JsonRecord;

#[derive(Clone, Debug, PartialEq)]
pub struct TypeChange {
    pub column: String,
    pub archived_type: String,
    pub current_type: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NullableChange {
    pub column: String,
    pub archived_nullable: bool,
    pub current_nullable: bool,
    pub current_type: String,
}

/// Differences between the archived schema and the current table.
#[derive(Clone, Debug, Default)]
pub struct SchemaDiff {
    /// Present in the current table but not in the archive.
    pub added_columns: Vec<ColumnInfo>,
    /// Present in the archive but gone from the table.
    pub removed_columns: Vec<ColumnInfo>,
    pub type_changes: Vec<TypeChange>,
    pub nullable_changes: Vec<NullableChange>,
}

impl SchemaDiff {
    pub fn has_changes(&self) -> bool {
        !self.added_columns.is_empty()
            || !self.removed_columns.is_empty()
            || !self.type_changes.is_empty()
            || !self.nullable_changes.is_empty()
    }

    pub fn report(&self) -> String {
        let mut lines = Vec::new();
        for column in &self.added_columns {
            lines.push(format!("+ {} ({})", column.name, column.data_type));
        }
        for column in &self.removed_columns {
            lines.push(format!("- {} ({})", column.name, column.data_type));
        }
        for change in &self.type_changes {
            lines.push(format!(
                "~ {}: {} -> {}",
                change.column, change.archived_type, change.current_type
            ));
        }
        for change in &self.nullable_changes {
            lines.push(format!(
                "~ {}: nullable {} -> {}",
                change.column, change.archived_nullable, change.current_nullable
            ));
        }
        lines.join(", ")
    }
}

pub fn compare_schemas(archived: &TableSchema, current: &TableSchema) -> SchemaDiff {
    let mut diff = SchemaDiff::default();

    for column in &current.columns {
        match archived.column(&column.name) {
            None => diff.added_columns.push(column.clone()),
            Some(previous) => {
                if previous.data_type != column.data_type {
                    diff.type_changes.push(TypeChange {
                        column: column.name.clone(),
                        archived_type: previous.data_type.clone(),
                        current_type: column.data_type.clone(),
                    });
                }
                if previous.is_nullable != column.is_nullable {
                    diff.nullable_changes.push(NullableChange {
                        column: column.name.clone(),
                        archived_nullable: previous.is_nullable,
                        current_nullable: column.is_nullable,
                        current_type: column.data_type.clone(),
                    });
                }
            }
        }
    }
    for column in &archived.columns {
        if current.column(&column.name).is_none() {
            diff.removed_columns.push(column.clone());
        }
    }
    diff
}

/// Type-appropriate filler for a non-nullable column that has no value.
pub fn default_for_type(data_type: &str) -> Json {
    let ty = data_type.to_uppercase();
    if ty.contains("INT") || ty.contains("SERIAL") {
        Json::from(0)
    } else if ty.contains("FLOAT") || ty.contains("DOUBLE") || ty.contains("REAL")
        || ty.contains("NUMERIC") || ty.contains("DECIMAL")
    {
        Json::from(0.0)
    } else if ty.contains("BOOL") {
        Json::Bool(false)
    } else if ty.contains("TIMESTAMP") || ty.contains("DATE") {
        Json::Null
    } else if ty.contains("JSON") {
        Json::Object(Default::default())
    } else if ty.contains("ARRAY") || ty.starts_with('_') {
        Json::Array(Default::default())
    } else {
        Json::String(String::new())
    }
}

/// Coerce a value across compatible type families. Numeric to numeric,
/// anything to text, string to json. Incompatible pairs are returned
/// unchanged; parse failures are errors so the caller can decide between
/// NULL and abort.
pub fn convert_value(value: &Json, _from_type: &str, to_type: &str) -> Result<Json, Error> {
    if value.is_null() {
        return Ok(Json::Null);
    }
    let target = to_type.to_uppercase();

    if target.contains("INT") {
        return match value {
            Json::Number(n) => {
                let int = n
                    .as_i64()
                    .or_else(|| n.as_f64().map(|f| f as i64))
                    .ok_or_else(|| anyhow::format_err!("numeric overflow"))?;
                Ok(Json::from(int))
            }
            Json::String(s) => {
                let parsed: f64 = s.trim().parse()?;
                Ok(Json::from(parsed as i64))
            }
            Json::Bool(b) => Ok(Json::from(*b as i64)),
            other => bail!("cannot convert {} to {}", other, to_type),
        };
    }
    if target.contains("FLOAT") || target.contains("DOUBLE") || target.contains("REAL") {
        return match value {
            Json::Number(n) => Ok(Json::from(n.as_f64().unwrap_or(0.0))),
            Json::String(s) => {
                let parsed: f64 = s.trim().parse()?;
                Ok(serde_json::Number::from_f64(parsed)
                    .map(Json::Number)
                    .unwrap_or(Json::Null))
            }
            other => bail!("cannot convert {} to {}", other, to_type),
        };
    }
    if target.contains("NUMERIC") || target.contains("DECIMAL") {
        return match value {
            Json::Number(n) => Ok(Json::String(n.to_string())),
            Json::String(s) => {
                let _: f64 = s.trim().parse()?;
                Ok(Json::String(s.trim().to_string()))
            }
            other => bail!("cannot convert {} to {}", other, to_type),
        };
    }
    if target.contains("TEXT") || target.contains("VARCHAR") || target.contains("CHAR") {
        return Ok(match value {
            Json::String(s) => Json::String(s.clone()),
            other => Json::String(other.to_string()),
        });
    }
    if target.contains("JSON") {
        return Ok(match value {
            Json::String(s) => serde_json::from_str(s).unwrap_or_else(|_| value.clone()),
            other => other.clone(),
        });
    }
    Ok(value.clone())
}

/// Transform one record to fit the current schema under the chosen
/// strategy.
pub fn transform_record(
    record: &JsonRecord,
    diff: &SchemaDiff,
    strategy: MigrationStrategy,
) -> Result<JsonRecord, Error> {
    if strategy == MigrationStrategy::None {
        return Ok(record.clone());
    }
    let mut transformed = record.clone();

    if !diff.removed_columns.is_empty() {
        if strategy == MigrationStrategy::Strict {
            let names: Vec<&str> = diff.removed_columns.iter().map(|c| c.name.as_str()).collect();
            bail!("columns removed from table: {}", names.join(", "));
        }
        for column in &diff.removed_columns {
            transformed.remove(&column.name);
        }
    }

    for column in &diff.added_columns {
        if !transformed.contains_key(&column.name) {
            let filler = if column.is_nullable {
                Json::Null
            } else {
                default_for_type(&column.data_type)
            };
            transformed.insert(column.name.clone(), filler);
        }
    }

    if !diff.type_changes.is_empty() {
        if strategy == MigrationStrategy::Strict {
            let names: Vec<&str> = diff.type_changes.iter().map(|c| c.column.as_str()).collect();
            bail!("column types changed: {}", names.join(", "));
        }
        if strategy == MigrationStrategy::Transform {
            for change in &diff.type_changes {
                if let Some(value) = transformed.get(&change.column).cloned() {
                    match convert_value(&value, &change.archived_type, &change.current_type) {
                        Ok(converted) => {
                            transformed.insert(change.column.clone(), converted);
                        }
                        Err(err) => {
                            log::warn!(
                                "conversion of column '{}' failed, setting NULL - {}",
                                change.column,
                                err
                            );
                            transformed.insert(change.column.clone(), Json::Null);
                        }
                    }
                }
            }
        }
    }

    for change in &diff.nullable_changes {
        if change.current_nullable {
            continue;
        }
        let is_null = transformed
            .get(&change.column)
            .map(Json::is_null)
            .unwrap_or(true);
        if is_null {
            if strategy == MigrationStrategy::Strict {
                bail!("NULL value in non-nullable column '{}'", change.column);
            }
            transformed.insert(
                change.column.clone(),
                default_for_type(&change.current_type),
            );
        }
    }

    Ok(transformed)
}

#[cfg(test)]
mod test {
    use super::*;

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

    fn schema(columns: Vec<ColumnInfo>) -> TableSchema {
        TableSchema {
            table_name: "t".into(),
            schema_name: "public".into(),
            columns,
            primary_key: None,
            foreign_keys: vec![],
            indexes: vec![],
            check_constraints: vec![],
            unique_constraints: vec![],
        }
    }

    fn record(pairs: &[(&str, Json)]) -> JsonRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn numeric_to_double_coerces_under_transform() {
        let archived = schema(vec![column("amount", "numeric", true, 1)]);
        let current = schema(vec![column("amount", "double precision", true, 1)]);
        let diff = compare_schemas(&archived, &current);

        let input = record(&[("amount", Json::String("1234.5".into()))]);
        let out = transform_record(&input, &diff, MigrationStrategy::Transform).unwrap();
        assert_eq!(out["amount"], Json::from(1234.5));

        // strict aborts on the same change
        let err = transform_record(&input, &diff, MigrationStrategy::Strict).unwrap_err();
        assert!(err.to_string().contains("column types changed"));

        // lenient passes the value through untouched
        let out = transform_record(&input, &diff, MigrationStrategy::Lenient).unwrap();
        assert_eq!(out["amount"], Json::String("1234.5".into()));
    }

    #[test]
    fn removed_columns_are_dropped_or_fatal() {
        let archived = schema(vec![
            column("id", "bigint", false, 1),
            column("legacy", "text", true, 2),
        ]);
        let current = schema(vec![column("id", "bigint", false, 1)]);
        let diff = compare_schemas(&archived, &current);

        let input = record(&[("id", Json::from(1)), ("legacy", Json::String("x".into()))]);
        let out = transform_record(&input, &diff, MigrationStrategy::Lenient).unwrap();
        assert!(!out.contains_key("legacy"));

        assert!(transform_record(&input, &diff, MigrationStrategy::Strict).is_err());
    }

    #[test]
    fn added_columns_get_type_defaults() {
        let archived = schema(vec![column("id", "bigint", false, 1)]);
        let current = schema(vec![
            column("id", "bigint", false, 1),
            column("count", "integer", false, 2),
            column("ratio", "double precision", false, 3),
            column("flag", "boolean", false, 4),
            column("name", "text", false, 5),
            column("payload", "jsonb", false, 6),
            column("note", "text", true, 7),
        ]);
        let diff = compare_schemas(&archived, &current);
        let out = transform_record(&record(&[("id", Json::from(1))]), &diff, MigrationStrategy::Lenient)
            .unwrap();
        assert_eq!(out["count"], Json::from(0));
        assert_eq!(out["ratio"], Json::from(0.0));
        assert_eq!(out["flag"], Json::Bool(false));
        assert_eq!(out["name"], Json::String(String::new()));
        assert_eq!(out["payload"], Json::Object(Default::default()));
        assert_eq!(out["note"], Json::Null);
    }

    #[test]
    fn null_into_not_null_is_strict_failure_or_default() {
        let archived = schema(vec![column("name", "text", true, 1)]);
        let current = schema(vec![column("name", "text", false, 1)]);
        let diff = compare_schemas(&archived, &current);

        let input = record(&[("name", Json::Null)]);
        assert!(transform_record(&input, &diff, MigrationStrategy::Strict).is_err());

        let out = transform_record(&input, &diff, MigrationStrategy::Lenient).unwrap();
        assert_eq!(out["name"], Json::String(String::new()));
    }

    #[test]
    fn none_strategy_passes_through() {
        let archived = schema(vec![column("a", "text", true, 1)]);
        let current = schema(vec![column("b", "text", true, 1)]);
        let diff = compare_schemas(&archived, &current);
        let input = record(&[("a", Json::String("kept".into()))]);
        let out = transform_record(&input, &diff, MigrationStrategy::None).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn coercion_failure_becomes_null_under_transform() {
        let archived = schema(vec![column("n", "text", true, 1)]);
        let current = schema(vec![column("n", "integer", true, 1)]);
        let diff = compare_schemas(&archived, &current);
        let input = record(&[("n", Json::String("not a number".into()))]);
        let out = transform_record(&input, &diff, MigrationStrategy::Transform).unwrap();
        assert_eq!(out["n"], Json::Null);
    }

    #[test]
    fn anything_coerces_to_text() {
        assert_eq!(
            convert_value(&Json::from(42), "integer", "text").unwrap(),
            Json::String("42".into())
        );
        assert_eq!(
            convert_value(&Json::String("{\"a\":1}".into()), "text", "jsonb").unwrap(),
            serde_json::json!({"a": 1})
        );
    }
}
