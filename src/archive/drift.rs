//! Schema drift detection between the most recent archived schema and
//! the live table.

use std::collections::BTreeSet;
use std::fmt;

use relic_api_types::{metadata_key_for, table_prefix, ArchiveMetadata, TableSchema, DATA_SUFFIX};
use relic_object_store::ObjectStore;

#[derive(Clone, Debug, PartialEq)]
pub enum DriftChange {
    ColumnAdded(String),
    ColumnRemoved(String),
    TypeChanged { column: String, from: String, to: String },
    NullabilityChanged { column: String, from: bool, to: bool },
    PrimaryKeyChanged,
    ForeignKeyAdded(String),
    ForeignKeyRemoved(String),
    IndexAdded(String),
    IndexRemoved(String),
}

impl fmt::Display for DriftChange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DriftChange::ColumnAdded(name) => write!(f, "column '{}' added", name),
            DriftChange::ColumnRemoved(name) => write!(f, "column '{}' removed", name),
            DriftChange::TypeChanged { column, from, to } => {
                write!(f, "column '{}' changed type: {} -> {}", column, from, to)
            }
            DriftChange::NullabilityChanged { column, from, to } => {
                write!(f, "column '{}' nullability: {} -> {}", column, from, to)
            }
            DriftChange::PrimaryKeyChanged => write!(f, "primary key changed"),
            DriftChange::ForeignKeyAdded(name) => write!(f, "foreign key '{}' added", name),
            DriftChange::ForeignKeyRemoved(name) => write!(f, "foreign key '{}' removed", name),
            DriftChange::IndexAdded(name) => write!(f, "index '{}' added", name),
            DriftChange::IndexRemoved(name) => write!(f, "index '{}' removed", name),
        }
    }
}

/// Classify every difference between the archived snapshot and the
/// current live schema.
pub fn detect_drift(archived: &TableSchema, current: &TableSchema) -> Vec<DriftChange> {
    let mut changes = Vec::new();

    for column in &current.columns {
        match archived.column(&column.name) {
            None => changes.push(DriftChange::ColumnAdded(column.name.clone())),
            Some(previous) => {
                if previous.data_type != column.data_type {
                    changes.push(DriftChange::TypeChanged {
                        column: column.name.clone(),
                        from: previous.data_type.clone(),
                        to: column.data_type.clone(),
                    });
                }
                if previous.is_nullable != column.is_nullable {
                    changes.push(DriftChange::NullabilityChanged {
                        column: column.name.clone(),
                        from: previous.is_nullable,
                        to: column.is_nullable,
                    });
                }
            }
        }
    }
    for column in &archived.columns {
        if current.column(&column.name).is_none() {
            changes.push(DriftChange::ColumnRemoved(column.name.clone()));
        }
    }

    let archived_pk = archived.primary_key.as_ref().map(|pk| &pk.columns);
    let current_pk = current.primary_key.as_ref().map(|pk| &pk.columns);
    if archived_pk != current_pk {
        changes.push(DriftChange::PrimaryKeyChanged);
    }

    let archived_fks: BTreeSet<&String> =
        archived.foreign_keys.iter().map(|fk| &fk.constraint_name).collect();
    let current_fks: BTreeSet<&String> =
        current.foreign_keys.iter().map(|fk| &fk.constraint_name).collect();
    for name in current_fks.difference(&archived_fks) {
        changes.push(DriftChange::ForeignKeyAdded((*name).clone()));
    }
    for name in archived_fks.difference(&current_fks) {
        changes.push(DriftChange::ForeignKeyRemoved((*name).clone()));
    }

    let archived_idx: BTreeSet<&String> = archived.indexes.iter().map(|ix| &ix.name).collect();
    let current_idx: BTreeSet<&String> = current.indexes.iter().map(|ix| &ix.name).collect();
    for name in current_idx.difference(&archived_idx) {
        changes.push(DriftChange::IndexAdded((*name).clone()));
    }
    for name in archived_idx.difference(&current_idx) {
        changes.push(DriftChange::IndexRemoved((*name).clone()));
    }

    changes
}

/// Load the schema snapshot from the most recent metadata sidecar of a
/// table, if any batch recorded one. Keys embed the archived-at
/// timestamp, so the newest sidecar is the lexicographically largest
/// data key.
pub async fn load_latest_archived_schema(
    store: &ObjectStore,
    database: &str,
    table: &str,
) -> Option<TableSchema> {
    let keys = match store.list(&table_prefix(database, table)).await {
        Ok(objects) => objects,
        Err(err) => {
            log::warn!(
                "unable to list archives for drift check on {}.{} - {}",
                database,
                table,
                err
            );
            return None;
        }
    };
    let mut data_keys: Vec<String> = keys
        .into_iter()
        .map(|object| object.key)
        .filter(|key| key.ends_with(DATA_SUFFIX))
        .collect();
    data_keys.sort();

    for data_key in data_keys.iter().rev() {
        let metadata_key = metadata_key_for(data_key);
        let data = match store.get(&metadata_key).await {
            Ok(data) => data,
            Err(_) => continue,
        };
        match ArchiveMetadata::from_slice(&data) {
            Ok(metadata) => {
                if let Some(schema) = metadata.table_schema {
                    return Some(schema);
                }
            }
            Err(err) => {
                log::warn!("unreadable metadata '{}' during drift check - {}", metadata_key, err)
            }
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;
    use relic_api_types::{ColumnInfo, IndexInfo, PrimaryKeyInfo};

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
            primary_key: Some(PrimaryKeyInfo {
                constraint_name: "t_pkey".into(),
                columns: vec!["id".into()],
            }),
            foreign_keys: vec![],
            indexes: vec![],
            check_constraints: vec![],
            unique_constraints: vec![],
        }
    }

    #[test]
    fn identical_schemas_have_no_drift() {
        let a = schema(vec![column("id", "bigint", false, 1)]);
        assert!(detect_drift(&a, &a.clone()).is_empty());
    }

    #[test]
    fn column_and_type_changes_are_classified() {
        let archived = schema(vec![
            column("id", "bigint", false, 1),
            column("amount", "numeric", true, 2),
            column("legacy", "text", true, 3),
        ]);
        let current = schema(vec![
            column("id", "bigint", false, 1),
            column("amount", "double precision", true, 2),
            column("added", "text", true, 3),
        ]);
        let changes = detect_drift(&archived, &current);
        assert!(changes.contains(&DriftChange::ColumnAdded("added".into())));
        assert!(changes.contains(&DriftChange::ColumnRemoved("legacy".into())));
        assert!(changes.contains(&DriftChange::TypeChanged {
            column: "amount".into(),
            from: "numeric".into(),
            to: "double precision".into(),
        }));
    }

    #[test]
    fn pk_nullability_and_index_changes_are_classified() {
        let mut archived = schema(vec![column("id", "bigint", false, 1), column("a", "text", true, 2)]);
        archived.indexes.push(IndexInfo {
            name: "t_a_idx".into(),
            definition: "CREATE INDEX t_a_idx ON t (a)".into(),
            columns: vec!["a".into()],
            is_unique: false,
        });

        let mut current = schema(vec![column("id", "bigint", false, 1), column("a", "text", false, 2)]);
        current.primary_key = Some(PrimaryKeyInfo {
            constraint_name: "t_pkey".into(),
            columns: vec!["id".into(), "a".into()],
        });

        let changes = detect_drift(&archived, &current);
        assert!(changes.contains(&DriftChange::PrimaryKeyChanged));
        assert!(changes.contains(&DriftChange::IndexRemoved("t_a_idx".into())));
        assert!(changes.contains(&DriftChange::NullabilityChanged {
            column: "a".into(),
            from: true,
            to: false,
        }));
    }
}
