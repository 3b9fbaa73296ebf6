use serde::{Deserialize, Serialize};

/// Normalized column shape as introspected from `information_schema`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udt_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_maximum_length: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numeric_precision: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numeric_scale: Option<i32>,
    pub is_nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    pub ordinal_position: i32,
}

impl ColumnInfo {
    pub fn is_tz_aware_timestamp(&self) -> bool {
        self.data_type.eq_ignore_ascii_case("timestamp with time zone")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrimaryKeyInfo {
    pub constraint_name: String,
    pub columns: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeyInfo {
    pub constraint_name: String,
    pub columns: Vec<String>,
    pub referenced_schema: String,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub definition: String,
    pub columns: Vec<String>,
    pub is_unique: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckConstraintInfo {
    pub constraint_name: String,
    pub check_clause: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UniqueConstraintInfo {
    pub constraint_name: String,
    pub columns: Vec<String>,
}

/// Complete snapshot of a table's shape, stored in the metadata sidecar of
/// the first batch of a run and compared against the live schema by the
/// drift checker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table_name: String,
    pub schema_name: String,
    pub columns: Vec<ColumnInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<PrimaryKeyInfo>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyInfo>,
    #[serde(default)]
    pub indexes: Vec<IndexInfo>,
    #[serde(default)]
    pub check_constraints: Vec<CheckConstraintInfo>,
    #[serde(default)]
    pub unique_constraints: Vec<UniqueConstraintInfo>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_is_tz_aware(&self, name: &str) -> bool {
        self.column(name)
            .map(|c| c.is_tz_aware_timestamp())
            .unwrap_or(false)
    }

    /// First primary key column, if any.
    pub fn primary_key_column(&self) -> Option<&str> {
        self.primary_key
            .as_ref()
            .and_then(|pk| pk.columns.first())
            .map(|s| s.as_str())
    }
}
