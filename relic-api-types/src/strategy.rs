use serde::{Deserialize, Serialize};

/// Restore-time rule for primary-key collisions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    /// `INSERT ... ON CONFLICT DO NOTHING`
    #[default]
    Skip,
    /// `INSERT ... ON CONFLICT DO UPDATE SET <all> = EXCLUDED.<col>`
    Overwrite,
    /// Same statement shape as overwrite.
    Upsert,
    /// Plain `INSERT`; a unique violation aborts the batch.
    Fail,
}

serde_plain::derive_display_from_serialize!(ConflictStrategy);
serde_plain::derive_fromstr_from_deserialize!(ConflictStrategy);

/// Restore-time rule for column differences between the archived schema
/// and the live table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStrategy {
    /// Any removed column, type change or NULL-in-NOT-NULL aborts.
    Strict,
    /// Drop extra fields, fill added columns with type defaults.
    #[default]
    Lenient,
    /// Lenient plus value coercion across compatible type families.
    Transform,
    /// Pass records through untouched.
    None,
}

serde_plain::derive_display_from_serialize!(MigrationStrategy);
serde_plain::derive_fromstr_from_deserialize!(MigrationStrategy);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    #[default]
    Postgresql,
    Redis,
    File,
}

serde_plain::derive_display_from_serialize!(LockKind);
serde_plain::derive_fromstr_from_deserialize!(LockKind);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatermarkStorageKind {
    #[default]
    S3,
    Database,
}

serde_plain::derive_display_from_serialize!(WatermarkStorageKind);
serde_plain::derive_fromstr_from_deserialize!(WatermarkStorageKind);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStorageKind {
    #[default]
    S3,
    Local,
}

serde_plain::derive_display_from_serialize!(CheckpointStorageKind);
serde_plain::derive_fromstr_from_deserialize!(CheckpointStorageKind);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreWatermarkStorageKind {
    #[default]
    S3,
    Database,
    /// S3 consulted first on load, both written on save.
    Both,
}

serde_plain::derive_display_from_serialize!(RestoreWatermarkStorageKind);
serde_plain::derive_fromstr_from_deserialize!(RestoreWatermarkStorageKind);

/// Maintenance run against a table after archival completes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VacuumStrategy {
    None,
    Analyze,
    #[default]
    Standard,
    Full,
}

serde_plain::derive_display_from_serialize!(VacuumStrategy);
serde_plain::derive_fromstr_from_deserialize!(VacuumStrategy);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionMode {
    #[default]
    #[serde(rename = "SSE-S3")]
    SseS3,
    #[serde(rename = "SSE-KMS")]
    SseKms,
    #[serde(rename = "none")]
    None,
}

serde_plain::derive_display_from_serialize!(EncryptionMode);
serde_plain::derive_fromstr_from_deserialize!(EncryptionMode);

/// Top-level outcome of a multi-target run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// No database and no table failed.
    Success,
    /// Some succeeded and some failed.
    Partial,
    /// Nothing succeeded.
    Failure,
}

serde_plain::derive_display_from_serialize!(RunStatus);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn strategies_parse_from_config_strings() {
        assert_eq!("skip".parse::<ConflictStrategy>().unwrap(), ConflictStrategy::Skip);
        assert_eq!("upsert".parse::<ConflictStrategy>().unwrap(), ConflictStrategy::Upsert);
        assert_eq!("transform".parse::<MigrationStrategy>().unwrap(), MigrationStrategy::Transform);
        assert_eq!("none".parse::<MigrationStrategy>().unwrap(), MigrationStrategy::None);
        assert_eq!("SSE-KMS".parse::<EncryptionMode>().unwrap(), EncryptionMode::SseKms);
        assert_eq!("none".parse::<EncryptionMode>().unwrap(), EncryptionMode::None);
        assert!("merge".parse::<ConflictStrategy>().is_err());
    }

    #[test]
    fn display_matches_config_spelling() {
        assert_eq!(LockKind::Postgresql.to_string(), "postgresql");
        assert_eq!(EncryptionMode::SseS3.to_string(), "SSE-S3");
        assert_eq!(RunStatus::Partial.to_string(), "partial");
    }
}
