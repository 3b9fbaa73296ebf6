use anyhow::{bail, format_err, Error};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

pub const DATA_SUFFIX: &str = ".jsonl.gz";
pub const METADATA_SUFFIX: &str = ".metadata.json";
pub const MANIFEST_SUFFIX: &str = ".manifest.json";

pub const WATERMARK_KEY_NAME: &str = ".watermark.json";
pub const CHECKPOINT_KEY_NAME: &str = ".checkpoint.json";
pub const RESTORE_WATERMARK_KEY_NAME: &str = ".restore_watermark.json";

const ARCHIVED_AT_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Deterministic batch identifier: first 16 hex chars of
/// `SHA256("{database}_{table}_{batch_number}")`.
pub fn batch_id(database: &str, table: &str, batch_number: u32) -> String {
    let content = format!("{}_{}_{}", database, table, batch_number);
    hex::encode(openssl::sha::sha256(content.as_bytes()))[..16].to_string()
}

/// Location of one archive object triple in the bucket.
///
/// The data key layout is bit-exact:
/// `{prefix/}{db}/{table}/year=YYYY/month=MM/day=DD/{table}_{archivedAt}_batch_NNN.jsonl.gz`
#[derive(Clone, Debug, PartialEq)]
pub struct ArchiveKey {
    pub database: String,
    pub table: String,
    pub archived_at: DateTime<Utc>,
    pub batch_number: u32,
}

impl ArchiveKey {
    pub fn partition_date(&self) -> NaiveDate {
        self.archived_at.date_naive()
    }

    pub fn data_key(&self) -> String {
        format!(
            "{}/{}/{}/{}_{}_batch_{:03}{}",
            self.database,
            self.table,
            self.archived_at.format("year=%Y/month=%m/day=%d"),
            self.table,
            self.archived_at.format(ARCHIVED_AT_FORMAT),
            self.batch_number,
            DATA_SUFFIX,
        )
    }

    pub fn metadata_key(&self) -> String {
        metadata_key_for(&self.data_key())
    }

    pub fn manifest_key(&self) -> String {
        manifest_key_for(&self.data_key())
    }

    /// Parse a data key back into its parts. Tolerates an arbitrary
    /// number of prefix segments before the database segment by anchoring
    /// on the `year=` partition.
    pub fn parse(key: &str) -> Result<Self, Error> {
        let parts: Vec<&str> = key.split('/').collect();
        let year_idx = parts
            .iter()
            .position(|p| p.starts_with("year="))
            .ok_or_else(|| format_err!("no date partition in key '{}'", key))?;
        if year_idx < 2 || parts.len() <= year_idx + 3 {
            bail!("malformed archive key '{}'", key);
        }
        let database = parts[year_idx - 2].to_string();
        let table = parts[year_idx - 1].to_string();

        let file_name = parts[year_idx + 3];
        let stem = file_name
            .strip_suffix(DATA_SUFFIX)
            .ok_or_else(|| format_err!("not a data file: '{}'", file_name))?;

        // {table}_{YYYYMMDDThhmmssZ}_batch_{NNN}, table may contain '_'
        let (rest, batch_part) = stem
            .rsplit_once("_batch_")
            .ok_or_else(|| format_err!("no batch number in '{}'", file_name))?;
        let batch_number: u32 = batch_part
            .parse()
            .map_err(|_| format_err!("bad batch number '{}' in '{}'", batch_part, file_name))?;
        let (_, ts_part) = rest
            .rsplit_once('_')
            .ok_or_else(|| format_err!("no timestamp in '{}'", file_name))?;
        let archived_at = NaiveDateTime::parse_from_str(ts_part, ARCHIVED_AT_FORMAT)
            .map(|naive| Utc.from_utc_datetime(&naive))
            .map_err(|err| format_err!("bad timestamp '{}' in '{}' - {}", ts_part, file_name, err))?;

        Ok(Self { database, table, archived_at, batch_number })
    }
}

pub fn metadata_key_for(data_key: &str) -> String {
    swap_suffix(data_key, METADATA_SUFFIX)
}

pub fn manifest_key_for(data_key: &str) -> String {
    swap_suffix(data_key, MANIFEST_SUFFIX)
}

fn swap_suffix(data_key: &str, suffix: &str) -> String {
    match data_key.strip_suffix(DATA_SUFFIX) {
        Some(stem) => format!("{}{}", stem, suffix),
        None => format!("{}{}", data_key, suffix),
    }
}

/// Control file key under `{db}/{table}/`.
pub fn control_key(database: &str, table: &str, name: &str) -> String {
    format!("{}/{}/{}", database, table, name)
}

/// Key prefix covering every archive object of one table.
pub fn table_prefix(database: &str, table: &str) -> String {
    format!("{}/{}/", database, table)
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> ArchiveKey {
        ArchiveKey {
            database: "app".into(),
            table: "audit_logs".into(),
            archived_at: Utc.with_ymd_and_hms(2026, 1, 6, 12, 30, 45).unwrap(),
            batch_number: 7,
        }
    }

    #[test]
    fn data_key_layout_is_exact() {
        assert_eq!(
            sample().data_key(),
            "app/audit_logs/year=2026/month=01/day=06/audit_logs_20260106T123045Z_batch_007.jsonl.gz"
        );
    }

    #[test]
    fn sidecar_keys_share_the_stem() {
        let key = sample();
        assert_eq!(
            key.metadata_key(),
            "app/audit_logs/year=2026/month=01/day=06/audit_logs_20260106T123045Z_batch_007.metadata.json"
        );
        assert_eq!(
            key.manifest_key(),
            "app/audit_logs/year=2026/month=01/day=06/audit_logs_20260106T123045Z_batch_007.manifest.json"
        );
    }

    #[test]
    fn parse_round_trip() {
        let key = sample();
        assert_eq!(ArchiveKey::parse(&key.data_key()).unwrap(), key);
    }

    #[test]
    fn parse_tolerates_prefix_and_underscored_tables() {
        let key = ArchiveKey::parse(
            "cold/archives/app/user_events_v2/year=2025/month=12/day=31/user_events_v2_20251231T235959Z_batch_120.jsonl.gz",
        )
        .unwrap();
        assert_eq!(key.database, "app");
        assert_eq!(key.table, "user_events_v2");
        assert_eq!(key.batch_number, 120);
        assert_eq!(key.partition_date(), NaiveDate::from_ymd_opt(2025, 12, 31).unwrap());
    }

    #[test]
    fn parse_rejects_non_data_keys() {
        assert!(ArchiveKey::parse("app/audit_logs/.watermark.json").is_err());
        assert!(ArchiveKey::parse(
            "app/audit_logs/year=2026/month=01/day=06/audit_logs_20260106T123045Z_batch_007.metadata.json"
        )
        .is_err());
    }

    #[test]
    fn batch_ids_are_deterministic_hex() {
        let id = batch_id("app", "audit_logs", 1);
        assert_eq!(id.len(), 16);
        assert_eq!(id, batch_id("app", "audit_logs", 1));
        assert_ne!(id, batch_id("app", "audit_logs", 2));
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
