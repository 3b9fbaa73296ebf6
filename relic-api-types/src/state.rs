use std::cmp::Ordering;

use anyhow::{bail, Error};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Value;

pub const WATERMARK_VERSION: &str = "1.0";
pub const CHECKPOINT_VERSION: &str = "1.0";
pub const RESTORE_WATERMARK_VERSION: &str = "1.0";

/// The resume position inside a table: strictly ordered by
/// `(timestamp, primary_key)`.
#[derive(Clone, Debug, PartialEq)]
pub struct Cursor {
    pub last_timestamp: DateTime<Utc>,
    pub last_primary_key: Value,
}

impl Cursor {
    /// Lexicographic comparison under the `(timestamp, primary_key)`
    /// order. Integer keys compare numerically, everything else by
    /// string form.
    pub fn cmp_position(&self, other: &Cursor) -> Ordering {
        self.last_timestamp
            .cmp(&other.last_timestamp)
            .then_with(|| match (&self.last_primary_key, &other.last_primary_key) {
                (Value::Int(a), Value::Int(b)) => a.cmp(b),
                (a, b) => a.to_pk_string().cmp(&b.to_pk_string()),
            })
    }
}

/// Durable cursor surviving across runs, advanced after each successful
/// batch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Watermark {
    pub version: String,
    pub database: String,
    pub table: String,
    pub last_timestamp: DateTime<Utc>,
    pub last_primary_key: String,
    pub updated_at: DateTime<Utc>,
}

impl Watermark {
    pub fn new(database: &str, table: &str, cursor: &Cursor) -> Self {
        Self {
            version: WATERMARK_VERSION.to_string(),
            database: database.to_string(),
            table: table.to_string(),
            last_timestamp: cursor.last_timestamp,
            last_primary_key: cursor.last_primary_key.to_pk_string(),
            updated_at: Utc::now(),
        }
    }

    pub fn cursor(&self) -> Cursor {
        Cursor {
            last_timestamp: self.last_timestamp,
            last_primary_key: Value::parse_pk(&self.last_primary_key),
        }
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, Error> {
        let watermark: Watermark = serde_json::from_slice(data)?;
        if watermark.version != WATERMARK_VERSION {
            bail!("unsupported watermark version '{}'", watermark.version);
        }
        Ok(watermark)
    }
}

/// Batch-granular resume marker, saved every N batches and deleted when a
/// table completes cleanly. Deletion is the authoritative "table done"
/// marker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: String,
    pub database: String,
    pub table: String,
    pub schema: String,
    pub batch_number: u32,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub last_primary_key: Option<String>,
    pub records_archived: u64,
    pub batches_processed: u64,
    pub checkpoint_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

impl Checkpoint {
    pub fn cursor(&self) -> Option<Cursor> {
        match (&self.last_timestamp, &self.last_primary_key) {
            (Some(ts), Some(pk)) => Some(Cursor {
                last_timestamp: *ts,
                last_primary_key: Value::parse_pk(pk),
            }),
            _ => None,
        }
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, Error> {
        let checkpoint: Checkpoint = serde_json::from_slice(data)?;
        if checkpoint.version != CHECKPOINT_VERSION {
            bail!("unsupported checkpoint version '{}'", checkpoint.version);
        }
        Ok(checkpoint)
    }
}

/// Latest restored archive per `(database, table)`; lets repeated restore
/// runs skip work that is already in the target.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RestoreWatermark {
    pub version: String,
    pub database: String,
    pub table: String,
    pub last_restored_date: DateTime<Utc>,
    pub last_restored_s3_key: String,
    pub total_archives_restored: u64,
    pub updated_at: DateTime<Utc>,
}

impl RestoreWatermark {
    pub fn from_slice(data: &[u8]) -> Result<Self, Error> {
        let watermark: RestoreWatermark = serde_json::from_slice(data)?;
        if watermark.version != RESTORE_WATERMARK_VERSION {
            bail!(
                "unsupported restore watermark version '{}'",
                watermark.version
            );
        }
        Ok(watermark)
    }
}

/// Payload of a file-based lock.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockRecord {
    pub lock_key: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub owner: String,
}

impl LockRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn cursor_order_is_lexicographic() {
        let ts = |s| Utc.timestamp_opt(s, 0).unwrap();
        let a = Cursor { last_timestamp: ts(10), last_primary_key: Value::Int(5) };
        let b = Cursor { last_timestamp: ts(10), last_primary_key: Value::Int(9) };
        let c = Cursor { last_timestamp: ts(11), last_primary_key: Value::Int(1) };
        assert_eq!(a.cmp_position(&b), Ordering::Less);
        assert_eq!(b.cmp_position(&c), Ordering::Less);
        assert_eq!(c.cmp_position(&c), Ordering::Equal);
    }

    #[test]
    fn watermark_round_trip_keeps_cursor() {
        let cursor = Cursor {
            last_timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            last_primary_key: Value::Int(42),
        };
        let watermark = Watermark::new("app", "audit_logs", &cursor);
        let data = serde_json::to_vec(&watermark).unwrap();
        let loaded = Watermark::from_slice(&data).unwrap();
        assert_eq!(loaded.cursor(), cursor);
    }
}
