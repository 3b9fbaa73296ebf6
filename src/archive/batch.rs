//! Cutoff computation and batch bookkeeping.

use anyhow::{format_err, Error};
use chrono::{DateTime, Duration, Utc};

use relic_api_types::{row_get, Cursor, Row, TimestampRange, Value};

/// The timestamp boundary: rows strictly earlier are eligible.
pub fn cutoff(now: DateTime<Utc>, retention_days: u32, safety_buffer_days: u32) -> DateTime<Utc> {
    now - Duration::days(retention_days as i64 + safety_buffer_days as i64)
}

/// The cutoff as a bind value matching the timestamp column's declared
/// type. A mismatch would silently compare different instants, so the
/// column type decides, never the data.
pub fn cutoff_value(cutoff: DateTime<Utc>, tz_aware: bool) -> Value {
    if tz_aware {
        Value::TimestampTz(cutoff)
    } else {
        Value::Timestamp(cutoff.naive_utc())
    }
}

/// Primary key of every row, in batch order.
pub fn extract_primary_keys(rows: &[Row], primary_key: &str) -> Result<Vec<Value>, Error> {
    rows.iter()
        .map(|row| {
            row_get(row, primary_key)
                .cloned()
                .filter(|value| !value.is_null())
                .ok_or_else(|| format_err!("row without primary key column '{}'", primary_key))
        })
        .collect()
}

/// Cursor position after this batch: the `(timestamp, primary_key)` of
/// the last row under the selection order.
pub fn last_cursor(rows: &[Row], timestamp_column: &str, primary_key: &str) -> Option<Cursor> {
    let row = rows.last()?;
    let last_timestamp = row_get(row, timestamp_column)?.as_timestamp_utc()?;
    let last_primary_key = row_get(row, primary_key)?.clone();
    Some(Cursor { last_timestamp, last_primary_key })
}

/// Min/max row timestamp for the metadata sidecar.
pub fn timestamp_range(rows: &[Row], timestamp_column: &str) -> TimestampRange {
    let mut range = TimestampRange::default();
    for row in rows {
        let ts = match row_get(row, timestamp_column).and_then(|v| v.as_timestamp_utc()) {
            Some(ts) => ts,
            None => continue,
        };
        range.min = Some(range.min.map_or(ts, |min| min.min(ts)));
        range.max = Some(range.max.map_or(ts, |max| max.max(ts)));
    }
    range
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn row(id: i64, created: i64) -> Row {
        vec![
            ("id".to_string(), Value::Int(id)),
            ("created_at".to_string(), Value::TimestampTz(ts(created))),
        ]
    }

    #[test]
    fn cutoff_subtracts_retention_and_buffer() {
        let now = Utc.with_ymd_and_hms(2026, 4, 2, 12, 0, 0).unwrap();
        let boundary = cutoff(now, 90, 1);
        assert_eq!(boundary, Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn cutoff_binding_matches_column_typing() {
        let boundary = ts(1_700_000_000);
        assert!(matches!(cutoff_value(boundary, true), Value::TimestampTz(_)));
        assert!(matches!(cutoff_value(boundary, false), Value::Timestamp(_)));
    }

    #[test]
    fn primary_keys_in_batch_order() {
        let rows = vec![row(1, 10), row(2, 10), row(3, 11)];
        let pks = extract_primary_keys(&rows, "id").unwrap();
        assert_eq!(pks, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    }

    #[test]
    fn missing_primary_key_is_an_error() {
        let rows = vec![vec![("created_at".to_string(), Value::TimestampTz(ts(1)))]];
        assert!(extract_primary_keys(&rows, "id").is_err());
    }

    #[test]
    fn cursor_tracks_the_last_row() {
        let rows = vec![row(1, 10), row(7, 42)];
        let cursor = last_cursor(&rows, "created_at", "id").unwrap();
        assert_eq!(cursor.last_timestamp, ts(42));
        assert_eq!(cursor.last_primary_key, Value::Int(7));
        assert!(last_cursor(&[], "created_at", "id").is_none());
    }

    #[test]
    fn range_covers_all_rows() {
        let rows = vec![row(1, 30), row(2, 10), row(3, 20)];
        let range = timestamp_range(&rows, "created_at");
        assert_eq!(range.min, Some(ts(10)));
        assert_eq!(range.max, Some(ts(30)));

        let empty = timestamp_range(&[], "created_at");
        assert!(empty.min.is_none() && empty.max.is_none());
    }
}
