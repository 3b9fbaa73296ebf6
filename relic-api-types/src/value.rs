use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::Value as Json;
use uuid::Uuid;

/// Reserved JSONL fields appended to every archived row.
pub const FIELD_BATCH_ID: &str = "_batch_id";
pub const FIELD_SOURCE_DATABASE: &str = "_source_database";
pub const FIELD_SOURCE_TABLE: &str = "_source_table";
pub const FIELD_ARCHIVED_AT: &str = "_archived_at";

pub const RESERVED_FIELDS: [&str; 4] = [
    FIELD_BATCH_ID,
    FIELD_SOURCE_DATABASE,
    FIELD_SOURCE_TABLE,
    FIELD_ARCHIVED_AT,
];

/// A single dynamically typed column value.
///
/// The serializer and the restore path are polymorphic over this type, so
/// a row is just a list of named values with no compile-time schema.
/// Numeric columns that carry arbitrary precision keep it via
/// [Decimal]; `TIMESTAMP` and `TIMESTAMPTZ` stay distinct because the
/// source store binds them differently.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Date(NaiveDate),
    Decimal(Decimal),
    Uuid(Uuid),
    Json(Json),
}

/// One source row in select-column order.
pub type Row = Vec<(String, Value)>;

pub fn rfc3339(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Wire representation for JSONL lines and sidecars.
    ///
    /// Timestamps become RFC 3339 UTC strings, decimals become strings to
    /// preserve precision, raw bytes become base64. Non-finite floats have
    /// no JSON representation and degrade to null.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Bool(v) => Json::Bool(*v),
            Value::Int(v) => Json::from(*v),
            Value::Float(v) => serde_json::Number::from_f64(*v)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Text(v) => Json::String(v.clone()),
            Value::Bytes(v) => Json::String(base64::encode(v)),
            Value::Timestamp(v) => Json::String(rfc3339(&Utc.from_utc_datetime(v))),
            Value::TimestampTz(v) => Json::String(rfc3339(v)),
            Value::Date(v) => Json::String(v.format("%Y-%m-%d").to_string()),
            Value::Decimal(v) => Json::String(v.to_string()),
            Value::Uuid(v) => Json::String(v.to_string()),
            Value::Json(v) => v.clone(),
        }
    }

    /// Inverse of [Value::to_json] as far as JSON allows.
    ///
    /// JSON strings stay [Value::Text]; the restore engine converts them
    /// into timestamps, uuids or decimals once it knows the target column
    /// type.
    pub fn from_json(value: &Json) -> Value {
        match value {
            Json::Null => Value::Null,
            Json::Bool(v) => Value::Bool(*v),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Json::String(s) => Value::Text(s.clone()),
            other => Value::Json(other.clone()),
        }
    }

    /// Timestamp view used for cursor advancement and range tracking.
    /// Naive timestamps are interpreted as UTC.
    pub fn as_timestamp_utc(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(v) => Some(Utc.from_utc_datetime(v)),
            Value::TimestampTz(v) => Some(*v),
            Value::Text(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            _ => None,
        }
    }

    /// String form used when persisting a primary key in watermarks,
    /// checkpoints and deletion manifests.
    pub fn to_pk_string(&self) -> String {
        match self {
            Value::Text(s) => s.clone(),
            other => match other.to_json() {
                Json::String(s) => s,
                json => json.to_string(),
            },
        }
    }

    /// Recover a primary key value from its persisted string form.
    /// Integer-looking strings become integers, everything else text.
    pub fn parse_pk(s: &str) -> Value {
        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(i) = s.parse::<i64>() {
                return Value::Int(i);
            }
        }
        Value::Text(s.to_string())
    }
}

/// Look up a column in a row by name.
pub fn row_get<'a>(row: &'a Row, name: &str) -> Option<&'a Value> {
    row.iter().find(|(n, _)| n == name).map(|(_, v)| v)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn json_round_trip_scalars() {
        let values = [
            Value::Null,
            Value::Bool(true),
            Value::Int(-42),
            Value::Text("SQL' OR '1'='1".into()),
            Value::Text("tab\there\nand 中文 Русский 🦀".into()),
        ];
        for value in values {
            assert_eq!(Value::from_json(&value.to_json()), value);
        }
    }

    #[test]
    fn decimal_serializes_as_string() {
        let value = Value::Decimal("1234567890123456.789012345".parse().unwrap());
        assert_eq!(
            value.to_json(),
            Json::String("1234567890123456.789012345".into())
        );
    }

    #[test]
    fn timestamps_are_rfc3339_utc() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 6, 12, 30, 45).unwrap();
        assert_eq!(
            Value::TimestampTz(ts).to_json(),
            Json::String("2026-01-06T12:30:45.000000Z".into())
        );
        assert_eq!(
            Value::Timestamp(ts.naive_utc()).to_json(),
            Json::String("2026-01-06T12:30:45.000000Z".into())
        );
    }

    #[test]
    fn nan_degrades_to_null() {
        assert_eq!(Value::Float(f64::NAN).to_json(), Json::Null);
    }

    #[test]
    fn pk_string_round_trip() {
        assert_eq!(Value::parse_pk("123"), Value::Int(123));
        assert_eq!(Value::parse_pk("abc-1"), Value::Text("abc-1".into()));
        assert_eq!(Value::Int(99).to_pk_string(), "99");
    }
}
