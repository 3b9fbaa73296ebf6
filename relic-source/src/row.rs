//! Conversions between dynamic [Value] rows and postgres wire types.

use anyhow::format_err;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use uuid::Uuid;

use relic_api_types::{Row, Value};

use crate::SourceError;

/// Convert a fetched row into the dynamic value model, one entry per
/// column in select order.
pub fn row_to_values(row: &tokio_postgres::Row) -> Result<Row, SourceError> {
    let mut values = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let ty = column.type_();
        let value = if *ty == Type::BOOL {
            row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool)
        } else if *ty == Type::INT2 {
            row.try_get::<_, Option<i16>>(idx)?.map(|v| Value::Int(v as i64))
        } else if *ty == Type::INT4 {
            row.try_get::<_, Option<i32>>(idx)?.map(|v| Value::Int(v as i64))
        } else if *ty == Type::INT8 {
            row.try_get::<_, Option<i64>>(idx)?.map(Value::Int)
        } else if *ty == Type::OID {
            row.try_get::<_, Option<u32>>(idx)?.map(|v| Value::Int(v as i64))
        } else if *ty == Type::FLOAT4 {
            row.try_get::<_, Option<f32>>(idx)?.map(|v| Value::Float(v as f64))
        } else if *ty == Type::FLOAT8 {
            row.try_get::<_, Option<f64>>(idx)?.map(Value::Float)
        } else if *ty == Type::NUMERIC {
            row.try_get::<_, Option<Decimal>>(idx)?.map(Value::Decimal)
        } else if *ty == Type::TEXT
            || *ty == Type::VARCHAR
            || *ty == Type::BPCHAR
            || *ty == Type::NAME
            || *ty == Type::UNKNOWN
        {
            row.try_get::<_, Option<String>>(idx)?.map(Value::Text)
        } else if *ty == Type::BYTEA {
            row.try_get::<_, Option<Vec<u8>>>(idx)?.map(Value::Bytes)
        } else if *ty == Type::TIMESTAMP {
            row.try_get::<_, Option<NaiveDateTime>>(idx)?.map(Value::Timestamp)
        } else if *ty == Type::TIMESTAMPTZ {
            row.try_get::<_, Option<DateTime<Utc>>>(idx)?.map(Value::TimestampTz)
        } else if *ty == Type::DATE {
            row.try_get::<_, Option<NaiveDate>>(idx)?.map(Value::Date)
        } else if *ty == Type::UUID {
            row.try_get::<_, Option<Uuid>>(idx)?.map(Value::Uuid)
        } else if *ty == Type::JSON || *ty == Type::JSONB {
            row.try_get::<_, Option<serde_json::Value>>(idx)?.map(Value::Json)
        } else {
            return Err(SourceError::Other(format_err!(
                "unsupported column type '{}' for column '{}'",
                ty,
                column.name()
            )));
        };
        values.push((column.name().to_string(), value.unwrap_or(Value::Null)));
    }
    Ok(values)
}

type BoxedError = Box<dyn std::error::Error + Sync + Send>;

/// Bind adapter: a [Value] as a statement parameter, coerced to the
/// column's declared type where the families are compatible.
#[derive(Debug)]
pub struct SqlParam<'a>(pub &'a Value);

fn bind_error(value: &Value, ty: &Type) -> BoxedError {
    format!("cannot bind {:?} to column type '{}'", value, ty).into()
}

impl ToSql for SqlParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxedError> {
        let is_text = *ty == Type::TEXT || *ty == Type::VARCHAR || *ty == Type::BPCHAR;
        match self.0 {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(v) => {
                if is_text {
                    v.to_string().to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            Value::Int(v) => {
                if *ty == Type::INT2 {
                    i16::try_from(*v)?.to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    i32::try_from(*v)?.to_sql(ty, out)
                } else if *ty == Type::OID {
                    u32::try_from(*v)?.to_sql(ty, out)
                } else if *ty == Type::FLOAT4 {
                    (*v as f32).to_sql(ty, out)
                } else if *ty == Type::FLOAT8 {
                    (*v as f64).to_sql(ty, out)
                } else if *ty == Type::NUMERIC {
                    Decimal::from(*v).to_sql(ty, out)
                } else if is_text {
                    v.to_string().to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            Value::Float(v) => {
                if *ty == Type::FLOAT4 {
                    (*v as f32).to_sql(ty, out)
                } else if *ty == Type::NUMERIC {
                    Decimal::from_f64_retain(*v)
                        .ok_or_else(|| bind_error(self.0, ty))?
                        .to_sql(ty, out)
                } else if is_text {
                    v.to_string().to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            Value::Decimal(v) => {
                if *ty == Type::FLOAT4 {
                    v.to_f32().ok_or_else(|| bind_error(self.0, ty))?.to_sql(ty, out)
                } else if *ty == Type::FLOAT8 {
                    v.to_f64().ok_or_else(|| bind_error(self.0, ty))?.to_sql(ty, out)
                } else if *ty == Type::INT2 || *ty == Type::INT4 || *ty == Type::INT8 {
                    let int = v.to_i64().ok_or_else(|| bind_error(self.0, ty))?;
                    SqlParam(&Value::Int(int)).to_sql(ty, out)
                } else if is_text {
                    v.to_string().to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            Value::Text(v) => {
                if *ty == Type::TIMESTAMPTZ {
                    DateTime::parse_from_rfc3339(v)?.with_timezone(&Utc).to_sql(ty, out)
                } else if *ty == Type::TIMESTAMP {
                    DateTime::parse_from_rfc3339(v)?.naive_utc().to_sql(ty, out)
                } else if *ty == Type::DATE {
                    NaiveDate::parse_from_str(v, "%Y-%m-%d")?.to_sql(ty, out)
                } else if *ty == Type::UUID {
                    Uuid::parse_str(v)?.to_sql(ty, out)
                } else if *ty == Type::NUMERIC {
                    v.parse::<Decimal>()?.to_sql(ty, out)
                } else if *ty == Type::JSON || *ty == Type::JSONB {
                    match serde_json::from_str::<serde_json::Value>(v) {
                        Ok(json) => json.to_sql(ty, out),
                        Err(_) => serde_json::Value::String(v.clone()).to_sql(ty, out),
                    }
                } else {
                    v.to_sql(ty, out)
                }
            }
            Value::Bytes(v) => v.to_sql(ty, out),
            Value::Timestamp(v) => {
                if *ty == Type::TIMESTAMPTZ {
                    Utc.from_utc_datetime(v).to_sql(ty, out)
                } else if *ty == Type::DATE {
                    v.date().to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            Value::TimestampTz(v) => {
                if *ty == Type::TIMESTAMP {
                    v.naive_utc().to_sql(ty, out)
                } else if *ty == Type::DATE {
                    v.date_naive().to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            Value::Date(v) => {
                if *ty == Type::TIMESTAMP {
                    v.and_hms_opt(0, 0, 0)
                        .ok_or_else(|| bind_error(self.0, ty))?
                        .to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            Value::Uuid(v) => {
                if is_text {
                    v.to_string().to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            Value::Json(v) => {
                if is_text {
                    v.to_string().to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Typed array over primary key values for `= ANY($1)` binds.
pub enum PkArray {
    Int(Vec<i64>),
    Text(Vec<String>),
    Uuid(Vec<Uuid>),
}

impl PkArray {
    /// All keys of a batch must share one representation; mixed key types
    /// indicate a corrupted cursor and are rejected.
    pub fn try_from_values(pks: &[Value]) -> Result<Self, SourceError> {
        if pks.iter().all(|pk| matches!(pk, Value::Int(_))) {
            return Ok(PkArray::Int(
                pks.iter()
                    .map(|pk| match pk {
                        Value::Int(v) => *v,
                        _ => unreachable!(),
                    })
                    .collect(),
            ));
        }
        if pks.iter().all(|pk| matches!(pk, Value::Uuid(_))) {
            return Ok(PkArray::Uuid(
                pks.iter()
                    .map(|pk| match pk {
                        Value::Uuid(v) => *v,
                        _ => unreachable!(),
                    })
                    .collect(),
            ));
        }
        if pks
            .iter()
            .all(|pk| matches!(pk, Value::Text(_) | Value::Int(_) | Value::Uuid(_)))
        {
            return Ok(PkArray::Text(pks.iter().map(|pk| pk.to_pk_string()).collect()));
        }
        Err(SourceError::Other(format_err!(
            "unsupported primary key value in batch"
        )))
    }

    pub fn as_param(&self) -> &(dyn ToSql + Sync) {
        match self {
            PkArray::Int(v) => v,
            PkArray::Text(v) => v,
            PkArray::Uuid(v) => v,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PkArray::Int(v) => v.len(),
            PkArray::Text(v) => v.len(),
            PkArray::Uuid(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
