//! Conversion between loosely-typed [`Record`]s and the tagged wire values used by
//! the binary COPY path, plus the reverse conversion applied to fetched rows.
//!
//! Writing happens in two passes. [`normalize_records`] flattens values that may
//! already have been formatted upstream (timestamps become RFC3339 text, numeric
//! looking text becomes a float). [`coerce_records`] then maps every value onto a
//! [`PgValue`], which is either `Absent` or a present, typed value. A `PgValue`
//! encodes itself against the actual column type of the staging table when it is
//! written, so the dynamic type only has to be *compatible* with the column.

use std::str::FromStr;

use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use rust_decimal::{prelude::ToPrimitive, Decimal};
use tokio_postgres::{
    types::{to_sql_checked, IsNull, ToSql, Type as PgType},
    Row,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::database::postgres::value::{Record, Value};

type EncodeResult = Result<IsNull, Box<dyn std::error::Error + Sync + Send>>;

/// What to do when a single field can not be coerced, or is missing from a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoercionFailurePolicy {
    /// Log a warning and load the field as NULL.
    #[default]
    Null,
    /// Fail the whole call before any transaction is opened.
    Abort,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CoercionRules<'a> {
    /// Column whose text values are parsed as RFC3339 timestamps.
    pub time_column: Option<&'a str>,
    pub on_invalid_value: CoercionFailurePolicy,
    pub on_missing_column: CoercionFailurePolicy,
}

#[derive(thiserror::Error, Debug)]
pub enum CoercionError {
    #[error("Record {row} is missing column {column}")]
    MissingColumn { row: usize, column: String },

    #[error("Record {row} column {column} value {value:?} is not an RFC3339 timestamp: {source}")]
    InvalidTimestamp {
        row: usize,
        column: String,
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

#[derive(thiserror::Error, Debug)]
#[error("can not encode {value_type} value into a {column_type} column: {reason}")]
pub struct WireEncodeError {
    value_type: &'static str,
    column_type: String,
    reason: String,
}

impl WireEncodeError {
    fn mismatch(value_type: &'static str, ty: &PgType) -> Box<Self> {
        Box::new(WireEncodeError {
            value_type,
            column_type: ty.name().to_string(),
            reason: "unsupported column type".to_string(),
        })
    }

    fn invalid(value_type: &'static str, ty: &PgType, reason: impl Into<String>) -> Box<Self> {
        Box::new(WireEncodeError {
            value_type,
            column_type: ty.name().to_string(),
            reason: reason.into(),
        })
    }
}

/// A value in its wire representation, tagged present or absent.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Absent,
    Bool(bool),
    Int4(i32),
    Int8(i64),
    Float8(f64),
    Numeric(Decimal),
    Text(String),
    Timestamptz(DateTime<Utc>),
    Bytea(Vec<u8>),
}

/// One coerced record, ordered by the call's column set.
pub type CoercedRow = Vec<PgValue>;

impl ToSql for PgValue {
    fn to_sql(&self, ty: &PgType, out: &mut BytesMut) -> EncodeResult {
        match self {
            PgValue::Absent => Ok(IsNull::Yes),
            PgValue::Bool(value) => encode_bool(*value, ty, out),
            PgValue::Int4(value) => encode_int(i64::from(*value), "integer", ty, out),
            PgValue::Int8(value) => encode_int(*value, "bigint", ty, out),
            PgValue::Float8(value) => encode_float(*value, ty, out),
            PgValue::Numeric(value) => encode_numeric(value, ty, out),
            PgValue::Text(value) => encode_text(value, ty, out),
            PgValue::Timestamptz(value) => encode_timestamp(value, ty, out),
            PgValue::Bytea(value) => match *ty {
                PgType::BYTEA => value.as_slice().to_sql(ty, out),
                _ => Err(WireEncodeError::mismatch("bytea", ty)),
            },
        }
    }

    fn accepts(_ty: &PgType) -> bool {
        true // the column type is checked per value in `to_sql`
    }

    to_sql_checked!();
}

fn is_text_like(ty: &PgType) -> bool {
    matches!(*ty, PgType::TEXT | PgType::VARCHAR | PgType::BPCHAR | PgType::NAME | PgType::UNKNOWN)
        || ty.name() == "citext"
}

fn write_text(value: &str, out: &mut BytesMut) -> EncodeResult {
    out.extend_from_slice(value.as_bytes());
    Ok(IsNull::No)
}

fn encode_bool(value: bool, ty: &PgType, out: &mut BytesMut) -> EncodeResult {
    match *ty {
        PgType::BOOL => value.to_sql(ty, out),
        _ if is_text_like(ty) => write_text(if value { "true" } else { "false" }, out),
        _ => Err(WireEncodeError::mismatch("boolean", ty)),
    }
}

fn encode_int(value: i64, value_type: &'static str, ty: &PgType, out: &mut BytesMut) -> EncodeResult {
    match *ty {
        PgType::INT2 => i16::try_from(value)?.to_sql(ty, out),
        PgType::INT4 => i32::try_from(value)?.to_sql(ty, out),
        PgType::INT8 => value.to_sql(ty, out),
        PgType::FLOAT4 => (value as f32).to_sql(ty, out),
        PgType::FLOAT8 => (value as f64).to_sql(ty, out),
        PgType::NUMERIC => Decimal::from(value).to_sql(ty, out),
        _ if is_text_like(ty) => write_text(&value.to_string(), out),
        _ => Err(WireEncodeError::mismatch(value_type, ty)),
    }
}

fn encode_float(value: f64, ty: &PgType, out: &mut BytesMut) -> EncodeResult {
    match *ty {
        PgType::FLOAT8 => value.to_sql(ty, out),
        PgType::FLOAT4 => (value as f32).to_sql(ty, out),
        PgType::NUMERIC => Decimal::try_from(value)?.to_sql(ty, out),
        PgType::INT2 | PgType::INT4 | PgType::INT8 => {
            let integral = value.is_finite()
                && value.fract() == 0.0
                && value >= i64::MIN as f64
                && value < i64::MAX as f64;
            if !integral {
                return Err(WireEncodeError::invalid(
                    "double precision",
                    ty,
                    format!("{value} is not an integral value"),
                ));
            }
            encode_int(value as i64, "double precision", ty, out)
        }
        _ if is_text_like(ty) => write_text(&value.to_string(), out),
        _ => Err(WireEncodeError::mismatch("double precision", ty)),
    }
}

fn encode_numeric(value: &Decimal, ty: &PgType, out: &mut BytesMut) -> EncodeResult {
    match *ty {
        PgType::NUMERIC => value.to_sql(ty, out),
        PgType::FLOAT8 | PgType::FLOAT4 => {
            let float = value.to_f64().ok_or_else(|| {
                WireEncodeError::invalid("numeric", ty, format!("{value} does not fit a float"))
            })?;
            encode_float(float, ty, out)
        }
        PgType::INT2 | PgType::INT4 | PgType::INT8 => {
            let int = value.fract().is_zero().then(|| value.to_i64()).flatten().ok_or_else(|| {
                WireEncodeError::invalid("numeric", ty, format!("{value} is not an integer"))
            })?;
            encode_int(int, "numeric", ty, out)
        }
        _ if is_text_like(ty) => write_text(&value.to_string(), out),
        _ => Err(WireEncodeError::mismatch("numeric", ty)),
    }
}

fn encode_text(value: &str, ty: &PgType, out: &mut BytesMut) -> EncodeResult {
    match *ty {
        _ if is_text_like(ty) => write_text(value, out),
        PgType::TIMESTAMPTZ => parse_timestamp(value)
            .ok_or_else(|| WireEncodeError::invalid("text", ty, format!("{value:?} is not a timestamp")))?
            .to_sql(ty, out),
        PgType::TIMESTAMP => parse_timestamp(value)
            .ok_or_else(|| WireEncodeError::invalid("text", ty, format!("{value:?} is not a timestamp")))?
            .naive_utc()
            .to_sql(ty, out),
        PgType::DATE => parse_date(value)
            .ok_or_else(|| WireEncodeError::invalid("text", ty, format!("{value:?} is not a date")))?
            .to_sql(ty, out),
        PgType::UUID => Uuid::parse_str(value.trim())?.to_sql(ty, out),
        PgType::JSON | PgType::JSONB => serde_json::from_str::<serde_json::Value>(value)?.to_sql(ty, out),
        PgType::BOOL => match value.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "on" | "1" => true.to_sql(ty, out),
            "false" | "f" | "no" | "n" | "off" | "0" => false.to_sql(ty, out),
            _ => Err(WireEncodeError::invalid("text", ty, format!("{value:?} is not a boolean"))),
        },
        PgType::NUMERIC => {
            let trimmed = value.trim();
            Decimal::from_str(trimmed).or_else(|_| Decimal::from_scientific(trimmed))?.to_sql(ty, out)
        }
        PgType::INT2 | PgType::INT4 | PgType::INT8 => {
            encode_int(value.trim().parse::<i64>()?, "text", ty, out)
        }
        PgType::FLOAT4 | PgType::FLOAT8 => encode_float(value.trim().parse::<f64>()?, ty, out),
        PgType::BYTEA => value.as_bytes().to_sql(ty, out),
        _ => Err(WireEncodeError::mismatch("text", ty)),
    }
}

fn encode_timestamp(value: &DateTime<Utc>, ty: &PgType, out: &mut BytesMut) -> EncodeResult {
    match *ty {
        PgType::TIMESTAMPTZ => value.to_sql(ty, out),
        PgType::TIMESTAMP => value.naive_utc().to_sql(ty, out),
        PgType::DATE => value.date_naive().to_sql(ty, out),
        _ if is_text_like(ty) => write_text(&value.to_rfc3339_opts(SecondsFormat::AutoSi, true), out),
        _ => Err(WireEncodeError::mismatch("timestamptz", ty)),
    }
}

/// RFC3339 first, then the `YYYY-MM-DD HH:MM:SS[.f]` form (read as UTC).
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp(value).map(|ts| ts.date_naive()))
}

/// Only plain decimal/scientific notation counts; words like `inf` or `nan` stay text.
fn parse_numeric_text(text: &str) -> Option<f64> {
    let looks_numeric = text.bytes().any(|b| b.is_ascii_digit())
        && text.bytes().all(|b| b.is_ascii_digit() || matches!(b, b'+' | b'-' | b'.' | b'e' | b'E'));
    if !looks_numeric {
        return None;
    }
    text.parse::<f64>().ok().filter(|value| value.is_finite())
}

/// Stringify pass: timestamps become RFC3339 text and numeric looking text becomes
/// a float. Only columns of the column set are kept; missing fields stay missing.
pub fn normalize_records(records: &[Record], columns: &[String]) -> Vec<Record> {
    records
        .iter()
        .map(|record| {
            columns
                .iter()
                .filter_map(|column| {
                    let value = record.get(column)?;
                    let normalized = match value {
                        Value::Timestamp(ts) => {
                            Value::Text(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
                        }
                        Value::Text(text) => {
                            parse_numeric_text(text).map_or_else(|| value.clone(), Value::Float64)
                        }
                        other => other.clone(),
                    };
                    Some((column.clone(), normalized))
                })
                .collect()
        })
        .collect()
}

fn coerce_value(
    row: usize,
    column: &str,
    value: &Value,
    rules: &CoercionRules<'_>,
) -> Result<PgValue, CoercionError> {
    let coerced = match value {
        Value::Null => PgValue::Absent,
        Value::Bool(b) => PgValue::Bool(*b),
        Value::Int32(i) => PgValue::Int4(*i),
        // Normalized to 32 bits when it fits; wider values are kept rather than truncated.
        Value::Int64(i) => i32::try_from(*i).map(PgValue::Int4).unwrap_or(PgValue::Int8(*i)),
        Value::Float64(f) => PgValue::Float8(*f),
        Value::Decimal(d) => PgValue::Numeric(*d),
        Value::Timestamp(ts) => PgValue::Timestamptz(*ts),
        Value::Bytes(bytes) => PgValue::Bytea(bytes.clone()),
        Value::Text(text) if rules.time_column == Some(column) => {
            match DateTime::parse_from_rfc3339(text.trim()) {
                Ok(parsed) => PgValue::Timestamptz(parsed.with_timezone(&Utc)),
                Err(source) => match rules.on_invalid_value {
                    CoercionFailurePolicy::Abort => {
                        return Err(CoercionError::InvalidTimestamp {
                            row,
                            column: column.to_string(),
                            value: text.clone(),
                            source,
                        });
                    }
                    CoercionFailurePolicy::Null => {
                        warn!(
                            "Record {} column {} value {:?} is not an RFC3339 timestamp ({}), loading NULL",
                            row, column, text, source
                        );
                        PgValue::Absent
                    }
                },
            }
        }
        Value::Text(text) => PgValue::Text(text.clone()),
    };

    Ok(coerced)
}

/// Coerces every record into a row ordered by `columns`.
pub fn coerce_records(
    records: &[Record],
    columns: &[String],
    rules: &CoercionRules<'_>,
) -> Result<Vec<CoercedRow>, CoercionError> {
    records
        .iter()
        .enumerate()
        .map(|(row, record)| {
            columns
                .iter()
                .map(|column| match record.get(column) {
                    Some(value) => coerce_value(row, column, value, rules),
                    None => match rules.on_missing_column {
                        CoercionFailurePolicy::Abort => {
                            Err(CoercionError::MissingColumn { row, column: column.clone() })
                        }
                        CoercionFailurePolicy::Null => {
                            warn!("Record {} is missing column {}, loading NULL", row, column);
                            Ok(PgValue::Absent)
                        }
                    },
                })
                .collect()
        })
        .collect()
}

fn read_column(row: &Row, idx: usize, ty: &PgType) -> Result<Value, tokio_postgres::Error> {
    let value = match *ty {
        PgType::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool),
        PgType::INT2 => row.try_get::<_, Option<i16>>(idx)?.map(|v| Value::Int32(v.into())),
        PgType::INT4 => row.try_get::<_, Option<i32>>(idx)?.map(Value::Int32),
        PgType::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(Value::Int64),
        PgType::OID => row.try_get::<_, Option<u32>>(idx)?.map(|v| Value::Int64(v.into())),
        PgType::FLOAT4 => row.try_get::<_, Option<f32>>(idx)?.map(|v| Value::Float64(v.into())),
        PgType::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(Value::Float64),
        PgType::NUMERIC => match row.try_get::<_, Option<Decimal>>(idx) {
            Ok(decimal) => decimal.and_then(|d| d.to_f64()).map(Value::Float64),
            Err(e) => {
                warn!("Could not read numeric column {}: {}", row.columns()[idx].name(), e);
                None
            }
        },
        PgType::TIMESTAMPTZ => row.try_get::<_, Option<DateTime<Utc>>>(idx)?.map(Value::Timestamp),
        PgType::TIMESTAMP => {
            row.try_get::<_, Option<NaiveDateTime>>(idx)?.map(|v| Value::Timestamp(v.and_utc()))
        }
        PgType::DATE => row
            .try_get::<_, Option<NaiveDate>>(idx)?
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|v| Value::Timestamp(v.and_utc())),
        PgType::BYTEA => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(Value::Bytes),
        PgType::UUID => row.try_get::<_, Option<Uuid>>(idx)?.map(|v| Value::Text(v.to_string())),
        PgType::JSON | PgType::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map(|v| Value::Text(v.to_string())),
        _ => match row.try_get::<_, Option<String>>(idx) {
            Ok(text) => text.map(Value::Text),
            Err(_) => {
                debug!(
                    "Column {} has unsupported type {}, reading NULL",
                    row.columns()[idx].name(),
                    ty
                );
                None
            }
        },
    };

    Ok(value.unwrap_or(Value::Null))
}

/// Reverse pass used by the fetch path: unwraps driver values into [`Value`]s,
/// narrowing numeric columns to `Float64`.
pub fn row_to_record(row: &Row) -> Result<Record, tokio_postgres::Error> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| Ok((column.name().to_string(), read_column(row, idx, column.type_())?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn record(fields: &[(&str, Value)]) -> Record {
        fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn encode(value: &PgValue, ty: &PgType) -> Result<(bool, BytesMut), String> {
        let mut out = BytesMut::new();
        value
            .to_sql(ty, &mut out)
            .map(|is_null| (matches!(is_null, IsNull::Yes), out))
            .map_err(|e| e.to_string())
    }

    #[test]
    fn test_normalize_stringifies_timestamps_and_parses_numbers() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        let records = vec![record(&[
            ("time", Value::Timestamp(ts)),
            ("price", Value::from("10.25")),
            ("name", Value::from("widget")),
            ("day", Value::from("2024-05-06")),
            ("word", Value::from("nan")),
            ("ignored", Value::from(1)),
        ])];

        let normalized =
            normalize_records(&records, &columns(&["day", "name", "price", "time", "word"]));

        assert_eq!(normalized[0]["time"], Value::from("2024-05-06T07:08:09Z"));
        assert_eq!(normalized[0]["price"], Value::Float64(10.25));
        assert_eq!(normalized[0]["name"], Value::from("widget"));
        assert_eq!(normalized[0]["day"], Value::from("2024-05-06"));
        assert_eq!(normalized[0]["word"], Value::from("nan"));
        assert!(!normalized[0].contains_key("ignored"));
    }

    #[test]
    fn test_normalize_keeps_subsecond_precision() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
            + chrono::Duration::milliseconds(250);
        let normalized =
            normalize_records(&[record(&[("time", Value::Timestamp(ts))])], &columns(&["time"]));

        assert_eq!(normalized[0]["time"], Value::from("2024-01-01T00:00:00.250Z"));
    }

    #[test]
    fn test_coerce_rules_per_dynamic_type() {
        let ts = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap();
        let records = vec![record(&[
            ("a_bool", Value::Bool(true)),
            ("b_int", Value::Int64(42)),
            ("c_big", Value::Int64(i64::from(i32::MAX) + 1)),
            ("d_float", Value::Float64(1.5)),
            ("e_text", Value::from("hello")),
            ("f_ts", Value::Timestamp(ts)),
            ("g_null", Value::Null),
            ("h_bytes", Value::Bytes(vec![1, 2])),
            ("time", Value::from("2023-12-31T23:59:59Z")),
        ])];
        let cols = columns(&[
            "a_bool", "b_int", "c_big", "d_float", "e_text", "f_ts", "g_null", "h_bytes", "time",
        ]);
        let rules = CoercionRules { time_column: Some("time"), ..Default::default() };

        let rows = coerce_records(&records, &cols, &rules).unwrap();

        assert_eq!(
            rows[0],
            vec![
                PgValue::Bool(true),
                PgValue::Int4(42),
                PgValue::Int8(i64::from(i32::MAX) + 1),
                PgValue::Float8(1.5),
                PgValue::Text("hello".to_string()),
                PgValue::Timestamptz(ts),
                PgValue::Absent,
                PgValue::Bytea(vec![1, 2]),
                PgValue::Timestamptz(ts),
            ]
        );
    }

    #[test]
    fn test_text_outside_time_column_stays_text() {
        let records = vec![record(&[("created", Value::from("2023-12-31T23:59:59Z"))])];
        let rules = CoercionRules { time_column: Some("time"), ..Default::default() };

        let rows = coerce_records(&records, &columns(&["created"]), &rules).unwrap();

        assert_eq!(rows[0][0], PgValue::Text("2023-12-31T23:59:59Z".to_string()));
    }

    #[test]
    fn test_invalid_time_loads_null_by_default() {
        let records = vec![record(&[("time", Value::from("yesterday")), ("id", Value::from(1))])];
        let rules = CoercionRules { time_column: Some("time"), ..Default::default() };

        let rows = coerce_records(&records, &columns(&["id", "time"]), &rules).unwrap();

        assert_eq!(rows[0], vec![PgValue::Int4(1), PgValue::Absent]);
    }

    #[test]
    fn test_invalid_time_aborts_when_configured() {
        let records = vec![record(&[("time", Value::from("yesterday"))])];
        let rules = CoercionRules {
            time_column: Some("time"),
            on_invalid_value: CoercionFailurePolicy::Abort,
            ..Default::default()
        };

        let err = coerce_records(&records, &columns(&["time"]), &rules).unwrap_err();

        assert!(matches!(err, CoercionError::InvalidTimestamp { row: 0, ref column, .. } if column == "time"));
    }

    #[test]
    fn test_missing_column_policy() {
        let records = vec![
            record(&[("id", Value::from(1)), ("val", Value::from("a"))]),
            record(&[("id", Value::from(2))]),
        ];
        let cols = columns(&["id", "val"]);

        let rows = coerce_records(&records, &cols, &CoercionRules::default()).unwrap();
        assert_eq!(rows[1], vec![PgValue::Int4(2), PgValue::Absent]);

        let strict = CoercionRules {
            on_missing_column: CoercionFailurePolicy::Abort,
            ..Default::default()
        };
        let err = coerce_records(&records, &cols, &strict).unwrap_err();
        assert!(matches!(err, CoercionError::MissingColumn { row: 1, ref column } if column == "val"));
    }

    #[test]
    fn test_encode_absent_is_null() {
        let (is_null, out) = encode(&PgValue::Absent, &PgType::INT4).unwrap();
        assert!(is_null);
        assert!(out.is_empty());
    }

    #[test]
    fn test_encode_int_follows_column_width() {
        let (_, out) = encode(&PgValue::Int4(7), &PgType::INT8).unwrap();
        assert_eq!(&out[..], &7i64.to_be_bytes());

        let (_, out) = encode(&PgValue::Int4(7), &PgType::INT2).unwrap();
        assert_eq!(&out[..], &7i16.to_be_bytes());

        let (_, out) = encode(&PgValue::Int4(7), &PgType::TEXT).unwrap();
        assert_eq!(&out[..], b"7");

        assert!(encode(&PgValue::Int8(70_000), &PgType::INT2).is_err());
        assert!(encode(&PgValue::Int4(1), &PgType::BYTEA).is_err());
    }

    #[test]
    fn test_encode_float_into_integer_columns_requires_integral_value() {
        let (_, out) = encode(&PgValue::Float8(3.0), &PgType::INT4).unwrap();
        assert_eq!(&out[..], &3i32.to_be_bytes());

        let err = encode(&PgValue::Float8(3.5), &PgType::INT4).unwrap_err();
        assert!(err.contains("not an integral value"));
    }

    #[test]
    fn test_encode_text_parses_into_typed_columns() {
        let (_, out) = encode(&PgValue::Text("2024-01-02T03:04:05Z".into()), &PgType::TIMESTAMPTZ)
            .unwrap();
        assert_eq!(out.len(), 8);

        let (_, out) = encode(&PgValue::Text("t".into()), &PgType::BOOL).unwrap();
        assert_eq!(&out[..], &[1]);

        let (_, out) = encode(&PgValue::Text(" 12 ".into()), &PgType::INT4).unwrap();
        assert_eq!(&out[..], &12i32.to_be_bytes());

        let (_, out) =
            encode(&PgValue::Text("7c9e6679-7425-40de-944b-e07fc1f90ae7".into()), &PgType::UUID)
                .unwrap();
        assert_eq!(out.len(), 16);

        assert!(encode(&PgValue::Text("soon".into()), &PgType::TIMESTAMPTZ).is_err());
        assert!(encode(&PgValue::Text("{oops".into()), &PgType::JSONB).is_err());
    }

    #[test]
    fn test_encode_timestamp_into_text_is_rfc3339() {
        let ts = Utc.with_ymd_and_hms(2020, 2, 29, 12, 0, 0).unwrap();
        let (_, out) = encode(&PgValue::Timestamptz(ts), &PgType::VARCHAR).unwrap();
        assert_eq!(&out[..], b"2020-02-29T12:00:00Z");
    }

    #[test]
    fn test_parse_numeric_text() {
        assert_eq!(parse_numeric_text("42"), Some(42.0));
        assert_eq!(parse_numeric_text("-1.5e3"), Some(-1500.0));
        assert_eq!(parse_numeric_text("inf"), None);
        assert_eq!(parse_numeric_text("2024-01-01"), None);
        assert_eq!(parse_numeric_text(""), None);
    }
}
