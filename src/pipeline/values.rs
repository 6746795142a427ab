//! PostgreSQL to JSON value mapping for result rows.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use postgres_types::{FromSql, Type};
use rust_decimal::Decimal;
use serde_json::{Number, Value};
use std::error::Error;
use tokio_postgres::Row;
use tracing::debug;
use uuid::Uuid;

/// Largest digit count that survives a trip through f64 unchanged
const MAX_EXACT_FLOAT_DIGITS: usize = 15;

/// NUMERIC as exact decimal text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgNumeric(pub String);

impl<'a> FromSql<'a> for PgNumeric {
    /// `Decimal` has no NaN or infinities; the sign word (bytes 4..6 of the
    /// binary header) flags those before decoding.
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        if let [_, _, _, _, hi, lo, ..] = raw {
            match u16::from_be_bytes([*hi, *lo]) {
                0xC000 => return Ok(PgNumeric("NaN".to_string())),
                0xD000 => return Ok(PgNumeric("Infinity".to_string())),
                0xF000 => return Ok(PgNumeric("-Infinity".to_string())),
                _ => {}
            }
        }
        Decimal::from_sql(ty, raw).map(|d| PgNumeric(d.to_string()))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// Exact decimal text to JSON: a number when it round-trips, a string otherwise
pub fn numeric_to_json(text: &str) -> Value {
    if !text.contains('.') {
        if let Ok(n) = text.parse::<i64>() {
            return Value::Number(n.into());
        }
    }

    let significant = text.chars().filter(char::is_ascii_digit).count();
    if significant <= MAX_EXACT_FLOAT_DIGITS {
        if let Some(n) = text.parse::<f64>().ok().and_then(Number::from_f64) {
            return Value::Number(n);
        }
    }

    Value::String(text.to_string())
}

fn float_to_json(v: f64) -> Value {
    // NaN and infinities have no JSON form
    Number::from_f64(v).map_or(Value::Null, Value::Number)
}

fn get<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Result<Option<T>, tokio_postgres::Error> {
    row.try_get::<_, Option<T>>(idx)
}

fn map_or_null<T>(value: Option<T>, f: impl FnOnce(T) -> Value) -> Value {
    value.map_or(Value::Null, f)
}

/// Convert one column of a row; never fails, unmappable values become a placeholder
pub fn column_to_json(row: &Row, idx: usize) -> Value {
    let ty = row.columns()[idx].type_();

    let value = match *ty {
        Type::BOOL => get::<bool>(row, idx).map(|v| map_or_null(v, Value::Bool)),
        Type::INT2 => get::<i16>(row, idx).map(|v| map_or_null(v, Value::from)),
        Type::INT4 => get::<i32>(row, idx).map(|v| map_or_null(v, Value::from)),
        Type::INT8 => get::<i64>(row, idx).map(|v| map_or_null(v, Value::from)),
        Type::OID => get::<u32>(row, idx).map(|v| map_or_null(v, Value::from)),
        Type::FLOAT4 => get::<f32>(row, idx).map(|v| map_or_null(v, |f| float_to_json(f64::from(f)))),
        Type::FLOAT8 => get::<f64>(row, idx).map(|v| map_or_null(v, float_to_json)),
        Type::NUMERIC => get::<PgNumeric>(row, idx).map(|v| map_or_null(v, |n| numeric_to_json(&n.0))),
        Type::JSON | Type::JSONB => get::<Value>(row, idx).map(|v| v.unwrap_or(Value::Null)),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, idx)
            .map(|v| map_or_null(v, |t| Value::String(t.format("%Y-%m-%dT%H:%M:%S").to_string()))),
        Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, idx)
            .map(|v| map_or_null(v, |t| Value::String(t.to_rfc3339()))),
        Type::DATE => get::<NaiveDate>(row, idx)
            .map(|v| map_or_null(v, |d| Value::String(d.format("%Y-%m-%d").to_string()))),
        Type::TIME => get::<NaiveTime>(row, idx)
            .map(|v| map_or_null(v, |t| Value::String(t.format("%H:%M:%S").to_string()))),
        Type::UUID => get::<Uuid>(row, idx).map(|v| map_or_null(v, |u| Value::String(u.to_string()))),
        _ => get::<String>(row, idx).map(|v| map_or_null(v, Value::String)),
    };

    value.unwrap_or_else(|e| {
        debug!(column = row.columns()[idx].name(), pg_type = ty.name(), "Unmapped value: {}", e);
        Value::String(format!("<{}>", ty.name()))
    })
}

/// Convert a row to a JSON-safe `Vec`
pub fn row_to_json(row: &Row) -> Vec<Value> {
    (0..row.len()).map(|idx| column_to_json(row, idx)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn encode(weight: i16, sign: u16, dscale: u16, digits: &[u16]) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&(digits.len() as u16).to_be_bytes());
        raw.extend_from_slice(&weight.to_be_bytes());
        raw.extend_from_slice(&sign.to_be_bytes());
        raw.extend_from_slice(&dscale.to_be_bytes());
        for d in digits {
            raw.extend_from_slice(&d.to_be_bytes());
        }
        raw
    }

    fn decode(weight: i16, sign: u16, dscale: u16, digits: &[u16]) -> String {
        PgNumeric::from_sql(&Type::NUMERIC, &encode(weight, sign, dscale, digits))
            .unwrap()
            .0
    }

    #[test]
    fn test_decode_numeric_values() {
        assert_eq!(decode(0, 0, 2, &[123, 4500]), "123.45");
        assert_eq!(decode(-1, 0, 2, &[500]), "0.05");
        assert_eq!(decode(1, 0, 0, &[1]), "10000");
        assert_eq!(decode(1, 0, 2, &[12, 3456, 7800]), "123456.78");
        assert_eq!(decode(0, 0x4000, 1, &[1, 5000]), "-1.5");
    }

    #[test]
    fn test_decode_special_values() {
        assert_eq!(decode(0, 0xC000, 0, &[]), "NaN");
        assert_eq!(decode(0, 0xD000, 0, &[]), "Infinity");
        assert_eq!(decode(0, 0xF000, 0, &[]), "-Infinity");
    }

    #[test]
    fn test_numeric_from_sql() {
        assert!(PgNumeric::from_sql(&Type::NUMERIC, &[0, 1]).is_err());
        assert!(PgNumeric::accepts(&Type::NUMERIC));
        assert!(!PgNumeric::accepts(&Type::FLOAT8));
    }

    #[test]
    fn test_numeric_to_json() {
        assert_eq!(numeric_to_json("42"), json!(42));
        assert_eq!(numeric_to_json("-7"), json!(-7));
        assert_eq!(numeric_to_json("123.45"), json!(123.45));
        assert_eq!(
            numeric_to_json("12345678901234567890.123"),
            json!("12345678901234567890.123")
        );
        assert_eq!(numeric_to_json("NaN"), json!("NaN"));
    }

    #[test]
    fn test_float_edge_cases() {
        assert_eq!(float_to_json(1.5), json!(1.5));
        assert_eq!(float_to_json(f64::NAN), Value::Null);
        assert_eq!(float_to_json(f64::INFINITY), Value::Null);
    }
}
