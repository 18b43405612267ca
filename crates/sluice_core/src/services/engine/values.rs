//! Postgres cell decoding into JSON values.

use serde_json::{Number, Value};
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::Row;

type DecodeError = Box<dyn std::error::Error + Sync + Send>;

/// Decode every cell of a row.
pub fn row_to_json(row: &Row) -> Vec<Value> {
    (0..row.columns().len()).map(|idx| cell_to_json(row, idx)).collect()
}

/// Decode one cell by its Postgres type name.
///
/// Unknown types (enums, domains, extensions) fall back to their raw text payload.
pub fn cell_to_json(row: &Row, idx: usize) -> Value {
    let type_name = row.columns()[idx].type_().name();

    match type_name {
        "bool" => get::<bool>(row, idx).map(Value::Bool),
        "int2" => get::<i16>(row, idx).map(Value::from),
        "int4" => get::<i32>(row, idx).map(Value::from),
        "int8" => get::<i64>(row, idx).map(Value::from),
        "oid" => get::<u32>(row, idx).map(Value::from),
        "float4" => get::<f32>(row, idx).map(|v| float_value(v as f64)),
        "float8" => get::<f64>(row, idx).map(float_value),
        "numeric" => get::<NumericText>(row, idx).map(|v| Value::String(v.0)),
        "text" | "varchar" | "bpchar" | "name" => get::<String>(row, idx).map(Value::String),
        "char" => get::<i8>(row, idx).map(|v| Value::String(char::from(v as u8).to_string())),
        "uuid" => get::<uuid::Uuid>(row, idx).map(|v| Value::String(v.to_string())),
        "json" | "jsonb" => get::<Value>(row, idx),
        "date" => get::<chrono::NaiveDate>(row, idx).map(|v| Value::String(v.to_string())),
        "time" => get::<chrono::NaiveTime>(row, idx).map(|v| Value::String(v.to_string())),
        "timestamp" => get::<chrono::NaiveDateTime>(row, idx).map(|v| Value::String(v.to_string())),
        "timestamptz" => get::<chrono::DateTime<chrono::Utc>>(row, idx)
            .map(|v| Value::String(v.to_rfc3339())),
        "bytea" => get::<Vec<u8>>(row, idx).map(|v| Value::String(hex_bytes(&v))),
        "_text" | "_varchar" | "_bpchar" | "_name" => {
            get::<Vec<Option<String>>>(row, idx).map(|v| Value::from(v.into_iter().map(Value::from).collect::<Vec<_>>()))
        }
        "_int4" => get::<Vec<Option<i32>>>(row, idx).map(|v| Value::from(v.into_iter().map(Value::from).collect::<Vec<_>>())),
        "_int8" => get::<Vec<Option<i64>>>(row, idx).map(|v| Value::from(v.into_iter().map(Value::from).collect::<Vec<_>>())),
        _ => get::<RawText>(row, idx).map(|v| Value::String(v.0)),
    }
    .unwrap_or(Value::Null)
}

fn get<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Option<T> {
    row.try_get::<_, Option<T>>(idx).ok().flatten()
}

/// Non-finite floats have no JSON number form; they keep Postgres's spelling.
fn float_value(v: f64) -> Value {
    match Number::from_f64(v) {
        Some(n) => Value::Number(n),
        None if v.is_nan() => Value::String("NaN".to_string()),
        None if v > 0.0 => Value::String("Infinity".to_string()),
        None => Value::String("-Infinity".to_string()),
    }
}

fn hex_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Any type, decoded as its UTF-8 payload.
struct RawText(String);

impl<'a> FromSql<'a> for RawText {
    fn from_sql(_: &Type, raw: &'a [u8]) -> Result<Self, DecodeError> {
        Ok(Self(String::from_utf8_lossy(raw).into_owned()))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

/// NUMERIC decoded from its binary form into exact decimal text.
struct NumericText(String);

impl NumericText {
    fn parse(raw: &[u8]) -> Result<String, DecodeError> {
        if raw.len() < 8 {
            return Err("invalid NUMERIC payload: too short".into());
        }

        let ndigits = i16::from_be_bytes([raw[0], raw[1]]).max(0) as usize;
        let weight = i16::from_be_bytes([raw[2], raw[3]]);
        let sign = u16::from_be_bytes([raw[4], raw[5]]);
        let dscale = i16::from_be_bytes([raw[6], raw[7]]).max(0) as usize;

        if raw.len() < 8 + ndigits * 2 {
            return Err("invalid NUMERIC payload: truncated digits".into());
        }
        match sign {
            0xC000 => return Ok("NaN".to_string()),
            0xD000 => return Ok("Infinity".to_string()),
            0xF000 => return Ok("-Infinity".to_string()),
            _ => {}
        }

        let digits: Vec<u16> = (0..ndigits)
            .map(|i| u16::from_be_bytes([raw[8 + i * 2], raw[9 + i * 2]]))
            .collect();

        let int_groups = if weight >= 0 { weight as usize + 1 } else { 0 };
        let mut integer = String::new();
        for i in 0..int_groups {
            let group = digits.get(i).copied().unwrap_or(0);
            if integer.is_empty() {
                integer.push_str(&group.to_string());
            } else {
                integer.push_str(&format!("{group:04}"));
            }
        }
        if integer.is_empty() || integer.chars().all(|c| c == '0') {
            integer = "0".to_string();
        }

        let mut fraction = String::new();
        if dscale > 0 {
            let leading_zero_groups = if weight < 0 { (-weight - 1) as usize } else { 0 };
            fraction.push_str(&"0000".repeat(leading_zero_groups));
            for group in digits.iter().skip(int_groups) {
                fraction.push_str(&format!("{group:04}"));
            }
            if fraction.len() < dscale {
                fraction.push_str(&"0".repeat(dscale - fraction.len()));
            }
            fraction.truncate(dscale);
        }

        let negative = sign == 0x4000 && (integer != "0" || fraction.chars().any(|c| c != '0'));
        let mut out = String::new();
        if negative {
            out.push('-');
        }
        out.push_str(&integer);
        if !fraction.is_empty() {
            out.push('.');
            out.push_str(&fraction);
        }
        Ok(out)
    }
}

impl<'a> FromSql<'a> for NumericText {
    fn from_sql(_: &Type, raw: &'a [u8]) -> Result<Self, DecodeError> {
        Ok(Self(Self::parse(raw)?))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}
