//! PostgreSQL driver over tokio-postgres.
//!
//! Connections are opened through the deadpool-postgres manager so that the
//! background connection task is spawned and tracked the same way for every
//! client. Cells are decoded by column type into [`Value`]; NUMERIC is decoded
//! from its binary form into exact decimal text.

use super::{CancelHandle, ConnectTarget, EngineConnection, EngineError, QuerySpec, RawResult};
use crate::models::{ColumnMetadata, EngineType, Value};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use deadpool_postgres::{ClientWrapper, Manager, ManagerConfig, RecyclingMethod};
use futures_util::TryStreamExt;
use std::error::Error as StdError;
use std::fmt::Write as _;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, Kind, ToSql, Type};
use tokio_postgres::{CancelToken, NoTls};
use uuid::Uuid;

type BoxError = Box<dyn StdError + Sync + Send>;

const APPLICATION_NAME: &str = "MesaGrid";

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// A live PostgreSQL session.
pub struct PgConnection {
    client: ClientWrapper,
}

impl PgConnection {
    /// Open and authenticate one connection.
    pub async fn connect(target: &ConnectTarget) -> Result<Self, EngineError> {
        let mut pg_config = tokio_postgres::Config::new();
        pg_config.host(&target.host);
        pg_config.port(target.port);
        pg_config.dbname(&target.database);
        pg_config.user(&target.username);
        pg_config.password(target.password.expose());
        pg_config.application_name(APPLICATION_NAME);
        pg_config.connect_timeout(target.connect_timeout);
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(60));

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig { recycling_method: RecyclingMethod::Fast },
        );

        let client = tokio::time::timeout(
            target.connect_timeout,
            deadpool::managed::Manager::create(&manager),
        )
        .await
        .map_err(|_| {
            EngineError::Timeout(format!(
                "no response from {}:{} within {}ms",
                target.host,
                target.port,
                target.connect_timeout.as_millis()
            ))
        })?
        .map_err(|e| classify(&e))?;

        tracing::debug!(
            host = %target.host,
            port = target.port,
            database = %target.database,
            "PostgreSQL connection established"
        );

        Ok(Self { client })
    }
}

#[async_trait]
impl EngineConnection for PgConnection {
    fn engine(&self) -> EngineType {
        EngineType::Postgres
    }

    async fn query(&mut self, spec: QuerySpec<'_>) -> Result<RawResult, EngineError> {
        let statement = self.client.prepare(spec.sql).await.map_err(|e| classify(&e))?;
        let params = spec.params.iter().map(|p| p as &(dyn ToSql + Sync));

        if statement.columns().is_empty() {
            let affected =
                self.client.execute_raw(&statement, params).await.map_err(|e| classify(&e))?;
            return Ok(RawResult { rows_affected: Some(affected), ..Default::default() });
        }

        // Nullability of an ad-hoc result column is not knowable from the
        // row description, so every column reports nullable.
        let columns: Vec<ColumnMetadata> = statement
            .columns()
            .iter()
            .map(|c| ColumnMetadata::new(c.name(), c.type_().name(), true))
            .collect();

        let stream = self.client.query_raw(&statement, params).await.map_err(|e| classify(&e))?;
        let mut stream = pin!(stream);

        let mut skipped = 0usize;
        let mut rows = Vec::with_capacity(spec.max_rows.min(1024));
        let mut more_available = false;
        while let Some(row) = stream.try_next().await.map_err(|e| classify(&e))? {
            if skipped < spec.skip {
                skipped += 1;
                continue;
            }
            if rows.len() == spec.max_rows {
                more_available = true;
                break;
            }
            rows.push(decode_row(&row)?);
        }

        Ok(RawResult { columns, rows, rows_affected: None, more_available })
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, EngineError> {
        self.client
            .execute_raw(sql, params.iter().map(|p| p as &(dyn ToSql + Sync)))
            .await
            .map_err(|e| classify(&e))
    }

    async fn ping(&mut self) -> Result<(), EngineError> {
        self.client.simple_query("").await.map(|_| ()).map_err(|e| classify(&e))
    }

    async fn server_version(&mut self) -> Result<String, EngineError> {
        let row =
            self.client.query_one("SELECT version()", &[]).await.map_err(|e| classify(&e))?;
        row.try_get::<_, String>(0).map_err(|e| classify(&e))
    }

    fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    fn cancel_handle(&self) -> Arc<dyn CancelHandle> {
        Arc::new(PgCancel { token: self.client.cancel_token() })
    }
}

struct PgCancel {
    token: CancelToken,
}

#[async_trait]
impl CancelHandle for PgCancel {
    async fn cancel(&self) -> Result<(), EngineError> {
        self.token.cancel_query(NoTls).await.map_err(|e| classify(&e))
    }
}

/// Classify a driver error by SQLSTATE, then by transport symptom.
pub(crate) fn classify(err: &tokio_postgres::Error) -> EngineError {
    if let Some(db_err) = err.as_db_error() {
        let code = db_err.code().code();
        let mut message = db_err.message().to_string();
        if let Some(detail) = db_err.detail() {
            let _ = write!(message, " ({detail})");
        }

        return match code {
            "28P01" | "28000" => EngineError::Auth(message),
            "57014" => EngineError::Cancelled,
            _ if code.starts_with("08") || code.starts_with("57P0") => {
                EngineError::Unreachable(message)
            }
            _ if code.starts_with("23") => {
                EngineError::Constraint { message, code: Some(code.to_string()) }
            }
            _ => EngineError::Rejected { message, code: Some(code.to_string()) },
        };
    }

    if err.is_closed() {
        return EngineError::Unreachable("connection closed".to_string());
    }

    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("serializing parameter")
        || lower.contains("deserializing column")
        || lower.contains("parameters but")
    {
        EngineError::rejected(message)
    } else if lower.contains("timeout") || lower.contains("timed out") {
        EngineError::Timeout(message)
    } else if lower.contains("password") || lower.contains("authentication") {
        EngineError::Auth(message)
    } else {
        EngineError::Unreachable(message)
    }
}

// ========== Decoding ==========

fn decode_row(row: &tokio_postgres::Row) -> Result<Vec<Value>, EngineError> {
    (0..row.len())
        .map(|idx| {
            decode_cell(row, idx).map_err(|e| {
                EngineError::rejected(format!(
                    "cannot decode column {}: {e}",
                    row.columns()[idx].name()
                ))
            })
        })
        .collect()
}

fn decode_cell(row: &tokio_postgres::Row, idx: usize) -> Result<Value, tokio_postgres::Error> {
    let ty = row.columns()[idx].type_();

    let value = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(Value::Boolean),
        Type::INT2 => row.try_get::<_, Option<i16>>(idx)?.map(|v| Value::Integer(v.into())),
        Type::INT4 => row.try_get::<_, Option<i32>>(idx)?.map(|v| Value::Integer(v.into())),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(Value::Integer),
        Type::OID => row.try_get::<_, Option<u32>>(idx)?.map(|v| Value::Integer(v.into())),
        Type::FLOAT4 => row.try_get::<_, Option<f32>>(idx)?.map(|v| Value::Float(v.into())),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(Value::Float),
        Type::NUMERIC => row.try_get::<_, Option<PgNumeric>>(idx)?.map(|n| Value::Text(n.0)),
        Type::TIMESTAMPTZ => row.try_get::<_, Option<DateTime<Utc>>>(idx)?.map(Value::Timestamp),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(|v| Value::Timestamp(v.and_utc())),
        Type::DATE => row.try_get::<_, Option<NaiveDate>>(idx)?.map(|v| Value::Text(v.to_string())),
        Type::TIME => row.try_get::<_, Option<NaiveTime>>(idx)?.map(|v| Value::Text(v.to_string())),
        Type::UUID => row.try_get::<_, Option<Uuid>>(idx)?.map(|v| Value::Text(v.to_string())),
        Type::JSON | Type::JSONB => row.try_get::<_, Option<serde_json::Value>>(idx)?.map(Value::Json),
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(Value::Bytes),
        Type::CHAR => row
            .try_get::<_, Option<i8>>(idx)?
            .map(|v| Value::Text(char::from(v as u8).to_string())),
        _ if <String as FromSql<'_>>::accepts(ty) => row.try_get::<_, Option<String>>(idx)?.map(Value::Text),
        _ => row.try_get::<_, Option<RawCell>>(idx)?.map(|raw| raw.into_value(ty)),
    };

    Ok(value.unwrap_or(Value::Null))
}

/// Undecoded cell for types without a native mapping.
struct RawCell(Vec<u8>);

impl RawCell {
    fn into_value(self, ty: &Type) -> Value {
        match ty.kind() {
            Kind::Enum(_) => match String::from_utf8(self.0) {
                Ok(label) => Value::Text(label),
                Err(e) => Value::Bytes(e.into_bytes()),
            },
            _ => Value::Bytes(self.0),
        }
    }
}

impl<'a> FromSql<'a> for RawCell {
    fn from_sql(_: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        Ok(Self(raw.to_vec()))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

/// NUMERIC rendered as exact decimal text.
struct PgNumeric(String);

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(_: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        decode_numeric(raw).map(Self)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// Decode the binary NUMERIC format: base-10000 digit groups with a weight
/// (exponent of the first group), a sign word and a display scale.
fn decode_numeric(raw: &[u8]) -> Result<String, BoxError> {
    if raw.len() < 8 {
        return Err("numeric value too short".into());
    }
    let ndigits = u16::from_be_bytes([raw[0], raw[1]]) as usize;
    let weight = i32::from(i16::from_be_bytes([raw[2], raw[3]]));
    let sign = u16::from_be_bytes([raw[4], raw[5]]);
    let dscale = u16::from_be_bytes([raw[6], raw[7]]) as usize;

    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        NUMERIC_POS | NUMERIC_NEG => {}
        other => return Err(format!("invalid numeric sign {other:#06x}").into()),
    }

    if raw.len() < 8 + ndigits * 2 {
        return Err("numeric value truncated".into());
    }
    let groups: Vec<u16> = raw[8..8 + ndigits * 2]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    if groups.iter().any(|g| *g > 9999) {
        return Err("numeric digit group out of range".into());
    }

    let group_at = |index: i32| -> u16 {
        usize::try_from(index).ok().and_then(|i| groups.get(i)).copied().unwrap_or(0)
    };

    let mut integer = String::new();
    if weight < 0 {
        integer.push('0');
    } else {
        for index in 0..=weight {
            let group = group_at(index);
            if index == 0 {
                let _ = write!(integer, "{group}");
            } else {
                let _ = write!(integer, "{group:04}");
            }
        }
    }

    let mut fraction = String::new();
    let mut index = weight + 1;
    while fraction.len() < dscale {
        let _ = write!(fraction, "{:04}", group_at(index));
        index += 1;
    }
    fraction.truncate(dscale);

    let is_zero = groups.iter().all(|g| *g == 0);
    let mut text = String::with_capacity(integer.len() + fraction.len() + 2);
    if sign == NUMERIC_NEG && !is_zero {
        text.push('-');
    }
    text.push_str(&integer);
    if !fraction.is_empty() {
        text.push('.');
        text.push_str(&fraction);
    }
    Ok(text)
}

// ========== Binding ==========

/// Values bind against any parameter type; the conversion follows the type
/// the server inferred for the placeholder.
impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Boolean(v) => match *ty {
                Type::BOOL => v.to_sql(ty, out),
                _ => text_to_sql(if *v { "true" } else { "false" }, ty, out),
            },
            Value::Integer(v) => integer_to_sql(*v, ty, out),
            Value::Float(v) => match *ty {
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                Type::FLOAT8 => v.to_sql(ty, out),
                _ => text_to_sql(&v.to_string(), ty, out),
            },
            Value::Text(v) => text_to_sql(v, ty, out),
            Value::Bytes(v) => v.to_sql(ty, out),
            Value::Timestamp(v) => match *ty {
                Type::TIMESTAMP => v.naive_utc().to_sql(ty, out),
                Type::DATE => v.date_naive().to_sql(ty, out),
                Type::TIMESTAMPTZ => v.to_sql(ty, out),
                _ => text_to_sql(&v.to_rfc3339(), ty, out),
            },
            Value::Json(v) => match *ty {
                Type::JSON | Type::JSONB => v.to_sql(ty, out),
                _ => text_to_sql(&v.to_string(), ty, out),
            },
        }
    }

    fn accepts(_: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn integer_to_sql(v: i64, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    match *ty {
        Type::INT2 => i16::try_from(v)?.to_sql(ty, out),
        Type::INT4 => i32::try_from(v)?.to_sql(ty, out),
        Type::INT8 => v.to_sql(ty, out),
        Type::OID => u32::try_from(v)?.to_sql(ty, out),
        Type::FLOAT4 => (v as f32).to_sql(ty, out),
        Type::FLOAT8 => (v as f64).to_sql(ty, out),
        Type::BOOL => (v != 0).to_sql(ty, out),
        _ => text_to_sql(&v.to_string(), ty, out),
    }
}

fn text_to_sql(s: &str, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    match *ty {
        Type::INT2 => s.trim().parse::<i16>()?.to_sql(ty, out),
        Type::INT4 => s.trim().parse::<i32>()?.to_sql(ty, out),
        Type::INT8 => s.trim().parse::<i64>()?.to_sql(ty, out),
        Type::OID => s.trim().parse::<u32>()?.to_sql(ty, out),
        Type::FLOAT4 => s.trim().parse::<f32>()?.to_sql(ty, out),
        Type::FLOAT8 => s.trim().parse::<f64>()?.to_sql(ty, out),
        Type::NUMERIC => encode_numeric(s.trim(), out),
        Type::BOOL => parse_bool(s)?.to_sql(ty, out),
        Type::UUID => Uuid::parse_str(s.trim())?.to_sql(ty, out),
        Type::DATE => s.trim().parse::<NaiveDate>()?.to_sql(ty, out),
        Type::TIME => s.trim().parse::<NaiveTime>()?.to_sql(ty, out),
        Type::TIMESTAMP => parse_naive_timestamp(s)?.to_sql(ty, out),
        Type::TIMESTAMPTZ => DateTime::parse_from_rfc3339(s.trim())?.with_timezone(&Utc).to_sql(ty, out),
        Type::JSON | Type::JSONB => serde_json::from_str::<serde_json::Value>(s)?.to_sql(ty, out),
        Type::BYTEA => s.as_bytes().to_sql(ty, out),
        _ => {
            // Text-like and enum types share the raw UTF-8 wire form.
            out.put_slice(s.as_bytes());
            Ok(IsNull::No)
        }
    }
}

fn parse_bool(s: &str) -> Result<bool, BoxError> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "on" | "1" => Ok(true),
        "false" | "f" | "no" | "n" | "off" | "0" => Ok(false),
        other => Err(format!("invalid boolean '{other}'").into()),
    }
}

fn parse_naive_timestamp(s: &str) -> Result<NaiveDateTime, BoxError> {
    let s = s.trim();
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
        .or_else(|_| DateTime::parse_from_rfc3339(s).map(|dt| dt.naive_utc()))
        .map_err(Into::into)
}

/// Encode decimal text in the binary NUMERIC format.
fn encode_numeric(text: &str, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    if text.eq_ignore_ascii_case("nan") {
        write_numeric(out, 0, NUMERIC_NAN, 0, &[]);
        return Ok(IsNull::No);
    }

    let (negative, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (int_digits, frac_digits) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    if (int_digits.is_empty() && frac_digits.is_empty())
        || !int_digits.bytes().all(|b| b.is_ascii_digit())
        || !frac_digits.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(format!("invalid numeric '{text}'").into());
    }

    let int_digits = int_digits.trim_start_matches('0');
    let dscale = u16::try_from(frac_digits.len())?;

    // Left-pad the integer part and right-pad the fraction to whole groups.
    let int_pad = (4 - int_digits.len() % 4) % 4;
    let frac_pad = (4 - frac_digits.len() % 4) % 4;
    let mut digits = String::with_capacity(int_pad + int_digits.len() + frac_digits.len() + frac_pad);
    digits.extend(std::iter::repeat('0').take(int_pad));
    digits.push_str(int_digits);
    digits.push_str(frac_digits);
    digits.extend(std::iter::repeat('0').take(frac_pad));

    let mut groups: Vec<u16> = digits
        .as_bytes()
        .chunks(4)
        .map(|chunk| chunk.iter().fold(0u16, |acc, b| acc * 10 + u16::from(b - b'0')))
        .collect();
    let int_groups = (int_pad + int_digits.len()) / 4;
    let mut weight = i32::try_from(int_groups)? - 1;

    let leading = groups.iter().take_while(|g| **g == 0).count();
    groups.drain(..leading);
    weight -= i32::try_from(leading)?;
    while groups.last() == Some(&0) {
        groups.pop();
    }

    if groups.is_empty() {
        write_numeric(out, 0, NUMERIC_POS, dscale, &[]);
    } else {
        let sign = if negative { NUMERIC_NEG } else { NUMERIC_POS };
        write_numeric(out, i16::try_from(weight)?, sign, dscale, &groups);
    }
    Ok(IsNull::No)
}

fn write_numeric(out: &mut BytesMut, weight: i16, sign: u16, dscale: u16, groups: &[u16]) {
    out.put_u16(groups.len() as u16);
    out.put_i16(weight);
    out.put_u16(sign);
    out.put_u16(dscale);
    for group in groups {
        out.put_u16(*group);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric_bytes(ndigits: u16, weight: i16, sign: u16, dscale: u16, groups: &[u16]) -> Vec<u8> {
        let mut out = BytesMut::new();
        write_numeric(&mut out, weight, sign, dscale, &groups[..ndigits as usize]);
        out.to_vec()
    }

    #[test]
    fn test_decode_numeric_keeps_scale() {
        // 12345.670 = [1, 2345, 6700] weight 1, scale 3
        let raw = numeric_bytes(3, 1, NUMERIC_POS, 3, &[1, 2345, 6700]);
        assert_eq!(decode_numeric(&raw).unwrap(), "12345.670");
    }

    #[test]
    fn test_decode_numeric_small_fraction() {
        // 0.00005 = [5000] weight -2, scale 5
        let raw = numeric_bytes(1, -2, NUMERIC_POS, 5, &[5000]);
        assert_eq!(decode_numeric(&raw).unwrap(), "0.00005");
    }

    #[test]
    fn test_decode_numeric_special_values() {
        assert_eq!(decode_numeric(&numeric_bytes(0, 0, NUMERIC_NAN, 0, &[])).unwrap(), "NaN");
        assert_eq!(decode_numeric(&numeric_bytes(0, 0, NUMERIC_POS, 2, &[])).unwrap(), "0.00");
        assert_eq!(
            decode_numeric(&numeric_bytes(1, 0, NUMERIC_NEG, 0, &[42])).unwrap(),
            "-42"
        );
        assert!(decode_numeric(&[0, 1]).is_err());
    }

    #[test]
    fn test_encode_numeric_layout() {
        let mut out = BytesMut::new();
        encode_numeric("-10000.5", &mut out).unwrap();
        // groups [1, 0, 5000], weight 1, negative, scale 1
        assert_eq!(out.to_vec(), numeric_bytes(3, 1, NUMERIC_NEG, 1, &[1, 0, 5000]));
        assert_eq!(decode_numeric(&out).unwrap(), "-10000.5");

        let mut out = BytesMut::new();
        encode_numeric("0.00005", &mut out).unwrap();
        assert_eq!(out.to_vec(), numeric_bytes(1, -2, NUMERIC_POS, 5, &[5000]));
    }

    #[test]
    fn test_encode_numeric_rejects_garbage() {
        let mut out = BytesMut::new();
        assert!(encode_numeric("12a", &mut out).is_err());
        assert!(encode_numeric(".", &mut out).is_err());
    }

    #[test]
    fn test_integer_binds_to_column_width() {
        let mut out = BytesMut::new();
        Value::Integer(7).to_sql(&Type::INT4, &mut out).unwrap();
        assert_eq!(out.len(), 4);

        let mut out = BytesMut::new();
        assert!(Value::Integer(70_000).to_sql(&Type::INT2, &mut out).is_err());
    }

    #[test]
    fn test_text_binds_by_target_type() {
        let mut out = BytesMut::new();
        Value::from("42").to_sql(&Type::INT8, &mut out).unwrap();
        assert_eq!(out.to_vec(), 42i64.to_be_bytes().to_vec());

        let mut out = BytesMut::new();
        Value::from("t").to_sql(&Type::BOOL, &mut out).unwrap();
        assert_eq!(out.to_vec(), vec![1]);

        let mut out = BytesMut::new();
        assert!(matches!(Value::Null.to_sql(&Type::TEXT, &mut out), Ok(IsNull::Yes)));
    }

    #[test]
    fn test_naive_timestamp_formats() {
        assert!(parse_naive_timestamp("2024-01-02 03:04:05").is_ok());
        assert!(parse_naive_timestamp("2024-01-02T03:04:05.123").is_ok());
        assert!(parse_naive_timestamp("yesterday").is_err());
    }
}
