//! MySQL driver over mysql_async.
//!
//! Each [`MySqlConnection`] owns one `Conn`. Cancellation opens a second
//! short-lived connection and issues `KILL QUERY` against the first one's
//! server-side id.

use super::{CancelHandle, ConnectTarget, EngineConnection, EngineError, QuerySpec, RawResult};
use crate::models::{ColumnMetadata, EngineType, Value};

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use mysql_async::consts::{ColumnFlags, ColumnType};
use mysql_async::prelude::*;
use mysql_async::{Column, Conn, DriverError, Opts, OptsBuilder, Params};
use std::sync::Arc;
use std::time::Duration;

/// Character set number MySQL reports for binary strings.
const BINARY_CHARSET: u16 = 63;

/// A live MySQL session.
pub struct MySqlConnection {
    conn: Conn,
    opts: Opts,
    connect_timeout: Duration,
    broken: bool,
}

impl MySqlConnection {
    /// Open and authenticate one connection.
    pub async fn connect(target: &ConnectTarget) -> Result<Self, EngineError> {
        let opts: Opts = OptsBuilder::default()
            .ip_or_hostname(target.host.clone())
            .tcp_port(target.port)
            .user(Some(target.username.clone()))
            .pass(Some(target.password.expose().to_string()))
            .db_name(Some(target.database.clone()))
            .client_found_rows(true)
            .into();

        let conn = open(opts.clone(), target.connect_timeout).await?;

        tracing::debug!(
            host = %target.host,
            port = target.port,
            database = %target.database,
            connection_id = conn.id(),
            "MySQL connection established"
        );

        Ok(Self { conn, opts, connect_timeout: target.connect_timeout, broken: false })
    }

    fn fail(&mut self, err: mysql_async::Error) -> EngineError {
        let classified = classify(&err);
        if classified.is_connection_lost() {
            self.broken = true;
        }
        classified
    }
}

async fn open(opts: Opts, timeout: Duration) -> Result<Conn, EngineError> {
    let host = opts.ip_or_hostname().to_string();
    tokio::time::timeout(timeout, Conn::new(opts))
        .await
        .map_err(|_| {
            EngineError::Timeout(format!("no response from {host} within {}ms", timeout.as_millis()))
        })?
        .map_err(|e| classify(&e))
}

#[async_trait]
impl EngineConnection for MySqlConnection {
    fn engine(&self) -> EngineType {
        EngineType::Mysql
    }

    async fn query(&mut self, spec: QuerySpec<'_>) -> Result<RawResult, EngineError> {
        let outcome = run_query(&mut self.conn, spec).await;
        outcome.map_err(|e| self.fail(e))
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, EngineError> {
        let outcome = if params.is_empty() {
            self.conn.query_drop(sql).await
        } else {
            self.conn.exec_drop(sql, to_params(params)).await
        };
        match outcome {
            Ok(()) => Ok(self.conn.affected_rows()),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn ping(&mut self) -> Result<(), EngineError> {
        let outcome = self.conn.ping().await;
        outcome.map_err(|e| self.fail(e))
    }

    async fn server_version(&mut self) -> Result<String, EngineError> {
        let outcome = self.conn.query_first::<String, _>("SELECT VERSION()").await;
        match outcome {
            Ok(version) => Ok(version.unwrap_or_default()),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn is_closed(&self) -> bool {
        self.broken
    }

    fn cancel_handle(&self) -> Arc<dyn CancelHandle> {
        Arc::new(MySqlCancel {
            opts: self.opts.clone(),
            connection_id: self.conn.id(),
            connect_timeout: self.connect_timeout,
        })
    }
}

struct MySqlCancel {
    opts: Opts,
    connection_id: u32,
    connect_timeout: Duration,
}

#[async_trait]
impl CancelHandle for MySqlCancel {
    async fn cancel(&self) -> Result<(), EngineError> {
        let mut conn = open(self.opts.clone(), self.connect_timeout).await?;
        let outcome = conn.query_drop(format!("KILL QUERY {}", self.connection_id)).await;
        if let Err(e) = conn.disconnect().await {
            tracing::debug!(error = %e, "Cancel connection did not close cleanly");
        }
        outcome.map_err(|e| classify(&e))
    }
}

async fn run_query(conn: &mut Conn, spec: QuerySpec<'_>) -> Result<RawResult, mysql_async::Error> {
    // Text and binary protocol results have distinct types but the same API.
    macro_rules! collect {
        ($result:expr) => {{
            let mut result = $result;
            let source: Vec<Column> = result.columns_ref().to_vec();
            if source.is_empty() {
                let affected = result.affected_rows();
                result.drop_result().await?;
                return Ok(RawResult { rows_affected: Some(affected), ..Default::default() });
            }

            let mut skipped = 0usize;
            let mut rows: Vec<Vec<Value>> = Vec::with_capacity(spec.max_rows.min(1024));
            let mut more_available = false;
            while let Some(mut row) = result.next().await? {
                if skipped < spec.skip {
                    skipped += 1;
                    continue;
                }
                if rows.len() == spec.max_rows {
                    more_available = true;
                    break;
                }
                let values: Vec<Value> = source
                    .iter()
                    .enumerate()
                    .map(|(idx, column)| {
                        let raw = row.take::<mysql_async::Value, usize>(idx);
                        decode_value(raw.unwrap_or(mysql_async::Value::NULL), column)
                    })
                    .collect();
                rows.push(values);
            }
            if more_available {
                result.drop_result().await?;
            }

            let columns = source.iter().map(column_metadata).collect();
            Ok(RawResult { columns, rows, rows_affected: None, more_available })
        }};
    }

    if spec.params.is_empty() {
        collect!(conn.query_iter(spec.sql).await?)
    } else {
        collect!(conn.exec_iter(spec.sql, to_params(spec.params)).await?)
    }
}

/// Classify a driver error by server error number, then by transport symptom.
pub(crate) fn classify(err: &mysql_async::Error) -> EngineError {
    match err {
        mysql_async::Error::Server(server) => {
            let message = server.message.clone();
            let code = Some(server.code.to_string());
            match server.code {
                1044 | 1045 | 1698 => EngineError::Auth(message),
                1317 => EngineError::Cancelled,
                1040 | 1053 | 1152 | 1153 | 1158..=1161 | 2006 | 2013 => {
                    EngineError::Unreachable(message)
                }
                1048 | 1062 | 1216 | 1217 | 1364 | 1451 | 1452 | 1557 | 3819 => {
                    EngineError::Constraint { message, code }
                }
                _ => EngineError::Rejected { message, code },
            }
        }
        mysql_async::Error::Io(e) => EngineError::Unreachable(e.to_string()),
        mysql_async::Error::Driver(DriverError::StmtParamsMismatch { .. }) => {
            EngineError::rejected(err.to_string())
        }
        mysql_async::Error::Driver(e) => EngineError::Unreachable(e.to_string()),
        other => EngineError::rejected(other.to_string()),
    }
}

fn to_params(values: &[Value]) -> Params {
    Params::Positional(values.iter().map(to_mysql_value).collect())
}

fn to_mysql_value(value: &Value) -> mysql_async::Value {
    match value {
        Value::Null => mysql_async::Value::NULL,
        Value::Integer(v) => mysql_async::Value::Int(*v),
        Value::Float(v) => mysql_async::Value::Double(*v),
        Value::Text(v) => mysql_async::Value::Bytes(v.clone().into_bytes()),
        Value::Boolean(v) => mysql_async::Value::Int(i64::from(*v)),
        Value::Bytes(v) => mysql_async::Value::Bytes(v.clone()),
        Value::Timestamp(v) => mysql_async::Value::Date(
            u16::try_from(v.year()).unwrap_or(0),
            v.month() as u8,
            v.day() as u8,
            v.hour() as u8,
            v.minute() as u8,
            v.second() as u8,
            v.timestamp_subsec_micros(),
        ),
        Value::Json(v) => mysql_async::Value::Bytes(v.to_string().into_bytes()),
    }
}

fn column_metadata(column: &Column) -> ColumnMetadata {
    let nullable = !column.flags().contains(ColumnFlags::NOT_NULL_FLAG);
    ColumnMetadata::new(column.name_str(), type_name(column), nullable)
}

fn is_binary(column: &Column) -> bool {
    column.character_set() == BINARY_CHARSET
}

fn type_name(column: &Column) -> &'static str {
    match column.column_type() {
        ColumnType::MYSQL_TYPE_TINY => "tinyint",
        ColumnType::MYSQL_TYPE_SHORT => "smallint",
        ColumnType::MYSQL_TYPE_INT24 => "mediumint",
        ColumnType::MYSQL_TYPE_LONG => "int",
        ColumnType::MYSQL_TYPE_LONGLONG => "bigint",
        ColumnType::MYSQL_TYPE_FLOAT => "float",
        ColumnType::MYSQL_TYPE_DOUBLE => "double",
        ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => "decimal",
        ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE => "date",
        ColumnType::MYSQL_TYPE_DATETIME | ColumnType::MYSQL_TYPE_DATETIME2 => "datetime",
        ColumnType::MYSQL_TYPE_TIMESTAMP | ColumnType::MYSQL_TYPE_TIMESTAMP2 => "timestamp",
        ColumnType::MYSQL_TYPE_TIME | ColumnType::MYSQL_TYPE_TIME2 => "time",
        ColumnType::MYSQL_TYPE_YEAR => "year",
        ColumnType::MYSQL_TYPE_BIT => "bit",
        ColumnType::MYSQL_TYPE_JSON => "json",
        ColumnType::MYSQL_TYPE_ENUM => "enum",
        ColumnType::MYSQL_TYPE_SET => "set",
        ColumnType::MYSQL_TYPE_GEOMETRY => "geometry",
        ColumnType::MYSQL_TYPE_VARCHAR | ColumnType::MYSQL_TYPE_VAR_STRING if is_binary(column) => {
            "varbinary"
        }
        ColumnType::MYSQL_TYPE_VARCHAR | ColumnType::MYSQL_TYPE_VAR_STRING => "varchar",
        ColumnType::MYSQL_TYPE_STRING if is_binary(column) => "binary",
        ColumnType::MYSQL_TYPE_STRING => "char",
        ColumnType::MYSQL_TYPE_TINY_BLOB
        | ColumnType::MYSQL_TYPE_MEDIUM_BLOB
        | ColumnType::MYSQL_TYPE_LONG_BLOB
        | ColumnType::MYSQL_TYPE_BLOB
            if is_binary(column) =>
        {
            "blob"
        }
        ColumnType::MYSQL_TYPE_TINY_BLOB
        | ColumnType::MYSQL_TYPE_MEDIUM_BLOB
        | ColumnType::MYSQL_TYPE_LONG_BLOB
        | ColumnType::MYSQL_TYPE_BLOB => "text",
        _ => "unknown",
    }
}

/// Convert a driver value using the column type, since the text protocol
/// delivers every non-NULL cell as bytes.
fn decode_value(raw: mysql_async::Value, column: &Column) -> Value {
    let column_type = column.column_type();
    match raw {
        mysql_async::Value::NULL => Value::Null,
        mysql_async::Value::Int(v) => Value::Integer(v),
        mysql_async::Value::UInt(v) => match i64::try_from(v) {
            Ok(v) => Value::Integer(v),
            Err(_) => Value::Text(v.to_string()),
        },
        mysql_async::Value::Float(v) => Value::Float(v.into()),
        mysql_async::Value::Double(v) => Value::Float(v),
        mysql_async::Value::Date(year, month, day, hour, minute, second, micros) => {
            let date = NaiveDate::from_ymd_opt(year.into(), month.into(), day.into());
            match column_type {
                ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE => {
                    Value::Text(format!("{year:04}-{month:02}-{day:02}"))
                }
                _ => date
                    .and_then(|d| {
                        d.and_hms_micro_opt(hour.into(), minute.into(), second.into(), micros)
                    })
                    .map(|dt| Value::Timestamp(dt.and_utc()))
                    .unwrap_or_else(|| {
                        Value::Text(format!(
                            "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}"
                        ))
                    }),
            }
        }
        mysql_async::Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let sign = if negative { "-" } else { "" };
            let total_hours = days * 24 + u32::from(hours);
            if micros == 0 {
                Value::Text(format!("{sign}{total_hours:02}:{minutes:02}:{seconds:02}"))
            } else {
                Value::Text(format!("{sign}{total_hours:02}:{minutes:02}:{seconds:02}.{micros:06}"))
            }
        }
        mysql_async::Value::Bytes(bytes) => decode_bytes(bytes, column),
    }
}

fn decode_bytes(bytes: Vec<u8>, column: &Column) -> Value {
    let column_type = column.column_type();
    if column_type == ColumnType::MYSQL_TYPE_BIT || (is_binary(column) && !is_numeric(column_type)) {
        return Value::Bytes(bytes);
    }

    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => return Value::Bytes(e.into_bytes()),
    };

    match column_type {
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_YEAR => {
            text.parse::<i64>().map(Value::Integer).unwrap_or(Value::Text(text))
        }
        ColumnType::MYSQL_TYPE_FLOAT | ColumnType::MYSQL_TYPE_DOUBLE => {
            text.parse::<f64>().map(Value::Float).unwrap_or(Value::Text(text))
        }
        ColumnType::MYSQL_TYPE_JSON => {
            serde_json::from_str(&text).map(Value::Json).unwrap_or(Value::Text(text))
        }
        ColumnType::MYSQL_TYPE_DATETIME
        | ColumnType::MYSQL_TYPE_DATETIME2
        | ColumnType::MYSQL_TYPE_TIMESTAMP
        | ColumnType::MYSQL_TYPE_TIMESTAMP2 => {
            NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f")
                .map(|dt| Value::Timestamp(dt.and_utc()))
                .unwrap_or(Value::Text(text))
        }
        // DECIMAL stays text so no precision is lost.
        _ => Value::Text(text),
    }
}

fn is_numeric(column_type: ColumnType) -> bool {
    matches!(
        column_type,
        ColumnType::MYSQL_TYPE_TINY
            | ColumnType::MYSQL_TYPE_SHORT
            | ColumnType::MYSQL_TYPE_INT24
            | ColumnType::MYSQL_TYPE_LONG
            | ColumnType::MYSQL_TYPE_LONGLONG
            | ColumnType::MYSQL_TYPE_YEAR
            | ColumnType::MYSQL_TYPE_FLOAT
            | ColumnType::MYSQL_TYPE_DOUBLE
            | ColumnType::MYSQL_TYPE_DECIMAL
            | ColumnType::MYSQL_TYPE_NEWDECIMAL
            | ColumnType::MYSQL_TYPE_DATE
            | ColumnType::MYSQL_TYPE_NEWDATE
            | ColumnType::MYSQL_TYPE_DATETIME
            | ColumnType::MYSQL_TYPE_DATETIME2
            | ColumnType::MYSQL_TYPE_TIMESTAMP
            | ColumnType::MYSQL_TYPE_TIMESTAMP2
            | ColumnType::MYSQL_TYPE_TIME
            | ColumnType::MYSQL_TYPE_TIME2
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_params_convert_by_variant() {
        let params = to_params(&[Value::Null, Value::Boolean(true), Value::from("a")]);
        let Params::Positional(values) = params else {
            panic!("expected positional params");
        };
        assert_eq!(values[0], mysql_async::Value::NULL);
        assert_eq!(values[1], mysql_async::Value::Int(1));
        assert_eq!(values[2], mysql_async::Value::Bytes(b"a".to_vec()));
    }

    #[test]
    fn test_timestamp_param_keeps_micros() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap()
            + chrono::Duration::microseconds(120);
        assert_eq!(
            to_mysql_value(&Value::Timestamp(ts)),
            mysql_async::Value::Date(2024, 5, 6, 7, 8, 9, 120)
        );
    }

    #[test]
    fn test_server_errors_are_classified() {
        let server = |code: u16| {
            mysql_async::Error::Server(mysql_async::ServerError {
                code,
                message: format!("error {code}"),
                state: "HY000".into(),
            })
        };
        assert!(matches!(classify(&server(1045)), EngineError::Auth(_)));
        assert_eq!(classify(&server(1317)), EngineError::Cancelled);
        assert!(matches!(
            classify(&server(1062)),
            EngineError::Constraint { code: Some(ref c), .. } if c == "1062"
        ));
        assert!(matches!(classify(&server(1064)), EngineError::Rejected { .. }));
    }
}
