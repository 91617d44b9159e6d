use super::driver::{ConnectionDriver, PhysicalConnection, Row, RowSink};
use arbor_common::auth::Credential;
use arbor_error::{ArborError, ErrorCode, Result};
use arbor_plan::ConnectionSpec;
use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::{Number, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SQLITE_DRIVER: &str = "sqlite";
const BUSY_TIMEOUT_OPTION: &str = "sqlite.busy_timeout_ms";

/// SQLite through rusqlite. `database` is a file path or `:memory:`
/// (the default); SQLite has no authentication, so credentials are ignored.
pub struct SqliteDriver;

#[async_trait]
impl ConnectionDriver for SqliteDriver {
    fn driver_name(&self) -> &'static str {
        SQLITE_DRIVER
    }

    async fn connect(
        &self,
        spec: &ConnectionSpec,
        _credential: &Credential,
    ) -> Result<Box<dyn PhysicalConnection>> {
        let path = spec.database.clone().unwrap_or_else(|| ":memory:".to_string());
        let busy_timeout = spec
            .options
            .get(BUSY_TIMEOUT_OPTION)
            .map(|v| v.parse::<u64>())
            .transpose()
            .map_err(|e| {
                ArborError::new(
                    ErrorCode::InvalidConfig,
                    format!("Invalid {}: {}", BUSY_TIMEOUT_OPTION, e),
                )
            })?;

        let conn = tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&path)?;
            if let Some(ms) = busy_timeout {
                conn.busy_timeout(Duration::from_millis(ms))?;
            }
            Ok::<_, rusqlite::Error>(conn)
        })
        .await
        .map_err(|e| ArborError::new(ErrorCode::ConnectionFailed, e.to_string()))?
        .map_err(|e| {
            ArborError::new(
                ErrorCode::ConnectionFailed,
                format!("Failed to open SQLite database: {}", e),
            )
        })?;

        Ok(Box::new(SqliteConnection {
            conn: Arc::new(Mutex::new(conn)),
        }))
    }

    fn is_transient(&self, err: &ArborError) -> bool {
        err.code == ErrorCode::ConnectionFailed
            || (err.code == ErrorCode::BackendExecutionFailed
                && err.message.contains("database is locked"))
    }
}

pub struct SqliteConnection {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

#[async_trait]
impl PhysicalConnection for SqliteConnection {
    async fn query(&mut self, sql: &str, params: &[Value], sink: &RowSink) -> Result<()> {
        let conn = self.conn.clone();
        let sql = sql.to_string();
        let binds: Vec<SqlValue> = params.iter().map(to_sql_value).collect();
        let sink = sink.clone();

        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| ArborError::invariant("SQLite connection lock poisoned"))?;
            run_query(&guard, &sql, binds, &sink).map_err(|e| {
                ArborError::backend_failure(format!("SQLite query failed: {}", e))
            })
        })
        .await
        .map_err(|e| ArborError::backend_failure(e.to_string()))?
    }
}

fn run_query(
    conn: &rusqlite::Connection,
    sql: &str,
    binds: Vec<SqlValue>,
    sink: &RowSink,
) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    if !sink.blocking_columns(columns.clone()) {
        return Ok(());
    }

    let mut rows = stmt.query(rusqlite::params_from_iter(binds))?;
    while let Some(row) = rows.next()? {
        let mut out = Row::new();
        for (i, name) in columns.iter().enumerate() {
            out.insert(name.clone(), from_value_ref(row.get_ref(i)?));
        }
        if !sink.blocking_row(out) {
            // Consumer gone; stop reading.
            break;
        }
    }
    Ok(())
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_value_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(b.iter().map(|byte| format!("{:02x}", byte)).collect()),
    }
}
