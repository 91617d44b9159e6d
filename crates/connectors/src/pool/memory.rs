//! Connection driver with no backend behind it.
//!
//! Used by tests and local development. It counts every connection it opens
//! and closes, which makes leaked pool handles visible.
//!
//! Understood statements:
//!
//! | Statement | Output |
//! |-----------|--------|
//! | `SELECT 1 AS a, 'x' AS b` | one row of literals (binds allowed as `?`) |
//! | `GENERATE 5` | column `n`, rows 1..=5 |
//! | `SLEEP 50` | waits 50ms, then one row `{"slept": 50}` |
//! | `FAIL` / `FAIL TRANSIENT` | execution / connection failure |
//!
//! Connection options:
//!
//! - `memory.fail_connects = N`: the first N connects for that connection fail.
//! - `memory.fail_validation = true`: validation always fails.
//! - `memory.connect_delay_ms = N`: every connect waits N milliseconds.

use super::driver::{ConnectionDriver, PhysicalConnection, Row, RowSink};
use arbor_common::auth::Credential;
use arbor_error::{ArborError, ErrorCode, Result};
use arbor_plan::ConnectionSpec;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const MEMORY_DRIVER: &str = "memory";

#[derive(Debug, Default)]
pub struct MemoryDriverStats {
    opened: AtomicUsize,
    closed: AtomicUsize,
    queries: AtomicUsize,
    failed_connects: AtomicUsize,
}

impl MemoryDriverStats {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Connections opened and not yet closed or dropped.
    pub fn live(&self) -> usize {
        self.opened().saturating_sub(self.closed())
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn failed_connects(&self) -> usize {
        self.failed_connects.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Default)]
pub struct MemoryDriver {
    stats: Arc<MemoryDriverStats>,
    connect_attempts: Arc<DashMap<String, usize>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> Arc<MemoryDriverStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl ConnectionDriver for MemoryDriver {
    fn driver_name(&self) -> &'static str {
        MEMORY_DRIVER
    }

    async fn connect(
        &self,
        spec: &ConnectionSpec,
        credential: &Credential,
    ) -> Result<Box<dyn PhysicalConnection>> {
        let fail_first: usize = spec
            .options
            .get("memory.fail_connects")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if fail_first > 0 {
            let attempt = {
                let mut entry = self
                    .connect_attempts
                    .entry(spec.key().to_string())
                    .or_insert(0);
                *entry += 1;
                *entry
            };
            if attempt <= fail_first {
                self.stats.failed_connects.fetch_add(1, Ordering::SeqCst);
                return Err(ArborError::new(
                    ErrorCode::ConnectionFailed,
                    format!("Simulated connect failure {}/{}", attempt, fail_first),
                ));
            }
        }

        if let Some(delay) = spec
            .options
            .get("memory.connect_delay_ms")
            .and_then(|v| v.parse::<u64>().ok())
        {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            stats: self.stats.clone(),
            fail_validation: spec
                .options
                .get("memory.fail_validation")
                .map(|v| v == "true")
                .unwrap_or(false),
            user: match credential {
                Credential::UsernamePassword { username, .. } => Some(username.clone()),
                _ => None,
            },
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct MemoryConnection {
    stats: Arc<MemoryDriverStats>,
    fail_validation: bool,
    user: Option<String>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.stats.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.mark_closed();
    }
}

#[async_trait]
impl PhysicalConnection for MemoryConnection {
    async fn query(&mut self, sql: &str, params: &[Value], sink: &RowSink) -> Result<()> {
        self.stats.queries.fetch_add(1, Ordering::SeqCst);
        let statement = sql.trim().trim_end_matches(';').trim();
        let upper = statement.to_ascii_uppercase();

        if upper == "FAIL" {
            return Err(ArborError::backend_failure("Simulated query failure"));
        }
        if upper == "FAIL TRANSIENT" {
            return Err(ArborError::new(
                ErrorCode::ConnectionFailed,
                "Simulated transient failure",
            ));
        }
        if upper == "CURRENT_USER" {
            let mut row = Row::new();
            row.insert(
                "user".to_string(),
                self.user.clone().map(Value::String).unwrap_or(Value::Null),
            );
            sink.columns(vec!["user".to_string()]).await;
            sink.row(row).await;
            return Ok(());
        }
        if let Some(count) = upper.strip_prefix("GENERATE ") {
            let count: u64 = count.trim().parse().map_err(|_| syntax_error(sql))?;
            if !sink.columns(vec!["n".to_string()]).await {
                return Ok(());
            }
            for n in 1..=count {
                let mut row = Row::new();
                row.insert("n".to_string(), Value::from(n));
                if !sink.row(row).await {
                    break;
                }
            }
            return Ok(());
        }
        if let Some(ms) = upper.strip_prefix("SLEEP ") {
            let ms: u64 = ms.trim().parse().map_err(|_| syntax_error(sql))?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            let mut row = Row::new();
            row.insert("slept".to_string(), Value::from(ms));
            sink.columns(vec!["slept".to_string()]).await;
            sink.row(row).await;
            return Ok(());
        }
        if upper.starts_with("SELECT ") {
            let (columns, row) = select_literals(&statement["SELECT ".len()..], params)
                .ok_or_else(|| syntax_error(sql))?;
            if sink.columns(columns).await {
                sink.row(row).await;
            }
            return Ok(());
        }
        Err(syntax_error(sql))
    }

    async fn validate(&mut self, _query: &str) -> Result<()> {
        if self.fail_validation {
            return Err(ArborError::new(
                ErrorCode::ConnectionFailed,
                "Simulated validation failure",
            ));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.mark_closed();
        Ok(())
    }
}

fn syntax_error(sql: &str) -> ArborError {
    ArborError::backend_failure(format!("Memory driver cannot run '{}'", sql))
}

/// `1 AS a, 'x' AS b, ?` -> one row. Unaliased items are named by their text.
fn select_literals(list: &str, params: &[Value]) -> Option<(Vec<String>, Row)> {
    let mut binds = params.iter();
    let mut columns = Vec::new();
    let mut row = Row::new();

    for item in list.split(',') {
        let item = item.trim();
        let (expr, alias) = match item.to_ascii_uppercase().find(" AS ") {
            Some(pos) => (item[..pos].trim(), item[pos + 4..].trim().to_string()),
            None => (item, item.to_string()),
        };
        let value = if expr == "?" {
            binds.next()?.clone()
        } else if let Some(text) = expr.strip_prefix('\'').and_then(|e| e.strip_suffix('\'')) {
            Value::String(text.to_string())
        } else if expr.eq_ignore_ascii_case("NULL") {
            Value::Null
        } else {
            serde_json::from_str::<serde_json::Number>(expr).ok().map(Value::Number)?
        };
        columns.push(alias.clone());
        row.insert(alias, value);
    }
    Some((columns, row))
}
