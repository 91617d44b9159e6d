//! Physical drivers and the connections they open.

use arbor_common::auth::Credential;
use arbor_error::{ArborError, ErrorCode, Result};
use arbor_plan::ConnectionSpec;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

pub type Row = Map<String, Value>;

#[derive(Debug)]
pub enum QueryEvent {
    /// Always sent once, before any row.
    Columns(Vec<String>),
    Row(Row),
}

/// Where a connection pushes query output. Bounded, so a slow consumer
/// applies back-pressure to the producing connection.
#[derive(Clone)]
pub struct RowSink {
    tx: mpsc::Sender<QueryEvent>,
}

impl RowSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<QueryEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Returns false once the consumer has gone away; producers should stop.
    pub async fn columns(&self, columns: Vec<String>) -> bool {
        self.tx.send(QueryEvent::Columns(columns)).await.is_ok()
    }

    pub async fn row(&self, row: Row) -> bool {
        self.tx.send(QueryEvent::Row(row)).await.is_ok()
    }

    /// For producers running on a blocking thread.
    pub fn blocking_columns(&self, columns: Vec<String>) -> bool {
        self.tx.blocking_send(QueryEvent::Columns(columns)).is_ok()
    }

    pub fn blocking_row(&self, row: Row) -> bool {
        self.tx.blocking_send(QueryEvent::Row(row)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// An open connection, owned by exactly one pool handle at a time.
#[async_trait]
pub trait PhysicalConnection: Send {
    /// Run `sql` with positional `?` binds, pushing columns then rows into `sink`.
    async fn query(&mut self, sql: &str, params: &[Value], sink: &RowSink) -> Result<()>;

    /// Liveness check run before an idle connection is reused.
    async fn validate(&mut self, query: &str) -> Result<()> {
        fetch_all(self, query, &[]).await.map(|_| ())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait ConnectionDriver: Send + Sync {
    /// Matches `ConnectionSpec::driver`.
    fn driver_name(&self) -> &'static str;

    async fn connect(
        &self,
        spec: &ConnectionSpec,
        credential: &Credential,
    ) -> Result<Box<dyn PhysicalConnection>>;

    /// Errors worth retrying from the executor.
    fn is_transient(&self, err: &ArborError) -> bool {
        err.code == ErrorCode::ConnectionFailed
    }
}

/// Run a query to completion and collect its output.
pub async fn fetch_all<C>(conn: &mut C, sql: &str, params: &[Value]) -> Result<(Vec<String>, Vec<Row>)>
where
    C: PhysicalConnection + ?Sized,
{
    let (sink, mut rx) = RowSink::channel(64);
    let produce = async move {
        let result = conn.query(sql, params, &sink).await;
        drop(sink);
        result
    };
    let consume = async {
        let mut columns = Vec::new();
        let mut rows = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                QueryEvent::Columns(c) => columns = c,
                QueryEvent::Row(r) => rows.push(r),
            }
        }
        (columns, rows)
    };
    let (result, (columns, rows)) = tokio::join!(produce, consume);
    result?;
    Ok((columns, rows))
}

#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: HashMap<&'static str, Arc<dyn ConnectionDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, driver: Arc<dyn ConnectionDriver>) {
        self.drivers.insert(driver.driver_name(), driver);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ConnectionDriver>> {
        self.drivers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.keys().map(|n| n.to_string()).collect();
        names.sort();
        names
    }
}

/// Registry with the SQLite driver and the in-memory driver.
pub fn default_drivers() -> DriverRegistry {
    let mut registry = DriverRegistry::new();
    registry.register(Arc::new(super::sqlite::SqliteDriver));
    registry.register(Arc::new(super::memory::MemoryDriver::new()));
    registry
}
