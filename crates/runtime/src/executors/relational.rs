//! SQL against a pooled connection.
//!
//! The query runs on a spawned producer task that owns the pooled connection
//! and pushes rows into a bounded channel. The executor buffers up to the
//! execution budget: a query that finishes inside it becomes a constant
//! result, anything larger is handed back as a stream over the remaining
//! rows. Dropping that stream closes the channel, the producer stops at its
//! next row and the connection goes back to its pool.

use super::{NodeContext, StoreExecutor};
use crate::format::Chunk;
use crate::result::{ChunkStream, ConstantResult, ExecutionResult, StreamingResult};
use arbor_common::config::RetrySettings;
use arbor_common::retry::retry_async_if;
use arbor_common::scrubber::scrub;
use arbor_connectors::pool::{QueryEvent, RowSink};
use arbor_error::{ArborError, ErrorCode, Result};
use arbor_plan::{BackendKind, ConnectionSpec, NodeKind};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 256;

pub struct RelationalExecutor {
    retry: RetrySettings,
}

impl RelationalExecutor {
    pub fn new(retry: RetrySettings) -> Self {
        Self { retry }
    }

    async fn attempt(
        &self,
        ctx: &NodeContext<'_>,
        connection: &ConnectionSpec,
        sql: &str,
        binds: &[Value],
    ) -> Result<ExecutionResult> {
        let mut conn = ctx.pools.acquire(ctx.state.identity(), connection).await?;
        let pool_name = conn.pool_name().to_string();
        let (sink, mut events) = RowSink::channel(CHANNEL_CAPACITY);

        let sql = sql.to_string();
        let binds = binds.to_vec();
        let producer: JoinHandle<Result<()>> = tokio::spawn(async move {
            let outcome = conn.query(&sql, &binds, &sink).await;
            drop(sink);
            drop(conn);
            outcome
        });

        let budget = ctx.state.budget();
        let mut columns = Vec::new();
        let mut rows: Vec<Value> = Vec::new();
        let mut bytes = 0usize;
        loop {
            match events.recv().await {
                Some(QueryEvent::Columns(names)) => columns = names,
                Some(QueryEvent::Row(row)) => {
                    let row = Value::Object(row);
                    bytes += crate::format::approx_size(&row);
                    rows.push(row);
                    if !budget.fits(rows.len(), bytes) {
                        debug!(
                            pool = %pool_name,
                            buffered = rows.len(),
                            "Result exceeds buffering budget, streaming the rest"
                        );
                        let buffered = rows.into_iter().map(Chunk::Row).collect();
                        let stream = StreamingResult::new(columns, buffered, cursor(events, producer))
                            .on_release(move || debug!(pool = %pool_name, "Relational cursor released"));
                        return Ok(ExecutionResult::Streaming(stream));
                    }
                }
                None => {
                    join_producer(producer).await?;
                    return Ok(ExecutionResult::Constant(
                        ConstantResult::new(Value::Array(rows)).with_columns(columns),
                    ));
                }
            }
        }
    }
}

async fn join_producer(producer: JoinHandle<Result<()>>) -> Result<()> {
    match producer.await {
        Ok(outcome) => outcome,
        Err(e) => Err(ArborError::backend_failure(format!("Query task failed: {}", e))),
    }
}

fn cursor(events: mpsc::Receiver<QueryEvent>, producer: JoinHandle<Result<()>>) -> ChunkStream {
    futures::stream::unfold(Some((events, producer)), |state| async move {
        let (mut events, producer) = state?;
        loop {
            match events.recv().await {
                Some(QueryEvent::Row(row)) => {
                    return Some((Ok(Chunk::Row(Value::Object(row))), Some((events, producer))))
                }
                Some(QueryEvent::Columns(_)) => continue,
                None => {
                    return match join_producer(producer).await {
                        Ok(()) => None,
                        Err(e) => Some((Err(e), None)),
                    }
                }
            }
        }
    })
    .boxed()
}

#[async_trait]
impl StoreExecutor for RelationalExecutor {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::relational()
    }

    async fn run(&self, ctx: NodeContext<'_>) -> Result<ExecutionResult> {
        let NodeKind::Relational { connection, sql } = &ctx.node.kind else {
            return Err(ctx.mismatch("Relational"));
        };

        let (sql, binds) = ctx.bind(sql)?;
        debug!(
            node = %ctx.path,
            endpoint = %connection.display_target(),
            binds = binds.len(),
            "Executing SQL: {}",
            scrub(&sql)
        );

        let driver = ctx.pools.drivers().get(&connection.driver);
        let is_transient = |e: &ArborError| match &driver {
            Some(driver) => driver.is_transient(e),
            None => e.code == ErrorCode::ConnectionFailed,
        };

        retry_async_if(
            "relational query",
            self.retry,
            || self.attempt(&ctx, connection, &sql, &binds),
            is_transient,
        )
        .await
    }
}
