//! Execution results.
//!
//! A [`ConstantResult`] is a materialized value and can be serialized any
//! number of times. A [`StreamingResult`] owns a live cursor (a query producer,
//! an HTTP body) that is drained exactly once by [`StreamingResult::stream`].
//! The cursor is released after draining, on [`StreamingResult::close`], or
//! when the result is dropped, whichever comes first.

use crate::format::{approx_size, union_columns, Chunk, ChunkEncoder, OutputFormat};
use crate::state::ResourceBudget;
use arbor_error::Result;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

pub type ChunkStream = BoxStream<'static, Result<Chunk>>;

#[derive(Debug, Clone, PartialEq)]
pub struct ConstantResult {
    value: Value,
    columns: Vec<String>,
}

impl ConstantResult {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            columns: Vec::new(),
        }
    }

    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.columns = columns;
        self
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub async fn stream<W>(&self, sink: &mut W, format: OutputFormat) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let bytes = match (format, &self.value) {
            (OutputFormat::Json, value) => serde_json::to_vec(value)?,
            (_, Value::Array(items)) => {
                let columns = union_columns(&self.columns, items);
                let mut encoder = ChunkEncoder::new(format, columns);
                let mut out = Vec::new();
                for item in items {
                    out.extend(encoder.encode(Chunk::Row(item.clone()))?);
                }
                out.extend(encoder.finish()?);
                out
            }
            (_, value) => {
                let columns = union_columns(&self.columns, std::iter::once(value));
                let mut encoder = ChunkEncoder::new(format, columns);
                let mut out = encoder.encode(Chunk::Row(value.clone()))?;
                out.extend(encoder.finish()?);
                out
            }
        };
        sink.write_all(&bytes).await?;
        sink.flush().await?;
        Ok(())
    }
}

type Finalizer = Box<dyn FnOnce() + Send>;

pub struct StreamingResult {
    columns: Vec<String>,
    buffered: VecDeque<Chunk>,
    cursor: Option<ChunkStream>,
    on_release: Option<Finalizer>,
    released: bool,
}

impl StreamingResult {
    /// `buffered` chunks are served before the cursor is polled.
    pub fn new(columns: Vec<String>, buffered: Vec<Chunk>, cursor: ChunkStream) -> Self {
        Self {
            columns,
            buffered: buffered.into(),
            cursor: Some(cursor),
            on_release: None,
            released: false,
        }
    }

    /// Runs once, when the cursor is released.
    pub fn on_release(mut self, finalizer: impl FnOnce() + Send + 'static) -> Self {
        self.on_release = Some(Box::new(finalizer));
        self
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    async fn next_chunk(&mut self) -> Option<Result<Chunk>> {
        if let Some(chunk) = self.buffered.pop_front() {
            return Some(Ok(chunk));
        }
        match self.cursor.as_mut() {
            Some(cursor) => cursor.next().await,
            None => None,
        }
    }

    /// Drain into `sink`, then release. A second call writes nothing.
    pub async fn stream<W>(&mut self, sink: &mut W, format: OutputFormat) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        if self.released {
            return Ok(());
        }
        let outcome = self.drain_into(sink, format).await;
        self.close();
        outcome
    }

    async fn drain_into<W>(&mut self, sink: &mut W, format: OutputFormat) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let mut encoder = ChunkEncoder::new(format, self.columns.clone());
        while let Some(chunk) = self.next_chunk().await {
            let bytes = encoder.encode(chunk?)?;
            sink.write_all(&bytes).await?;
        }
        sink.write_all(&encoder.finish()?).await?;
        sink.flush().await?;
        Ok(())
    }

    /// Drain into memory, failing once `budget` is exceeded. Rows become a
    /// JSON array; a byte stream becomes its parsed JSON, or a string.
    pub async fn materialize(mut self, budget: ResourceBudget) -> Result<Value> {
        let outcome = self.collect(budget).await;
        self.close();
        outcome
    }

    async fn collect(&mut self, budget: ResourceBudget) -> Result<Value> {
        let mut rows = Vec::new();
        let mut raw: Vec<u8> = Vec::new();
        let mut bytes = 0usize;
        while let Some(chunk) = self.next_chunk().await {
            let chunk = chunk?;
            bytes += chunk.approx_size();
            match chunk {
                Chunk::Row(row) => rows.push(row),
                Chunk::Bytes(b) => raw.extend_from_slice(&b),
            }
            budget.check(rows.len(), bytes)?;
        }
        if rows.is_empty() && !raw.is_empty() {
            return Ok(serde_json::from_slice(&raw)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&raw).into_owned())));
        }
        Ok(Value::Array(rows))
    }

    /// Release the cursor without draining it. Idempotent.
    pub fn close(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.buffered.clear();
        self.cursor = None;
        if let Some(finalizer) = self.on_release.take() {
            finalizer();
        }
        debug!("Streaming result released");
    }
}

impl Drop for StreamingResult {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for StreamingResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingResult")
            .field("columns", &self.columns)
            .field("buffered", &self.buffered.len())
            .field("released", &self.released)
            .finish()
    }
}

#[derive(Debug)]
pub enum ExecutionResult {
    Constant(ConstantResult),
    Streaming(StreamingResult),
}

impl ExecutionResult {
    pub fn constant(value: Value) -> Self {
        ExecutionResult::Constant(ConstantResult::new(value))
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, ExecutionResult::Streaming(_))
    }

    pub fn columns(&self) -> &[String] {
        match self {
            ExecutionResult::Constant(c) => c.columns(),
            ExecutionResult::Streaming(s) => s.columns(),
        }
    }

    pub async fn stream<W>(&mut self, sink: &mut W, format: OutputFormat) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        match self {
            ExecutionResult::Constant(c) => c.stream(sink, format).await,
            ExecutionResult::Streaming(s) => s.stream(sink, format).await,
        }
    }

    /// Serialize to an in-memory buffer.
    pub async fn to_bytes(&mut self, format: OutputFormat) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.stream(&mut buf, format).await?;
        Ok(buf)
    }

    pub async fn into_value(self, budget: ResourceBudget) -> Result<Value> {
        match self {
            ExecutionResult::Constant(c) => {
                let value = c.into_value();
                let rows = match &value {
                    Value::Array(items) => items.len(),
                    _ => 1,
                };
                budget.check(rows, approx_size(&value))?;
                Ok(value)
            }
            ExecutionResult::Streaming(s) => s.materialize(budget).await,
        }
    }

    pub fn close(&mut self) {
        if let ExecutionResult::Streaming(s) = self {
            s.close();
        }
    }
}
