//! Output formats and the incremental encoder behind `stream`.

use arbor_error::{ArborError, ErrorCode, ErrorContext, Result};
use arbor_plan::template::value_to_text;
use bytes::Bytes;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OutputFormat {
    /// A JSON array of rows, or the constant value as JSON.
    #[default]
    Json,
    /// Header line plus one line per row, RFC 4180 quoting.
    Csv,
    /// Scalars as text, one item per line; byte chunks verbatim.
    Raw,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 3] = [OutputFormat::Json, OutputFormat::Csv, OutputFormat::Raw];

    pub fn name(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Csv => "csv",
            OutputFormat::Raw => "raw",
        }
    }

    pub fn supported() -> Vec<String> {
        Self::ALL.iter().map(|f| f.name().to_string()).collect()
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OutputFormat {
    type Err = ArborError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|f| f.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| {
                let supported = Self::supported();
                let mut err = ArborError::new(
                    ErrorCode::UnsupportedFormat,
                    format!("Unsupported output format '{}'", s),
                );
                if let Some(suggestion) = arbor_error::find_closest_match(wanted, &supported) {
                    err = err.with_hint(format!("Did you mean '{}'?", suggestion));
                }
                err.with_context(ErrorContext::Format {
                    requested: s.to_string(),
                    supported,
                })
            })
    }
}

/// One unit of a streaming result.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Row(Value),
    Bytes(Bytes),
}

impl Chunk {
    /// Rough in-memory footprint, used for buffering budgets.
    pub fn approx_size(&self) -> usize {
        match self {
            Chunk::Row(value) => approx_size(value),
            Chunk::Bytes(bytes) => bytes.len(),
        }
    }
}

pub fn approx_size(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) => 1,
        Value::Number(_) => 8,
        Value::String(s) => s.len(),
        Value::Array(items) => items.iter().map(approx_size).sum::<usize>() + 8,
        Value::Object(map) => map.iter().map(|(k, v)| k.len() + approx_size(v)).sum::<usize>() + 8,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Rows,
    Bytes,
}

/// Turns chunks into output bytes. The first chunk fixes the mode:
/// rows are framed per format, bytes pass through untouched.
pub(crate) struct ChunkEncoder {
    format: OutputFormat,
    columns: Vec<String>,
    mode: Option<Mode>,
    rows: usize,
}

impl ChunkEncoder {
    pub(crate) fn new(format: OutputFormat, columns: Vec<String>) -> Self {
        Self {
            format,
            columns,
            mode: None,
            rows: 0,
        }
    }

    pub(crate) fn encode(&mut self, chunk: Chunk) -> Result<Vec<u8>> {
        match chunk {
            Chunk::Bytes(bytes) => {
                if self.mode == Some(Mode::Rows) {
                    return Err(ArborError::invariant(
                        "Byte chunk in a row stream",
                    ));
                }
                self.mode = Some(Mode::Bytes);
                Ok(bytes.to_vec())
            }
            Chunk::Row(row) => {
                if self.mode == Some(Mode::Bytes) {
                    return Err(ArborError::invariant("Row chunk in a byte stream"));
                }
                let mut out = Vec::new();
                if self.mode.is_none() {
                    self.mode = Some(Mode::Rows);
                    self.begin_rows(&row, &mut out)?;
                }
                self.encode_row(&row, &mut out)?;
                self.rows += 1;
                Ok(out)
            }
        }
    }

    pub(crate) fn finish(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match (self.format, self.mode) {
            (OutputFormat::Json, Some(Mode::Rows)) => out.extend_from_slice(b"]"),
            (OutputFormat::Json, None) => out.extend_from_slice(b"[]"),
            (OutputFormat::Csv, None) if !self.columns.is_empty() => {
                let mut writer = csv_writer(&mut out);
                writer.write_record(&self.columns).map_err(csv_error)?;
                writer.flush()?;
            }
            _ => {}
        }
        Ok(out)
    }

    fn begin_rows(&mut self, first: &Value, out: &mut Vec<u8>) -> Result<()> {
        match self.format {
            OutputFormat::Json => out.push(b'['),
            OutputFormat::Csv => {
                if self.columns.is_empty() {
                    self.columns = match first {
                        Value::Object(map) => map.keys().cloned().collect(),
                        _ => vec!["value".to_string()],
                    };
                }
                let mut writer = csv_writer(out);
                writer.write_record(&self.columns).map_err(csv_error)?;
                writer.flush()?;
            }
            OutputFormat::Raw => {}
        }
        Ok(())
    }

    fn encode_row(&self, row: &Value, out: &mut Vec<u8>) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                if self.rows > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, row)?;
            }
            OutputFormat::Csv => {
                let fields: Vec<String> = match row {
                    Value::Object(map) => {
                        if let Some(extra) = map.keys().find(|k| !self.columns.contains(*k)) {
                            return Err(ArborError::new(
                                ErrorCode::SerializationFailed,
                                format!(
                                    "Row column '{}' is not in the CSV header [{}]",
                                    extra,
                                    self.columns.join(", ")
                                ),
                            )
                            .with_hint(
                                "Declare the result columns on the node so every row shares one header",
                            ));
                        }
                        self.columns
                            .iter()
                            .map(|c| map.get(c).map(value_to_text).unwrap_or_default())
                            .collect()
                    }
                    other => vec![value_to_text(other)],
                };
                let mut writer = csv_writer(out);
                writer.write_record(&fields).map_err(csv_error)?;
                writer.flush()?;
            }
            OutputFormat::Raw => {
                out.extend_from_slice(value_to_text(row).as_bytes());
                out.push(b'\n');
            }
        }
        Ok(())
    }
}

/// Header plus every key seen across `rows`, in first-seen order.
pub(crate) fn union_columns<'a>(
    declared: &[String],
    rows: impl IntoIterator<Item = &'a Value>,
) -> Vec<String> {
    let mut columns = declared.to_vec();
    for row in rows {
        if let Value::Object(map) = row {
            for key in map.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }
    }
    columns
}

fn csv_writer(out: &mut Vec<u8>) -> csv::Writer<&mut Vec<u8>> {
    csv::WriterBuilder::new()
        .has_headers(false)
        .flexible(true)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(out)
}

fn csv_error(err: csv::Error) -> ArborError {
    ArborError::new(ErrorCode::SerializationFailed, format!("CSV encoding failed: {}", err))
}
