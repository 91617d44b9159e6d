//! # arbor-error
//!
//! Unified error types for the Arbor plan runtime.
//!
//! Every error carries:
//! - A stable numeric code (ARBOR-XXXX) that callers can branch on
//! - Structured JSON context
//! - The plan-node path and backend kind, when the failure happened inside a node
//! - An optional actionable hint

mod code;
mod context;
mod convert;

pub use code::{ErrorCategory, ErrorCode};
pub use context::ErrorContext;
pub use convert::find_closest_match;

use serde::{Deserialize, Serialize};
use std::fmt;

/// The unified error type for all Arbor operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArborError {
    /// Numeric error code (e.g., "ARBOR-1004")
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Path of the failing node in the plan tree (e.g., "root/1")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_path: Option<String>,

    /// Backend kind of the failing node
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,

    /// Structured context for programmatic handling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ErrorContext>,

    /// Suggestion for the caller
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,

    /// Correlation ID (session id of the execution)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl ArborError {
    /// Create a new error with code and message
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            node_path: None,
            backend: None,
            context: None,
            hint: None,
            trace_id: None,
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvariantViolation, message)
    }

    pub fn backend_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BackendExecutionFailed, message)
    }

    /// Add structured context
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Add a hint
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Add trace ID for correlation
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Attach the failing node. An already attached node is kept, so the
    /// innermost node wins when an error bubbles up through a sequence.
    pub fn at_node(mut self, path: impl Into<String>, backend: impl Into<String>) -> Self {
        if self.node_path.is_none() {
            self.node_path = Some(path.into());
            self.backend = Some(backend.into());
        }
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Serialize to JSON for API responses
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::warn!("Failed to serialize ArborError: {}", e);
            format!(
                r#"{{"code":"{}","message":"Serialization failed"}}"#,
                self.code
            )
        })
    }

    /// Serialize to pretty JSON for logging
    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| self.to_json())
    }
}

impl fmt::Display for ArborError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(path) = &self.node_path {
            write!(f, " at node '{}'", path)?;
            if let Some(backend) = &self.backend {
                write!(f, " ({})", backend)?;
            }
        }
        if let Some(hint) = &self.hint {
            write!(f, " (Hint: {})", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for ArborError {}

/// Result type alias for Arbor operations
pub type Result<T> = std::result::Result<T, ArborError>;
