//! # Error Contexts
//!
//! Structured metadata attached to errors so callers can tell "fix your
//! credentials" from "backend is down" from "pool is saturated" without
//! parsing free text.

use serde::{Deserialize, Serialize};

/// Structured context for errors.
///
/// Each variant provides specific fields relevant to that error type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorContext {
    /// Context for ARBOR-1005 (UnsupportedBackend)
    UnsupportedBackend {
        backend: String,
        registered_backends: Vec<String>,
    },

    /// Context for pool errors (ARBOR-1001, 1004, 5003)
    Pool {
        pool_name: String,
        driver: String,
        max_size: usize,
        active: usize,
    },

    /// Context for ARBOR-4001/4002 (auth errors)
    Credential {
        identity: String,
        spec_kind: Option<String>,
        cause: Option<String>,
    },

    /// Context for ARBOR-2002 (ParameterUnresolved)
    Parameter {
        name: String,
        available: Vec<String>,
    },

    /// Context for ARBOR-2004 (UnsupportedFormat)
    Format {
        requested: String,
        supported: Vec<String>,
    },

    /// Context for ARBOR-2006 (BudgetExceeded)
    Budget { limit: usize, observed: usize },

    /// Context for HTTP backend failures
    Http { url: String, status: Option<u16> },

    /// Generic key-value context for extensibility
    Generic {
        #[serde(flatten)]
        data: std::collections::HashMap<String, serde_json::Value>,
    },
}
