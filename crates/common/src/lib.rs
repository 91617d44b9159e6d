//! Common utilities, types, and configurations shared across Arbor crates.
//!
//! This crate contains the base building blocks for the runtime, including:
//! - **Configuration**: Strongly typed application configuration (`config`).
//! - **Authentication**: Identities and the credentials they carry (`auth`).
//! - **Resilience**: Retry with exponential backoff for store executors (`retry`).
//! - **Telemetry**: Tracing subscriber and OTLP setup (`telemetry`).
//! - **Logging**: Redaction of secrets and PII before they reach logs (`scrubber`).
pub mod auth;
pub mod config;
pub mod retry;
pub mod scrubber;
pub mod telemetry;
