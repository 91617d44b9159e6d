//! Execution runtime for Arbor plans.
//!
//! | Module | Role |
//! |---|---|
//! | [`engine`] | Owns registries, pools and metrics; the entry point for callers |
//! | [`executor`] | Walks a plan and dispatches nodes |
//! | [`executors`] | Store executors per backend kind, and their registry |
//! | [`state`] | Per-request published results, parameters and budget |
//! | [`result`] | Constant and streaming results |
//! | [`format`] | Output formats (`json`, `csv`, `raw`) |
//! | [`metrics`] | Prometheus registry per engine |

pub mod engine;
pub mod executor;
pub mod executors;
pub mod format;
pub mod metrics;
pub mod result;
pub mod state;

pub use engine::{Engine, EngineBuilder};
pub use executor::PlanExecutor;
pub use executors::{default_registry, ExecutorRegistry, NodeContext, StoreExecutor};
pub use format::{Chunk, OutputFormat};
pub use result::{ConstantResult, ExecutionResult, StreamingResult};
pub use state::{ExecutionState, PublishedResult, RequestContext, ResourceBudget};
