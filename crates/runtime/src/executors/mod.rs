//! Store executors: one per backend kind, looked up by the plan executor.
//!
//! Adding a backend means implementing [`StoreExecutor`] and registering it;
//! the plan executor itself never changes.

pub mod in_memory;
pub mod relational;
pub mod service;

pub use in_memory::InMemoryExecutor;
pub use relational::RelationalExecutor;
pub use service::ServiceExecutor;

use crate::result::ExecutionResult;
use crate::state::ExecutionState;
use arbor_common::config::RetrySettings;
use arbor_connectors::ConnectionPoolManager;
use arbor_error::{ArborError, ErrorCode, ErrorContext, Result};
use arbor_plan::{BackendKind, ExecutionNode, NodePath, Template};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything an executor may touch while running one node.
pub struct NodeContext<'a> {
    pub node: &'a ExecutionNode,
    pub path: &'a NodePath,
    pub state: &'a ExecutionState,
    pub pools: &'a ConnectionPoolManager,
}

impl<'a> NodeContext<'a> {
    /// Render a template against published results and parameters.
    pub fn render(&self, text: &str) -> Result<String> {
        Template::parse(text)?.render(|name| self.state.resolve_variable(name))
    }

    /// Same as [`render`](Self::render) but every placeholder becomes a `?`
    /// bind parameter.
    pub fn bind(&self, text: &str) -> Result<(String, Vec<Value>)> {
        Template::parse(text)?.bind(|name| self.state.resolve_variable(name))
    }

    pub(crate) fn mismatch(&self, expected: &str) -> ArborError {
        ArborError::invariant(format!(
            "{} executor received a '{}' node",
            expected,
            self.node.backend_kind()
        ))
    }
}

#[async_trait]
pub trait StoreExecutor: Send + Sync {
    fn backend_kind(&self) -> BackendKind;

    async fn run(&self, ctx: NodeContext<'_>) -> Result<ExecutionResult>;
}

#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<BackendKind, Arc<dyn StoreExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later registrations replace earlier ones for the same kind.
    pub fn register(&mut self, executor: Arc<dyn StoreExecutor>) {
        self.executors.insert(executor.backend_kind(), executor);
    }

    pub fn get(&self, kind: &BackendKind) -> Option<Arc<dyn StoreExecutor>> {
        self.executors.get(kind).cloned()
    }

    pub fn resolve(&self, kind: &BackendKind) -> Result<Arc<dyn StoreExecutor>> {
        self.get(kind).ok_or_else(|| {
            let registered = self.kinds();
            let hint = match arbor_error::find_closest_match(kind.as_str(), &registered) {
                Some(suggestion) => format!("Did you mean '{}'?", suggestion),
                None => format!(
                    "Register a store executor for '{}'. Registered: {}",
                    kind,
                    registered.join(", ")
                ),
            };
            ArborError::new(
                ErrorCode::UnsupportedBackend,
                format!("No store executor registered for backend '{}'", kind),
            )
            .with_context(ErrorContext::UnsupportedBackend {
                backend: kind.to_string(),
                registered_backends: registered,
            })
            .with_hint(hint)
        })
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.executors.keys().map(|k| k.to_string()).collect();
        kinds.sort();
        kinds
    }
}

/// Registry with the relational, service and in-memory executors.
pub fn default_registry(retry: RetrySettings, http: reqwest::Client) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(RelationalExecutor::new(retry)));
    registry.register(Arc::new(ServiceExecutor::new(http, retry)));
    registry.register(Arc::new(InMemoryExecutor));
    registry
}
