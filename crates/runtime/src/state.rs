//! Per-request execution state.

use arbor_common::auth::Identity;
use arbor_common::config::ExecutionSettings;
use arbor_error::{ArborError, ErrorCode, ErrorContext, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Upper bounds on what one execution may hold in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceBudget {
    pub max_buffered_rows: usize,
    pub max_buffered_bytes: usize,
}

impl ResourceBudget {
    pub fn check(&self, rows: usize, bytes: usize) -> Result<()> {
        if rows > self.max_buffered_rows {
            return Err(budget_exceeded("rows", self.max_buffered_rows, rows));
        }
        if bytes > self.max_buffered_bytes {
            return Err(budget_exceeded("bytes", self.max_buffered_bytes, bytes));
        }
        Ok(())
    }

    pub fn fits(&self, rows: usize, bytes: usize) -> bool {
        rows <= self.max_buffered_rows && bytes <= self.max_buffered_bytes
    }
}

fn budget_exceeded(what: &str, limit: usize, observed: usize) -> ArborError {
    ArborError::new(
        ErrorCode::BudgetExceeded,
        format!("Buffered {} {} exceeds the limit of {}", observed, what, limit),
    )
    .with_context(ErrorContext::Budget { limit, observed })
    .with_hint("Raise execution.max_buffered_rows / max_buffered_bytes or stream the result")
}

impl From<&ExecutionSettings> for ResourceBudget {
    fn from(settings: &ExecutionSettings) -> Self {
        Self {
            max_buffered_rows: settings.max_buffered_rows,
            max_buffered_bytes: settings.max_buffered_bytes,
        }
    }
}

impl Default for ResourceBudget {
    fn default() -> Self {
        Self::from(&ExecutionSettings::default())
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub session_id: Uuid,
    pub referer: Option<String>,
    pub trace_id: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            referer: None,
            trace_id: None,
        }
    }

    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Trace id if the caller supplied one, otherwise the session id.
    pub fn correlation_id(&self) -> String {
        self.trace_id
            .clone()
            .unwrap_or_else(|| self.session_id.to_string())
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A named result as seen by later nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishedResult {
    Value(Value),
    /// Handed to the caller unconsumed; only its shape is known.
    Streaming { columns: Vec<String> },
    /// A best-effort node failed.
    Failed { code: ErrorCode, message: String },
}

/// Mutable bag threaded through one execution. Never shared across requests.
pub struct ExecutionState {
    results: RwLock<HashMap<String, PublishedResult>>,
    parameters: HashMap<String, Value>,
    identity: Identity,
    budget: ResourceBudget,
    context: RequestContext,
    cancellation: CancellationToken,
}

impl ExecutionState {
    pub fn new(identity: Identity, parameters: HashMap<String, Value>, budget: ResourceBudget) -> Self {
        Self {
            results: RwLock::new(HashMap::new()),
            parameters,
            identity,
            budget,
            context: RequestContext::new(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn parameters(&self) -> &HashMap<String, Value> {
        &self.parameters
    }

    pub fn budget(&self) -> ResourceBudget {
        self.budget
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Publish under `name`, replacing any earlier result.
    pub fn publish(&self, name: impl Into<String>, result: PublishedResult) {
        self.results
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), result);
    }

    pub fn published(&self, name: &str) -> Option<PublishedResult> {
        self.results
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Published names, sorted.
    pub fn result_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .results
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Value of a plan variable: published results shadow parameters.
    pub fn resolve_variable(&self, name: &str) -> Result<Value> {
        match self.published(name) {
            Some(PublishedResult::Value(value)) => return Ok(value),
            Some(PublishedResult::Streaming { .. }) => {
                return Err(ArborError::new(
                    ErrorCode::ParameterUnresolved,
                    format!("Result '{}' is a stream and cannot be used as a variable", name),
                ));
            }
            Some(PublishedResult::Failed { code, message }) => {
                return Err(ArborError::new(
                    ErrorCode::ParameterUnresolved,
                    format!("Result '{}' is unavailable: its node failed ({}: {})", name, code, message),
                ));
            }
            None => {}
        }

        if let Some(value) = self.parameters.get(name) {
            return Ok(value.clone());
        }

        let mut available: Vec<String> = self.parameters.keys().cloned().collect();
        available.extend(self.result_names());
        available.sort();
        available.dedup();

        let mut err = ArborError::new(
            ErrorCode::ParameterUnresolved,
            format!("Variable '{}' is neither a published result nor a parameter", name),
        );
        if let Some(suggestion) = arbor_error::find_closest_match(name, &available) {
            err = err.with_hint(format!("Did you mean '{}'?", suggestion));
        }
        Err(err.with_context(ErrorContext::Parameter {
            name: name.to_string(),
            available,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(params: &[(&str, Value)]) -> ExecutionState {
        ExecutionState::new(
            Identity::anonymous(),
            params.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            ResourceBudget::default(),
        )
    }

    #[test]
    fn test_published_results_shadow_parameters() {
        let state = state(&[("region", json!("EU"))]);
        assert_eq!(state.resolve_variable("region").unwrap(), json!("EU"));

        state.publish("region", PublishedResult::Value(json!("US")));
        assert_eq!(state.resolve_variable("region").unwrap(), json!("US"));
    }

    #[test]
    fn test_republish_overwrites() {
        let state = state(&[]);
        state.publish("A", PublishedResult::Value(json!(1)));
        state.publish("A", PublishedResult::Value(json!(2)));
        assert_eq!(state.published("A"), Some(PublishedResult::Value(json!(2))));
        assert_eq!(state.result_names(), vec!["A"]);
    }

    #[test]
    fn test_unresolved_variable_suggests() {
        let state = state(&[("region", json!("EU"))]);
        let err = state.resolve_variable("regoin").unwrap_err();
        assert_eq!(err.code, ErrorCode::ParameterUnresolved);
        assert_eq!(err.hint.as_deref(), Some("Did you mean 'region'?"));
    }

    #[test]
    fn test_failed_result_is_not_a_value() {
        let state = state(&[]);
        state.publish(
            "orders",
            PublishedResult::Failed {
                code: ErrorCode::BackendExecutionFailed,
                message: "boom".into(),
            },
        );
        let err = state.resolve_variable("orders").unwrap_err();
        assert_eq!(err.code, ErrorCode::ParameterUnresolved);
    }

    #[test]
    fn test_budget() {
        let budget = ResourceBudget {
            max_buffered_rows: 2,
            max_buffered_bytes: 100,
        };
        assert!(budget.fits(2, 100));
        assert!(!budget.fits(3, 10));
        assert_eq!(budget.check(1, 101).unwrap_err().code, ErrorCode::BudgetExceeded);
    }
}
