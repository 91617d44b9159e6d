//! The plan executor: walks an `ExecutionPlan` and dispatches each node to the
//! store executor registered for its backend kind.

use crate::executors::{ExecutorRegistry, NodeContext};
use crate::format::OutputFormat;
use crate::metrics::RuntimeMetrics;
use crate::result::ExecutionResult;
use crate::state::{ExecutionState, PublishedResult, RequestContext, ResourceBudget};
use arbor_common::auth::Identity;
use arbor_common::config::ExecutionSettings;
use arbor_connectors::ConnectionPoolManager;
use arbor_error::{ArborError, ErrorCode, ErrorContext, Result};
use arbor_plan::{BackendKind, ExecutionNode, ExecutionPlan, NodePath};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tracks one in-flight execution. Dropping it before `finish` (the caller
/// dropped the future) still decrements the counters and records a failure.
struct ExecutionGuard<'a> {
    active: &'a AtomicUsize,
    metrics: Option<&'a RuntimeMetrics>,
    start: Instant,
    success: Option<bool>,
}

impl<'a> ExecutionGuard<'a> {
    fn enter(active: &'a AtomicUsize, metrics: Option<&'a RuntimeMetrics>) -> Self {
        active.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = metrics {
            metrics.execution_started();
        }
        Self {
            active,
            metrics,
            start: Instant::now(),
            success: None,
        }
    }

    fn finish(&mut self, success: bool) -> Duration {
        self.success = Some(success);
        self.start.elapsed()
    }
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        if self.success.is_none() {
            debug!("Execution abandoned before completion");
        }
        if let Some(metrics) = self.metrics {
            metrics.execution_finished(
                self.success.unwrap_or(false),
                self.start.elapsed().as_secs_f64(),
            );
        }
    }
}

pub struct PlanExecutor {
    registry: Arc<ExecutorRegistry>,
    pools: Arc<ConnectionPoolManager>,
    settings: ExecutionSettings,
    active_executions: Arc<AtomicUsize>,
    metrics: Option<Arc<RuntimeMetrics>>,
    shutdown: CancellationToken,
}

impl PlanExecutor {
    pub fn new(
        registry: Arc<ExecutorRegistry>,
        pools: Arc<ConnectionPoolManager>,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            registry,
            pools,
            settings,
            active_executions: Arc::new(AtomicUsize::new(0)),
            metrics: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<RuntimeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Cancelling `token` cancels every execution started from this executor.
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    pub fn pools(&self) -> &Arc<ConnectionPoolManager> {
        &self.pools
    }

    pub fn active_executions(&self) -> usize {
        self.active_executions.load(Ordering::Relaxed)
    }

    /// Fresh state for one request, cancelled along with this executor.
    pub fn new_state(&self, identity: Identity, parameters: HashMap<String, Value>) -> ExecutionState {
        ExecutionState::new(identity, parameters, ResourceBudget::from(&self.settings))
            .with_context(RequestContext::new())
            .with_cancellation(self.shutdown.child_token())
    }

    /// Requested format, else the plan's serializer, else JSON.
    pub fn output_format(plan: &ExecutionPlan, requested: Option<&str>) -> Result<OutputFormat> {
        match requested.or(plan.serializer.as_deref()) {
            Some(name) => name.parse(),
            None => Ok(OutputFormat::default()),
        }
    }

    pub fn authorize(plan: &ExecutionPlan, identity: &Identity) -> Result<()> {
        let denied = |message: String, cause: Option<String>| {
            ArborError::new(ErrorCode::AuthorizationRequired, message).with_context(
                ErrorContext::Credential {
                    identity: identity.name().to_string(),
                    spec_kind: None,
                    cause,
                },
            )
        };

        if !identity.is_valid() {
            return Err(denied(
                format!("Identity '{}' holds an invalid or expired credential", identity.name()),
                Some("invalid credential".into()),
            )
            .with_hint("Re-authenticate and retry"));
        }
        if plan.auth_dependent && identity.is_anonymous() {
            return Err(denied(
                "Plan requires an authenticated identity".into(),
                Some("anonymous identity".into()),
            ));
        }
        if let Some(principal) = &plan.kerberos {
            if identity.kerberos_principal() != Some(principal.as_str()) {
                return Err(denied(
                    format!("Plan requires a Kerberos credential for '{}'", principal),
                    identity
                        .kerberos_principal()
                        .map(|held| format!("identity holds '{}'", held)),
                ));
            }
        }
        Ok(())
    }

    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        parameters: HashMap<String, Value>,
        identity: Identity,
        output_format: Option<&str>,
    ) -> Result<ExecutionResult> {
        Self::output_format(plan, output_format)?;
        let state = self.new_state(identity, parameters);
        self.execute_with_state(plan, &state).await
    }

    /// Execute and stream the result into `sink`.
    pub async fn execute_to<W>(
        &self,
        plan: &ExecutionPlan,
        parameters: HashMap<String, Value>,
        identity: Identity,
        output_format: Option<&str>,
        sink: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let format = Self::output_format(plan, output_format)?;
        let state = self.new_state(identity, parameters);
        let mut result = self.execute_with_state(plan, &state).await?;
        let streamed = result.stream(sink, format).await;
        result.close();
        streamed
    }

    pub async fn execute_with_state(
        &self,
        plan: &ExecutionPlan,
        state: &ExecutionState,
    ) -> Result<ExecutionResult> {
        let mut guard = ExecutionGuard::enter(&self.active_executions, self.metrics.as_deref());

        let outcome = self.run_plan(plan, state).await;

        let duration = guard.finish(outcome.is_ok());

        let context = state.context();
        match &outcome {
            Ok(result) => info!(
                target: "queries",
                session_id = %context.session_id,
                identity = %state.identity().name(),
                nodes = plan.node_count(),
                streaming = result.is_streaming(),
                duration_ms = duration.as_millis() as u64,
                success = true,
                "Plan executed"
            ),
            Err(e) => warn!(
                target: "queries",
                session_id = %context.session_id,
                identity = %state.identity().name(),
                nodes = plan.node_count(),
                code = %e.code,
                node = e.node_path.as_deref().unwrap_or("-"),
                duration_ms = duration.as_millis() as u64,
                success = false,
                "Plan execution failed: {}",
                e.message
            ),
        }

        outcome.map_err(|e| match e.trace_id {
            Some(_) => e,
            None => e.with_trace_id(context.correlation_id()),
        })
    }

    async fn run_plan(&self, plan: &ExecutionPlan, state: &ExecutionState) -> Result<ExecutionResult> {
        Self::authorize(plan, state.identity())?;
        plan.validate()?;

        let traversal = self.visit(&plan.root, NodePath::root(), state);
        let result = if self.settings.timeout_seconds == 0 {
            traversal.await?
        } else {
            let limit = Duration::from_secs(self.settings.timeout_seconds);
            match tokio::time::timeout(limit, traversal).await {
                Ok(result) => result?,
                Err(_) => {
                    state.cancellation().cancel();
                    return Err(ArborError::new(
                        ErrorCode::ExecutionCancelled,
                        format!(
                            "Execution timed out after {} seconds",
                            self.settings.timeout_seconds
                        ),
                    )
                    .with_hint("Simplify the plan or increase 'execution.timeout_seconds' in config"));
                }
            }
        };

        if let Some(name) = &plan.root.name {
            state.publish(name.clone(), published_form(&result));
        }
        Ok(result)
    }

    fn visit<'a>(
        &'a self,
        node: &'a ExecutionNode,
        path: NodePath,
        state: &'a ExecutionState,
    ) -> BoxFuture<'a, Result<ExecutionResult>> {
        async move {
            let backend = node.backend_kind();
            if state.is_cancelled() {
                return Err(cancelled().at_node(path.as_str(), backend.as_str()));
            }

            if node.is_sequence() {
                debug!(node = %path, children = node.children.len(), "Running sequence");
                let last = self.run_children(node, &path, state, true).await?;
                return Ok(last.unwrap_or_else(|| ExecutionResult::constant(Value::Null)));
            }

            let executor = self
                .registry
                .resolve(&backend)
                .map_err(|e| e.at_node(path.as_str(), backend.as_str()))?;

            self.run_children(node, &path, state, false).await?;

            for name in &node.parameters {
                state
                    .resolve_variable(name)
                    .map_err(|e| e.at_node(path.as_str(), backend.as_str()))?;
            }

            debug!(node = %path, backend = %backend, "Dispatching node");
            let started = Instant::now();
            let ctx = NodeContext {
                node,
                path: &path,
                state,
                pools: &self.pools,
            };
            let result = cancellable(state, executor.run(ctx)).await;
            debug!(
                node = %path,
                backend = %backend,
                elapsed_ms = started.elapsed().as_millis() as u64,
                ok = result.is_ok(),
                "Node finished"
            );
            result.map_err(|e| annotate(e, &path, &backend))
        }
        .boxed()
    }

    /// Runs children in order. With `keep_last`, the last child's result is
    /// returned unconsumed; every other result is materialized for publication.
    async fn run_children(
        &self,
        node: &ExecutionNode,
        path: &NodePath,
        state: &ExecutionState,
        keep_last: bool,
    ) -> Result<Option<ExecutionResult>> {
        let mut last = None;
        let count = node.children.len();
        for (i, child) in node.children.iter().enumerate() {
            let child_path = path.child(i);
            let keep = keep_last && i + 1 == count;
            match self.run_child(child, child_path.clone(), state, keep).await {
                Ok(result) => last = result,
                Err(e) if child.best_effort && e.code != ErrorCode::ExecutionCancelled => {
                    warn!(node = %child_path, code = %e.code, "Best-effort node failed: {}", e.message);
                    if let Some(name) = &child.name {
                        state.publish(
                            name.clone(),
                            PublishedResult::Failed {
                                code: e.code,
                                message: e.message,
                            },
                        );
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(last)
    }

    async fn run_child(
        &self,
        child: &ExecutionNode,
        path: NodePath,
        state: &ExecutionState,
        keep: bool,
    ) -> Result<Option<ExecutionResult>> {
        let mut result = self.visit(child, path.clone(), state).await?;
        if keep {
            if let Some(name) = &child.name {
                state.publish(name.clone(), published_form(&result));
            }
            return Ok(Some(result));
        }

        let Some(name) = &child.name else {
            result.close();
            return Ok(None);
        };
        let value = cancellable(state, result.into_value(state.budget()))
            .await
            .map_err(|e| e.at_node(path.as_str(), child.backend_kind().as_str()))?;
        state.publish(name.clone(), PublishedResult::Value(value));
        Ok(None)
    }
}

fn published_form(result: &ExecutionResult) -> PublishedResult {
    match result {
        ExecutionResult::Constant(c) => PublishedResult::Value(c.value().clone()),
        ExecutionResult::Streaming(s) => PublishedResult::Streaming {
            columns: s.columns().to_vec(),
        },
    }
}

fn cancelled() -> ArborError {
    ArborError::new(ErrorCode::ExecutionCancelled, "Execution was cancelled")
}

/// Races `fut` against the state's cancellation. Dropping `fut` releases
/// whatever it holds.
async fn cancellable<T>(state: &ExecutionState, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = state.cancellation().cancelled() => Err(cancelled()),
        outcome = fut => outcome,
    }
}

/// Attach the node position; unclassified failures become backend failures.
fn annotate(mut err: ArborError, path: &NodePath, backend: &BackendKind) -> ArborError {
    if err.code == ErrorCode::Unknown {
        err.code = ErrorCode::BackendExecutionFailed;
    }
    err.at_node(path.as_str(), backend.as_str())
}
