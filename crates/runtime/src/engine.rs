//! The [`Engine`]: every registry, pool and cache of one runtime instance.
//!
//! Nothing is process-global. An engine is built once at start-up, shared by
//! reference across requests, and torn down with [`Engine::shutdown`].

use crate::executor::PlanExecutor;
use crate::executors::{default_registry, StoreExecutor};
use crate::metrics::RuntimeMetrics;
use crate::result::ExecutionResult;
use crate::state::ExecutionState;
use arbor_common::auth::Identity;
use arbor_common::config::AppConfig;
use arbor_connectors::credentials::{vault_registry, CredentialVault, EnvironmentVault};
use arbor_connectors::{
    default_drivers, default_resolvers, ConnectionDriver, ConnectionPoolManager, CredentialResolver,
    DriverRegistry, PoolStatistics,
};
use arbor_error::{ArborError, ErrorCode, Result};
use arbor_plan::ExecutionPlan;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use validator::Validate;

/// Vault backed by `ARBOR_SECRET_*` environment variables, always registered.
pub const ENV_VAULT: &str = "env";
pub const ENV_VAULT_PREFIX: &str = "ARBOR_SECRET_";

pub struct EngineBuilder {
    config: AppConfig,
    drivers: DriverRegistry,
    vaults: Vec<Arc<dyn CredentialVault>>,
    resolvers: Vec<Arc<dyn CredentialResolver>>,
    executors: Vec<Arc<dyn StoreExecutor>>,
    http: Option<reqwest::Client>,
    reaper: bool,
}

impl EngineBuilder {
    pub fn with_driver(mut self, driver: Arc<dyn ConnectionDriver>) -> Self {
        self.drivers.register(driver);
        self
    }

    pub fn with_vault(mut self, vault: Arc<dyn CredentialVault>) -> Self {
        self.vaults.push(vault);
        self
    }

    /// Replaces the built-in resolver for the same authentication kind.
    pub fn with_resolver(mut self, resolver: Arc<dyn CredentialResolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    /// Replaces the built-in executor for the same backend kind.
    pub fn with_executor(mut self, executor: Arc<dyn StoreExecutor>) -> Self {
        self.executors.push(executor);
        self
    }

    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = Some(client);
        self
    }

    /// Skip the background idle-connection reaper.
    pub fn without_reaper(mut self) -> Self {
        self.reaper = false;
        self
    }

    pub fn build(self) -> Result<Engine> {
        let config = self.config;
        config.validate().map_err(|e| {
            ArborError::new(
                ErrorCode::InvalidConfig,
                format!("Configuration validation failed: {}", e),
            )
        })?;

        let http = self.http.unwrap_or_default();

        let mut vaults = vault_registry(&config.credentials);
        vaults.register(Arc::new(EnvironmentVault::new(ENV_VAULT, ENV_VAULT_PREFIX)));
        for vault in self.vaults {
            vaults.register(vault);
        }
        let mut resolvers = default_resolvers(vaults, http.clone());
        for resolver in self.resolvers {
            resolvers.register(resolver);
        }

        let pools = Arc::new(ConnectionPoolManager::new(
            config.pool.clone(),
            self.drivers,
            Arc::new(resolvers),
        ));
        if self.reaper {
            if tokio::runtime::Handle::try_current().is_ok() {
                pools.spawn_reaper(config.pool.reaper_interval());
            } else {
                warn!("No Tokio runtime at engine start; idle connections are only evicted on demand");
            }
        }

        let mut registry = default_registry(config.retry, http);
        for executor in self.executors {
            registry.register(executor);
        }

        let metrics = Arc::new(RuntimeMetrics::new()?);
        let shutdown = CancellationToken::new();
        let executor = PlanExecutor::new(Arc::new(registry), pools.clone(), config.execution.clone())
            .with_metrics(metrics.clone())
            .with_shutdown_token(shutdown.clone());

        info!(
            executors = ?executor.registry().kinds(),
            drivers = ?pools.drivers().names(),
            max_pool_size = config.pool.max_size,
            "Arbor engine ready"
        );

        Ok(Engine {
            config,
            executor,
            pools,
            metrics,
            shutdown,
        })
    }
}

pub struct Engine {
    config: AppConfig,
    executor: PlanExecutor,
    pools: Arc<ConnectionPoolManager>,
    metrics: Arc<RuntimeMetrics>,
    shutdown: CancellationToken,
}

impl Engine {
    /// Engine with the built-in drivers, resolvers and executors.
    pub fn new(config: AppConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: AppConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            drivers: default_drivers(),
            vaults: Vec::new(),
            resolvers: Vec::new(),
            executors: Vec::new(),
            http: None,
            reaper: true,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn executor(&self) -> &PlanExecutor {
        &self.executor
    }

    pub fn pools(&self) -> &Arc<ConnectionPoolManager> {
        &self.pools
    }

    pub fn active_executions(&self) -> usize {
        self.executor.active_executions()
    }

    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        parameters: HashMap<String, Value>,
        identity: Identity,
        output_format: Option<&str>,
    ) -> Result<ExecutionResult> {
        self.ensure_running()?;
        self.executor
            .execute(plan, parameters, identity, output_format)
            .await
    }

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
        self.ensure_running()?;
        self.executor
            .execute_to(plan, parameters, identity, output_format, sink)
            .await
    }

    pub fn new_state(&self, identity: Identity, parameters: HashMap<String, Value>) -> ExecutionState {
        self.executor.new_state(identity, parameters)
    }

    pub async fn execute_with_state(
        &self,
        plan: &ExecutionPlan,
        state: &ExecutionState,
    ) -> Result<ExecutionResult> {
        self.ensure_running()?;
        self.executor.execute_with_state(plan, state).await
    }

    pub fn pool_statistics(&self) -> Vec<PoolStatistics> {
        self.pools.statistics()
    }

    /// Prometheus text exposition of execution and pool metrics.
    pub fn metrics_text(&self) -> Result<String> {
        self.metrics.observe_pools(&self.pools.statistics());
        self.metrics.encode()
    }

    /// Drop every pool; connections close once their borrowers release them.
    pub fn reset_pools(&self) {
        self.pools.reset();
    }

    /// Cancel running executions and close every pool. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.pools.shutdown().await;
        info!("Arbor engine shut down");
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(ArborError::new(
                ErrorCode::ExecutionCancelled,
                "Engine is shut down",
            ));
        }
        Ok(())
    }
}
