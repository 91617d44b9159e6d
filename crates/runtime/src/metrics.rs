//! Prometheus metrics for one engine.
//!
//! Each [`RuntimeMetrics`] owns its own `Registry`, so several engines in one
//! process (tests, multi-tenant hosts) never collide on metric names.

use arbor_connectors::PoolStatistics;
use arbor_error::{ArborError, Result};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

pub struct RuntimeMetrics {
    registry: Registry,
    executions: IntCounterVec,
    active_executions: IntGauge,
    execution_seconds: Histogram,
    pool_active: IntGaugeVec,
    pool_idle: IntGaugeVec,
    pool_acquired: IntGaugeVec,
    pool_errors: IntGaugeVec,
}

fn metric_error(err: prometheus::Error) -> ArborError {
    ArborError::invariant(format!("Metric registration failed: {}", err))
}

impl RuntimeMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let executions = IntCounterVec::new(
            Opts::new("arbor_executions_total", "Plan executions by outcome"),
            &["outcome"],
        )
        .map_err(metric_error)?;
        let active_executions = IntGauge::with_opts(Opts::new(
            "arbor_active_executions",
            "Plan executions currently running",
        ))
        .map_err(metric_error)?;
        let execution_seconds = Histogram::with_opts(HistogramOpts::new(
            "arbor_execution_duration_seconds",
            "Wall time of plan executions",
        ))
        .map_err(metric_error)?;

        let pool_gauge = |name: &str, help: &str| {
            IntGaugeVec::new(Opts::new(name, help), &["pool", "driver"]).map_err(metric_error)
        };
        let pool_active = pool_gauge("arbor_pool_active_connections", "Checked-out connections")?;
        let pool_idle = pool_gauge("arbor_pool_idle_connections", "Idle pooled connections")?;
        let pool_acquired = pool_gauge("arbor_pool_acquired_total", "Lifetime acquisitions")?;
        let pool_errors = pool_gauge("arbor_pool_errors_total", "Lifetime pool errors")?;

        registry
            .register(Box::new(executions.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(active_executions.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(execution_seconds.clone()))
            .map_err(metric_error)?;
        for gauge in [&pool_active, &pool_idle, &pool_acquired, &pool_errors] {
            registry
                .register(Box::new(gauge.clone()))
                .map_err(metric_error)?;
        }

        Ok(Self {
            registry,
            executions,
            active_executions,
            execution_seconds,
            pool_active,
            pool_idle,
            pool_acquired,
            pool_errors,
        })
    }

    pub(crate) fn execution_started(&self) {
        self.active_executions.inc();
    }

    pub(crate) fn execution_finished(&self, success: bool, seconds: f64) {
        self.active_executions.dec();
        self.execution_seconds.observe(seconds);
        let outcome = if success { "success" } else { "error" };
        self.executions.with_label_values(&[outcome]).inc();
    }

    /// Replace pool gauges with a fresh snapshot.
    pub fn observe_pools(&self, stats: &[PoolStatistics]) {
        for gauge in [&self.pool_active, &self.pool_idle, &self.pool_acquired, &self.pool_errors] {
            gauge.reset();
        }
        for s in stats {
            let labels = [s.pool_name.as_str(), s.driver.as_str()];
            self.pool_active.with_label_values(&labels).set(s.active as i64);
            self.pool_idle.with_label_values(&labels).set(s.idle as i64);
            self.pool_acquired
                .with_label_values(&labels)
                .set(s.total_acquired as i64);
            self.pool_errors
                .with_label_values(&labels)
                .set(s.total_errors as i64);
        }
    }

    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metric_error)?;
        String::from_utf8(buffer)
            .map_err(|e| ArborError::invariant(format!("Metrics are not UTF-8: {}", e)))
    }
}
