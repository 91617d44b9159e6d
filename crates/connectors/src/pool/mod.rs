//! Identity-scoped connection pooling.
//!
//! Pools are keyed by `"{identity}::{connection_key}"`: two identities never
//! share a pool, even for byte-identical connection specs, because the
//! credential a pool connects with is resolved per identity.
//!
//! The pool map is the only structure shared across concurrent requests. Each
//! slot is a `OnceCell`, so N concurrent first acquisitions for the same name
//! resolve credentials and build the pool exactly once.

pub mod data_source;
pub mod driver;
pub mod memory;
pub mod sqlite;

pub use data_source::{DataSourceWithStatistics, PoolStatistics, PooledConnection};
pub use driver::{
    default_drivers, fetch_all, ConnectionDriver, DriverRegistry, PhysicalConnection, QueryEvent,
    Row, RowSink,
};

use crate::credentials::CredentialResolverRegistry;
use arbor_common::auth::Identity;
use arbor_common::config::PoolSettings;
use arbor_error::{ArborError, ErrorCode, Result};
use arbor_plan::{ConnectionKey, ConnectionSpec};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type PoolSlot = Arc<OnceCell<Arc<DataSourceWithStatistics>>>;

pub struct ConnectionPoolManager {
    pools: DashMap<String, PoolSlot>,
    drivers: DriverRegistry,
    resolvers: Arc<CredentialResolverRegistry>,
    settings: PoolSettings,
    shut_down: AtomicBool,
    reaper: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ConnectionPoolManager {
    pub fn new(
        settings: PoolSettings,
        drivers: DriverRegistry,
        resolvers: Arc<CredentialResolverRegistry>,
    ) -> Self {
        Self {
            pools: DashMap::new(),
            drivers,
            resolvers,
            settings,
            shut_down: AtomicBool::new(false),
            reaper: Mutex::new(None),
        }
    }

    pub fn pool_name(identity: &Identity, key: &ConnectionKey) -> String {
        format!("{}::{}", identity.name(), key)
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    pub fn resolvers(&self) -> &Arc<CredentialResolverRegistry> {
        &self.resolvers
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Check out a connection for `identity` on `spec`, building the pool on
    /// first use.
    pub async fn acquire(
        &self,
        identity: &Identity,
        spec: &ConnectionSpec,
    ) -> Result<PooledConnection> {
        let pool = self.data_source(identity, spec).await?;
        match pool.acquire().await {
            // Retired by the reaper or a reset after lookup; the slot is gone,
            // so a second lookup builds a fresh pool.
            Err(_) if pool.is_closed() && !self.is_shut_down() => {
                tracing::debug!(pool = %pool.name(), "Pool retired during acquire, retrying");
                self.data_source(identity, spec).await?.acquire().await
            }
            outcome => outcome,
        }
    }

    /// Equivalent to `conn.release()`.
    pub fn release(&self, conn: &mut PooledConnection) -> Result<()> {
        conn.release()
    }

    /// The pool for `(identity, spec)`, created if absent.
    pub async fn data_source(
        &self,
        identity: &Identity,
        spec: &ConnectionSpec,
    ) -> Result<Arc<DataSourceWithStatistics>> {
        if self.is_shut_down() {
            return Err(ArborError::invariant("Connection pool manager is shut down"));
        }

        let name = Self::pool_name(identity, &spec.key());
        let slot = self
            .pools
            .entry(name.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .value()
            .clone();

        let pool = slot
            .get_or_try_init(|| self.build(name.clone(), identity, spec))
            .await?
            .clone();

        // `shutdown` may have cleared the map while this pool was being built.
        if self.is_shut_down() {
            self.pools.remove_if(&name, |_, current| Arc::ptr_eq(current, &slot));
            pool.close().await;
            return Err(ArborError::invariant("Connection pool manager is shut down"));
        }
        Ok(pool)
    }

    async fn build(
        &self,
        name: String,
        identity: &Identity,
        spec: &ConnectionSpec,
    ) -> Result<Arc<DataSourceWithStatistics>> {
        let driver = self.drivers.get(&spec.driver).ok_or_else(|| {
            let mut err = ArborError::new(
                ErrorCode::InvalidConfig,
                format!("No connection driver named '{}'", spec.driver),
            );
            if let Some(suggestion) = arbor_error::find_closest_match(&spec.driver, &self.drivers.names()) {
                err = err.with_hint(format!("Did you mean '{}'?", suggestion));
            }
            err
        })?;

        let settings = self
            .settings
            .with_overrides(&spec.options)
            .map_err(|e| ArborError::new(ErrorCode::InvalidConfig, format!("{:#}", e)))?;

        let credential = self.resolvers.resolve(&spec.auth, identity).await?;

        let pool = Arc::new(DataSourceWithStatistics::new(
            name,
            identity.name().to_string(),
            spec.clone(),
            credential,
            driver,
            settings,
        ));
        pool.warm_up().await?;

        tracing::info!(
            pool = %pool.name(),
            endpoint = %arbor_common::scrubber::scrub(&spec.display_target()),
            max_size = pool.settings().max_size,
            "Created connection pool"
        );
        Ok(pool)
    }

    /// Initialized pools, sorted by name.
    pub fn pools(&self) -> Vec<Arc<DataSourceWithStatistics>> {
        let mut pools: Vec<_> = self
            .pools
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .collect();
        pools.sort_by(|a, b| a.name().cmp(b.name()));
        pools
    }

    pub fn pool_count(&self) -> usize {
        self.pools
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    pub fn statistics(&self) -> Vec<PoolStatistics> {
        self.pools().iter().map(|p| p.statistics()).collect()
    }

    pub fn pool_statistics(&self, pool_name: &str) -> Option<PoolStatistics> {
        self.pools
            .get(pool_name)
            .and_then(|slot| slot.get().map(|p| p.statistics()))
    }

    /// Drop every pool. Connections still checked out are discarded when
    /// they come back; the next acquisition builds a fresh pool.
    pub fn reset(&self) {
        let slots: Vec<PoolSlot> = self.pools.iter().map(|e| e.value().clone()).collect();
        self.pools.clear();
        for slot in slots {
            if let Some(pool) = slot.get() {
                pool.detach();
            }
        }
        tracing::info!("Connection pools reset");
    }

    /// Stop the reaper, close every pool's connections and refuse further
    /// acquisitions.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_reaper().await;

        let slots: Vec<PoolSlot> = self.pools.iter().map(|e| e.value().clone()).collect();
        self.pools.clear();
        for slot in slots {
            if let Some(pool) = slot.get() {
                pool.close().await;
            }
        }
        tracing::info!("Connection pool manager shut down");
    }

    /// Close stale idle connections in every pool, then drop pools that have
    /// been entirely unused for longer than their idle timeout.
    pub async fn evict_idle(&self) -> usize {
        let mut evicted = 0;
        for pool in self.pools() {
            evicted += pool.evict_idle().await;
        }

        let unused: Vec<String> = self
            .pools()
            .into_iter()
            .filter(|p| {
                let stats = p.statistics();
                stats.active == 0 && stats.idle == 0 && p.idle_for() >= p.settings().idle_timeout()
            })
            .map(|p| p.name().to_string())
            .collect();
        for name in unused {
            let removed = self.pools.remove_if(&name, |_, slot| {
                slot.get()
                    .map(|p| p.active() == 0 && p.statistics().idle == 0)
                    .unwrap_or(false)
            });
            if let Some((_, slot)) = removed {
                if let Some(pool) = slot.get() {
                    pool.detach();
                }
                tracing::debug!(pool = %name, "Removed unused pool");
            }
        }
        evicted
    }

    /// Run [`evict_idle`](Self::evict_idle) every `interval` until shutdown.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) {
        let token = CancellationToken::new();
        let weak: Weak<Self> = Arc::downgrade(self);
        let child = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.evict_idle().await;
                    }
                }
            }
        });

        let previous = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace((token, handle));
        if let Some((old_token, _)) = previous {
            old_token.cancel();
        }
    }

    async fn stop_reaper(&self) {
        let reaper = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((token, handle)) = reaper {
            token.cancel();
            let _ = handle.await;
        }
    }
}

impl Drop for ConnectionPoolManager {
    fn drop(&mut self) {
        if let Some((token, _)) = self
            .reaper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
    }
}
