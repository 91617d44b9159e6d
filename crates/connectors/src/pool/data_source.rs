//! One physical connection pool plus its live statistics.

use super::driver::{ConnectionDriver, PhysicalConnection, RowSink};
use arbor_common::auth::Credential;
use arbor_common::config::PoolSettings;
use arbor_error::{ArborError, ErrorCode, ErrorContext, Result};
use arbor_plan::{ConnectionKey, ConnectionSpec};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Point-in-time copy of a pool's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatistics {
    pub pool_name: String,
    pub identity: String,
    pub driver: String,
    pub max_size: usize,
    pub active: usize,
    pub idle: usize,
    pub total_acquired: u64,
    pub total_released: u64,
    pub total_errors: u64,
    pub total_created: u64,
    pub total_evicted: u64,
}

#[derive(Default)]
struct Counters {
    active: AtomicUsize,
    idle: AtomicUsize,
    total_acquired: AtomicU64,
    total_released: AtomicU64,
    total_errors: AtomicU64,
    total_created: AtomicU64,
    total_evicted: AtomicU64,
}

struct IdleConnection {
    conn: Box<dyn PhysicalConnection>,
    created_at: Instant,
    idle_since: Instant,
}

/// Physical pool for one (identity, connection key) pair.
///
/// Capacity is a semaphore with `max_size` permits: a checked-out connection
/// holds one permit until it is released. Idle connections are reused
/// most-recently-returned first.
pub struct DataSourceWithStatistics {
    name: String,
    identity: String,
    key: ConnectionKey,
    spec: ConnectionSpec,
    credential: Credential,
    driver: Arc<dyn ConnectionDriver>,
    settings: PoolSettings,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConnection>>,
    counters: Counters,
    closed: AtomicBool,
    created_at: Instant,
    /// Milliseconds since `created_at` of the last acquire or release.
    last_used_ms: AtomicU64,
}

impl DataSourceWithStatistics {
    pub fn new(
        name: String,
        identity: String,
        spec: ConnectionSpec,
        credential: Credential,
        driver: Arc<dyn ConnectionDriver>,
        settings: PoolSettings,
    ) -> Self {
        Self {
            name,
            identity,
            key: spec.key(),
            spec,
            credential,
            driver,
            semaphore: Arc::new(Semaphore::new(settings.max_size)),
            settings,
            idle: Mutex::new(Vec::new()),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
            created_at: Instant::now(),
            last_used_ms: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn driver(&self) -> &Arc<dyn ConnectionDriver> {
        &self.driver
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    /// Time since the pool was last touched by an acquire or release.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_used_ms.load(Ordering::Relaxed));
        self.created_at.elapsed().saturating_sub(last)
    }

    pub fn statistics(&self) -> PoolStatistics {
        let c = &self.counters;
        PoolStatistics {
            pool_name: self.name.clone(),
            identity: self.identity.clone(),
            driver: self.spec.driver.clone(),
            max_size: self.settings.max_size,
            active: c.active.load(Ordering::SeqCst),
            idle: c.idle.load(Ordering::SeqCst),
            total_acquired: c.total_acquired.load(Ordering::SeqCst),
            total_released: c.total_released.load(Ordering::SeqCst),
            total_errors: c.total_errors.load(Ordering::SeqCst),
            total_created: c.total_created.load(Ordering::SeqCst),
            total_evicted: c.total_evicted.load(Ordering::SeqCst),
        }
    }

    pub(crate) fn record_error(&self) {
        self.counters.total_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_used_ms.store(elapsed, Ordering::Relaxed);
    }

    fn idle_list(&self) -> std::sync::MutexGuard<'_, Vec<IdleConnection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pool_context(&self) -> ErrorContext {
        ErrorContext::Pool {
            pool_name: self.name.clone(),
            driver: self.spec.driver.clone(),
            max_size: self.settings.max_size,
            active: self.active(),
        }
    }

    fn closed_error(&self) -> ArborError {
        ArborError::invariant(format!("Pool '{}' is closed", self.name))
            .with_context(self.pool_context())
    }

    /// Open `min_size` connections up front.
    pub async fn warm_up(&self) -> Result<()> {
        let mut warmed = Vec::new();
        for _ in 0..self.settings.min_size {
            let conn = self.open().await?;
            warmed.push(IdleConnection {
                conn,
                created_at: Instant::now(),
                idle_since: Instant::now(),
            });
        }
        let mut idle = self.idle_list();
        idle.extend(warmed);
        self.counters.idle.store(idle.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn open(&self) -> Result<Box<dyn PhysicalConnection>> {
        match self.driver.connect(&self.spec, &self.credential).await {
            Ok(conn) => {
                self.counters.total_created.fetch_add(1, Ordering::SeqCst);
                Ok(conn)
            }
            Err(e) => {
                self.record_error();
                Err(e.with_context(self.pool_context()))
            }
        }
    }

    fn pop_idle(&self) -> Option<IdleConnection> {
        let mut idle = self.idle_list();
        let next = idle.pop();
        self.counters.idle.store(idle.len(), Ordering::SeqCst);
        next
    }

    fn evicted(&self, count: usize) {
        self.counters
            .total_evicted
            .fetch_add(count as u64, Ordering::SeqCst);
    }

    /// Check out a connection, waiting up to `acquire_timeout` for capacity.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let permit = match tokio::time::timeout(
            self.settings.acquire_timeout(),
            self.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(self.closed_error()),
            Err(_) => {
                self.record_error();
                return Err(ArborError::new(
                    ErrorCode::PoolExhausted,
                    format!(
                        "Timed out after {:?} waiting for a connection from pool '{}'",
                        self.settings.acquire_timeout(),
                        self.name
                    ),
                )
                .with_context(self.pool_context())
                .with_hint("Increase pool.max_size or pool.acquire_timeout_ms"));
            }
        };

        let (conn, created_at) = loop {
            let Some(candidate) = self.pop_idle() else {
                break (self.open().await?, Instant::now());
            };
            let mut candidate = candidate;
            if candidate.created_at.elapsed() >= self.settings.max_lifetime() {
                tracing::debug!(pool = %self.name, "Discarding connection past max lifetime");
                let _ = candidate.conn.close().await;
                self.evicted(1);
                continue;
            }
            if let Some(query) = &self.settings.validation_query {
                if let Err(e) = candidate.conn.validate(query).await {
                    tracing::warn!(pool = %self.name, "Discarding connection that failed validation: {}", e);
                    let _ = candidate.conn.close().await;
                    self.evicted(1);
                    continue;
                }
            }
            break (candidate.conn, candidate.created_at);
        };

        self.counters.active.fetch_add(1, Ordering::SeqCst);
        self.counters.total_acquired.fetch_add(1, Ordering::SeqCst);
        self.touch();

        Ok(PooledConnection {
            conn: Some(conn),
            created_at,
            permit: Some(permit),
            broken: false,
            pool: Arc::clone(self),
        })
    }

    fn check_in(&self, conn: Box<dyn PhysicalConnection>, created_at: Instant, broken: bool) {
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
        self.counters.total_released.fetch_add(1, Ordering::SeqCst);
        self.touch();

        if broken || self.is_closed() {
            // Dropping the connection closes it.
            drop(conn);
            if broken {
                self.evicted(1);
            }
            return;
        }

        let mut idle = self.idle_list();
        idle.push(IdleConnection {
            conn,
            created_at,
            idle_since: Instant::now(),
        });
        self.counters.idle.store(idle.len(), Ordering::SeqCst);
    }

    /// Close idle connections past `idle_timeout` or `max_lifetime`,
    /// keeping at least `min_size` of the freshest. Returns how many closed.
    pub async fn evict_idle(&self) -> usize {
        let expired: Vec<IdleConnection> = {
            let mut idle = self.idle_list();
            let idle_timeout = self.settings.idle_timeout();
            let max_lifetime = self.settings.max_lifetime();
            let mut keep = Vec::with_capacity(idle.len());
            let mut expired = Vec::new();
            // Newest are at the end; walk from the newest so min_size keeps them.
            for entry in idle.drain(..).rev() {
                let stale = entry.idle_since.elapsed() >= idle_timeout
                    || entry.created_at.elapsed() >= max_lifetime;
                if stale && keep.len() >= self.settings.min_size {
                    expired.push(entry);
                } else {
                    keep.push(entry);
                }
            }
            keep.reverse();
            *idle = keep;
            self.counters.idle.store(idle.len(), Ordering::SeqCst);
            expired
        };

        let count = expired.len();
        for mut entry in expired {
            let _ = entry.conn.close().await;
        }
        if count > 0 {
            self.evicted(count);
            tracing::debug!(pool = %self.name, evicted = count, "Evicted idle connections");
        }
        count
    }

    /// Stop handing out connections. Idle connections are dropped now,
    /// checked-out ones when they come back.
    pub fn detach(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.semaphore.close();
        let drained: Vec<IdleConnection> = self.idle_list().drain(..).collect();
        self.counters.idle.store(0, Ordering::SeqCst);
        drop(drained);
    }

    /// Like [`detach`](Self::detach), but closes idle connections gracefully.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.semaphore.close();
        let drained: Vec<IdleConnection> = self.idle_list().drain(..).collect();
        self.counters.idle.store(0, Ordering::SeqCst);
        for mut entry in drained {
            if let Err(e) = entry.conn.close().await {
                tracing::warn!(pool = %self.name, "Error closing connection: {}", e);
            }
        }
    }
}

/// Exclusive handle on a checked-out connection.
///
/// Returned to its pool by [`release`](Self::release) or, failing that, on drop.
pub struct PooledConnection {
    conn: Option<Box<dyn PhysicalConnection>>,
    created_at: Instant,
    permit: Option<OwnedSemaphorePermit>,
    broken: bool,
    pool: Arc<DataSourceWithStatistics>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.name)
            .field("released", &self.is_released())
            .finish()
    }
}

impl PooledConnection {
    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }

    pub fn pool(&self) -> &Arc<DataSourceWithStatistics> {
        &self.pool
    }

    pub fn is_released(&self) -> bool {
        self.conn.is_none()
    }

    /// Do not return this connection to the pool; it is closed on release.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn connection(&mut self) -> Result<&mut (dyn PhysicalConnection + 'static)> {
        match self.conn.as_deref_mut() {
            Some(conn) => Ok(conn),
            None => Err(ArborError::invariant(format!(
                "Connection from pool '{}' used after release",
                self.pool.name
            ))),
        }
    }

    /// Run a query on the checked-out connection. Failures count towards the
    /// pool's error statistics; connection-level failures mark it broken.
    pub async fn query(&mut self, sql: &str, params: &[Value], sink: &RowSink) -> Result<()> {
        let result = self.connection()?.query(sql, params, sink).await;
        if let Err(e) = &result {
            self.pool.record_error();
            if e.code == ErrorCode::ConnectionFailed {
                self.broken = true;
            }
        }
        result
    }

    /// Return the connection. A second call is a programming error and leaves
    /// the pool statistics untouched.
    pub fn release(&mut self) -> Result<()> {
        let Some(conn) = self.conn.take() else {
            return Err(ArborError::invariant(format!(
                "Connection from pool '{}' released twice",
                self.pool.name
            ))
            .with_context(self.pool.pool_context()));
        };
        self.pool.check_in(conn, self.created_at, self.broken);
        // Capacity is handed back only after the connection is idle again.
        drop(self.permit.take());
        Ok(())
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.conn.is_some() {
            tracing::trace!(pool = %self.pool.name, "Connection returned on drop");
            let _ = self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::memory::MemoryDriver;

    fn pool_with(settings: PoolSettings, driver: MemoryDriver) -> Arc<DataSourceWithStatistics> {
        Arc::new(DataSourceWithStatistics::new(
            "alice::k".to_string(),
            "alice".to_string(),
            ConnectionSpec::new("memory"),
            Credential::Anonymous,
            Arc::new(driver),
            settings,
        ))
    }

    #[tokio::test]
    async fn test_reuse_is_lifo_and_counted() {
        let driver = MemoryDriver::new();
        let pool = pool_with(PoolSettings::default(), driver.clone());

        let mut a = pool.acquire().await.unwrap();
        a.release().unwrap();
        let mut b = pool.acquire().await.unwrap();
        b.release().unwrap();

        let stats = pool.statistics();
        assert_eq!(stats.total_acquired, 2);
        assert_eq!(stats.total_released, 2);
        assert_eq!(stats.total_created, 1);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.active, 0);
        assert_eq!(driver.stats().opened(), 1);
    }

    #[tokio::test]
    async fn test_double_release_is_invariant_violation() {
        let pool = pool_with(PoolSettings::default(), MemoryDriver::new());
        let mut conn = pool.acquire().await.unwrap();
        conn.release().unwrap();
        let before = pool.statistics();

        let err = conn.release().unwrap_err();
        assert_eq!(err.code, ErrorCode::InvariantViolation);
        assert_eq!(pool.statistics(), before);
        assert!(conn.connection().is_err());
    }

    #[tokio::test]
    async fn test_drop_returns_connection() {
        let pool = pool_with(PoolSettings::default(), MemoryDriver::new());
        {
            let _conn = pool.acquire().await.unwrap();
            assert_eq!(pool.statistics().active, 1);
        }
        let stats = pool.statistics();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.total_released, 1);
    }

    #[tokio::test]
    async fn test_expired_connection_is_replaced() {
        let driver = MemoryDriver::new();
        let settings = PoolSettings {
            max_lifetime_secs: 0,
            ..Default::default()
        };
        let pool = pool_with(settings, driver.clone());

        pool.acquire().await.unwrap().release().unwrap();
        pool.acquire().await.unwrap().release().unwrap();

        let stats = pool.statistics();
        assert_eq!(stats.total_created, 2);
        assert_eq!(stats.total_evicted, 1);
        assert_eq!(driver.stats().closed(), 1);
    }

    #[tokio::test]
    async fn test_failed_validation_discards_connection() {
        let driver = MemoryDriver::new();
        let settings = PoolSettings {
            validation_query: Some("SELECT 1".to_string()),
            ..Default::default()
        };
        let pool = Arc::new(DataSourceWithStatistics::new(
            "p".to_string(),
            "alice".to_string(),
            ConnectionSpec::new("memory").with_option("memory.fail_validation", "true"),
            Credential::Anonymous,
            Arc::new(driver.clone()),
            settings,
        ));

        pool.acquire().await.unwrap().release().unwrap();
        pool.acquire().await.unwrap().release().unwrap();
        assert_eq!(pool.statistics().total_evicted, 1);
        assert_eq!(driver.stats().opened(), 2);
    }

    #[tokio::test]
    async fn test_warm_up_and_evict_idle_keeps_min_size() {
        let driver = MemoryDriver::new();
        let settings = PoolSettings {
            min_size: 1,
            max_size: 4,
            idle_timeout_secs: 0,
            ..Default::default()
        };
        let pool = pool_with(settings, driver.clone());
        pool.warm_up().await.unwrap();
        assert_eq!(pool.statistics().idle, 1);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        drop((a, b, c));
        assert_eq!(pool.statistics().idle, 3);

        assert_eq!(pool.evict_idle().await, 2);
        assert_eq!(pool.statistics().idle, 1);
        assert_eq!(driver.stats().live(), 1);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_and_drops_returns() {
        let driver = MemoryDriver::new();
        let pool = pool_with(PoolSettings::default(), driver.clone());
        let conn = pool.acquire().await.unwrap();

        pool.close().await;
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvariantViolation);

        drop(conn);
        assert_eq!(driver.stats().live(), 0);
        assert_eq!(pool.statistics().idle, 0);
    }
}
