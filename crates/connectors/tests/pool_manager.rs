use arbor_common::auth::{Credential, Identity};
use arbor_common::config::PoolSettings;
use arbor_connectors::credentials::{
    default_resolvers, CredentialResolver, CredentialResolverRegistry, InMemoryVault,
    VaultRegistry,
};
use arbor_connectors::pool::memory::MemoryDriver;
use arbor_connectors::pool::{fetch_all, ConnectionPoolManager, DriverRegistry};
use arbor_error::{ErrorCode, Result};
use arbor_plan::{AuthenticationKind, AuthenticationSpec, ConnectionSpec, SecretRef};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn manager_with(settings: PoolSettings, driver: MemoryDriver) -> Arc<ConnectionPoolManager> {
    let mut drivers = DriverRegistry::new();
    drivers.register(Arc::new(driver));
    let mut vaults = VaultRegistry::default();
    vaults.register(Arc::new(
        InMemoryVault::new("mem").with_secret("db_password", "hunter2"),
    ));
    let resolvers = default_resolvers(vaults, reqwest::Client::new());
    Arc::new(ConnectionPoolManager::new(
        settings,
        drivers,
        Arc::new(resolvers),
    ))
}

fn memory_spec() -> ConnectionSpec {
    ConnectionSpec::new("memory").with_database("orders")
}

fn alice() -> Identity {
    Identity::new("alice", vec![Credential::username_password("alice", "pw")])
}

fn bob() -> Identity {
    Identity::new("bob", vec![Credential::username_password("bob", "pw")])
}

#[tokio::test]
async fn test_pool_identity_isolation() {
    let manager = manager_with(PoolSettings::default(), MemoryDriver::new());
    let spec = memory_spec();

    let a = manager.acquire(&alice(), &spec).await.unwrap();
    let mut b = manager.acquire(&bob(), &spec).await.unwrap();
    assert_ne!(a.pool_name(), b.pool_name());
    assert!(a.pool_name().starts_with("alice::"));
    assert!(b.pool_name().starts_with("bob::"));

    b.release().unwrap();
    let stats_a = manager.pool_statistics(a.pool_name()).unwrap();
    let stats_b = manager.pool_statistics(b.pool_name()).unwrap();
    assert_eq!((stats_a.active, stats_a.total_released), (1, 0));
    assert_eq!((stats_b.active, stats_b.total_released), (0, 1));
    assert_eq!(manager.pool_count(), 2);
}

struct CountingResolver {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl CredentialResolver for CountingResolver {
    fn kind(&self) -> AuthenticationKind {
        AuthenticationKind::None
    }

    async fn resolve(
        &self,
        _spec: &AuthenticationSpec,
        _identity: &Identity,
        _vaults: &VaultRegistry,
    ) -> Result<Credential> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(Credential::Anonymous)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_pool_under_concurrent_first_acquire() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut resolvers = CredentialResolverRegistry::new(VaultRegistry::default());
    resolvers.register(Arc::new(CountingResolver {
        calls: calls.clone(),
    }));
    let mut drivers = DriverRegistry::new();
    drivers.register(Arc::new(MemoryDriver::new()));
    let settings = PoolSettings {
        max_size: 32,
        ..Default::default()
    };
    let manager = Arc::new(ConnectionPoolManager::new(
        settings,
        drivers,
        Arc::new(resolvers),
    ));

    let identity = alice();
    let mut handles = Vec::new();
    for _ in 0..16 {
        let manager = manager.clone();
        let identity = identity.clone();
        handles.push(tokio::spawn(async move {
            let mut conn = manager.acquire(&identity, &memory_spec()).await.unwrap();
            conn.release().unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(manager.pool_count(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stats = &manager.statistics()[0];
    assert_eq!(stats.total_acquired, 16);
    assert_eq!(stats.total_released, 16);
}

#[tokio::test]
async fn test_double_release_keeps_statistics() {
    let manager = manager_with(PoolSettings::default(), MemoryDriver::new());
    let mut conn = manager.acquire(&alice(), &memory_spec()).await.unwrap();

    manager.release(&mut conn).unwrap();
    let before = manager.pool_statistics(conn.pool_name()).unwrap();
    let err = manager.release(&mut conn).unwrap_err();
    assert_eq!(err.code, ErrorCode::InvariantViolation);
    assert_eq!(manager.pool_statistics(conn.pool_name()).unwrap(), before);
    assert_eq!(before.total_released, 1);
}

#[tokio::test]
async fn test_pool_exhaustion_times_out() {
    let manager = manager_with(PoolSettings::default(), MemoryDriver::new());
    let spec = memory_spec()
        .with_option("pool.max_size", "1")
        .with_option("pool.acquire_timeout_ms", "50");

    let _held = manager.acquire(&alice(), &spec).await.unwrap();
    let started = Instant::now();
    let err = manager.acquire(&alice(), &spec).await.unwrap_err();
    let waited = started.elapsed();

    assert_eq!(err.code, ErrorCode::PoolExhausted);
    assert!(waited >= Duration::from_millis(45), "returned early: {:?}", waited);
    assert!(waited < Duration::from_secs(2), "hung: {:?}", waited);

    let stats = manager.statistics();
    assert_eq!(stats[0].total_errors, 1);
    assert_eq!(stats[0].max_size, 1);
}

#[tokio::test]
async fn test_waiter_gets_released_connection() {
    let manager = manager_with(PoolSettings::default(), MemoryDriver::new());
    let spec = memory_spec()
        .with_option("pool.max_size", "1")
        .with_option("pool.acquire_timeout_ms", "2000");

    let mut held = manager.acquire(&alice(), &spec).await.unwrap();
    let waiter = {
        let manager = manager.clone();
        let spec = spec.clone();
        tokio::spawn(async move { manager.acquire(&alice(), &spec).await.map(|_| ()) })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    held.release().unwrap();

    assert!(waiter.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_credentials_resolved_per_identity_into_pool() {
    let manager = manager_with(PoolSettings::default(), MemoryDriver::new());
    let spec = memory_spec().with_auth(AuthenticationSpec::UserPassword {
        username: "svc_orders".into(),
        password: SecretRef::new("mem", "db_password"),
    });

    let mut conn = manager.acquire(&alice(), &spec).await.unwrap();
    let (_, rows) = fetch_all(conn.connection().unwrap(), "CURRENT_USER", &[])
        .await
        .unwrap();
    assert_eq!(rows[0]["user"], "svc_orders");
}

#[tokio::test]
async fn test_credential_failure_creates_no_pool() {
    let manager = manager_with(PoolSettings::default(), MemoryDriver::new());
    let spec = memory_spec().with_auth(AuthenticationSpec::StaticToken {
        token: SecretRef::new("mem", "missing"),
    });

    let err = manager.acquire(&alice(), &spec).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::CredentialResolutionFailed);
    assert_eq!(manager.pool_count(), 0);
}

#[tokio::test]
async fn test_unknown_driver_suggests_name() {
    let manager = manager_with(PoolSettings::default(), MemoryDriver::new());
    let err = manager
        .acquire(&alice(), &ConnectionSpec::new("memroy"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidConfig);
    assert_eq!(err.hint.as_deref(), Some("Did you mean 'memory'?"));
}

#[tokio::test]
async fn test_reset_discards_pools() {
    let driver = MemoryDriver::new();
    let stats = driver.stats();
    let manager = manager_with(PoolSettings::default(), driver);

    let held = manager.acquire(&alice(), &memory_spec()).await.unwrap();
    manager.acquire(&bob(), &memory_spec()).await.unwrap();
    assert_eq!(stats.live(), 2);

    manager.reset();
    assert_eq!(manager.pool_count(), 0);
    assert_eq!(stats.live(), 1);

    drop(held);
    assert_eq!(stats.live(), 0);

    let fresh = manager.acquire(&alice(), &memory_spec()).await.unwrap();
    assert_eq!(
        manager.pool_statistics(fresh.pool_name()).unwrap().total_acquired,
        1
    );
}

#[tokio::test]
async fn test_shutdown_closes_connections_and_rejects_acquire() {
    let driver = MemoryDriver::new();
    let stats = driver.stats();
    let manager = manager_with(PoolSettings::default(), driver);

    for _ in 0..3 {
        manager.acquire(&alice(), &memory_spec()).await.unwrap();
    }
    assert_eq!(stats.live(), 1);

    manager.shutdown().await;
    assert_eq!(stats.live(), 0);
    let err = manager.acquire(&alice(), &memory_spec()).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvariantViolation);
}

#[tokio::test]
async fn test_reaper_evicts_idle_connections_and_pools() {
    let driver = MemoryDriver::new();
    let stats = driver.stats();
    let settings = PoolSettings {
        idle_timeout_secs: 0,
        ..Default::default()
    };
    let manager = manager_with(settings, driver);

    manager.acquire(&alice(), &memory_spec()).await.unwrap();
    assert_eq!(stats.live(), 1);

    manager.spawn_reaper(Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(stats.live(), 0);
    assert_eq!(manager.pool_count(), 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_waiter_moves_to_fresh_pool_after_reset() {
    let settings = PoolSettings {
        max_size: 1,
        acquire_timeout_ms: 2_000,
        ..Default::default()
    };
    let manager = manager_with(settings, MemoryDriver::new());

    let held = manager.acquire(&alice(), &memory_spec()).await.unwrap();
    let waiter = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.acquire(&alice(), &memory_spec()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    manager.reset();
    let conn = waiter.await.unwrap().unwrap();
    assert!(!conn.pool().is_closed());
    assert!(held.pool().is_closed());
    assert_eq!(manager.pool_count(), 1);
}

#[tokio::test]
async fn test_pool_built_during_shutdown_is_closed() {
    let driver = MemoryDriver::new();
    let stats = driver.stats();
    let settings = PoolSettings {
        min_size: 1,
        ..Default::default()
    };
    let manager = manager_with(settings, driver);
    let slow = memory_spec().with_option("memory.connect_delay_ms", "200");

    let building = {
        let manager = manager.clone();
        let spec = slow.clone();
        tokio::spawn(async move { manager.acquire(&alice(), &spec).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.shutdown().await;

    let err = building.await.unwrap().unwrap_err();
    assert_eq!(err.code, ErrorCode::InvariantViolation);
    assert_eq!(manager.pool_count(), 0);
    assert_eq!(stats.opened(), 1);
    assert_eq!(stats.live(), 0);
}
