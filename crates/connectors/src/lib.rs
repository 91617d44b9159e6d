//! Connectivity for the Arbor runtime.
//!
//! - [`credentials`]: turns an `AuthenticationSpec` plus an `Identity` into a
//!   `Credential`, consulting pluggable vaults for secret material.
//! - [`pool`]: identity-scoped connection pools with live statistics, and the
//!   physical drivers that open connections.
//!
//! Both sides use explicit registries populated once at start-up
//! (`default_resolvers`, `default_drivers`); nothing here is global.

pub mod credentials;
pub mod pool;

pub use credentials::{default_resolvers, CredentialResolver, CredentialResolverRegistry};
pub use pool::{
    default_drivers, ConnectionDriver, ConnectionPoolManager, DataSourceWithStatistics,
    DriverRegistry, PhysicalConnection, PoolStatistics, PooledConnection,
};
