//! Backend reachability descriptors and their hashable identity.

use crate::auth::AuthenticationSpec;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// How to reach a backend, independent of who connects.
///
/// `options` carries driver-specific settings as well as `pool.*` overrides
/// for the pool built from this spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub driver: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub auth: AuthenticationSpec,
}

impl ConnectionSpec {
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            host: None,
            port: None,
            database: None,
            options: BTreeMap::new(),
            auth: AuthenticationSpec::None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>, port: Option<u16>) -> Self {
        self.host = Some(host.into());
        self.port = port;
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn with_auth(mut self, auth: AuthenticationSpec) -> Self {
        self.auth = auth;
        self
    }

    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::of(self)
    }

    /// `driver://host:port/database` for logs; never contains secrets.
    pub fn display_target(&self) -> String {
        let mut target = format!("{}://", self.driver);
        if let Some(host) = &self.host {
            target.push_str(host);
            if let Some(port) = self.port {
                target.push_str(&format!(":{}", port));
            }
        }
        if let Some(database) = &self.database {
            target.push('/');
            target.push_str(database);
        }
        target
    }
}

/// SHA-256 of the canonical JSON encoding of a [`ConnectionSpec`], hex encoded.
///
/// Field order is fixed by the struct and options are kept sorted, so
/// structurally equal specs always hash to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionKey(String);

impl ConnectionKey {
    pub fn of(spec: &ConnectionSpec) -> Self {
        let canonical = serde_json::to_string(spec).unwrap_or_else(|_| format!("{:?}", spec));
        Self(format!("{:x}", Sha256::digest(canonical.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex digits, enough to tell pools apart in logs.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
