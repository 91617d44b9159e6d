//! Credential vaults: interchangeable stores of secret material.

use anyhow::{Context, Result};
use arbor_common::auth::Identity;
use arbor_error::{ArborError, ErrorCode, ErrorContext};
use arbor_plan::SecretRef;
use async_trait::async_trait;
use dashmap::DashMap;
use moka::future::Cache;
use secrecy::SecretString;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[async_trait]
pub trait CredentialVault: Send + Sync {
    /// Name `SecretRef::vault` uses to select this vault.
    fn name(&self) -> &str;

    /// `Ok(None)` when the vault holds no secret under `key`.
    async fn lookup_secret(&self, key: &str, identity: &Identity) -> Result<Option<SecretString>>;
}

/// Test and bootstrap vault. Secrets may be scoped to one identity; scoped
/// entries win over shared ones.
pub struct InMemoryVault {
    name: String,
    secrets: DashMap<(Option<String>, String), SecretString>,
}

impl InMemoryVault {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            secrets: DashMap::new(),
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        self.secrets
            .insert((None, key.into()), SecretString::from(value.into()));
    }

    pub fn insert_for(
        &self,
        identity: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.secrets.insert(
            (Some(identity.into()), key.into()),
            SecretString::from(value.into()),
        );
    }

    pub fn with_secret(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }
}

#[async_trait]
impl CredentialVault for InMemoryVault {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup_secret(&self, key: &str, identity: &Identity) -> Result<Option<SecretString>> {
        let scoped = (Some(identity.name().to_string()), key.to_string());
        if let Some(secret) = self.secrets.get(&scoped) {
            return Ok(Some(secret.clone()));
        }
        Ok(self
            .secrets
            .get(&(None, key.to_string()))
            .map(|s| s.clone()))
    }
}

/// Reads `{prefix}{KEY}` from the process environment. Keys are upper-cased
/// and anything outside `[A-Z0-9_]` becomes `_`.
pub struct EnvironmentVault {
    name: String,
    prefix: String,
}

impl EnvironmentVault {
    pub fn new(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
        }
    }

    pub fn variable_name(&self, key: &str) -> String {
        let normalized: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, normalized)
    }
}

#[async_trait]
impl CredentialVault for EnvironmentVault {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup_secret(&self, key: &str, _identity: &Identity) -> Result<Option<SecretString>> {
        match std::env::var(self.variable_name(key)) {
            Ok(value) => Ok(Some(SecretString::from(value))),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Invalid value for secret '{}'", key)),
        }
    }
}

/// Flat key/value map read from a JSON or YAML file (by extension).
pub struct FileVault {
    name: String,
    path: PathBuf,
    secrets: RwLock<HashMap<String, String>>,
}

impl FileVault {
    pub fn load(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let secrets = read_secret_file(&path)?;
        Ok(Self {
            name: name.into(),
            path,
            secrets: RwLock::new(secrets),
        })
    }

    /// Re-read the file, replacing every secret.
    pub fn reload(&self) -> Result<()> {
        let secrets = read_secret_file(&self.path)?;
        let mut guard = self
            .secrets
            .write()
            .map_err(|_| anyhow::anyhow!("File vault '{}' lock poisoned", self.name))?;
        *guard = secrets;
        Ok(())
    }
}

fn read_secret_file(path: &Path) -> Result<HashMap<String, String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read secret file {}", path.display()))?;
    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if is_json {
        serde_json::from_str(&content).context("Secret file is not a JSON object of strings")
    } else {
        serde_yaml::from_str(&content).context("Secret file is not a YAML map of strings")
    }
}

#[async_trait]
impl CredentialVault for FileVault {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup_secret(&self, key: &str, _identity: &Identity) -> Result<Option<SecretString>> {
        let guard = self
            .secrets
            .read()
            .map_err(|_| anyhow::anyhow!("File vault '{}' lock poisoned", self.name))?;
        Ok(guard.get(key).cloned().map(SecretString::from))
    }
}

/// Vaults by name, with lookups memoized per (vault, key, identity).
pub struct VaultRegistry {
    vaults: HashMap<String, Arc<dyn CredentialVault>>,
    cache: Cache<String, SecretString>,
}

impl VaultRegistry {
    pub fn new(ttl: Duration, capacity: u64) -> Self {
        Self {
            vaults: HashMap::new(),
            cache: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(capacity)
                .build(),
        }
    }

    pub fn register(&mut self, vault: Arc<dyn CredentialVault>) {
        self.vaults.insert(vault.name().to_string(), vault);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.vaults.keys().cloned().collect();
        names.sort();
        names
    }

    /// Missing vaults, missing secrets and vault errors are all
    /// `CredentialResolutionFailed`. Misses are not cached.
    pub async fn lookup(
        &self,
        secret: &SecretRef,
        identity: &Identity,
    ) -> arbor_error::Result<SecretString> {
        let failed = |cause: String| {
            ArborError::new(
                ErrorCode::CredentialResolutionFailed,
                format!("Cannot resolve secret '{}'", secret),
            )
            .with_context(ErrorContext::Credential {
                identity: identity.name().to_string(),
                spec_kind: None,
                cause: Some(cause),
            })
        };

        let vault = match self.vaults.get(&secret.vault) {
            Some(vault) => vault.clone(),
            None => {
                let mut err = failed(format!("Unknown vault '{}'", secret.vault));
                if let Some(suggestion) = arbor_error::find_closest_match(&secret.vault, &self.names())
                {
                    err = err.with_hint(format!("Did you mean '{}'?", suggestion));
                }
                return Err(err);
            }
        };

        let cache_key = format!("{}\u{1f}{}\u{1f}{}", secret.vault, secret.key, identity.name());
        let key = secret.key.clone();
        self.cache
            .try_get_with(cache_key, async move {
                tracing::debug!(vault = %vault.name(), key = %key, "Vault lookup");
                match vault.lookup_secret(&key, identity).await {
                    Ok(Some(value)) => Ok(value),
                    Ok(None) => Err(format!("Secret '{}' not found", key)),
                    Err(e) => Err(format!("{:#}", e)),
                }
            })
            .await
            .map_err(|cause: Arc<String>| failed(cause.to_string()))
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}

impl Default for VaultRegistry {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(arbor_common::config::DEFAULT_SECRET_CACHE_TTL_SECS),
            arbor_common::config::DEFAULT_SECRET_CACHE_CAPACITY,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serial_test::serial;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingVault {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialVault for CountingVault {
        fn name(&self) -> &str {
            "counting"
        }

        async fn lookup_secret(&self, key: &str, _: &Identity) -> Result<Option<SecretString>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(SecretString::from(format!("value-of-{}", key))))
        }
    }

    #[tokio::test]
    async fn test_identity_scoped_secret_wins() {
        let vault = InMemoryVault::new("mem").with_secret("db", "shared");
        vault.insert_for("alice", "db", "alice-only");

        let alice = Identity::new("alice", vec![]);
        let bob = Identity::new("bob", vec![]);
        let a = vault.lookup_secret("db", &alice).await.unwrap().unwrap();
        let b = vault.lookup_secret("db", &bob).await.unwrap().unwrap();
        assert_eq!(a.expose_secret(), "alice-only");
        assert_eq!(b.expose_secret(), "shared");
        assert!(vault.lookup_secret("nope", &bob).await.unwrap().is_none());
    }

    #[tokio::test]
    #[serial]
    async fn test_environment_vault() {
        std::env::set_var("ARBOR_SECRET_DB_PASSWORD", "pw");
        let vault = EnvironmentVault::new("env", "ARBOR_SECRET_");
        assert_eq!(vault.variable_name("db.password"), "ARBOR_SECRET_DB_PASSWORD");

        let anon = Identity::anonymous();
        let secret = vault.lookup_secret("db.password", &anon).await.unwrap();
        std::env::remove_var("ARBOR_SECRET_DB_PASSWORD");
        assert_eq!(secret.unwrap().expose_secret(), "pw");
        assert!(vault.lookup_secret("absent", &anon).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_vault_json_and_yaml() {
        let mut json = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(json, r#"{{"api_token": "t0k3n"}}"#).unwrap();
        let mut yaml = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(yaml, "db_password: hunter2").unwrap();

        let anon = Identity::anonymous();
        let json_vault = FileVault::load("json", json.path()).unwrap();
        let yaml_vault = FileVault::load("yaml", yaml.path()).unwrap();

        let token = json_vault.lookup_secret("api_token", &anon).await.unwrap();
        let pw = yaml_vault.lookup_secret("db_password", &anon).await.unwrap();
        assert_eq!(token.unwrap().expose_secret(), "t0k3n");
        assert_eq!(pw.unwrap().expose_secret(), "hunter2");
    }

    #[tokio::test]
    async fn test_file_vault_reload() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "k: one").unwrap();
        let vault = FileVault::load("file", file.path()).unwrap();

        std::fs::write(file.path(), "k: two\n").unwrap();
        vault.reload().unwrap();

        let anon = Identity::anonymous();
        let value = vault.lookup_secret("k", &anon).await.unwrap().unwrap();
        assert_eq!(value.expose_secret(), "two");
    }

    #[tokio::test]
    async fn test_registry_memoizes_lookups() {
        let counting = Arc::new(CountingVault {
            calls: AtomicUsize::new(0),
        });
        let mut registry = VaultRegistry::default();
        registry.register(counting.clone());

        let anon = Identity::anonymous();
        let secret = SecretRef::new("counting", "k");
        for _ in 0..3 {
            let value = registry.lookup(&secret, &anon).await.unwrap();
            assert_eq!(value.expose_secret(), "value-of-k");
        }
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_registry_failures_are_credential_errors() {
        let mut registry = VaultRegistry::default();
        registry.register(Arc::new(InMemoryVault::new("memory")));
        let anon = Identity::anonymous();

        let missing = registry
            .lookup(&SecretRef::new("memory", "absent"), &anon)
            .await
            .unwrap_err();
        assert_eq!(missing.code, ErrorCode::CredentialResolutionFailed);

        let unknown = registry
            .lookup(&SecretRef::new("memroy", "k"), &anon)
            .await
            .unwrap_err();
        assert_eq!(unknown.code, ErrorCode::CredentialResolutionFailed);
        assert_eq!(unknown.hint.as_deref(), Some("Did you mean 'memory'?"));
    }
}
