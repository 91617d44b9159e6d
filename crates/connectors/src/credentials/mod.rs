//! Credential resolution.
//!
//! Turns a connection's or service call's [`AuthenticationSpec`] plus the
//! caller's [`Identity`] into a [`Credential`]. One resolver is registered per
//! [`AuthenticationKind`]; resolvers read secret material through the
//! [`VaultRegistry`].
//!
//! Every failure surfaces as `CredentialResolutionFailed`. A failed resolution
//! is never downgraded to an anonymous credential.

pub mod oauth;
pub mod vault;

use arbor_common::auth::{Credential, Identity};
use arbor_common::config::CredentialSettings;
use arbor_error::{ArborError, ErrorCode, ErrorContext, Result};
use arbor_plan::{AuthenticationKind, AuthenticationSpec};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use oauth::{OAuthClientCredentialsConfig, OAuthTokenCache};
pub use vault::{CredentialVault, EnvironmentVault, FileVault, InMemoryVault, VaultRegistry};

#[async_trait]
pub trait CredentialResolver: Send + Sync {
    fn kind(&self) -> AuthenticationKind;

    async fn resolve(
        &self,
        spec: &AuthenticationSpec,
        identity: &Identity,
        vaults: &VaultRegistry,
    ) -> Result<Credential>;
}

pub(crate) fn resolution_failed(
    identity: &Identity,
    kind: AuthenticationKind,
    cause: impl Into<String>,
) -> ArborError {
    let cause = cause.into();
    ArborError::new(
        ErrorCode::CredentialResolutionFailed,
        format!(
            "Cannot resolve {} credential for '{}': {}",
            kind,
            identity.name(),
            cause
        ),
    )
    .with_context(ErrorContext::Credential {
        identity: identity.name().to_string(),
        spec_kind: Some(kind.to_string()),
        cause: Some(cause),
    })
}

/// Fill in the spec kind on errors bubbling up from vault lookups.
fn tag_kind(mut err: ArborError, kind: AuthenticationKind) -> ArborError {
    if let Some(ErrorContext::Credential { spec_kind, .. }) = &mut err.context {
        if spec_kind.is_none() {
            *spec_kind = Some(kind.to_string());
        }
    }
    err
}

fn mismatch(spec: &AuthenticationSpec, identity: &Identity, expected: AuthenticationKind) -> ArborError {
    resolution_failed(
        identity,
        spec.kind(),
        format!("resolver for {} received a {} spec", expected, spec.kind()),
    )
}

pub struct AnonymousResolver;

#[async_trait]
impl CredentialResolver for AnonymousResolver {
    fn kind(&self) -> AuthenticationKind {
        AuthenticationKind::None
    }

    async fn resolve(
        &self,
        _spec: &AuthenticationSpec,
        _identity: &Identity,
        _vaults: &VaultRegistry,
    ) -> Result<Credential> {
        Ok(Credential::Anonymous)
    }
}

pub struct UserPasswordResolver;

#[async_trait]
impl CredentialResolver for UserPasswordResolver {
    fn kind(&self) -> AuthenticationKind {
        AuthenticationKind::UserPassword
    }

    async fn resolve(
        &self,
        spec: &AuthenticationSpec,
        identity: &Identity,
        vaults: &VaultRegistry,
    ) -> Result<Credential> {
        let AuthenticationSpec::UserPassword { username, password } = spec else {
            return Err(mismatch(spec, identity, self.kind()));
        };
        let password = vaults
            .lookup(password, identity)
            .await
            .map_err(|e| tag_kind(e, self.kind()))?;
        Ok(Credential::UsernamePassword {
            username: username.clone(),
            password,
        })
    }
}

pub struct StaticTokenResolver;

#[async_trait]
impl CredentialResolver for StaticTokenResolver {
    fn kind(&self) -> AuthenticationKind {
        AuthenticationKind::StaticToken
    }

    async fn resolve(
        &self,
        spec: &AuthenticationSpec,
        identity: &Identity,
        vaults: &VaultRegistry,
    ) -> Result<Credential> {
        let AuthenticationSpec::StaticToken { token } = spec else {
            return Err(mismatch(spec, identity, self.kind()));
        };
        let token = vaults
            .lookup(token, identity)
            .await
            .map_err(|e| tag_kind(e, self.kind()))?;
        Ok(Credential::Token {
            token,
            expires_at: None,
        })
    }
}

/// Connects as the caller, using the caller's own Kerberos ticket.
pub struct DelegatedKerberosResolver;

#[async_trait]
impl CredentialResolver for DelegatedKerberosResolver {
    fn kind(&self) -> AuthenticationKind {
        AuthenticationKind::DelegatedKerberos
    }

    async fn resolve(
        &self,
        _spec: &AuthenticationSpec,
        identity: &Identity,
        _vaults: &VaultRegistry,
    ) -> Result<Credential> {
        identity
            .credentials()
            .iter()
            .find(|c| matches!(c, Credential::Kerberos { .. }) && c.is_valid())
            .cloned()
            .ok_or_else(|| {
                resolution_failed(
                    identity,
                    self.kind(),
                    "identity holds no valid Kerberos credential to delegate",
                )
            })
    }
}

pub struct OAuthClientCredentialsResolver {
    tokens: OAuthTokenCache,
}

impl OAuthClientCredentialsResolver {
    pub fn new(tokens: OAuthTokenCache) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl CredentialResolver for OAuthClientCredentialsResolver {
    fn kind(&self) -> AuthenticationKind {
        AuthenticationKind::OAuthClientCredentials
    }

    async fn resolve(
        &self,
        spec: &AuthenticationSpec,
        identity: &Identity,
        vaults: &VaultRegistry,
    ) -> Result<Credential> {
        let AuthenticationSpec::OAuthClientCredentials {
            client_id,
            client_secret,
            token_url,
            scopes,
        } = spec
        else {
            return Err(mismatch(spec, identity, self.kind()));
        };

        let client_secret = vaults
            .lookup(client_secret, identity)
            .await
            .map_err(|e| tag_kind(e, self.kind()))?;
        let config = OAuthClientCredentialsConfig {
            client_id: client_id.clone(),
            client_secret,
            token_url: token_url.clone(),
            scopes: scopes.clone(),
        };

        let token = self
            .tokens
            .get_token(&config)
            .await
            .map_err(|e| resolution_failed(identity, self.kind(), format!("{:#}", e)))?;

        Ok(Credential::Token {
            token: token.access_token,
            expires_at: Some(token.expires_at_wall),
        })
    }
}

/// Resolvers keyed by authentication kind, plus the vaults they read from.
pub struct CredentialResolverRegistry {
    resolvers: HashMap<AuthenticationKind, Arc<dyn CredentialResolver>>,
    vaults: VaultRegistry,
}

impl CredentialResolverRegistry {
    pub fn new(vaults: VaultRegistry) -> Self {
        Self {
            resolvers: HashMap::new(),
            vaults,
        }
    }

    pub fn register(&mut self, resolver: Arc<dyn CredentialResolver>) {
        self.resolvers.insert(resolver.kind(), resolver);
    }

    pub fn vaults(&self) -> &VaultRegistry {
        &self.vaults
    }

    pub fn kinds(&self) -> Vec<AuthenticationKind> {
        self.resolvers.keys().copied().collect()
    }

    pub async fn resolve(&self, spec: &AuthenticationSpec, identity: &Identity) -> Result<Credential> {
        let kind = spec.kind();
        let resolver = self.resolvers.get(&kind).ok_or_else(|| {
            resolution_failed(identity, kind, "no resolver registered for this kind")
        })?;

        let credential = resolver.resolve(spec, identity, &self.vaults).await?;
        tracing::debug!(
            identity = %identity.name(),
            spec_kind = %kind,
            credential_kind = %credential.kind(),
            "Resolved credential"
        );
        Ok(credential)
    }
}

/// Registry with every built-in resolver.
pub fn default_resolvers(
    vaults: VaultRegistry,
    http: reqwest::Client,
) -> CredentialResolverRegistry {
    let mut registry = CredentialResolverRegistry::new(vaults);
    registry.register(Arc::new(AnonymousResolver));
    registry.register(Arc::new(UserPasswordResolver));
    registry.register(Arc::new(StaticTokenResolver));
    registry.register(Arc::new(DelegatedKerberosResolver));
    registry.register(Arc::new(OAuthClientCredentialsResolver::new(
        OAuthTokenCache::new(http),
    )));
    registry
}

/// Vault registry sized from configuration, without any vault registered.
pub fn vault_registry(settings: &CredentialSettings) -> VaultRegistry {
    VaultRegistry::new(
        Duration::from_secs(settings.secret_cache_ttl_secs),
        settings.secret_cache_capacity,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_plan::SecretRef;
    use secrecy::ExposeSecret;

    fn registry_with(vault: InMemoryVault) -> CredentialResolverRegistry {
        let mut vaults = VaultRegistry::default();
        vaults.register(Arc::new(vault));
        default_resolvers(vaults, reqwest::Client::new())
    }

    #[tokio::test]
    async fn test_user_password_from_vault() {
        let registry = registry_with(InMemoryVault::new("mem").with_secret("db", "hunter2"));
        let spec = AuthenticationSpec::UserPassword {
            username: "svc".into(),
            password: SecretRef::new("mem", "db"),
        };

        let cred = registry.resolve(&spec, &Identity::anonymous()).await.unwrap();
        match cred {
            Credential::UsernamePassword { username, password } => {
                assert_eq!(username, "svc");
                assert_eq!(password.expose_secret(), "hunter2");
            }
            other => panic!("unexpected credential {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_secret_is_not_downgraded() {
        let registry = registry_with(InMemoryVault::new("mem"));
        let spec = AuthenticationSpec::StaticToken {
            token: SecretRef::new("mem", "absent"),
        };

        let err = registry
            .resolve(&spec, &Identity::anonymous())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CredentialResolutionFailed);
        match err.context {
            Some(ErrorContext::Credential { spec_kind, .. }) => {
                assert_eq!(spec_kind.as_deref(), Some("static_token"));
            }
            other => panic!("unexpected context {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delegated_kerberos_uses_identity_ticket() {
        let registry = registry_with(InMemoryVault::new("mem"));
        let alice = Identity::new(
            "alice",
            vec![Credential::kerberos("alice@EXAMPLE.COM", None)],
        );

        let cred = registry
            .resolve(&AuthenticationSpec::DelegatedKerberos, &alice)
            .await
            .unwrap();
        assert!(matches!(cred, Credential::Kerberos { ref principal, .. } if principal == "alice@EXAMPLE.COM"));

        let err = registry
            .resolve(&AuthenticationSpec::DelegatedKerberos, &Identity::anonymous())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CredentialResolutionFailed);
    }

    #[tokio::test]
    async fn test_unregistered_kind_fails() {
        let registry = CredentialResolverRegistry::new(VaultRegistry::default());
        let err = registry
            .resolve(&AuthenticationSpec::None, &Identity::anonymous())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CredentialResolutionFailed);
    }
}
