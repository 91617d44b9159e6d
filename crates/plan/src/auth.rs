use serde::{Deserialize, Serialize};
use std::fmt;

/// Pointer to secret material held by a named credential vault.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    pub vault: String,
    pub key: String,
}

impl SecretRef {
    pub fn new(vault: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            vault: vault.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.vault, self.key)
    }
}

/// How a connection or service call authenticates.
///
/// Secrets are never inlined; they are referenced through [`SecretRef`]s and
/// looked up at resolution time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthenticationSpec {
    #[default]
    None,
    UserPassword {
        username: String,
        password: SecretRef,
    },
    StaticToken {
        token: SecretRef,
    },
    /// Reuse the caller's own Kerberos credential.
    DelegatedKerberos,
    #[serde(rename = "oauth_client_credentials")]
    OAuthClientCredentials {
        client_id: String,
        client_secret: SecretRef,
        token_url: String,
        #[serde(default)]
        scopes: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationKind {
    None,
    UserPassword,
    StaticToken,
    DelegatedKerberos,
    #[serde(rename = "oauth_client_credentials")]
    OAuthClientCredentials,
}

impl AuthenticationSpec {
    pub fn kind(&self) -> AuthenticationKind {
        match self {
            AuthenticationSpec::None => AuthenticationKind::None,
            AuthenticationSpec::UserPassword { .. } => AuthenticationKind::UserPassword,
            AuthenticationSpec::StaticToken { .. } => AuthenticationKind::StaticToken,
            AuthenticationSpec::DelegatedKerberos => AuthenticationKind::DelegatedKerberos,
            AuthenticationSpec::OAuthClientCredentials { .. } => {
                AuthenticationKind::OAuthClientCredentials
            }
        }
    }
}

impl fmt::Display for AuthenticationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthenticationKind::None => "none",
            AuthenticationKind::UserPassword => "user_password",
            AuthenticationKind::StaticToken => "static_token",
            AuthenticationKind::DelegatedKerberos => "delegated_kerberos",
            AuthenticationKind::OAuthClientCredentials => "oauth_client_credentials",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let spec: AuthenticationSpec = serde_json::from_str(
            r#"{"type":"user_password","username":"svc","password":{"vault":"env","key":"DB_PASS"}}"#,
        )
        .unwrap();
        assert_eq!(spec.kind(), AuthenticationKind::UserPassword);

        let none: AuthenticationSpec = serde_json::from_str(r#"{"type":"none"}"#).unwrap();
        assert_eq!(none, AuthenticationSpec::default());

        let oauth: AuthenticationSpec = serde_json::from_str(
            r#"{"type":"oauth_client_credentials","client_id":"c","client_secret":{"vault":"mem","key":"s"},"token_url":"http://idp/token"}"#,
        )
        .unwrap();
        assert_eq!(oauth.kind().to_string(), "oauth_client_credentials");
    }
}
