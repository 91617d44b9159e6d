//! Identities and the credentials they carry.
//!
//! An [`Identity`] is built once by the authentication layer in front of the
//! runtime and is read-only afterwards. The credentials it holds are proofs the
//! credential resolvers can delegate to (e.g. a Kerberos ticket) when opening
//! connections on the identity's behalf.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Name carried by [`Identity::anonymous`].
pub const ANONYMOUS_IDENTITY: &str = "_anonymous_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CredentialKind {
    Anonymous,
    UsernamePassword,
    Kerberos,
    Token,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialKind::Anonymous => write!(f, "anonymous"),
            CredentialKind::UsernamePassword => write!(f, "username_password"),
            CredentialKind::Kerberos => write!(f, "kerberos"),
            CredentialKind::Token => write!(f, "token"),
        }
    }
}

/// Proof of authentication usable to open a connection.
#[derive(Clone)]
pub enum Credential {
    Anonymous,
    UsernamePassword {
        username: String,
        password: SecretString,
    },
    Kerberos {
        principal: String,
        expires_at: Option<SystemTime>,
    },
    Token {
        token: SecretString,
        expires_at: Option<SystemTime>,
    },
}

impl Credential {
    pub fn username_password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credential::UsernamePassword {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    pub fn token(token: impl Into<String>, expires_at: Option<SystemTime>) -> Self {
        Credential::Token {
            token: SecretString::from(token.into()),
            expires_at,
        }
    }

    pub fn kerberos(principal: impl Into<String>, expires_at: Option<SystemTime>) -> Self {
        Credential::Kerberos {
            principal: principal.into(),
            expires_at,
        }
    }

    pub fn kind(&self) -> CredentialKind {
        match self {
            Credential::Anonymous => CredentialKind::Anonymous,
            Credential::UsernamePassword { .. } => CredentialKind::UsernamePassword,
            Credential::Kerberos { .. } => CredentialKind::Kerberos,
            Credential::Token { .. } => CredentialKind::Token,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(SystemTime::now())
    }

    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        let unexpired = |expires_at: &Option<SystemTime>| match expires_at {
            Some(at) => now < *at,
            None => true,
        };
        match self {
            Credential::Anonymous => true,
            Credential::UsernamePassword { username, .. } => !username.is_empty(),
            Credential::Kerberos {
                principal,
                expires_at,
            } => !principal.is_empty() && unexpired(expires_at),
            Credential::Token { token, expires_at } => {
                !token.expose_secret().is_empty() && unexpired(expires_at)
            }
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Anonymous => f.write_str("Anonymous"),
            Credential::UsernamePassword { username, .. } => f
                .debug_struct("UsernamePassword")
                .field("username", username)
                .field("password", &"***REDACTED***")
                .finish(),
            Credential::Kerberos {
                principal,
                expires_at,
            } => f
                .debug_struct("Kerberos")
                .field("principal", principal)
                .field("expires_at", expires_at)
                .finish(),
            Credential::Token { expires_at, .. } => f
                .debug_struct("Token")
                .field("token", &"***REDACTED***")
                .field("expires_at", expires_at)
                .finish(),
        }
    }
}

/// An authenticated principal plus its credentials.
#[derive(Debug, Clone)]
pub struct Identity {
    name: String,
    credentials: Vec<Credential>,
}

impl Identity {
    pub fn new(name: impl Into<String>, credentials: Vec<Credential>) -> Self {
        Self {
            name: name.into(),
            credentials,
        }
    }

    pub fn anonymous() -> Self {
        Self::new(ANONYMOUS_IDENTITY, vec![])
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn credentials(&self) -> &[Credential] {
        &self.credentials
    }

    /// An identity without any non-anonymous proof is anonymous, whatever its name.
    pub fn is_anonymous(&self) -> bool {
        self.credentials
            .iter()
            .all(|c| c.kind() == CredentialKind::Anonymous)
    }

    /// Valid iff every held credential is valid; no credentials is valid.
    pub fn is_valid(&self) -> bool {
        self.credentials.iter().all(Credential::is_valid)
    }

    /// First credential of the given kind.
    pub fn credential(&self, kind: CredentialKind) -> Option<&Credential> {
        self.credentials.iter().find(|c| c.kind() == kind)
    }

    /// Kerberos principal of the first Kerberos credential, if any.
    pub fn kerberos_principal(&self) -> Option<&str> {
        match self.credential(CredentialKind::Kerberos) {
            Some(Credential::Kerberos { principal, .. }) => Some(principal.as_str()),
            _ => None,
        }
    }
}
