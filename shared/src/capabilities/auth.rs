use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Opaque bearer credential. Never printed.
#[derive(Clone)]
pub struct BearerToken(Arc<SecretString>);

impl BearerToken {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(Arc::new(SecretString::new(token.into())))
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.expose_secret().trim().is_empty()
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken([REDACTED])")
    }
}

/// Supplies the caller's credential for each request. The core never
/// refreshes tokens; a missing or expired one is reported as a transient
/// network failure and the work is retried or queued.
pub trait CredentialProvider: Send + Sync {
    fn bearer_token(&self) -> Option<BearerToken>;
}

/// Credential slot the host updates on sign-in and sign-out.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    token: RwLock<Option<BearerToken>>,
}

impl StaticCredentials {
    #[must_use]
    pub fn new(token: Option<BearerToken>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    pub fn set(&self, token: BearerToken) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token);
    }

    pub fn clear(&self) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl CredentialProvider for StaticCredentials {
    fn bearer_token(&self) -> Option<BearerToken> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .filter(|t| !t.is_empty())
    }
}
