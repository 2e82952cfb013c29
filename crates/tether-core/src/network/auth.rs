//! Auth context for remote calls.
//!
//! There is no process-wide "active user": every engine holds an explicit
//! [`AuthProvider`] and requests resolve against it.

use std::fmt;
use std::sync::RwLock;

use crate::error::{Error, Result};

/// Which credentials a request needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthRequirement {
    /// Anonymous
    None,
    /// App key and secret
    App,
    /// Active user session; fails without one
    Session,
    /// Session when available, otherwise app credentials
    #[default]
    Default,
}

/// Credentials attached to an outgoing request
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic { username: String, password: String },
    Session(String),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
            Self::Session(_) => f.debug_tuple("Session").field(&"[REDACTED]").finish(),
        }
    }
}

/// Supplies credentials for outgoing requests
pub trait AuthProvider: Send + Sync {
    /// App key/secret credentials
    fn app_credentials(&self) -> Option<Credentials>;
    /// Credentials of the active user session, if any
    fn session_credentials(&self) -> Option<Credentials>;
}

/// App credentials with an optional user session token
pub struct AppCredentials {
    app_key: String,
    app_secret: String,
    session_token: RwLock<Option<String>>,
}

impl fmt::Debug for AppCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppCredentials")
            .field("app_key", &self.app_key)
            .field("app_secret", &"[REDACTED]")
            .field("has_session", &self.session_token().is_some())
            .finish()
    }
}

impl AppCredentials {
    pub fn new(app_key: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            app_secret: app_secret.into(),
            session_token: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn with_session(self, token: impl Into<String>) -> Self {
        self.set_session(Some(token.into()));
        self
    }

    pub fn app_key(&self) -> &str {
        &self.app_key
    }

    /// Replace (or with `None`, end) the user session
    pub fn set_session(&self, token: Option<String>) {
        if let Ok(mut slot) = self.session_token.write() {
            *slot = token;
        }
    }

    pub fn session_token(&self) -> Option<String> {
        self.session_token.read().ok().and_then(|slot| slot.clone())
    }
}

impl AuthProvider for AppCredentials {
    fn app_credentials(&self) -> Option<Credentials> {
        Some(Credentials::Basic {
            username: self.app_key.clone(),
            password: self.app_secret.clone(),
        })
    }

    fn session_credentials(&self) -> Option<Credentials> {
        self.session_token().map(Credentials::Session)
    }
}

pub(super) fn resolve(
    requirement: AuthRequirement,
    provider: &dyn AuthProvider,
) -> Result<Option<Credentials>> {
    match requirement {
        AuthRequirement::None => Ok(None),
        AuthRequirement::App => provider
            .app_credentials()
            .map(Some)
            .ok_or_else(|| Error::InvalidCredentials("no app credentials configured".into())),
        AuthRequirement::Session => provider
            .session_credentials()
            .map(Some)
            .ok_or_else(|| Error::InvalidCredentials("no active user session".into())),
        AuthRequirement::Default => provider
            .session_credentials()
            .or_else(|| provider.app_credentials())
            .map(Some)
            .ok_or_else(|| Error::InvalidCredentials("no credentials available".into())),
    }
}
