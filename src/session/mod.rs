//! Vault session tokens and their lifecycle.
//!
//! A [`SessionSecret`] is immutable once issued: renewal and re-login both
//! produce a new value, which the [`SessionManager`] publishes to every
//! [`SessionHandle`] with a single pointer swap. Readers never observe a
//! half-updated session and never take a lock on the hot path beyond the
//! watch channel's read guard.

mod manager;
mod watcher;

pub use manager::{LifecycleSettings, SessionManager};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Deserialize;
use tokio::sync::watch;

use crate::error::{Error, Result};

/// Token issued by Vault after login or renewal.
#[derive(Debug)]
pub struct SessionSecret {
    token: SecretString,
    accessor: Option<String>,
    policies: Vec<String>,
    renewable: bool,
    lease_duration: Duration,
    issued_at: DateTime<Utc>,
}

impl SessionSecret {
    pub fn new(token: SecretString, lease_duration: Duration, renewable: bool) -> Self {
        Self {
            token,
            accessor: None,
            policies: Vec::new(),
            renewable,
            lease_duration,
            issued_at: Utc::now(),
        }
    }

    pub fn with_policies(mut self, policies: Vec<String>) -> Self {
        self.policies = policies;
        self
    }

    pub fn token(&self) -> &SecretString {
        &self.token
    }

    pub fn accessor(&self) -> Option<&str> {
        self.accessor.as_deref()
    }

    pub fn policies(&self) -> &[String] {
        &self.policies
    }

    pub fn is_renewable(&self) -> bool {
        self.renewable
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// End of the current lease, ignoring any future renewal.
    pub fn expires_at(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.lease_duration)
            .ok()
            .and_then(|lease| self.issued_at.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// `{"auth": {...}}` envelope returned by login and renew-self.
#[derive(Deserialize)]
pub(crate) struct AuthEnvelope {
    #[serde(default)]
    auth: Option<AuthBlock>,
}

#[derive(Deserialize)]
struct AuthBlock {
    client_token: String,
    #[serde(default)]
    accessor: Option<String>,
    #[serde(default)]
    policies: Option<Vec<String>>,
    #[serde(default)]
    lease_duration: u64,
    #[serde(default)]
    renewable: bool,
}

impl AuthEnvelope {
    pub(crate) fn into_session(self) -> Result<SessionSecret> {
        let auth = self
            .auth
            .ok_or_else(|| Error::schema("Vault response carries no auth block"))?;

        if auth.client_token.is_empty() {
            return Err(Error::schema("Vault response carries an empty client token"));
        }

        let mut session = SessionSecret::new(
            SecretString::from(auth.client_token),
            Duration::from_secs(auth.lease_duration),
            auth.renewable,
        )
        .with_policies(auth.policies.unwrap_or_default());
        session.accessor = auth.accessor.filter(|a| !a.is_empty());

        Ok(session)
    }
}

/// Where the token lifecycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Obtaining a fresh token from the identity provider and Vault.
    LoggingIn,
    /// A renewal watcher is keeping the current token alive.
    Watching,
    /// The watcher reported an error; a re-login follows.
    RenewalFailed,
    /// The token reached its maximum TTL; a re-login follows.
    LeaseExpired,
    /// The lifecycle was cancelled.
    Stopped,
}

/// Read side of the session published by a [`SessionManager`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session: watch::Receiver<Arc<SessionSecret>>,
    state: watch::Receiver<LifecycleState>,
}

impl SessionHandle {
    pub(crate) fn new(
        session: watch::Receiver<Arc<SessionSecret>>,
        state: watch::Receiver<LifecycleState>,
    ) -> Self {
        Self { session, state }
    }

    /// The session to use for the next request.
    pub fn current(&self) -> Arc<SessionSecret> {
        self.session.borrow().clone()
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Wait until a different session is published.
    ///
    /// Returns `false` once the lifecycle has stopped and no further
    /// session will ever be published.
    pub async fn changed(&mut self) -> bool {
        self.session.changed().await.is_ok()
    }

    /// Wait for the next lifecycle state and return it, or `None` once the
    /// lifecycle is gone.
    pub async fn state_changed(&mut self) -> Option<LifecycleState> {
        self.state.changed().await.ok()?;
        Some(*self.state.borrow_and_update())
    }
}
