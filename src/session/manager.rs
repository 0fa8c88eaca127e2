//! Supervising task that owns the current Vault session.
//!
//! ```text
//!   start ── login ──► Watching ──renewed──► Watching (new token published)
//!                        │
//!                        ├─ lease capped ─► LeaseExpired ─┐
//!                        └─ renew failed ─► RenewalFailed ┤
//!                                                         ▼
//!                     Watching ◄── new token ◄── LoggingIn (retries with backoff)
//! ```
//!
//! The task exits only when its cancellation token fires, and always stops
//! the current watcher before returning.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::watcher::{sleep_unless_cancelled, LifetimeWatcher, WatchEnd};
use super::{LifecycleState, SessionHandle, SessionSecret};
use crate::auth::AuthMethod;
use crate::client::BackendClient;
use crate::config::LifecycleConfig;
use crate::duration::format_duration;
use crate::error::{Error, Result};

/// Timing knobs for the token lifecycle.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Lease extension requested on each renewal.
    pub renew_increment: Duration,
    /// First delay after a failed login, and the starting spacing between logins.
    pub relogin_backoff: Duration,
    /// Cap for the doubling login backoff.
    pub relogin_backoff_max: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self::from(&LifecycleConfig::default())
    }
}

impl From<&LifecycleConfig> for LifecycleSettings {
    fn from(config: &LifecycleConfig) -> Self {
        Self {
            renew_increment: config.renew_increment,
            relogin_backoff: config.relogin_backoff,
            relogin_backoff_max: config.relogin_backoff_max,
        }
    }
}

/// Owner of the Vault session and of the task that keeps it alive.
pub struct SessionManager {
    handle: SessionHandle,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionManager {
    /// Log in once and start the lifecycle task.
    ///
    /// Fails without spawning anything if the login fails or yields a token
    /// Vault will not renew: that is a role misconfiguration no amount of
    /// retrying fixes. The task stops when `parent` is cancelled or when
    /// [`stop`](Self::stop) is called.
    pub async fn start(
        client: BackendClient,
        auth: Arc<dyn AuthMethod>,
        settings: LifecycleSettings,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let session = auth.login(&client).await?;
        if !session.is_renewable() {
            return Err(Error::configuration(
                "Vault issued a non-renewable token; check the auth role's token settings",
            ));
        }
        info!(
            method = auth.name(),
            lease = %format_duration(session.lease_duration()),
            "logged in to vault"
        );

        let (session_tx, session_rx) = watch::channel(Arc::new(session));
        let (state_tx, state_rx) = watch::channel(LifecycleState::Watching);
        let cancel = parent.child_token();

        let lifecycle = Lifecycle {
            client,
            auth,
            settings,
            session_tx,
            state_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(lifecycle.run());

        Ok(Self {
            handle: SessionHandle::new(session_rx, state_rx),
            cancel,
            task,
        })
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Cancel the lifecycle task and wait until it and its watcher are gone.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            error!(error = %err, "vault token lifecycle task panicked");
        }
    }
}

struct Lifecycle {
    client: BackendClient,
    auth: Arc<dyn AuthMethod>,
    settings: LifecycleSettings,
    session_tx: watch::Sender<Arc<SessionSecret>>,
    state_tx: watch::Sender<LifecycleState>,
    cancel: CancellationToken,
}

impl Lifecycle {
    async fn run(self) {
        // Minimum time between logins. Doubles while sessions keep ending
        // before it has passed, and falls back once one outlives it.
        let mut spacing = self.settings.relogin_backoff;

        loop {
            let started = Instant::now();
            let session = self.session_tx.borrow().clone();

            match self.watch(session).await {
                None => break,
                Some(WatchEnd::Expired) => {
                    self.state_tx.send_replace(LifecycleState::LeaseExpired);
                    info!("vault token can no longer be renewed, logging in again");
                }
                Some(WatchEnd::Failed(err)) => {
                    self.state_tx.send_replace(LifecycleState::RenewalFailed);
                    warn!(error = %err, "vault token renewal failed, logging in again");
                }
            }

            let elapsed = started.elapsed();
            if elapsed < spacing {
                debug!(
                    wait = %format_duration(spacing - elapsed),
                    "vault session ended early, spacing out the next login"
                );
                if !sleep_unless_cancelled(spacing - elapsed, &self.cancel).await {
                    break;
                }
                spacing = next_backoff(spacing, self.settings.relogin_backoff_max);
            } else {
                spacing = self.settings.relogin_backoff;
            }

            let Some(session) = self.relogin().await else {
                break;
            };
            self.session_tx.send_replace(Arc::new(session));
            self.state_tx.send_replace(LifecycleState::Watching);
        }

        self.state_tx.send_replace(LifecycleState::Stopped);
        debug!("vault token lifecycle stopped");
    }

    /// Run one watcher over `session` until it ends or we are cancelled.
    async fn watch(&self, session: Arc<SessionSecret>) -> Option<WatchEnd> {
        let mut watcher = LifetimeWatcher::new(
            self.client.clone(),
            session,
            self.settings.renew_increment,
        )
        .start(self.cancel.child_token());

        let end = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break None,
                Some(renewed) = watcher.renewed.recv() => {
                    debug!(
                        lease = %format_duration(renewed.lease_duration()),
                        "renewed vault token"
                    );
                    self.session_tx.send_replace(renewed);
                }
                end = &mut watcher.done => {
                    break Some(end.unwrap_or_else(|_| {
                        WatchEnd::Failed(Error::configuration("renewal watcher exited without reporting"))
                    }));
                }
            }
        };

        // Renewals queued before the watcher finished are still newer than what we published.
        if end.is_some() {
            while let Ok(renewed) = watcher.renewed.try_recv() {
                self.session_tx.send_replace(renewed);
            }
        }
        watcher.stop().await;
        end
    }

    /// Log in until it works. Returns `None` only when cancelled.
    async fn relogin(&self) -> Option<SessionSecret> {
        let mut backoff = self.settings.relogin_backoff;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.state_tx.send_replace(LifecycleState::LoggingIn);

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                result = self.auth.login(&self.client) => result,
            };

            match result {
                Ok(session) => {
                    if !session.is_renewable() {
                        error!(
                            "vault issued a non-renewable token, please check vault config; \
                             it will be replaced when its lease runs out"
                        );
                    }
                    info!(
                        attempt,
                        lease = %format_duration(session.lease_duration()),
                        expires_at = %session.expires_at(),
                        "logged in to vault"
                    );
                    return Some(session);
                }
                Err(err) => {
                    warn!(
                        attempt,
                        error = %err,
                        retry_in = %format_duration(backoff),
                        "vault login failed, retrying"
                    );
                    if !sleep_unless_cancelled(backoff, &self.cancel).await {
                        return None;
                    }
                    backoff = next_backoff(backoff, self.settings.relogin_backoff_max);
                }
            }
        }
    }
}

/// Double `current`, never going past `max`.
fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}
