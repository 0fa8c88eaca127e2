//! Renewal watcher: keeps one session token alive until it cannot be extended.
//!
//! The watcher renews immediately, then again after roughly two thirds of
//! every granted lease. While the granted lease keeps growing it recomputes a
//! grace window of 10-20 % of the lease. Once Vault starts capping the lease
//! (max TTL reached) the lease shrinks on every renewal; as soon as the next
//! sleep would end inside the grace window the watcher reports
//! [`WatchEnd::Expired`], leaving the caller time to log in again while the
//! old token is still valid.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::SessionSecret;
use crate::client::BackendClient;
use crate::duration::format_duration;
use crate::error::Error;

const RENEWAL_BUFFER: usize = 4;

/// Why a watcher stopped watching.
#[derive(Debug)]
pub(crate) enum WatchEnd {
    /// The lease can no longer be extended.
    Expired,
    /// A renewal request failed.
    Failed(Error),
}

pub(crate) struct LifetimeWatcher {
    client: BackendClient,
    session: Arc<SessionSecret>,
    increment: Duration,
}

/// Channels and task of a running watcher.
pub(crate) struct WatcherHandle {
    pub(crate) renewed: mpsc::Receiver<Arc<SessionSecret>>,
    pub(crate) done: oneshot::Receiver<WatchEnd>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    /// Cancel the watcher task and wait for it to exit.
    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

impl LifetimeWatcher {
    pub(crate) fn new(client: BackendClient, session: Arc<SessionSecret>, increment: Duration) -> Self {
        Self {
            client,
            session,
            increment,
        }
    }

    /// Spawn the watcher. It runs until it reports on `done` or `cancel` fires.
    pub(crate) fn start(self, cancel: CancellationToken) -> WatcherHandle {
        let (renew_tx, renewed) = mpsc::channel(RENEWAL_BUFFER);
        let (done_tx, done) = oneshot::channel();

        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            if let Some(end) = self.run(renew_tx, &task_cancel).await {
                let _ = done_tx.send(end);
            }
        });

        WatcherHandle {
            renewed,
            done,
            cancel,
            task,
        }
    }

    /// Returns `None` when cancelled or when nobody listens any more.
    async fn run(
        self,
        renewed: mpsc::Sender<Arc<SessionSecret>>,
        cancel: &CancellationToken,
    ) -> Option<WatchEnd> {
        let mut current = self.session;
        let mut prior_lease = Duration::ZERO;
        let mut grace = Duration::ZERO;

        loop {
            if !current.is_renewable() {
                let lease = current.lease_duration();
                let wait = lease.saturating_sub(grace_period(lease, rand::random()));
                debug!(wait = %format_duration(wait), "vault token is not renewable, waiting out its lease");
                return sleep_unless_cancelled(wait, cancel)
                    .await
                    .then_some(WatchEnd::Expired);
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return None,
                result = self.client.renew_self(&current, self.increment) => result,
            };
            let session = match result {
                Ok(session) => Arc::new(session),
                Err(err) => return Some(WatchEnd::Failed(err)),
            };

            let lease = session.lease_duration();
            if renewed.send(Arc::clone(&session)).await.is_err() {
                return None;
            }
            current = session;

            if !current.is_renewable() {
                continue;
            }

            if lease > prior_lease {
                grace = grace_period(lease, rand::random());
            }
            prior_lease = lease;

            let delay = renewal_delay(lease, rand::random());
            if grace >= lease || grace >= delay {
                debug!(
                    lease = %format_duration(lease),
                    grace = %format_duration(grace),
                    "vault token lease is no longer extending"
                );
                return Some(WatchEnd::Expired);
            }

            debug!(
                lease = %format_duration(lease),
                next_renewal = %format_duration(delay),
                "scheduled next vault token renewal"
            );
            if !sleep_unless_cancelled(delay, cancel).await {
                return None;
            }
        }
    }
}

/// Sleep for `duration`. Returns `false` if `cancel` fired first.
pub(super) async fn sleep_unless_cancelled(
    duration: Duration,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Two thirds of the lease, shortened by up to 10 % of jitter.
fn renewal_delay(lease: Duration, jitter: f64) -> Duration {
    lease.mul_f64(2.0 / 3.0 * (1.0 - 0.1 * jitter.clamp(0.0, 1.0)))
}

/// Between 10 % and 20 % of the lease.
fn grace_period(lease: Duration, jitter: f64) -> Duration {
    lease.mul_f64(0.1 + 0.1 * jitter.clamp(0.0, 1.0))
}
