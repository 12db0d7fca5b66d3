//! Background lease expiry sweep.
//!
//! [`LeaseSweeper::run`] ticks on a `tokio` interval until the shutdown
//! channel flips. A tick that fails outright (the lease index could not be
//! listed) is retried after 1 s, 2 s and 4 s; the backoff sleeps also watch
//! the shutdown channel. After five consecutive failed ticks the failure is
//! logged at `error` instead of `warn`. A sealed vault is not a failure:
//! there is simply nothing to sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorKind, LeaseError};
use crate::lease::{LeaseManager, SweepReport};

/// Delays between retries of a failed tick.
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// Consecutive failed ticks before logging escalates to `error`.
const ESCALATE_AFTER: u32 = 5;

/// Periodic, cancellable driver for [`LeaseManager::sweep`].
pub struct LeaseSweeper {
    leases: Arc<LeaseManager>,
    interval: Duration,
}

impl LeaseSweeper {
    #[must_use]
    pub fn new(leases: Arc<LeaseManager>, interval: Duration) -> Self {
        Self { leases, interval }
    }

    /// Run one sweep. A sealed vault yields an empty report.
    ///
    /// # Errors
    ///
    /// Returns the [`LeaseError`] from [`LeaseManager::sweep`] for anything
    /// other than a sealed vault.
    pub async fn tick(&self) -> Result<SweepReport, LeaseError> {
        match self.leases.sweep().await {
            Err(e) if e.kind() == ErrorKind::Sealed => {
                debug!("vault sealed, skipping lease sweep");
                Ok(SweepReport::default())
            }
            other => other,
        }
    }

    /// Sweep every interval until `shutdown` becomes `true` or its sender
    /// is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_failures: u32 = 0;
        info!(interval_secs = self.interval.as_secs(), "lease sweeper started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick_with_retry(&mut shutdown).await {
                        Some(Ok(_)) => consecutive_failures = 0,
                        Some(Err(e)) => {
                            consecutive_failures = consecutive_failures.saturating_add(1);
                            if consecutive_failures >= ESCALATE_AFTER {
                                error!(error = %e, consecutive_failures, "lease sweep keeps failing");
                            } else {
                                warn!(error = %e, consecutive_failures, "lease sweep failed");
                            }
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("lease sweeper stopped");
    }

    /// `None` if shutdown arrived during a backoff sleep.
    async fn tick_with_retry(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Result<SweepReport, LeaseError>> {
        let mut result = self.tick().await;
        for delay in RETRY_DELAYS {
            let Err(e) = &result else {
                break;
            };
            debug!(error = %e, retry_in_ms = delay.as_millis(), "retrying lease sweep");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return None,
            }
            result = self.tick().await;
        }
        Some(result)
    }
}

impl std::fmt::Debug for LeaseSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseSweeper")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
