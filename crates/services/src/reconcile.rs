//! Reconciliation: the passes that bring local truth and cloud state back
//! in line at session boundaries and app foregrounding.
//!
//! A pass is two steps, progress sync then entitlement revalidation, both
//! network-tolerant: either step degrading to its cached answer still counts
//! as a completed pass. Foreground passes are rate-limited so rapid app
//! switching cannot hammer the backend.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use coach_core::model::UserId;
use coach_core::Clock;
use thiserror::Error;
use tracing::{debug, info};

use crate::entitlement_service::EntitlementService;
use crate::error::ReconcileError;
use crate::progress_service::ProgressService;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("foreground interval must be positive")]
pub struct InvalidIntervalError;

/// Tunable knobs for reconciliation scheduling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilePolicy {
    foreground_min_interval: Duration,
}

impl ReconcilePolicy {
    /// Default policy: at most one foreground pass every five minutes.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            foreground_min_interval: Duration::minutes(5),
        }
    }

    /// Creates a custom policy.
    ///
    /// # Errors
    ///
    /// Returns `InvalidIntervalError` if the interval is zero or negative.
    pub fn new(foreground_min_interval: Duration) -> Result<Self, InvalidIntervalError> {
        if foreground_min_interval <= Duration::zero() {
            return Err(InvalidIntervalError);
        }
        Ok(Self {
            foreground_min_interval,
        })
    }

    #[must_use]
    pub fn foreground_min_interval(&self) -> Duration {
        self.foreground_min_interval
    }
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Drives reconciliation passes at lifecycle boundaries.
pub struct ReconcileCoordinator {
    clock: Clock,
    policy: ReconcilePolicy,
    progress: Arc<ProgressService>,
    entitlement: Arc<EntitlementService>,
    last_foreground: Mutex<Option<DateTime<Utc>>>,
}

impl ReconcileCoordinator {
    #[must_use]
    pub fn new(
        clock: Clock,
        policy: ReconcilePolicy,
        progress: Arc<ProgressService>,
        entitlement: Arc<EntitlementService>,
    ) -> Self {
        Self {
            clock,
            policy,
            progress,
            entitlement,
            last_foreground: Mutex::new(None),
        }
    }

    /// Runs the sign-in pass: point the cloud mirror at the new identity,
    /// pull-merge-push progress, then revalidate the cached receipt.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError` only for local storage failures; network
    /// failures degrade to cached answers inside each step.
    pub async fn on_authenticated(&self, user: UserId) -> Result<(), ReconcileError> {
        info!(%user, "running sign-in reconciliation pass");
        self.progress.set_cloud_user(Some(user));
        self.run_pass(user).await
    }

    /// Runs the sign-out pass: stop mirroring, wipe the local progress cache,
    /// and drop the cached receipt. The departing user's cloud copy is left
    /// intact for their next device.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError` if the local wipes fail.
    pub async fn on_signed_out(&self) -> Result<(), ReconcileError> {
        info!("running sign-out reconciliation pass");
        self.progress.set_cloud_user(None);
        self.progress.reset_local().await?;
        self.entitlement.clear_cache().await?;
        *self.last_foreground.lock().expect("foreground lock") = None;
        Ok(())
    }

    /// Runs a foreground pass unless one ran within the policy interval.
    ///
    /// Returns whether a pass actually ran.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError` only for local storage failures.
    pub async fn on_foreground(&self, user: UserId) -> Result<bool, ReconcileError> {
        let now = self.clock.now();
        {
            let last = self.last_foreground.lock().expect("foreground lock");
            if let Some(last) = *last {
                if now - last < self.policy.foreground_min_interval() {
                    debug!(%user, "skipping foreground pass, last ran recently");
                    return Ok(false);
                }
            }
        }
        self.run_pass(user).await?;
        Ok(true)
    }

    async fn run_pass(&self, user: UserId) -> Result<(), ReconcileError> {
        self.progress.sync(user).await?;
        self.entitlement.revalidate(user).await?;
        *self.last_foreground.lock().expect("foreground lock") = Some(self.clock.now());
        Ok(())
    }
}
