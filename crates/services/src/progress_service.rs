//! Program progress: the offline-first log, its persistence, and the cloud
//! mirror.
//!
//! Every mutation follows the same shape: apply to the in-memory log, await
//! the durable local write, then mirror to the cloud fire-and-forget. The
//! local write is the source of truth; a failed mirror is logged and healed
//! by the next sync pass.

use std::sync::{Arc, Mutex};

use coach_core::model::{
    ExerciseId, ProgramSelection, ProgressLog, ProgressSnapshot, UserId,
};
use coach_core::Clock;
use storage::LocalStore;
use tracing::warn;

use crate::cloud::CloudBackend;
use crate::error::ProgressServiceError;

pub struct ProgressService {
    clock: Clock,
    store: LocalStore,
    cloud: Arc<dyn CloudBackend>,
    log: Mutex<ProgressLog>,
    cloud_user: Mutex<Option<UserId>>,
}

impl ProgressService {
    /// Builds the service, hydrating the log from local storage. A missing
    /// or corrupt persisted log starts empty.
    ///
    /// # Errors
    ///
    /// Returns `ProgressServiceError::Storage` on backend I/O failure.
    pub async fn load(
        clock: Clock,
        store: LocalStore,
        cloud: Arc<dyn CloudBackend>,
    ) -> Result<Self, ProgressServiceError> {
        let log = store.load_progress().await?;
        Ok(Self {
            clock,
            store,
            cloud,
            log: Mutex::new(log),
            cloud_user: Mutex::new(None),
        })
    }

    /// Sets the identity the cloud mirror writes under. `None` disables
    /// mirroring (anonymous / signed-out).
    pub fn set_cloud_user(&self, user: Option<UserId>) {
        *self.cloud_user.lock().expect("cloud user lock") = user;
    }

    /// A point-in-time copy of the log.
    #[must_use]
    pub fn log(&self) -> ProgressLog {
        self.log.lock().expect("progress log lock").clone()
    }

    /// The derived progress view as of today.
    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.log
            .lock()
            .expect("progress log lock")
            .snapshot(self.clock.today())
    }

    /// Records completion of a program day, stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns `Domain` for an invalid day number, `Storage` if the durable
    /// write fails. Cloud mirror failures are logged, never returned.
    pub async fn complete_day(
        &self,
        day_number: u32,
        routine_name: &str,
    ) -> Result<(), ProgressServiceError> {
        let updated = {
            let mut log = self.log.lock().expect("progress log lock");
            log.complete_day(day_number, routine_name, self.clock.now())?;
            log.clone()
        };
        self.persist_and_mirror(updated).await
    }

    /// Records completion of a bonus exercise.
    ///
    /// # Errors
    ///
    /// Same contract as `complete_day`.
    pub async fn complete_bonus(
        &self,
        day_number: u32,
        exercise_id: ExerciseId,
    ) -> Result<(), ProgressServiceError> {
        let updated = {
            let mut log = self.log.lock().expect("progress log lock");
            log.complete_bonus(day_number, exercise_id, self.clock.now())?;
            log.clone()
        };
        self.persist_and_mirror(updated).await
    }

    /// Replaces the plan selection, keeping completion history.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the durable write fails.
    pub async fn select_plan(
        &self,
        selection: ProgramSelection,
    ) -> Result<(), ProgressServiceError> {
        let updated = {
            let mut log = self.log.lock().expect("progress log lock");
            log.select_plan(selection);
            log.clone()
        };
        self.persist_and_mirror(updated).await
    }

    /// User-initiated full reset: clears the local log and best-effort
    /// deletes the cloud mirror so the wipe does not resurrect on sync.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the local wipe fails; the cloud delete is
    /// fire-and-forget.
    pub async fn reset_progress(&self) -> Result<(), ProgressServiceError> {
        let mirror_user = self.reset_local().await?;
        if let Some(user) = mirror_user {
            let cloud = Arc::clone(&self.cloud);
            tokio::spawn(async move {
                if let Err(err) = cloud.delete_progress(user).await {
                    warn!(%user, %err, "cloud progress delete failed");
                }
            });
        }
        Ok(())
    }

    /// Clears the in-memory and persisted log without touching the cloud.
    /// Used on sign-out, where the cloud copy belongs to the departing user.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the local wipe fails.
    pub async fn reset_local(&self) -> Result<Option<UserId>, ProgressServiceError> {
        {
            let mut log = self.log.lock().expect("progress log lock");
            log.clear();
        }
        self.store.store_progress(&ProgressLog::new()).await?;
        Ok(*self.cloud_user.lock().expect("cloud user lock"))
    }

    /// Pull-merge-push reconciliation with the cloud copy.
    ///
    /// The remote log is merged into the local one (union, later timestamp
    /// wins per record), the merged result is persisted locally, then pushed
    /// back. A failed pull degrades to push-only; a failed push is logged
    /// and retried on the next pass. Local completions are never lost.
    ///
    /// # Errors
    ///
    /// Returns `Storage` only when the local persist fails; network failures
    /// never propagate.
    pub async fn sync(&self, user: UserId) -> Result<(), ProgressServiceError> {
        let remote = match self.cloud.fetch_progress(user).await {
            Ok(remote) => remote,
            Err(err) => {
                warn!(%user, %err, "progress pull failed; pushing local copy only");
                None
            }
        };

        let merged = {
            let mut log = self.log.lock().expect("progress log lock");
            if let Some(remote) = &remote {
                log.merge(remote);
            }
            log.clone()
        };
        self.store.store_progress(&merged).await?;

        if let Err(err) = self.cloud.upsert_progress(user, &merged).await {
            warn!(%user, %err, "progress push failed; will retry on next sync");
        }
        Ok(())
    }

    async fn persist_and_mirror(&self, log: ProgressLog) -> Result<(), ProgressServiceError> {
        self.store.store_progress(&log).await?;
        if let Some(user) = *self.cloud_user.lock().expect("cloud user lock") {
            let cloud = Arc::clone(&self.cloud);
            tokio::spawn(async move {
                if let Err(err) = cloud.upsert_progress(user, &log).await {
                    warn!(%user, %err, "progress mirror failed; will retry on next sync");
                }
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::InMemoryCloud;
    use chrono::Duration;
    use coach_core::model::{PlanId, ProgressError};
    use coach_core::time::{fixed_clock, fixed_now};
    use storage::vault::{ChaChaVaultCipher, KEY_LEN};

    #[tokio::test]
    async fn completion_persists_locally() {
        let store = LocalStore::in_memory(Arc::new(ChaChaVaultCipher::new(&[7u8; KEY_LEN])));
        let cloud = Arc::new(InMemoryCloud::new());
        let service = ProgressService::load(
            fixed_clock(),
            store.clone(),
            Arc::clone(&cloud) as Arc<dyn CloudBackend>,
        )
        .await
        .unwrap();

        service.complete_day(1, "Full Body").await.unwrap();
        service
            .complete_bonus(1, ExerciseId::new("plank-hold").unwrap())
            .await
            .unwrap();

        let persisted = store.load_progress().await.unwrap();
        assert_eq!(persisted.completed_days().len(), 1);
        assert!(persisted.completed_days()[0].bonus_completed);

        // Rehydrating a fresh service sees the same log.
        let rehydrated = ProgressService::load(
            fixed_clock(),
            store,
            Arc::clone(&cloud) as Arc<dyn CloudBackend>,
        )
        .await
        .unwrap();
        assert_eq!(rehydrated.snapshot().completed_days_count, 1);
    }

    #[tokio::test]
    async fn invalid_day_leaves_state_untouched() {
        let store = LocalStore::in_memory(Arc::new(ChaChaVaultCipher::new(&[7u8; KEY_LEN])));
        let service = ProgressService::load(
            fixed_clock(),
            store.clone(),
            Arc::new(InMemoryCloud::new()) as Arc<dyn CloudBackend>,
        )
        .await
        .unwrap();

        let err = service.complete_day(0, "Warmup").await.unwrap_err();
        assert!(matches!(
            err,
            ProgressServiceError::Domain(ProgressError::InvalidDayNumber)
        ));
        assert!(store.load_progress().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mirror_reaches_cloud_when_user_set() {
        let store = LocalStore::in_memory(Arc::new(ChaChaVaultCipher::new(&[7u8; KEY_LEN])));
        let cloud = Arc::new(InMemoryCloud::new());
        let service = ProgressService::load(
            fixed_clock(),
            store,
            Arc::clone(&cloud) as Arc<dyn CloudBackend>,
        )
        .await
        .unwrap();
        let user = UserId::random();
        service.set_cloud_user(Some(user));

        service.complete_day(1, "Full Body").await.unwrap();
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        let mirrored = cloud.progress_of(user).expect("mirrored log");
        assert_eq!(mirrored.completed_days().len(), 1);
    }

    #[tokio::test]
    async fn sync_merges_remote_and_pushes_back() {
        let store = LocalStore::in_memory(Arc::new(ChaChaVaultCipher::new(&[7u8; KEY_LEN])));
        let cloud = Arc::new(InMemoryCloud::new());
        let user = UserId::random();

        let mut remote = ProgressLog::new();
        remote
            .complete_day(5, "Leg Day", fixed_now() + Duration::days(4))
            .unwrap();
        cloud.seed_progress(user, remote);

        let service = ProgressService::load(
            fixed_clock(),
            store.clone(),
            Arc::clone(&cloud) as Arc<dyn CloudBackend>,
        )
        .await
        .unwrap();
        service.complete_day(1, "Full Body").await.unwrap();

        service.sync(user).await.unwrap();

        let merged = service.log();
        let numbers: Vec<u32> = merged.completed_days().iter().map(|d| d.day_number).collect();
        assert_eq!(numbers, vec![1, 5]);
        assert_eq!(store.load_progress().await.unwrap(), merged);
        assert_eq!(cloud.progress_of(user), Some(merged));
    }

    #[tokio::test]
    async fn sync_offline_keeps_local_log() {
        let store = LocalStore::in_memory(Arc::new(ChaChaVaultCipher::new(&[7u8; KEY_LEN])));
        let cloud = Arc::new(InMemoryCloud::new());
        let service = ProgressService::load(
            fixed_clock(),
            store,
            Arc::clone(&cloud) as Arc<dyn CloudBackend>,
        )
        .await
        .unwrap();
        service.complete_day(1, "Full Body").await.unwrap();

        cloud.set_offline(true);
        service.sync(UserId::random()).await.unwrap();
        assert_eq!(service.snapshot().completed_days_count, 1);
    }

    #[tokio::test]
    async fn reset_progress_wipes_local_and_cloud() {
        let store = LocalStore::in_memory(Arc::new(ChaChaVaultCipher::new(&[7u8; KEY_LEN])));
        let cloud = Arc::new(InMemoryCloud::new());
        let service = ProgressService::load(
            fixed_clock(),
            store.clone(),
            Arc::clone(&cloud) as Arc<dyn CloudBackend>,
        )
        .await
        .unwrap();
        let user = UserId::random();
        service.set_cloud_user(Some(user));
        service
            .select_plan(ProgramSelection::subscription(
                PlanId::new("coach-unlimited").unwrap(),
                fixed_now(),
            ))
            .await
            .unwrap();
        service.complete_day(1, "Full Body").await.unwrap();

        service.reset_progress().await.unwrap();
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }

        assert!(service.log().is_empty());
        assert!(store.load_progress().await.unwrap().is_empty());
        assert_eq!(cloud.progress_of(user), None);
    }
}
