//! Seam to the cloud backend: table-like resources keyed by user id.
//!
//! The backend itself is an external collaborator. This module defines the
//! narrow contract the core consumes (upsert-by-id, select-by-id, privileged
//! delete-everything) plus an HTTP client and an in-memory double for tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coach_core::model::{ProgressLog, UserId};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::CloudError;

/// The user's remote profile row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteProfile {
    pub user_id: UserId,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

impl RemoteProfile {
    /// A locally synthesized minimal profile, used when the remote fetch
    /// times out or fails so that sign-in never blocks on the backend.
    #[must_use]
    pub fn minimal(user_id: UserId, created_at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            display_name: String::new(),
            created_at,
        }
    }
}

/// Contract with the cloud backend.
#[async_trait]
pub trait CloudBackend: Send + Sync {
    /// Fetch the profile row for a user, `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns `CloudError` when the backend is unreachable or misbehaves.
    async fn fetch_profile(&self, user: UserId) -> Result<Option<RemoteProfile>, CloudError>;

    /// Create or overwrite the profile row.
    ///
    /// # Errors
    ///
    /// Returns `CloudError` when the backend is unreachable or misbehaves.
    async fn upsert_profile(&self, profile: &RemoteProfile) -> Result<(), CloudError>;

    /// Fetch the mirrored progress log for a user, `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns `CloudError` when the backend is unreachable or misbehaves.
    async fn fetch_progress(&self, user: UserId) -> Result<Option<ProgressLog>, CloudError>;

    /// Create or overwrite the mirrored progress log. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `CloudError` when the backend is unreachable or misbehaves.
    async fn upsert_progress(&self, user: UserId, log: &ProgressLog) -> Result<(), CloudError>;

    /// Remove the mirrored progress log.
    ///
    /// # Errors
    ///
    /// Returns `CloudError` when the backend is unreachable or misbehaves.
    async fn delete_progress(&self, user: UserId) -> Result<(), CloudError>;

    /// Privileged server-side deletion of everything stored for a user.
    ///
    /// Authorized by the current session token and executed entirely by the
    /// backend; the client never deletes the auth-identity row directly.
    ///
    /// # Errors
    ///
    /// Returns `CloudError` when the backend refuses or is unreachable.
    async fn delete_account(&self, user: UserId, session_token: &str) -> Result<(), CloudError>;
}

//
// ─── HTTP CLIENT ───────────────────────────────────────────────────────────────
//

/// HTTP implementation of the cloud contract.
pub struct HttpCloudBackend {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpCloudBackend {
    /// Build a client with a hard per-request timeout so no call can hang
    /// past the reconciliation budget.
    ///
    /// # Errors
    ///
    /// Returns `CloudError::Http` if the underlying client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, CloudError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn map_send_error(err: reqwest::Error) -> CloudError {
        if err.is_timeout() {
            CloudError::Timeout
        } else {
            CloudError::Http(err)
        }
    }
}

#[async_trait]
impl CloudBackend for HttpCloudBackend {
    async fn fetch_profile(&self, user: UserId) -> Result<Option<RemoteProfile>, CloudError> {
        let response = self
            .client
            .get(self.url(&format!("/users/{user}/profile")))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(Self::map_send_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(CloudError::Status(response.status()));
        }
        let profile = response
            .json::<RemoteProfile>()
            .await
            .map_err(|e| CloudError::Malformed(e.to_string()))?;
        Ok(Some(profile))
    }

    async fn upsert_profile(&self, profile: &RemoteProfile) -> Result<(), CloudError> {
        let response = self
            .client
            .put(self.url(&format!("/users/{}/profile", profile.user_id)))
            .bearer_auth(&self.api_key)
            .json(profile)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        if !response.status().is_success() {
            return Err(CloudError::Status(response.status()));
        }
        Ok(())
    }

    async fn fetch_progress(&self, user: UserId) -> Result<Option<ProgressLog>, CloudError> {
        let response = self
            .client
            .get(self.url(&format!("/users/{user}/progress")))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(Self::map_send_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(CloudError::Status(response.status()));
        }
        let log = response
            .json::<ProgressLog>()
            .await
            .map_err(|e| CloudError::Malformed(e.to_string()))?;
        Ok(Some(log))
    }

    async fn upsert_progress(&self, user: UserId, log: &ProgressLog) -> Result<(), CloudError> {
        let response = self
            .client
            .put(self.url(&format!("/users/{user}/progress")))
            .bearer_auth(&self.api_key)
            .json(log)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        if !response.status().is_success() {
            return Err(CloudError::Status(response.status()));
        }
        Ok(())
    }

    async fn delete_progress(&self, user: UserId) -> Result<(), CloudError> {
        let response = self
            .client
            .delete(self.url(&format!("/users/{user}/progress")))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            return Err(CloudError::Status(response.status()));
        }
        Ok(())
    }

    async fn delete_account(&self, user: UserId, session_token: &str) -> Result<(), CloudError> {
        let response = self
            .client
            .post(self.url(&format!("/users/{user}/delete")))
            .bearer_auth(session_token)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        if !response.status().is_success() {
            return Err(CloudError::Status(response.status()));
        }
        Ok(())
    }
}

//
// ─── TEST DOUBLE ───────────────────────────────────────────────────────────────
//

#[derive(Default)]
struct CloudState {
    profiles: HashMap<UserId, RemoteProfile>,
    progress: HashMap<UserId, ProgressLog>,
    deleted_accounts: Vec<UserId>,
    offline: bool,
}

/// In-memory cloud backend for tests, with a switchable offline mode.
#[derive(Default)]
pub struct InMemoryCloud {
    state: Mutex<CloudState>,
}

impl InMemoryCloud {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with a timeout.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().expect("cloud state lock").offline = offline;
    }

    /// Seeds a stored progress log, as if another device had pushed it.
    pub fn seed_progress(&self, user: UserId, log: ProgressLog) {
        self.state
            .lock()
            .expect("cloud state lock")
            .progress
            .insert(user, log);
    }

    #[must_use]
    pub fn progress_of(&self, user: UserId) -> Option<ProgressLog> {
        self.state
            .lock()
            .expect("cloud state lock")
            .progress
            .get(&user)
            .cloned()
    }

    #[must_use]
    pub fn account_deleted(&self, user: UserId) -> bool {
        self.state
            .lock()
            .expect("cloud state lock")
            .deleted_accounts
            .contains(&user)
    }

    fn check_online(state: &CloudState) -> Result<(), CloudError> {
        if state.offline {
            Err(CloudError::Timeout)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CloudBackend for InMemoryCloud {
    async fn fetch_profile(&self, user: UserId) -> Result<Option<RemoteProfile>, CloudError> {
        let state = self.state.lock().expect("cloud state lock");
        Self::check_online(&state)?;
        Ok(state.profiles.get(&user).cloned())
    }

    async fn upsert_profile(&self, profile: &RemoteProfile) -> Result<(), CloudError> {
        let mut state = self.state.lock().expect("cloud state lock");
        Self::check_online(&state)?;
        state.profiles.insert(profile.user_id, profile.clone());
        Ok(())
    }

    async fn fetch_progress(&self, user: UserId) -> Result<Option<ProgressLog>, CloudError> {
        let state = self.state.lock().expect("cloud state lock");
        Self::check_online(&state)?;
        Ok(state.progress.get(&user).cloned())
    }

    async fn upsert_progress(&self, user: UserId, log: &ProgressLog) -> Result<(), CloudError> {
        let mut state = self.state.lock().expect("cloud state lock");
        Self::check_online(&state)?;
        state.progress.insert(user, log.clone());
        Ok(())
    }

    async fn delete_progress(&self, user: UserId) -> Result<(), CloudError> {
        let mut state = self.state.lock().expect("cloud state lock");
        Self::check_online(&state)?;
        state.progress.remove(&user);
        Ok(())
    }

    async fn delete_account(&self, user: UserId, _session_token: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock().expect("cloud state lock");
        Self::check_online(&state)?;
        state.profiles.remove(&user);
        state.progress.remove(&user);
        state.deleted_accounts.push(user);
        Ok(())
    }
}
