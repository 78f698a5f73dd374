//! Identity session: who is signed in, and the lifecycle events other
//! components react to.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use coach_core::model::UserId;
use coach_core::Clock;
use serde::{Deserialize, Serialize};
use storage::{keys, LocalStore, Namespace};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::warn;

use crate::cloud::{CloudBackend, RemoteProfile};
use crate::error::{AuthError, SessionError};

/// Email/password credentials handed to the auth provider.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

/// A session issued by the auth provider.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub user_id: UserId,
    pub token: String,
}

/// Contract with the external authentication provider.
#[async_trait]
pub trait AuthGateway: Send + Sync {
    /// Exchange credentials for a session.
    ///
    /// # Errors
    ///
    /// Returns `AuthError` on bad credentials or provider failure.
    async fn sign_in(&self, credentials: &Credentials) -> Result<AuthSession, AuthError>;

    /// Invalidate a session token. Best-effort.
    ///
    /// # Errors
    ///
    /// Returns `AuthError` if the provider rejects the call.
    async fn sign_out(&self, token: &str) -> Result<(), AuthError>;
}

/// The authenticated identity currently driving the app.
#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub user_id: UserId,
    pub token: String,
    pub profile: RemoteProfile,
}

#[derive(Debug, Clone)]
pub enum SessionState {
    Anonymous,
    Authenticating,
    Authenticated(ActiveSession),
    Deleting(ActiveSession),
}

/// Lifecycle events broadcast to subscribers (reconciliation, UI).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn(UserId),
    SignedOut,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuthTokens {
    token: String,
}

/// Owns the sign-in/out/delete lifecycle and the current user identity.
///
/// When no one is signed in, `current_user_id` reports a stable anonymous
/// device identity persisted in the plaintext namespace.
pub struct SessionService {
    clock: Clock,
    store: LocalStore,
    gateway: Arc<dyn AuthGateway>,
    cloud: Arc<dyn CloudBackend>,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    network_timeout: Duration,
}

impl SessionService {
    #[must_use]
    pub fn new(
        clock: Clock,
        store: LocalStore,
        gateway: Arc<dyn AuthGateway>,
        cloud: Arc<dyn CloudBackend>,
        network_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            clock,
            store,
            gateway,
            cloud,
            state: Mutex::new(SessionState::Anonymous),
            events,
            network_timeout,
        }
    }

    /// Subscribe to session lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.lock().expect("session state lock").clone()
    }

    /// The authenticated user id, if any.
    #[must_use]
    pub fn authenticated_user_id(&self) -> Option<UserId> {
        match self.state() {
            SessionState::Authenticated(s) | SessionState::Deleting(s) => Some(s.user_id),
            _ => None,
        }
    }

    /// The identity progress and entitlement are keyed by right now:
    /// the authenticated user, or the stable anonymous device identity.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Storage` if the device id cannot be persisted.
    pub async fn current_user_id(&self) -> Result<UserId, SessionError> {
        if let Some(user) = self.authenticated_user_id() {
            return Ok(user);
        }
        if let Some(device_id) = self
            .store
            .read::<UserId>(Namespace::Plain, keys::DEVICE_ID)
            .await?
        {
            return Ok(device_id);
        }
        let fresh = UserId::random();
        self.store
            .write(Namespace::Plain, keys::DEVICE_ID, &fresh)
            .await?;
        Ok(fresh)
    }

    /// Sign in with email/password.
    ///
    /// The gateway call is raced against the network timeout; the profile
    /// fetch is bounded the same way and falls back to a locally synthesized
    /// minimal profile, so sign-in never hangs on the backend.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Auth` with `InvalidCredentials`, `ServerError`,
    /// or `NetworkTimeout`; the state returns to `Anonymous` on failure.
    pub async fn sign_in(&self, credentials: Credentials) -> Result<UserId, SessionError> {
        self.set_state(SessionState::Authenticating);

        let session = match timeout(self.network_timeout, self.gateway.sign_in(&credentials)).await
        {
            Ok(Ok(session)) => session,
            Ok(Err(err)) => {
                self.set_state(SessionState::Anonymous);
                return Err(err.into());
            }
            Err(_) => {
                self.set_state(SessionState::Anonymous);
                return Err(AuthError::NetworkTimeout.into());
            }
        };

        let profile = self.fetch_profile_bounded(session.user_id).await;

        self.store
            .write(
                Namespace::Vault,
                keys::AUTH_TOKENS,
                &AuthTokens {
                    token: session.token.clone(),
                },
            )
            .await?;

        let user_id = session.user_id;
        self.set_state(SessionState::Authenticated(ActiveSession {
            user_id,
            token: session.token,
            profile,
        }));
        let _ = self.events.send(SessionEvent::SignedIn(user_id));
        Ok(user_id)
    }

    /// Sign out the current identity.
    ///
    /// Locally cached receipts, tokens, and the progress cache are cleared
    /// *before* the state flips to `Anonymous`, so nothing can leak to the
    /// next identity on this device. The remote token invalidation happens
    /// after and is best-effort.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Storage` if local clearing fails; in that case
    /// the session state is left untouched.
    pub async fn sign_out(&self) -> Result<(), SessionError> {
        let token = match self.state() {
            SessionState::Authenticated(s) => Some(s.token),
            _ => None,
        };

        self.clear_local_identity_state().await?;
        self.set_state(SessionState::Anonymous);
        let _ = self.events.send(SessionEvent::SignedOut);

        if let Some(token) = token {
            match timeout(self.network_timeout, self.gateway.sign_out(&token)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(%err, "remote sign-out rejected; token expires server-side");
                }
                Err(err) => {
                    warn!(%err, "remote sign-out timed out; token expires server-side");
                }
            }
        }
        Ok(())
    }

    /// Delete the account of the currently authenticated user.
    ///
    /// The destructive deletion runs server-side, authorized by the session
    /// token. Local state is cleared only after the backend reports success;
    /// on failure the session is restored so the user can retry.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotAuthenticated` without a session,
    /// `SessionError::Cloud`/`Auth` if the backend call fails or times out.
    pub async fn delete_account(&self) -> Result<(), SessionError> {
        let session = match self.state() {
            SessionState::Authenticated(s) => s,
            _ => return Err(SessionError::NotAuthenticated),
        };
        self.set_state(SessionState::Deleting(session.clone()));

        let deleted = timeout(
            self.network_timeout,
            self.cloud.delete_account(session.user_id, &session.token),
        )
        .await;

        match deleted {
            Ok(Ok(())) => {
                self.clear_local_identity_state().await?;
                self.set_state(SessionState::Anonymous);
                let _ = self.events.send(SessionEvent::Deleted);
                Ok(())
            }
            Ok(Err(err)) => {
                self.set_state(SessionState::Authenticated(session));
                Err(err.into())
            }
            Err(_) => {
                self.set_state(SessionState::Authenticated(session));
                Err(AuthError::NetworkTimeout.into())
            }
        }
    }

    async fn fetch_profile_bounded(&self, user_id: UserId) -> RemoteProfile {
        match timeout(self.network_timeout, self.cloud.fetch_profile(user_id)).await {
            Ok(Ok(Some(profile))) => profile,
            Ok(Ok(None)) => {
                let profile = RemoteProfile::minimal(user_id, self.clock.now());
                if let Err(err) = self.cloud.upsert_profile(&profile).await {
                    warn!(%user_id, %err, "profile creation failed; using local profile");
                }
                profile
            }
            Ok(Err(err)) => {
                warn!(%user_id, %err, "profile fetch failed; using minimal profile");
                RemoteProfile::minimal(user_id, self.clock.now())
            }
            Err(_) => {
                warn!(%user_id, "profile fetch timed out; using minimal profile");
                RemoteProfile::minimal(user_id, self.clock.now())
            }
        }
    }

    async fn clear_local_identity_state(&self) -> Result<(), SessionError> {
        self.store.clear_entitlement().await?;
        self.store.delete(Namespace::Plain, keys::PROGRESS).await?;
        self.store.delete(Namespace::Vault, keys::AUTH_TOKENS).await?;
        Ok(())
    }

    fn set_state(&self, next: SessionState) {
        *self.state.lock().expect("session state lock") = next;
    }
}

//
// ─── TEST DOUBLE ───────────────────────────────────────────────────────────────
//

/// In-memory auth provider for tests.
#[derive(Default)]
pub struct InMemoryAuthGateway {
    accounts: Mutex<HashMap<String, (String, UserId)>>,
    reject_sign_out: Mutex<bool>,
}

impl InMemoryAuthGateway {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an account and returns its user id.
    pub fn register(&self, email: &str, password: &str) -> UserId {
        let user_id = UserId::random();
        self.accounts
            .lock()
            .expect("accounts lock")
            .insert(email.to_string(), (password.to_string(), user_id));
        user_id
    }

    /// Makes subsequent remote sign-out calls fail.
    pub fn reject_sign_out(&self, reject: bool) {
        *self.reject_sign_out.lock().expect("reject flag lock") = reject;
    }
}

#[async_trait]
impl AuthGateway for InMemoryAuthGateway {
    async fn sign_in(&self, credentials: &Credentials) -> Result<AuthSession, AuthError> {
        let accounts = self.accounts.lock().expect("accounts lock");
        match accounts.get(&credentials.email) {
            Some((password, user_id)) if *password == credentials.password => Ok(AuthSession {
                user_id: *user_id,
                token: format!("token-{user_id}"),
            }),
            _ => Err(AuthError::InvalidCredentials),
        }
    }

    async fn sign_out(&self, _token: &str) -> Result<(), AuthError> {
        if *self.reject_sign_out.lock().expect("reject flag lock") {
            return Err(AuthError::ServerError("session already revoked".to_string()));
        }
        Ok(())
    }
}
