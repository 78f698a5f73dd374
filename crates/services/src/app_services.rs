use std::sync::Arc;
use std::time::Duration;

use coach_core::model::EntitlementPolicy;
use storage::vault::{ChaChaVaultCipher, KEY_LEN};
use storage::LocalStore;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::cloud::CloudBackend;
use crate::entitlement_service::EntitlementService;
use crate::error::AppServicesError;
use crate::progress_service::ProgressService;
use crate::receipts::ReceiptValidator;
use crate::reconcile::{ReconcileCoordinator, ReconcilePolicy};
use crate::session_service::{AuthGateway, SessionEvent, SessionService};
use crate::Clock;

/// External collaborators the services talk to.
pub struct Backends {
    pub gateway: Arc<dyn AuthGateway>,
    pub cloud: Arc<dyn CloudBackend>,
    pub validator: Arc<dyn ReceiptValidator>,
}

/// Product-tunable policies, injected once at assembly.
#[derive(Debug, Clone, Default)]
pub struct Policies {
    pub entitlement: EntitlementPolicy,
    pub reconcile: ReconcilePolicy,
}

/// Assembles app-facing services over a shared local store, and pumps the
/// session event stream into the reconciliation coordinator so sign-in,
/// sign-out, and account deletion trigger their passes without every caller
/// having to remember to.
#[derive(Clone)]
pub struct AppServices {
    store: LocalStore,
    session: Arc<SessionService>,
    progress: Arc<ProgressService>,
    entitlement: Arc<EntitlementService>,
    reconciler: Arc<ReconcileCoordinator>,
}

impl AppServices {
    /// Build services backed by `SQLite` storage, with the vault sealed
    /// under `vault_key` (sourced from the platform keystore).
    ///
    /// # Errors
    ///
    /// Returns `AppServicesError` if storage initialization fails.
    pub async fn new_sqlite(
        db_url: &str,
        clock: Clock,
        vault_key: &[u8; KEY_LEN],
        backends: Backends,
        policies: Policies,
        network_timeout: Duration,
    ) -> Result<Self, AppServicesError> {
        let cipher = Arc::new(ChaChaVaultCipher::new(vault_key));
        let store = LocalStore::sqlite(db_url, cipher).await?;
        Self::assemble(store, clock, backends, policies, network_timeout).await
    }

    /// Build services over the in-memory backend, for tests and previews.
    ///
    /// # Errors
    ///
    /// Returns `AppServicesError` if hydrating the services fails.
    pub async fn in_memory(
        clock: Clock,
        vault_key: &[u8; KEY_LEN],
        backends: Backends,
        policies: Policies,
        network_timeout: Duration,
    ) -> Result<Self, AppServicesError> {
        let store = LocalStore::in_memory(Arc::new(ChaChaVaultCipher::new(vault_key)));
        Self::assemble(store, clock, backends, policies, network_timeout).await
    }

    async fn assemble(
        store: LocalStore,
        clock: Clock,
        backends: Backends,
        policies: Policies,
        network_timeout: Duration,
    ) -> Result<Self, AppServicesError> {
        let session = Arc::new(SessionService::new(
            clock,
            store.clone(),
            backends.gateway,
            Arc::clone(&backends.cloud),
            network_timeout,
        ));
        let progress = Arc::new(
            ProgressService::load(clock, store.clone(), backends.cloud).await?,
        );
        let entitlement = Arc::new(
            EntitlementService::load(
                clock,
                store.clone(),
                backends.validator,
                policies.entitlement,
            )
            .await?,
        );
        let reconciler = Arc::new(ReconcileCoordinator::new(
            clock,
            policies.reconcile,
            Arc::clone(&progress),
            Arc::clone(&entitlement),
        ));

        spawn_session_event_pump(session.subscribe(), Arc::clone(&reconciler));

        Ok(Self {
            store,
            session,
            progress,
            entitlement,
            reconciler,
        })
    }

    #[must_use]
    pub fn store(&self) -> LocalStore {
        self.store.clone()
    }

    #[must_use]
    pub fn session(&self) -> Arc<SessionService> {
        Arc::clone(&self.session)
    }

    #[must_use]
    pub fn progress(&self) -> Arc<ProgressService> {
        Arc::clone(&self.progress)
    }

    #[must_use]
    pub fn entitlement(&self) -> Arc<EntitlementService> {
        Arc::clone(&self.entitlement)
    }

    #[must_use]
    pub fn reconciler(&self) -> Arc<ReconcileCoordinator> {
        Arc::clone(&self.reconciler)
    }
}

/// Forwards session lifecycle events to the coordinator. The task ends when
/// the session service (the sender) is dropped.
fn spawn_session_event_pump(
    mut events: tokio::sync::broadcast::Receiver<SessionEvent>,
    reconciler: Arc<ReconcileCoordinator>,
) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::SignedIn(user)) => {
                    if let Err(err) = reconciler.on_authenticated(user).await {
                        warn!(%user, %err, "sign-in reconciliation pass failed");
                    }
                }
                Ok(SessionEvent::SignedOut | SessionEvent::Deleted) => {
                    if let Err(err) = reconciler.on_signed_out().await {
                        warn!(%err, "sign-out reconciliation pass failed");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "session event pump lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}
