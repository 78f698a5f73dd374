//! Entitlement: the cached receipt, its server validation, and the derived
//! access decision.
//!
//! The cached receipt in the vault is the fallback truth; server validation
//! only ever tightens it. A validation that fails or times out is logged and
//! the cached answer stands, so a dead validation endpoint can never lock a
//! paying user out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use coach_core::model::{
    resolve, EntitlementPolicy, EntitlementState, Receipt, StoredEntitlement, UserId,
    ValidationRecord,
};
use coach_core::Clock;
use storage::LocalStore;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::EntitlementServiceError;
use crate::receipts::{ReceiptValidator, ValidationRequest};

/// Cheap to clone: clones share the cached state and loading flag, so a
/// clone handed to a background task updates the same decision.
#[derive(Clone)]
pub struct EntitlementService {
    clock: Clock,
    store: LocalStore,
    validator: Arc<dyn ReceiptValidator>,
    policy: EntitlementPolicy,
    validation_timeout: Duration,
    state: Arc<Mutex<EntitlementState>>,
    loading: Arc<AtomicBool>,
}

impl EntitlementService {
    /// Builds the service, resolving the cached vault record so the access
    /// decision is available synchronously from the first frame.
    ///
    /// # Errors
    ///
    /// Returns `EntitlementServiceError::Storage` on backend I/O failure.
    pub async fn load(
        clock: Clock,
        store: LocalStore,
        validator: Arc<dyn ReceiptValidator>,
        policy: EntitlementPolicy,
    ) -> Result<Self, EntitlementServiceError> {
        let stored = store.load_entitlement().await?;
        let state = resolve(stored.as_ref(), &policy, clock.now());
        let validation_timeout = policy
            .validation_timeout()
            .to_std()
            .unwrap_or(Duration::from_secs(15));
        Ok(Self {
            clock,
            store,
            validator,
            policy,
            validation_timeout,
            state: Arc::new(Mutex::new(state)),
            loading: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The current access decision, resolved against the current time.
    #[must_use]
    pub fn state(&self) -> EntitlementState {
        self.state.lock().expect("entitlement state lock").clone()
    }

    #[must_use]
    pub fn has_active_access(&self) -> bool {
        self.state.lock().expect("entitlement state lock").has_active_access
    }

    /// True while a background validation is in flight.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    /// Handles a purchase reported by the platform SDK.
    ///
    /// The raw receipt is sealed into the vault and access is granted
    /// immediately from the cached copy, so the paywall lifts without a
    /// network round-trip. Server validation then runs in the background
    /// and either confirms (upgrading the source) or revokes.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the receipt cannot be persisted; validation
    /// failures never propagate.
    pub async fn on_purchase_event(
        &self,
        receipt: Receipt,
        user: UserId,
    ) -> Result<(), EntitlementServiceError> {
        let stored = StoredEntitlement::unvalidated(receipt);
        self.store.store_entitlement(&stored).await?;
        self.set_state(resolve(Some(&stored), &self.policy, self.clock.now()));

        let service = self.clone();
        service.loading.store(true, Ordering::SeqCst);
        tokio::spawn(async move {
            if let Err(err) = service.validate_stored(user).await {
                warn!(%user, %err, "post-purchase validation skipped");
            }
            service.loading.store(false, Ordering::SeqCst);
        });
        Ok(())
    }

    /// Revalidates the cached receipt against the server, awaited.
    ///
    /// A definitive server verdict (valid or not) is recorded and the access
    /// decision recomputed; an unreachable or misbehaving endpoint leaves
    /// the cached decision untouched.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on backend I/O failure only.
    pub async fn revalidate(&self, user: UserId) -> Result<(), EntitlementServiceError> {
        self.validate_stored(user).await
    }

    /// Drops the cached receipt and resets the decision to inactive.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the vault delete fails.
    pub async fn clear_cache(&self) -> Result<(), EntitlementServiceError> {
        self.store.clear_entitlement().await?;
        self.set_state(EntitlementState::inactive());
        Ok(())
    }

    async fn validate_stored(&self, user: UserId) -> Result<(), EntitlementServiceError> {
        let Some(mut stored) = self.store.load_entitlement().await? else {
            self.set_state(EntitlementState::inactive());
            return Ok(());
        };

        let request = ValidationRequest::for_receipt(&stored.receipt, user);
        let verdict = match timeout(self.validation_timeout, self.validator.validate(request)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                warn!(%user, %err, "receipt validation failed; keeping cached decision");
                return Ok(());
            }
            Err(_) => {
                warn!(%user, "receipt validation timed out; keeping cached decision");
                return Ok(());
            }
        };

        // The identity may have changed while the validator was in flight:
        // sign-out clears the vault, a new purchase replaces the record. A
        // verdict for a receipt that is no longer cached must be dropped,
        // never written back.
        let Some(current) = self.store.load_entitlement().await? else {
            debug!(%user, "discarding validation verdict; cached receipt was cleared");
            return Ok(());
        };
        if current.receipt != stored.receipt {
            debug!(%user, "discarding validation verdict; cached receipt was replaced");
            return Ok(());
        }

        stored.validation = Some(ValidationRecord {
            is_valid: verdict.is_valid,
            expires_at: verdict.expiration_date,
            validated_at: self.clock.now(),
        });
        self.store.store_entitlement(&stored).await?;
        self.set_state(resolve(Some(&stored), &self.policy, self.clock.now()));
        Ok(())
    }

    fn set_state(&self, next: EntitlementState) {
        *self.state.lock().expect("entitlement state lock") = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use coach_core::model::{AccessSource, Platform};
    use coach_core::time::{fixed_clock, fixed_now};
    use storage::vault::{ChaChaVaultCipher, KEY_LEN};

    use crate::error::ReceiptValidationFailure;
    use crate::receipts::{InMemoryValidator, ValidationResponse};

    fn receipt(expires_in: ChronoDuration) -> Receipt {
        Receipt {
            platform: Platform::AppStore,
            product_id: "coach.monthly".to_string(),
            receipt_data: "opaque-blob".to_string(),
            expires_at: fixed_now() + expires_in,
            original_transaction_id: Some("txn-1".to_string()),
        }
    }

    async fn service(validator: Arc<InMemoryValidator>) -> (Arc<EntitlementService>, LocalStore) {
        let store = LocalStore::in_memory(Arc::new(ChaChaVaultCipher::new(&[9u8; KEY_LEN])));
        let service = EntitlementService::load(
            fixed_clock(),
            store.clone(),
            validator as Arc<dyn ReceiptValidator>,
            EntitlementPolicy::standard(),
        )
        .await
        .unwrap();
        (Arc::new(service), store)
    }

    #[tokio::test]
    async fn load_resolves_cached_receipt() {
        let store = LocalStore::in_memory(Arc::new(ChaChaVaultCipher::new(&[9u8; KEY_LEN])));
        store
            .store_entitlement(&StoredEntitlement::unvalidated(receipt(
                ChronoDuration::days(10),
            )))
            .await
            .unwrap();

        let service = EntitlementService::load(
            fixed_clock(),
            store,
            Arc::new(InMemoryValidator::new()) as Arc<dyn ReceiptValidator>,
            EntitlementPolicy::standard(),
        )
        .await
        .unwrap();

        assert!(service.has_active_access());
        assert_eq!(service.state().source, AccessSource::CachedReceipt);
    }

    #[tokio::test]
    async fn purchase_grants_immediately_then_upgrades() {
        let validator = Arc::new(InMemoryValidator::new());
        validator.enqueue(Ok(ValidationResponse {
            is_valid: true,
            expiration_date: Some(fixed_now() + ChronoDuration::days(30)),
            product_id: Some("coach.monthly".to_string()),
            original_transaction_id: Some("txn-1".to_string()),
        }));
        let (service, _) = service(Arc::clone(&validator)).await;

        service
            .on_purchase_event(receipt(ChronoDuration::days(30)), UserId::random())
            .await
            .unwrap();
        // Cached grant is immediate, before validation settles.
        assert!(service.has_active_access());

        while service.is_loading() {
            tokio::task::yield_now().await;
        }
        let state = service.state();
        assert_eq!(state.source, AccessSource::Receipt);
        assert_eq!(state.expires_at, Some(fixed_now() + ChronoDuration::days(30)));
        assert_eq!(validator.calls(), 1);
    }

    #[tokio::test]
    async fn failed_validation_keeps_cached_grant() {
        let validator = Arc::new(InMemoryValidator::new());
        validator.enqueue(Err(ReceiptValidationFailure::Status(503)));
        let (service, store) = service(Arc::clone(&validator)).await;

        service
            .on_purchase_event(receipt(ChronoDuration::days(30)), UserId::random())
            .await
            .unwrap();
        while service.is_loading() {
            tokio::task::yield_now().await;
        }

        assert!(service.has_active_access());
        assert_eq!(service.state().source, AccessSource::CachedReceipt);
        // No verdict was recorded.
        let stored = store.load_entitlement().await.unwrap().unwrap();
        assert!(stored.validation.is_none());
    }

    #[tokio::test]
    async fn revalidate_downgrades_on_invalid_verdict() {
        let validator = Arc::new(InMemoryValidator::new());
        validator.enqueue(Err(ReceiptValidationFailure::Timeout));
        let (service, store) = service(Arc::clone(&validator)).await;
        store
            .store_entitlement(&StoredEntitlement::unvalidated(receipt(
                ChronoDuration::days(10),
            )))
            .await
            .unwrap();

        let user = UserId::random();
        // Unreachable endpoint: the cached receipt keeps access.
        service.revalidate(user).await.unwrap();
        let reloaded = EntitlementService::load(
            fixed_clock(),
            store.clone(),
            Arc::clone(&validator) as Arc<dyn ReceiptValidator>,
            EntitlementPolicy::standard(),
        )
        .await
        .unwrap();
        assert!(reloaded.has_active_access());

        // A definitive refund verdict revokes access despite the receipt's
        // future expiry, and the verdict is persisted.
        validator.enqueue(Ok(ValidationResponse {
            is_valid: false,
            expiration_date: None,
            product_id: None,
            original_transaction_id: None,
        }));
        reloaded.revalidate(user).await.unwrap();
        assert!(!reloaded.has_active_access());

        let stored = store.load_entitlement().await.unwrap().unwrap();
        assert_eq!(stored.validation.as_ref().map(|v| v.is_valid), Some(false));
    }

    #[tokio::test]
    async fn clear_cache_resets_to_inactive() {
        let validator = Arc::new(InMemoryValidator::new());
        let (service, store) = service(validator).await;
        service
            .on_purchase_event(receipt(ChronoDuration::days(30)), UserId::random())
            .await
            .unwrap();
        while service.is_loading() {
            tokio::task::yield_now().await;
        }

        service.clear_cache().await.unwrap();
        assert!(!service.has_active_access());
        assert_eq!(store.load_entitlement().await.unwrap(), None);
    }

    /// Validator that parks every call until released, so tests can hold a
    /// validation in flight across other operations.
    #[derive(Default)]
    struct GatedValidator {
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl ReceiptValidator for GatedValidator {
        async fn validate(
            &self,
            _request: ValidationRequest,
        ) -> Result<crate::receipts::ValidationResponse, ReceiptValidationFailure> {
            self.release.notified().await;
            Ok(ValidationResponse {
                is_valid: true,
                expiration_date: Some(fixed_now() + ChronoDuration::days(30)),
                product_id: Some("coach.monthly".to_string()),
                original_transaction_id: Some("txn-1".to_string()),
            })
        }
    }

    #[tokio::test]
    async fn validation_finishing_after_sign_out_is_discarded() {
        let validator = Arc::new(GatedValidator::default());
        let store = LocalStore::in_memory(Arc::new(ChaChaVaultCipher::new(&[9u8; KEY_LEN])));
        let service = EntitlementService::load(
            fixed_clock(),
            store.clone(),
            Arc::clone(&validator) as Arc<dyn ReceiptValidator>,
            EntitlementPolicy::standard(),
        )
        .await
        .unwrap();

        service
            .on_purchase_event(receipt(ChronoDuration::days(30)), UserId::random())
            .await
            .unwrap();
        // Let the background task reach the validator and park there.
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }

        // Sign-out empties the vault while the validation is still in flight.
        service.clear_cache().await.unwrap();
        assert!(!service.has_active_access());

        validator.release.notify_one();
        while service.is_loading() {
            tokio::task::yield_now().await;
        }

        // The late verdict must not resurrect the departed user's receipt.
        assert!(!service.has_active_access());
        assert_eq!(store.load_entitlement().await.unwrap(), None);
    }

    #[tokio::test]
    async fn validation_for_a_replaced_receipt_is_discarded() {
        let validator = Arc::new(GatedValidator::default());
        let store = LocalStore::in_memory(Arc::new(ChaChaVaultCipher::new(&[9u8; KEY_LEN])));
        let service = EntitlementService::load(
            fixed_clock(),
            store.clone(),
            Arc::clone(&validator) as Arc<dyn ReceiptValidator>,
            EntitlementPolicy::standard(),
        )
        .await
        .unwrap();
        let user = UserId::random();

        service
            .on_purchase_event(receipt(ChronoDuration::days(30)), user)
            .await
            .unwrap();
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }

        // A different receipt lands before the first validation settles.
        let replacement = Receipt {
            product_id: "coach.yearly".to_string(),
            ..receipt(ChronoDuration::days(365))
        };
        store
            .store_entitlement(&StoredEntitlement::unvalidated(replacement.clone()))
            .await
            .unwrap();

        validator.release.notify_one();
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }

        // The replacement stays unvalidated; the stale verdict was dropped.
        let stored = store.load_entitlement().await.unwrap().unwrap();
        assert_eq!(stored.receipt, replacement);
        assert!(stored.validation.is_none());
    }

    #[tokio::test]
    async fn revalidate_with_no_cached_receipt_is_inactive() {
        let validator = Arc::new(InMemoryValidator::new());
        let (service, _) = service(Arc::clone(&validator)).await;

        service.revalidate(UserId::random()).await.unwrap();
        assert!(!service.has_active_access());
        // No receipt, no network call.
        assert_eq!(validator.calls(), 0);
    }
}
