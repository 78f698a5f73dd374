use std::sync::Arc;

use coach_core::model::{ProgressLog, StoredEntitlement};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::kv::{InMemoryStore, KeyValueStore, Namespace, StorageError};
use crate::vault::VaultCipher;

/// Well-known keys of the persisted local state.
pub mod keys {
    /// Plaintext: the serialized `ProgressLog`.
    pub const PROGRESS: &str = "progress";
    /// Plaintext: the stable anonymous device identity.
    pub const DEVICE_ID: &str = "device-id";
    /// Plaintext: reminder/notification preferences.
    pub const NOTIFICATION_PREFS: &str = "notification-prefs";
    /// Vault: the cached subscription receipt and its validation record.
    pub const SUBSCRIPTION_RECEIPT: &str = "subscription-receipt";
    /// Vault: session tokens for the authenticated identity.
    pub const AUTH_TOKENS: &str = "auth-tokens";
}

/// Typed, schema-validated facade over the raw key/value backend.
///
/// Every read validates the stored payload by deserializing it; a payload
/// that fails to decode (or, for vault entries, to decrypt) is logged,
/// deleted, and treated as absent. Corruption self-heals and never crashes
/// the app or propagates to callers.
#[derive(Clone)]
pub struct LocalStore {
    backend: Arc<dyn KeyValueStore>,
    cipher: Arc<dyn VaultCipher>,
}

impl LocalStore {
    #[must_use]
    pub fn new(backend: Arc<dyn KeyValueStore>, cipher: Arc<dyn VaultCipher>) -> Self {
        Self { backend, cipher }
    }

    /// Builds a store over the in-memory backend, for tests and previews.
    #[must_use]
    pub fn in_memory(cipher: Arc<dyn VaultCipher>) -> Self {
        Self::new(Arc::new(InMemoryStore::new()), cipher)
    }

    /// Reads and validates a typed value.
    ///
    /// Returns `Ok(None)` when the key is absent *or* when the stored
    /// payload is corrupt (in which case the entry is deleted and a warning
    /// logged).
    ///
    /// # Errors
    ///
    /// Returns `StorageError` only for backend I/O failures, never for bad
    /// payloads.
    pub async fn read<T: DeserializeOwned>(
        &self,
        ns: Namespace,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        let Some(raw) = self.backend.get(ns, key).await? else {
            return Ok(None);
        };

        let bytes = match ns {
            Namespace::Plain => raw,
            Namespace::Vault => match self.cipher.open(&raw) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(%key, %err, "discarding unreadable vault entry");
                    self.backend.delete(ns, key).await?;
                    return Ok(None);
                }
            },
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                warn!(%key, %err, "discarding corrupt local entry");
                self.backend.delete(ns, key).await?;
                Ok(None)
            }
        }
    }

    /// Reads a typed value, substituting the caller's default when the key
    /// is absent or corrupt.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` only for backend I/O failures.
    pub async fn read_or<T: DeserializeOwned>(
        &self,
        ns: Namespace,
        key: &str,
        default: T,
    ) -> Result<T, StorageError> {
        Ok(self.read(ns, key).await?.unwrap_or(default))
    }

    /// Serializes and persists a typed value.
    ///
    /// Completes only once the write is durable, so callers that need
    /// ordering (clear-before-transition, local-before-network) can await it.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if serialization, sealing, or the backend
    /// write fails.
    pub async fn write<T: Serialize>(
        &self,
        ns: Namespace,
        key: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let payload = match ns {
            Namespace::Plain => bytes,
            Namespace::Vault => self.cipher.seal(&bytes)?,
        };
        self.backend.put(ns, key, payload).await
    }

    /// Removes a key.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend cannot be written.
    pub async fn delete(&self, ns: Namespace, key: &str) -> Result<(), StorageError> {
        self.backend.delete(ns, key).await
    }

    /// Removes every entry in a namespace.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend cannot be written.
    pub async fn clear(&self, ns: Namespace) -> Result<(), StorageError> {
        self.backend.clear(ns).await
    }
}

// ─── Domain accessors ──────────────────────────────────────────────────────────

impl LocalStore {
    /// Loads the persisted progress log, or an empty one when absent/corrupt.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` only for backend I/O failures.
    pub async fn load_progress(&self) -> Result<ProgressLog, StorageError> {
        self.read_or(Namespace::Plain, keys::PROGRESS, ProgressLog::new())
            .await
    }

    /// Persists the progress log to the plaintext namespace.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the write fails.
    pub async fn store_progress(&self, log: &ProgressLog) -> Result<(), StorageError> {
        self.write(Namespace::Plain, keys::PROGRESS, log).await
    }

    /// Loads the cached subscription record from the vault.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` only for backend I/O failures.
    pub async fn load_entitlement(&self) -> Result<Option<StoredEntitlement>, StorageError> {
        self.read(Namespace::Vault, keys::SUBSCRIPTION_RECEIPT).await
    }

    /// Seals the subscription record into the vault.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if sealing or the write fails.
    pub async fn store_entitlement(
        &self,
        stored: &StoredEntitlement,
    ) -> Result<(), StorageError> {
        self.write(Namespace::Vault, keys::SUBSCRIPTION_RECEIPT, stored)
            .await
    }

    /// Drops the cached subscription record.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the delete fails.
    pub async fn clear_entitlement(&self) -> Result<(), StorageError> {
        self.delete(Namespace::Vault, keys::SUBSCRIPTION_RECEIPT).await
    }
}
