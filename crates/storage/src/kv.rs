use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("vault error: {0}")]
    Crypto(String),
}

/// Logical namespaces of the local store.
///
/// `Plain` holds fast, non-sensitive entries; `Vault` entries are sealed
/// with authenticated encryption before they reach the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Plain,
    Vault,
}

impl Namespace {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Plain => "plain",
            Namespace::Vault => "vault",
        }
    }
}

/// Raw byte-level key/value contract implemented by storage backends.
///
/// Backends know nothing about schemas or encryption; both live in
/// `LocalStore`, which wraps this trait.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch the raw bytes stored under a key, if any.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend cannot be read.
    async fn get(&self, ns: Namespace, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Persist raw bytes under a key, replacing any previous value.
    ///
    /// The returned future completes only once the write is durable, so
    /// callers can await durability when ordering matters.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend cannot be written.
    async fn put(&self, ns: Namespace, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    /// Remove a key. Removing a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend cannot be written.
    async fn delete(&self, ns: Namespace, key: &str) -> Result<(), StorageError>;

    /// Remove every entry in a namespace.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend cannot be written.
    async fn clear(&self, ns: Namespace) -> Result<(), StorageError>;
}

/// Simple in-memory backend for tests and prototyping.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    entries: Arc<Mutex<HashMap<(Namespace, String), Vec<u8>>>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, ns: Namespace, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let guard = self
            .entries
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(guard.get(&(ns, key.to_string())).cloned())
    }

    async fn put(&self, ns: Namespace, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        guard.insert((ns, key.to_string()), value);
        Ok(())
    }

    async fn delete(&self, ns: Namespace, key: &str) -> Result<(), StorageError> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        guard.remove(&(ns, key.to_string()));
        Ok(())
    }

    async fn clear(&self, ns: Namespace) -> Result<(), StorageError> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        guard.retain(|(entry_ns, _), _| *entry_ns != ns);
        Ok(())
    }
}
