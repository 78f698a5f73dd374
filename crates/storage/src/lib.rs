#![forbid(unsafe_code)]

pub mod kv;
pub mod local_store;
pub mod sqlite;
pub mod vault;

pub use kv::{InMemoryStore, KeyValueStore, Namespace, StorageError};
pub use local_store::{keys, LocalStore};
pub use vault::{ChaChaVaultCipher, VaultCipher};
