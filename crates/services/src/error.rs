//! Shared error types for the services crate.

use thiserror::Error;

use storage::kv::StorageError;
use storage::sqlite::SqliteInitError;

/// Sign-in failures surfaced to the UI for user-facing messaging.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("auth server error: {0}")]
    ServerError(String),

    #[error("network timeout")]
    NetworkTimeout,
}

/// Cloud backend failures. Timeouts are a defined value, never a hang.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CloudError {
    #[error("cloud request timed out")]
    Timeout,

    #[error("cloud request failed with status {0}")]
    Status(reqwest::StatusCode),

    #[error("cloud response was malformed: {0}")]
    Malformed(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Receipt validation failures.
///
/// Never surfaced to the user: the resolver logs these and keeps the cached
/// receipt as fallback truth. Cloneable so scripted test doubles can replay
/// them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReceiptValidationFailure {
    #[error("validation request timed out")]
    Timeout,

    #[error("validation endpoint returned status {0}")]
    Status(u16),

    #[error("validation response was malformed: {0}")]
    Malformed(String),

    #[error("validation request failed: {0}")]
    Http(String),
}

/// Errors emitted by `SessionService`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    #[error("no authenticated session")]
    NotAuthenticated,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted by `ProgressService`.
///
/// Cloud mirror failures are deliberately absent: they are logged and
/// retried on the next reconciliation pass, never surfaced.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProgressServiceError {
    #[error(transparent)]
    Domain(#[from] coach_core::model::ProgressError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted by `EntitlementService`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EntitlementServiceError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted by a reconciliation pass.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReconcileError {
    #[error(transparent)]
    Progress(#[from] ProgressServiceError),

    #[error(transparent)]
    Entitlement(#[from] EntitlementServiceError),
}

/// Errors emitted while bootstrapping app services.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AppServicesError {
    #[error(transparent)]
    Sqlite(#[from] SqliteInitError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Progress(#[from] ProgressServiceError),

    #[error(transparent)]
    Entitlement(#[from] EntitlementServiceError),
}
