#![forbid(unsafe_code)]

pub mod app_services;
pub mod cloud;
pub mod entitlement_service;
pub mod error;
pub mod progress_service;
pub mod receipts;
pub mod reconcile;
pub mod session_service;

pub use coach_core::Clock;

pub use app_services::{AppServices, Backends, Policies};
pub use cloud::{CloudBackend, HttpCloudBackend, InMemoryCloud, RemoteProfile};
pub use entitlement_service::EntitlementService;
pub use error::{
    AppServicesError, AuthError, CloudError, EntitlementServiceError, ProgressServiceError,
    ReceiptValidationFailure, ReconcileError, SessionError,
};
pub use progress_service::ProgressService;
pub use receipts::{
    HttpReceiptValidator, InMemoryValidator, ReceiptValidator, ValidationRequest,
    ValidationResponse,
};
pub use reconcile::{ReconcileCoordinator, ReconcilePolicy};
pub use session_service::{
    AuthGateway, AuthSession, Credentials, InMemoryAuthGateway, SessionEvent, SessionService,
    SessionState,
};
