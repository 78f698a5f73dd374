use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PolicyError {
    #[error("staleness window must be positive")]
    InvalidStalenessWindow,

    #[error("validation timeout must be positive")]
    InvalidValidationTimeout,
}

//
// ─── RECEIPTS ──────────────────────────────────────────────────────────────────
//

/// Store the purchase was made on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    AppStore,
    PlayStore,
}

/// A platform-issued proof of purchase, as reported by the purchase SDK.
///
/// `expires_at` is the platform's self-reported expiry; the server-validated
/// expiry in `ValidationRecord` is trusted over it once available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub platform: Platform,
    pub product_id: String,
    pub receipt_data: String,
    pub expires_at: DateTime<Utc>,
    pub original_transaction_id: Option<String>,
}

/// The last authoritative answer from server-side receipt validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub is_valid: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub validated_at: DateTime<Utc>,
}

/// The vault payload: the raw cached receipt plus whatever the server has
/// said about it so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntitlement {
    pub receipt: Receipt,
    pub validation: Option<ValidationRecord>,
}

impl StoredEntitlement {
    #[must_use]
    pub fn unvalidated(receipt: Receipt) -> Self {
        Self {
            receipt,
            validation: None,
        }
    }
}

//
// ─── ENTITLEMENT STATE ─────────────────────────────────────────────────────────
//

/// Which signal granted access, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessSource {
    /// A fresh server-validated receipt.
    Receipt,
    /// A locally cached receipt whose platform expiry is still in the future.
    CachedReceipt,
    None,
}

/// The derived answer to "does this user have paid access right now".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementState {
    pub has_active_access: bool,
    pub source: AccessSource,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_validated_at: Option<DateTime<Utc>>,
}

impl EntitlementState {
    #[must_use]
    pub fn inactive() -> Self {
        Self {
            has_active_access: false,
            source: AccessSource::None,
            expires_at: None,
            last_validated_at: None,
        }
    }
}

impl Default for EntitlementState {
    fn default() -> Self {
        Self::inactive()
    }
}

//
// ─── POLICY ────────────────────────────────────────────────────────────────────
//

/// Product-tunable knobs for entitlement resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitlementPolicy {
    staleness_window: Duration,
    validation_timeout: Duration,
}

impl EntitlementPolicy {
    /// Default policy: a 24h staleness window and a 15s validation timeout.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            staleness_window: Duration::hours(24),
            validation_timeout: Duration::seconds(15),
        }
    }

    /// Creates a custom policy.
    ///
    /// # Errors
    ///
    /// Returns `PolicyError` if either duration is zero or negative.
    pub fn new(
        staleness_window: Duration,
        validation_timeout: Duration,
    ) -> Result<Self, PolicyError> {
        if staleness_window <= Duration::zero() {
            return Err(PolicyError::InvalidStalenessWindow);
        }
        if validation_timeout <= Duration::zero() {
            return Err(PolicyError::InvalidValidationTimeout);
        }
        Ok(Self {
            staleness_window,
            validation_timeout,
        })
    }

    #[must_use]
    pub fn staleness_window(&self) -> Duration {
        self.staleness_window
    }

    #[must_use]
    pub fn validation_timeout(&self) -> Duration {
        self.validation_timeout
    }
}

impl Default for EntitlementPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

//
// ─── RESOLUTION ────────────────────────────────────────────────────────────────
//

/// Resolves the cached entitlement record into an access decision.
///
/// Precedence, first definitive answer wins:
/// 1. A server validation that is fresh (within the staleness window),
///    valid, and unexpired grants access with `AccessSource::Receipt`.
/// 2. A server verdict of invalid or expired is honored even when the
///    cached receipt still claims a future expiry: revalidation only ever
///    makes entitlement stricter. Only a brand-new purchase (which replaces
///    the stored record) can loosen it again.
/// 3. A cached receipt whose platform expiry is in the future grants access
///    with `AccessSource::CachedReceipt`. This covers offline devices and
///    validations that have merely gone stale.
/// 4. Otherwise: inactive.
#[must_use]
pub fn resolve(
    stored: Option<&StoredEntitlement>,
    policy: &EntitlementPolicy,
    now: DateTime<Utc>,
) -> EntitlementState {
    let Some(stored) = stored else {
        return EntitlementState::inactive();
    };

    if let Some(validation) = &stored.validation {
        let fresh = now - validation.validated_at <= policy.staleness_window();
        let server_expiry_future = validation.expires_at.is_some_and(|at| at > now);

        if fresh && validation.is_valid && server_expiry_future {
            return EntitlementState {
                has_active_access: true,
                source: AccessSource::Receipt,
                expires_at: validation.expires_at,
                last_validated_at: Some(validation.validated_at),
            };
        }

        // A definitive negative verdict (explicitly invalid, or a server
        // expiry already behind us) downgrades regardless of what the raw
        // receipt claims.
        if !validation.is_valid || validation.expires_at.is_some_and(|at| at <= now) {
            return EntitlementState {
                has_active_access: false,
                source: AccessSource::None,
                expires_at: validation.expires_at,
                last_validated_at: Some(validation.validated_at),
            };
        }
    }

    if stored.receipt.expires_at > now {
        return EntitlementState {
            has_active_access: true,
            source: AccessSource::CachedReceipt,
            expires_at: Some(stored.receipt.expires_at),
            last_validated_at: stored.validation.as_ref().map(|v| v.validated_at),
        };
    }

    EntitlementState {
        has_active_access: false,
        source: AccessSource::None,
        expires_at: Some(stored.receipt.expires_at),
        last_validated_at: stored.validation.as_ref().map(|v| v.validated_at),
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::fixed_now;

    fn receipt(expires_in: Duration) -> Receipt {
        Receipt {
            platform: Platform::AppStore,
            product_id: "coach.monthly".to_string(),
            receipt_data: "opaque-blob".to_string(),
            expires_at: fixed_now() + expires_in,
            original_transaction_id: Some("txn-1".to_string()),
        }
    }

    fn policy() -> EntitlementPolicy {
        EntitlementPolicy::standard()
    }

    #[test]
    fn no_record_is_inactive() {
        let state = resolve(None, &policy(), fixed_now());
        assert!(!state.has_active_access);
        assert_eq!(state.source, AccessSource::None);
    }

    #[test]
    fn fresh_server_validation_grants_receipt_access() {
        let stored = StoredEntitlement {
            receipt: receipt(Duration::days(20)),
            validation: Some(ValidationRecord {
                is_valid: true,
                expires_at: Some(fixed_now() + Duration::days(25)),
                validated_at: fixed_now() - Duration::hours(2),
            }),
        };
        let state = resolve(Some(&stored), &policy(), fixed_now());
        assert!(state.has_active_access);
        assert_eq!(state.source, AccessSource::Receipt);
        // Server expiry is trusted over the receipt's own claim.
        assert_eq!(state.expires_at, Some(fixed_now() + Duration::days(25)));
    }

    #[test]
    fn cached_receipt_covers_offline_use() {
        let stored = StoredEntitlement::unvalidated(receipt(Duration::days(20)));
        let state = resolve(Some(&stored), &policy(), fixed_now());
        assert!(state.has_active_access);
        assert_eq!(state.source, AccessSource::CachedReceipt);
    }

    #[test]
    fn stale_validation_falls_back_to_cached_receipt() {
        // Validated long ago, but the receipt itself has not expired: the
        // staleness window is a freshness bar for the server answer, not a
        // hard revalidation requirement.
        let stored = StoredEntitlement {
            receipt: receipt(Duration::days(20)),
            validation: Some(ValidationRecord {
                is_valid: true,
                expires_at: Some(fixed_now() + Duration::days(25)),
                validated_at: fixed_now() - Duration::days(3),
            }),
        };
        let state = resolve(Some(&stored), &policy(), fixed_now());
        assert!(state.has_active_access);
        assert_eq!(state.source, AccessSource::CachedReceipt);
        assert_eq!(
            state.last_validated_at,
            Some(fixed_now() - Duration::days(3))
        );
    }

    #[test]
    fn server_invalid_verdict_downgrades_despite_future_receipt_expiry() {
        let stored = StoredEntitlement {
            receipt: receipt(Duration::days(20)),
            validation: Some(ValidationRecord {
                is_valid: false,
                expires_at: None,
                validated_at: fixed_now(),
            }),
        };
        let state = resolve(Some(&stored), &policy(), fixed_now());
        assert!(!state.has_active_access);
        assert_eq!(state.source, AccessSource::None);
    }

    #[test]
    fn server_reported_expiry_in_past_downgrades() {
        let stored = StoredEntitlement {
            receipt: receipt(Duration::days(20)),
            validation: Some(ValidationRecord {
                is_valid: true,
                expires_at: Some(fixed_now() - Duration::hours(1)),
                validated_at: fixed_now() - Duration::hours(1),
            }),
        };
        let state = resolve(Some(&stored), &policy(), fixed_now());
        assert!(!state.has_active_access);
    }

    #[test]
    fn expired_cached_receipt_is_inactive() {
        let stored = StoredEntitlement::unvalidated(receipt(Duration::days(-1)));
        let state = resolve(Some(&stored), &policy(), fixed_now());
        assert!(!state.has_active_access);
        assert_eq!(state.source, AccessSource::None);
        assert_eq!(state.expires_at, Some(fixed_now() - Duration::days(1)));
    }

    #[test]
    fn policy_rejects_non_positive_durations() {
        assert!(matches!(
            EntitlementPolicy::new(Duration::zero(), Duration::seconds(10)),
            Err(PolicyError::InvalidStalenessWindow)
        ));
        assert!(matches!(
            EntitlementPolicy::new(Duration::hours(24), Duration::seconds(-1)),
            Err(PolicyError::InvalidValidationTimeout)
        ));
    }
}
