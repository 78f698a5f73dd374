//! Seam to the server-side receipt validation endpoint.
//!
//! Wire format (camelCase JSON): the request carries the raw platform
//! receipt plus product and user ids; the response is the server's verdict.
//! A non-200 status or a malformed body is treated identically to
//! "validation failed" — the resolver falls back to the cached receipt.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coach_core::model::{Platform, Receipt, UserId};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::ReceiptValidationFailure;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRequest {
    pub platform: Platform,
    pub receipt_data: String,
    pub product_id: String,
    pub user_id: UserId,
}

impl ValidationRequest {
    #[must_use]
    pub fn for_receipt(receipt: &Receipt, user_id: UserId) -> Self {
        Self {
            platform: receipt.platform,
            receipt_data: receipt.receipt_data.clone(),
            product_id: receipt.product_id.clone(),
            user_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResponse {
    pub is_valid: bool,
    pub expiration_date: Option<DateTime<Utc>>,
    pub product_id: Option<String>,
    pub original_transaction_id: Option<String>,
}

/// Contract with the validation endpoint.
#[async_trait]
pub trait ReceiptValidator: Send + Sync {
    /// Submit a receipt for authoritative validation.
    ///
    /// # Errors
    ///
    /// Returns `ReceiptValidationFailure` when the endpoint is unreachable,
    /// answers with a non-200 status, or returns a body that does not parse.
    /// Callers treat every failure the same way: keep the cached fallback.
    async fn validate(
        &self,
        request: ValidationRequest,
    ) -> Result<ValidationResponse, ReceiptValidationFailure>;
}

//
// ─── HTTP CLIENT ───────────────────────────────────────────────────────────────
//

/// HTTP implementation posting to the validation endpoint.
pub struct HttpReceiptValidator {
    client: Client,
    endpoint: String,
}

impl HttpReceiptValidator {
    /// # Errors
    ///
    /// Returns `ReceiptValidationFailure::Http` if the client cannot be built.
    pub fn new(
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ReceiptValidationFailure> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReceiptValidationFailure::Http(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl ReceiptValidator for HttpReceiptValidator {
    async fn validate(
        &self,
        request: ValidationRequest,
    ) -> Result<ValidationResponse, ReceiptValidationFailure> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ReceiptValidationFailure::Timeout
                } else {
                    ReceiptValidationFailure::Http(e.to_string())
                }
            })?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(ReceiptValidationFailure::Status(response.status().as_u16()));
        }

        response
            .json::<ValidationResponse>()
            .await
            .map_err(|e| ReceiptValidationFailure::Malformed(e.to_string()))
    }
}

//
// ─── TEST DOUBLE ───────────────────────────────────────────────────────────────
//

/// Scripted validator for tests: answers are dequeued in order, and the
/// last scripted answer repeats once the queue is drained.
#[derive(Default)]
pub struct InMemoryValidator {
    script: Mutex<VecDeque<Result<ValidationResponse, ReceiptValidationFailure>>>,
    last: Mutex<Option<Result<ValidationResponse, ReceiptValidationFailure>>>,
    calls: Mutex<u32>,
}

impl InMemoryValidator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, answer: Result<ValidationResponse, ReceiptValidationFailure>) {
        self.script
            .lock()
            .expect("validator script lock")
            .push_back(answer);
    }

    #[must_use]
    pub fn calls(&self) -> u32 {
        *self.calls.lock().expect("validator call lock")
    }
}

#[async_trait]
impl ReceiptValidator for InMemoryValidator {
    async fn validate(
        &self,
        _request: ValidationRequest,
    ) -> Result<ValidationResponse, ReceiptValidationFailure> {
        *self.calls.lock().expect("validator call lock") += 1;
        let next = self.script.lock().expect("validator script lock").pop_front();
        let mut last = self.last.lock().expect("validator last lock");
        if let Some(answer) = next {
            *last = Some(answer.clone());
            return answer;
        }
        last.clone()
            .unwrap_or(Err(ReceiptValidationFailure::Timeout))
    }
}
