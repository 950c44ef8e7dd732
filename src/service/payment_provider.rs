// service/payment_provider.rs
use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::http::HeaderMap;
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{models::methodmodel::PaymentMethodType, service::error::ServiceError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// Timeouts, connection failures, 5xx and 429. Safe to retry.
    #[error("gateway unavailable: {0}")]
    Unavailable(String),

    #[error("gateway rejected the request: {0}")]
    Rejected(String),

    #[error("gateway configuration missing: {0}")]
    ConfigurationMissing(String),

    #[error("webhook signature did not verify")]
    InvalidSignature,

    #[error("malformed gateway payload: {0}")]
    MalformedPayload(String),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return GatewayError::MalformedPayload(err.to_string());
        }
        GatewayError::Unavailable(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    CreateCharge,
    GetChargeStatus,
    SupportsWebhookConfirmation,
    RequiresManualConfirmation,
}

#[derive(Debug, Clone)]
pub struct ChargeRequest {
    /// The payment id. Every provider call carries it so a retried request
    /// never creates a second charge.
    pub idempotency_key: Uuid,
    pub amount: BigDecimal,
    pub currency: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeHandle {
    pub charge_id: String,
    pub approval_url: Option<String>,
    /// What the payer must do by hand, for manual providers.
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChargeState {
    Pending,
    Captured { reference: String },
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct ChargeStatus {
    pub state: ChargeState,
}

/// Money leaving the platform: a payout to a professional or a refund to a
/// facility.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// The obligation id.
    pub idempotency_key: Uuid,
    pub amount: BigDecimal,
    pub currency: String,
    /// Decrypted account identifier of the beneficiary.
    pub destination: String,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferReceipt {
    Sent { reference: String },
    ManualActionRequired { instructions: String },
}

/// A verified provider event about one of our charges.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub charge_id: String,
    pub state: ChargeState,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> &'static [Capability];

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Whether the provider deduplicates `create_charge` on the idempotency
    /// key. Charges on providers that don't are never retried blindly.
    fn idempotent_charges(&self) -> bool {
        true
    }

    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeHandle, GatewayError>;

    /// Finds a live charge an earlier, unanswered `create_charge` may have
    /// made for this request.
    async fn find_charge(&self, _request: &ChargeRequest) -> Result<Option<ChargeHandle>, GatewayError> {
        Ok(None)
    }

    async fn get_charge(&self, charge_id: &str) -> Result<ChargeStatus, GatewayError>;

    /// Returns funds for a captured charge to the payer.
    async fn refund_charge(&self, capture_reference: &str, request: &TransferRequest) -> Result<TransferReceipt, GatewayError>;

    async fn send_payout(&self, request: &TransferRequest) -> Result<TransferReceipt, GatewayError>;

    /// `Ok(None)` for authentic events that carry nothing we act on.
    async fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<Option<WebhookEvent>, GatewayError>;
}

/// Reads a provider response, classifying HTTP failures.
pub(crate) async fn read_json(response: reqwest::Response) -> Result<serde_json::Value, GatewayError> {
    let status = response.status();
    let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
    if status.is_success() {
        return Ok(body);
    }
    let message = body["message"]
        .as_str()
        .or_else(|| body["error"]["message"].as_str())
        .or_else(|| body["error_description"].as_str())
        .unwrap_or("no error message")
        .to_string();
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Err(GatewayError::Unavailable(format!("{}: {}", status, message)))
    } else {
        Err(GatewayError::Rejected(format!("{}: {}", status, message)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

/// Runs `op` until it succeeds, fails with anything other than
/// `Unavailable`, or the attempts run out. The delay doubles after each try.
pub async fn retry_with_backoff<T, F, Fut>(policy: RetryPolicy, operation: &str, mut op: F) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut delay = policy.initial_backoff;
    let mut attempt = 1;
    loop {
        match op().await {
            Err(GatewayError::Unavailable(reason)) if attempt < policy.max_attempts => {
                tracing::warn!(operation, attempt, ?delay, %reason, "gateway unavailable, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Adapter selection by payment method type and by provider name.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    by_method: HashMap<PaymentMethodType, Arc<dyn PaymentGateway>>,
    by_name: HashMap<&'static str, Arc<dyn PaymentGateway>>,
}

impl std::fmt::Debug for GatewayRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayRegistry")
            .field("providers", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, gateway: Arc<dyn PaymentGateway>, method_types: &[PaymentMethodType]) {
        for method_type in method_types {
            self.by_method.insert(*method_type, gateway.clone());
        }
        self.by_name.insert(gateway.name(), gateway);
    }

    pub fn for_method(&self, method_type: PaymentMethodType) -> Result<Arc<dyn PaymentGateway>, ServiceError> {
        self.by_method
            .get(&method_type)
            .cloned()
            .ok_or_else(|| ServiceError::UnsupportedPaymentMethod(method_type.to_str().to_string()))
    }

    pub fn by_name(&self, provider: &str) -> Result<Arc<dyn PaymentGateway>, ServiceError> {
        self.by_name
            .get(provider)
            .cloned()
            .ok_or_else(|| ServiceError::InvalidWebhook(format!("unknown provider '{}'", provider)))
    }

    pub fn providers(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.by_name.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = retry_with_backoff(fast(), "create_charge", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(GatewayError::Unavailable("timeout".into()))
            } else {
                Ok("ch_1")
            }
        })
        .await;
        assert_eq!(result, Ok("ch_1"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = retry_with_backoff(fast(), "get_charge", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(GatewayError::Unavailable("503".into()))
        })
        .await;
        assert!(matches!(result, Err(GatewayError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejection_is_never_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = retry_with_backoff(fast(), "create_charge", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(GatewayError::Rejected("card declined".into()))
        })
        .await;
        assert_eq!(result, Err(GatewayError::Rejected("card declined".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_registry_rejects_unknown_method() {
        let registry = GatewayRegistry::new();
        let err = registry.for_method(PaymentMethodType::Cashapp).err().unwrap();
        assert!(matches!(err, ServiceError::UnsupportedPaymentMethod(_)));
        assert!(registry.by_name("paypal").is_err());
    }
}
