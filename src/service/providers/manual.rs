// service/providers/manual.rs
use async_trait::async_trait;
use axum::http::HeaderMap;

use crate::service::payment_provider::{
    Capability, ChargeHandle, ChargeRequest, ChargeStatus, GatewayError, PaymentGateway, TransferReceipt,
    TransferRequest, WebhookEvent,
};

const CAPABILITIES: &[Capability] = &[Capability::RequiresManualConfirmation];

/// Zelle, Cash App and bank transfers. Nothing is charged programmatically:
/// the payer sends money outside the platform and an admin confirms it.
pub struct ManualGateway {
    /// Where payers send funds.
    recipient: String,
}

impl ManualGateway {
    pub fn new(recipient: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
        }
    }
}

#[async_trait]
impl PaymentGateway for ManualGateway {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    /// Issues the reference the payer quotes with their transfer. The same
    /// payment always gets the same reference.
    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeHandle, GatewayError> {
        let reference = format!("manual-{}", request.idempotency_key.simple());
        let instructions = format!(
            "send {} {} to {} quoting {}",
            request.amount.with_scale(2),
            request.currency,
            self.recipient,
            reference
        );
        Ok(ChargeHandle {
            charge_id: reference,
            approval_url: None,
            instructions: Some(instructions),
        })
    }

    async fn get_charge(&self, _charge_id: &str) -> Result<ChargeStatus, GatewayError> {
        Err(GatewayError::Unsupported("charge status of a manual transfer"))
    }

    async fn refund_charge(&self, _capture_reference: &str, request: &TransferRequest) -> Result<TransferReceipt, GatewayError> {
        Ok(TransferReceipt::ManualActionRequired {
            instructions: format!("refund {} {} to {}", request.amount, request.currency, request.destination),
        })
    }

    async fn send_payout(&self, request: &TransferRequest) -> Result<TransferReceipt, GatewayError> {
        Ok(TransferReceipt::ManualActionRequired {
            instructions: format!("pay {} {} to {}", request.amount, request.currency, request.destination),
        })
    }

    async fn verify_webhook(&self, _headers: &HeaderMap, _body: &[u8]) -> Result<Option<WebhookEvent>, GatewayError> {
        Err(GatewayError::Unsupported("webhooks for manual transfers"))
    }
}
