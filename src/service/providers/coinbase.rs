// service/providers/coinbase.rs
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::{
    config::CoinbaseConfig,
    service::payment_provider::{
        read_json, Capability, ChargeHandle, ChargeRequest, ChargeState, ChargeStatus, GatewayError, PaymentGateway,
        TransferReceipt, TransferRequest, WebhookEvent,
    },
};

const API_VERSION: &str = "2018-03-22";

const CAPABILITIES: &[Capability] = &[
    Capability::CreateCharge,
    Capability::GetChargeStatus,
    Capability::SupportsWebhookConfirmation,
];

/// Coinbase Commerce hosted charges. Commerce has no payout or refund API,
/// so money leaving the platform is handed to an operator.
pub struct CoinbaseGateway {
    config: CoinbaseConfig,
    client: reqwest::Client,
}

impl CoinbaseGateway {
    pub fn new(config: CoinbaseConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| GatewayError::ConfigurationMissing(format!("coinbase http client: {}", e)))?;
        Ok(Self { config, client })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.config.api_base, path))
            .header("X-CC-Api-Key", &self.config.api_key)
            .header("X-CC-Version", API_VERSION)
    }
}

/// HMAC-SHA256 of the raw body, hex encoded, compared in constant time.
pub(crate) fn verify_signature(body: &[u8], signature: &str, secret: &str) -> bool {
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());

    ConstantTimeEq::ct_eq(signature.trim().as_bytes(), expected.as_bytes()).into()
}

/// The last timeline entry is the charge's current status.
fn charge_state(charge: &serde_json::Value) -> ChargeState {
    let status = charge["timeline"]
        .as_array()
        .and_then(|timeline| timeline.last())
        .and_then(|entry| entry["status"].as_str())
        .unwrap_or("NEW");
    match status {
        "COMPLETED" | "RESOLVED" => ChargeState::Captured {
            reference: charge["code"].as_str().or_else(|| charge["id"].as_str()).unwrap_or_default().to_string(),
        },
        "EXPIRED" | "CANCELED" => ChargeState::Failed {
            reason: format!("charge {}", status.to_lowercase()),
        },
        _ => ChargeState::Pending,
    }
}

fn charge_handle(charge: &serde_json::Value) -> Option<ChargeHandle> {
    Some(ChargeHandle {
        charge_id: charge["code"].as_str()?.to_string(),
        approval_url: charge["hosted_url"].as_str().map(str::to_string),
        instructions: None,
    })
}

/// The newest charge in a listing tagged with our payment id that can
/// still be paid.
fn live_charge_for(listing: &serde_json::Value, payment_id: &str) -> Option<ChargeHandle> {
    listing["data"]
        .as_array()?
        .iter()
        .filter(|charge| charge["metadata"]["payment_id"].as_str() == Some(payment_id))
        .find(|charge| !matches!(charge_state(charge), ChargeState::Failed { .. }))
        .and_then(charge_handle)
}

fn parse_event(payload: &serde_json::Value) -> Option<WebhookEvent> {
    let event = &payload["event"];
    let data = &event["data"];
    let charge_id = data["code"].as_str()?.to_string();
    match event["type"].as_str()? {
        "charge:confirmed" | "charge:resolved" => Some(WebhookEvent {
            charge_id: charge_id.clone(),
            state: ChargeState::Captured { reference: charge_id },
        }),
        "charge:failed" => Some(WebhookEvent {
            charge_id,
            state: ChargeState::Failed {
                reason: "charge failed".to_string(),
            },
        }),
        _ => None,
    }
}

#[async_trait]
impl PaymentGateway for CoinbaseGateway {
    fn name(&self) -> &'static str {
        "coinbase"
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    fn idempotent_charges(&self) -> bool {
        false
    }

    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeHandle, GatewayError> {
        // Commerce takes no idempotency header; the payment id in metadata is
        // what find_charge matches on.
        let payload = json!({
            "name": "Shift payment",
            "description": request.description,
            "pricing_type": "fixed_price",
            "local_price": {
                "amount": request.amount.with_scale(2).to_string(),
                "currency": request.currency,
            },
            "metadata": { "payment_id": request.idempotency_key.to_string() },
        });
        let response = self
            .request(reqwest::Method::POST, "/charges")
            .json(&payload)
            .send()
            .await?;
        let body = read_json(response).await?;

        charge_handle(&body["data"]).ok_or_else(|| GatewayError::MalformedPayload("coinbase charge without code".into()))
    }

    async fn find_charge(&self, request: &ChargeRequest) -> Result<Option<ChargeHandle>, GatewayError> {
        let response = self
            .request(reqwest::Method::GET, "/charges?order=desc&limit=100")
            .send()
            .await?;
        let listing = read_json(response).await?;
        Ok(live_charge_for(&listing, &request.idempotency_key.to_string()))
    }

    async fn get_charge(&self, charge_id: &str) -> Result<ChargeStatus, GatewayError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/charges/{}", charge_id))
            .send()
            .await?;
        let body = read_json(response).await?;
        Ok(ChargeStatus {
            state: charge_state(&body["data"]),
        })
    }

    async fn refund_charge(&self, _capture_reference: &str, request: &TransferRequest) -> Result<TransferReceipt, GatewayError> {
        Ok(TransferReceipt::ManualActionRequired {
            instructions: format!(
                "return {} {} in crypto to the payer's wallet {}",
                request.amount, request.currency, request.destination
            ),
        })
    }

    async fn send_payout(&self, request: &TransferRequest) -> Result<TransferReceipt, GatewayError> {
        Ok(TransferReceipt::ManualActionRequired {
            instructions: format!(
                "send {} {} to wallet {}",
                request.amount, request.currency, request.destination
            ),
        })
    }

    async fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<Option<WebhookEvent>, GatewayError> {
        let signature = headers
            .get("x-cc-webhook-signature")
            .and_then(|v| v.to_str().ok())
            .ok_or(GatewayError::InvalidSignature)?;
        if !verify_signature(body, signature, &self.config.webhook_secret) {
            return Err(GatewayError::InvalidSignature);
        }

        let payload: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| GatewayError::MalformedPayload(e.to_string()))?;
        Ok(parse_event(&payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> CoinbaseGateway {
        CoinbaseGateway::new(CoinbaseConfig {
            api_key: "key".into(),
            webhook_secret: "whsec_test".into(),
            api_base: "http://127.0.0.1:9".into(),
        })
        .unwrap()
    }

    fn sign(body: &[u8], secret: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn test_signature_check() {
        let body = br#"{"event":{"type":"charge:confirmed"}}"#;
        let signature = sign(body, "whsec_test");
        assert!(verify_signature(body, &signature, "whsec_test"));
        assert!(!verify_signature(body, &signature, "other"));
        assert!(!verify_signature(b"{}", &signature, "whsec_test"));
    }

    #[tokio::test]
    async fn test_webhook_maps_confirmed_charge() {
        let body = serde_json::to_vec(&json!({
            "event": { "type": "charge:confirmed", "data": { "code": "66BEOV2A" } }
        }))
        .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-cc-webhook-signature", sign(&body, "whsec_test").parse().unwrap());

        let event = gateway().verify_webhook(&headers, &body).await.unwrap().unwrap();
        assert_eq!(event.charge_id, "66BEOV2A");
        assert_eq!(event.state, ChargeState::Captured { reference: "66BEOV2A".into() });
    }

    #[tokio::test]
    async fn test_webhook_without_signature_rejected() {
        let err = gateway().verify_webhook(&HeaderMap::new(), b"{}").await.unwrap_err();
        assert_eq!(err, GatewayError::InvalidSignature);
    }

    #[test]
    fn test_listing_match_skips_other_and_expired_charges() {
        let payment_id = "0b0d5c59-2a4f-4c5e-9d6e-2f1f0c8c1a11";
        let listing = json!({
            "data": [
                { "code": "OTHER001", "metadata": { "payment_id": "someone-else" }, "timeline": [{ "status": "NEW" }] },
                { "code": "EXPIRED1", "metadata": { "payment_id": payment_id }, "timeline": [{ "status": "EXPIRED" }] },
                {
                    "code": "LIVE0001",
                    "hosted_url": "https://commerce.coinbase.com/charges/LIVE0001",
                    "metadata": { "payment_id": payment_id },
                    "timeline": [{ "status": "NEW" }]
                }
            ]
        });

        let handle = live_charge_for(&listing, payment_id).unwrap();
        assert_eq!(handle.charge_id, "LIVE0001");
        assert_eq!(handle.approval_url.as_deref(), Some("https://commerce.coinbase.com/charges/LIVE0001"));
        assert!(live_charge_for(&listing, "missing").is_none());
        assert!(live_charge_for(&json!({}), payment_id).is_none());
        assert!(!gateway().idempotent_charges());
    }

    #[test]
    fn test_timeline_status() {
        let charge = json!({
            "code": "66BEOV2A",
            "timeline": [{ "status": "NEW" }, { "status": "PENDING" }, { "status": "COMPLETED" }]
        });
        assert_eq!(charge_state(&charge), ChargeState::Captured { reference: "66BEOV2A".into() });
        assert!(matches!(
            charge_state(&json!({ "timeline": [{ "status": "EXPIRED" }] })),
            ChargeState::Failed { .. }
        ));
        assert_eq!(charge_state(&json!({})), ChargeState::Pending);
    }
}
