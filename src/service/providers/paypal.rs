// service/providers/paypal.rs
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde_json::json;
use tokio::sync::Mutex;

use crate::{
    config::PaypalConfig,
    service::payment_provider::{
        read_json, Capability, ChargeHandle, ChargeRequest, ChargeState, ChargeStatus, GatewayError, PaymentGateway,
        TransferReceipt, TransferRequest, WebhookEvent,
    },
};

const CAPABILITIES: &[Capability] = &[
    Capability::CreateCharge,
    Capability::GetChargeStatus,
    Capability::SupportsWebhookConfirmation,
];

/// PayPal Orders v2 for charges, Payouts v1 for payouts. Redirect based: the
/// facility approves the order at `approval_url`, then the order is captured.
pub struct PaypalGateway {
    config: PaypalConfig,
    client: reqwest::Client,
    token: Mutex<Option<(String, Instant)>>,
}

impl PaypalGateway {
    pub fn new(config: PaypalConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| GatewayError::ConfigurationMissing(format!("paypal http client: {}", e)))?;
        Ok(Self {
            config,
            client,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, GatewayError> {
        let mut cached = self.token.lock().await;
        if let Some((token, expires_at)) = cached.as_ref() {
            if Instant::now() < *expires_at {
                return Ok(token.clone());
            }
        }

        let response = self
            .client
            .post(format!("{}/v1/oauth2/token", self.config.api_base))
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;
        let body = read_json(response).await?;

        let token = body["access_token"]
            .as_str()
            .ok_or_else(|| GatewayError::MalformedPayload("paypal token response without access_token".into()))?
            .to_string();
        // refresh a minute early
        let ttl = body["expires_in"].as_u64().unwrap_or(300).saturating_sub(60);
        *cached = Some((token.clone(), Instant::now() + Duration::from_secs(ttl)));
        Ok(token)
    }

    async fn capture_order(&self, order_id: &str) -> Result<serde_json::Value, GatewayError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .post(format!("{}/v2/checkout/orders/{}/capture", self.config.api_base, order_id))
            .bearer_auth(token)
            .header("PayPal-Request-Id", format!("capture-{}", order_id))
            .header("Content-Type", "application/json")
            .send()
            .await?;
        read_json(response).await
    }

    async fn post_json(
        &self,
        path: &str,
        request_id: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .post(format!("{}{}", self.config.api_base, path))
            .bearer_auth(token)
            .header("PayPal-Request-Id", request_id)
            .json(payload)
            .send()
            .await?;
        read_json(response).await
    }
}

/// Interprets an order body. COMPLETED carries the capture id used as our
/// external reference.
fn order_state(order: &serde_json::Value) -> ChargeState {
    match order["status"].as_str() {
        Some("COMPLETED") => {
            let capture = &order["purchase_units"][0]["payments"]["captures"][0];
            match capture["status"].as_str() {
                Some("DECLINED") | Some("FAILED") => ChargeState::Failed {
                    reason: format!("capture {}", capture["status"].as_str().unwrap_or_default().to_lowercase()),
                },
                _ => ChargeState::Captured {
                    reference: capture["id"]
                        .as_str()
                        .or_else(|| order["id"].as_str())
                        .unwrap_or_default()
                        .to_string(),
                },
            }
        }
        Some("VOIDED") => ChargeState::Failed {
            reason: "order voided".to_string(),
        },
        _ => ChargeState::Pending,
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, GatewayError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or(GatewayError::InvalidSignature)
}

#[async_trait]
impl PaymentGateway for PaypalGateway {
    fn name(&self) -> &'static str {
        "paypal"
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeHandle, GatewayError> {
        let payload = json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": request.idempotency_key.to_string(),
                "custom_id": request.idempotency_key.to_string(),
                "description": request.description,
                "amount": {
                    "currency_code": request.currency,
                    "value": request.amount.with_scale(2).to_string(),
                }
            }]
        });
        let order = self
            .post_json("/v2/checkout/orders", &request.idempotency_key.to_string(), &payload)
            .await?;

        let charge_id = order["id"]
            .as_str()
            .ok_or_else(|| GatewayError::MalformedPayload("paypal order without id".into()))?
            .to_string();
        let approval_url = order["links"].as_array().and_then(|links| {
            links
                .iter()
                .find(|l| matches!(l["rel"].as_str(), Some("approve") | Some("payer-action")))
                .and_then(|l| l["href"].as_str())
                .map(str::to_string)
        });

        Ok(ChargeHandle {
            charge_id,
            approval_url,
            instructions: None,
        })
    }

    async fn get_charge(&self, charge_id: &str) -> Result<ChargeStatus, GatewayError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(format!("{}/v2/checkout/orders/{}", self.config.api_base, charge_id))
            .bearer_auth(token)
            .send()
            .await?;
        let order = read_json(response).await?;

        // approved by the payer but not yet captured: capture now
        let order = if order["status"].as_str() == Some("APPROVED") {
            self.capture_order(charge_id).await?
        } else {
            order
        };

        Ok(ChargeStatus {
            state: order_state(&order),
        })
    }

    async fn refund_charge(&self, capture_reference: &str, request: &TransferRequest) -> Result<TransferReceipt, GatewayError> {
        let payload = json!({
            "amount": {
                "currency_code": request.currency,
                "value": request.amount.with_scale(2).to_string(),
            },
            "note_to_payer": request.note,
        });
        let refund = self
            .post_json(
                &format!("/v2/payments/captures/{}/refund", capture_reference),
                &request.idempotency_key.to_string(),
                &payload,
            )
            .await?;
        let reference = refund["id"]
            .as_str()
            .ok_or_else(|| GatewayError::MalformedPayload("paypal refund without id".into()))?;
        Ok(TransferReceipt::Sent {
            reference: reference.to_string(),
        })
    }

    async fn send_payout(&self, request: &TransferRequest) -> Result<TransferReceipt, GatewayError> {
        let key = request.idempotency_key.to_string();
        let payload = json!({
            "sender_batch_header": {
                "sender_batch_id": key,
                "email_subject": "You have a shift payout",
            },
            "items": [{
                "recipient_type": "EMAIL",
                "receiver": request.destination,
                "note": request.note,
                "sender_item_id": key,
                "amount": {
                    "currency": request.currency,
                    "value": request.amount.with_scale(2).to_string(),
                }
            }]
        });
        let batch = self.post_json("/v1/payments/payouts", &key, &payload).await?;
        let reference = batch["batch_header"]["payout_batch_id"]
            .as_str()
            .ok_or_else(|| GatewayError::MalformedPayload("paypal payout without batch id".into()))?;
        Ok(TransferReceipt::Sent {
            reference: reference.to_string(),
        })
    }

    async fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<Option<WebhookEvent>, GatewayError> {
        let event: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| GatewayError::MalformedPayload(e.to_string()))?;

        let verification = json!({
            "auth_algo": header(headers, "paypal-auth-algo")?,
            "cert_url": header(headers, "paypal-cert-url")?,
            "transmission_id": header(headers, "paypal-transmission-id")?,
            "transmission_sig": header(headers, "paypal-transmission-sig")?,
            "transmission_time": header(headers, "paypal-transmission-time")?,
            "webhook_id": self.config.webhook_id,
            "webhook_event": event,
        });
        let transmission_id = header(headers, "paypal-transmission-id")?;
        let result = self
            .post_json("/v1/notifications/verify-webhook-signature", transmission_id, &verification)
            .await?;
        if result["verification_status"].as_str() != Some("SUCCESS") {
            return Err(GatewayError::InvalidSignature);
        }

        Ok(parse_event(&verification["webhook_event"]))
    }
}

fn parse_event(event: &serde_json::Value) -> Option<WebhookEvent> {
    let resource = &event["resource"];
    let order_id = resource["supplementary_data"]["related_ids"]["order_id"].as_str();
    match event["event_type"].as_str()? {
        "PAYMENT.CAPTURE.COMPLETED" => Some(WebhookEvent {
            charge_id: order_id?.to_string(),
            state: ChargeState::Captured {
                reference: resource["id"].as_str()?.to_string(),
            },
        }),
        "PAYMENT.CAPTURE.DENIED" => Some(WebhookEvent {
            charge_id: order_id?.to_string(),
            state: ChargeState::Failed {
                reason: "capture denied".to_string(),
            },
        }),
        // approved orders still need a capture, which polling performs
        "CHECKOUT.ORDER.APPROVED" => Some(WebhookEvent {
            charge_id: resource["id"].as_str()?.to_string(),
            state: ChargeState::Pending,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_state_reads_capture_id() {
        let order = json!({
            "id": "5O190127TN364715T",
            "status": "COMPLETED",
            "purchase_units": [{ "payments": { "captures": [{ "id": "3C679366HH908993F", "status": "COMPLETED" }] } }]
        });
        assert_eq!(
            order_state(&order),
            ChargeState::Captured { reference: "3C679366HH908993F".to_string() }
        );
        assert_eq!(order_state(&json!({ "status": "CREATED" })), ChargeState::Pending);
        assert!(matches!(order_state(&json!({ "status": "VOIDED" })), ChargeState::Failed { .. }));
    }

    #[test]
    fn test_capture_events_map_to_order() {
        let completed = json!({
            "event_type": "PAYMENT.CAPTURE.COMPLETED",
            "resource": {
                "id": "CAP-1",
                "supplementary_data": { "related_ids": { "order_id": "ORDER-1" } }
            }
        });
        let event = parse_event(&completed).unwrap();
        assert_eq!(event.charge_id, "ORDER-1");
        assert_eq!(event.state, ChargeState::Captured { reference: "CAP-1".to_string() });

        assert!(parse_event(&json!({ "event_type": "BILLING.PLAN.CREATED", "resource": {} })).is_none());
    }
}
