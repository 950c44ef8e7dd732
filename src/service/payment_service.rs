// service/payment_service.rs
use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    db::{CaptureOutcome, SettlementStore},
    models::{
        methodmodel::PaymentMethod,
        paymentmodel::{Money, Payment, PaymentChange, PaymentStatus, PaymentStatusUpdate},
        usermodel::{Actor, UserRole},
    },
    service::{
        error::ServiceError,
        notification_service::{NotificationService, SettlementEvent},
        payment_provider::{
            retry_with_backoff, Capability, ChargeRequest, ChargeState, GatewayError, GatewayRegistry, RetryPolicy,
        },
    },
    utils::decimal::BigDecimalHelpers,
};

/// What the payer needs to complete a charge.
#[derive(Debug, Clone, Serialize)]
pub struct ChargeStart {
    pub payment: Payment,
    pub approval_url: Option<String>,
    pub instructions: Option<String>,
}

pub struct PaymentService {
    store: Arc<dyn SettlementStore>,
    gateways: GatewayRegistry,
    notifications: Arc<NotificationService>,
    retry: RetryPolicy,
    fee_percent: u32,
}

impl std::fmt::Debug for PaymentService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentService")
            .field("gateways", &self.gateways)
            .field("fee_percent", &self.fee_percent)
            .finish()
    }
}

impl PaymentService {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        gateways: GatewayRegistry,
        notifications: Arc<NotificationService>,
        retry: RetryPolicy,
        fee_percent: u32,
    ) -> Self {
        Self {
            store,
            gateways,
            notifications,
            retry,
            fee_percent,
        }
    }

    async fn load(&self, payment_id: Uuid) -> Result<Payment, ServiceError> {
        self.store
            .get_payment(payment_id)
            .await?
            .ok_or(ServiceError::PaymentNotFound(payment_id))
    }

    fn published(&self, payment: Payment) -> Payment {
        self.notifications.publish(SettlementEvent::PaymentChanged {
            payment_id: payment.id,
            application_id: payment.application_id,
            payer_id: payment.payer_id,
            status: payment.status,
        });
        payment
    }

    async fn owned_method(&self, method_id: Uuid, owner_id: Uuid) -> Result<PaymentMethod, ServiceError> {
        let method = self
            .store
            .get_method(method_id)
            .await?
            .ok_or(ServiceError::MethodNotFound(method_id))?;
        if method.owner_id != owner_id {
            return Err(ServiceError::NotOwner(owner_id));
        }
        Ok(method)
    }

    pub async fn get_payment(&self, payment_id: Uuid, actor: &Actor) -> Result<Payment, ServiceError> {
        let payment = self.load(payment_id).await?;
        if !actor.is_admin() && !actor.is_user(payment.payer_id) && !actor.is_user(payment.payee_id) {
            return Err(ServiceError::NotOwner(actor.user_id().unwrap_or_default()));
        }
        Ok(payment)
    }

    /// Opens a pending payment for an accepted application. The platform fee
    /// is fixed here and later withheld from the payout.
    pub async fn initiate(
        &self,
        application_id: Uuid,
        actor: &Actor,
        money: &Money,
        method_id: Option<Uuid>,
    ) -> Result<Payment, ServiceError> {
        let payer_id = actor.require_role(UserRole::Facility)?;
        if let Some(method_id) = method_id {
            self.owned_method(method_id, payer_id).await?;
        }
        let fee = money.amount().percent_of(self.fee_percent);

        let payment = self
            .store
            .create_payment(application_id, payer_id, money, fee, method_id, Utc::now())
            .await?;
        tracing::info!(payment_id = %payment.id, %application_id, amount = %payment.amount, "payment initiated");
        Ok(self.published(payment))
    }

    /// Creates the provider charge, or for manual providers records the
    /// intent. Safe to call again: an existing charge is returned as is.
    /// Only providers that deduplicate on the payment id are retried.
    pub async fn start_charge(
        &self,
        payment_id: Uuid,
        actor: &Actor,
        method_id: Option<Uuid>,
    ) -> Result<ChargeStart, ServiceError> {
        let payment = self.load(payment_id).await?;
        if !actor.is_user(payment.payer_id) {
            return Err(ServiceError::NotOwner(actor.user_id().unwrap_or_default()));
        }
        if !payment.status.is_precapture() {
            return Err(ServiceError::InvalidStatusTransition {
                id: payment.id,
                from: payment.status,
                to: "charge".to_string(),
            });
        }

        let method = match method_id.or(payment.payment_method_id) {
            Some(id) => self.owned_method(id, payment.payer_id).await?,
            None => self
                .store
                .default_method(payment.payer_id)
                .await?
                .ok_or_else(|| ServiceError::Validation("choose a payment method first".to_string()))?,
        };
        let gateway = self.gateways.for_method(method.method_type)?;

        let started = payment.status == PaymentStatus::PendingManualVerification || payment.approval_url.is_some();
        if started && payment.gateway_charge_id.is_some() && payment.payment_method_id == Some(method.id) {
            return Ok(ChargeStart {
                approval_url: payment.approval_url.clone(),
                instructions: None,
                payment,
            });
        }

        let request = ChargeRequest {
            idempotency_key: payment.id,
            amount: payment.amount.clone(),
            currency: payment.currency.clone(),
            description: format!("Shift application {}", payment.application_id),
        };
        let attempt = if gateway.idempotent_charges() {
            retry_with_backoff(self.retry, "create_charge", || gateway.create_charge(&request)).await
        } else {
            // a retry could open a second charge; reuse whatever an unanswered call left behind
            match gateway.find_charge(&request).await? {
                Some(existing) => {
                    tracing::info!(
                        %payment_id,
                        provider = gateway.name(),
                        charge_id = %existing.charge_id,
                        "found charge from earlier attempt"
                    );
                    Ok(existing)
                }
                None => gateway.create_charge(&request).await,
            }
        };
        let handle = match attempt {
            Ok(handle) => handle,
            Err(GatewayError::Rejected(reason)) => {
                let failed = self
                    .store
                    .change_payment(payment.id, &PaymentChange::Fail { reason: reason.clone() }, Utc::now())
                    .await?;
                self.published(failed);
                return Err(ServiceError::GatewayRejected(reason));
            }
            Err(err) => return Err(err.into()),
        };

        let change = if gateway.supports(Capability::RequiresManualConfirmation) {
            PaymentChange::RecordManualIntent {
                method_id: method.id,
                charge_id: handle.charge_id.clone(),
            }
        } else {
            PaymentChange::AttachCharge {
                method_id: method.id,
                charge_id: handle.charge_id.clone(),
                approval_url: handle.approval_url.clone(),
            }
        };
        let payment = self.store.change_payment(payment.id, &change, Utc::now()).await?;
        tracing::info!(%payment_id, provider = gateway.name(), charge_id = %handle.charge_id, "charge started");

        Ok(ChargeStart {
            payment: self.published(payment),
            approval_url: handle.approval_url,
            instructions: handle.instructions,
        })
    }

    /// Gateway confirmation path. Idempotent on the external reference.
    pub async fn mark_captured(&self, payment_id: Uuid, external_reference: &str) -> Result<CaptureOutcome, ServiceError> {
        let outcome = self.store.capture_payment(payment_id, external_reference, Utc::now()).await?;
        match &outcome {
            CaptureOutcome::Captured { payment, escrow } => {
                tracing::info!(%payment_id, escrow_id = %escrow.id, held = %escrow.held_amount, "payment captured into escrow");
                self.published(payment.clone());
                self.notifications.publish(SettlementEvent::EscrowChanged {
                    escrow_id: escrow.id,
                    facility_id: escrow.facility_id,
                    professional_id: escrow.professional_id,
                    status: escrow.status,
                });
            }
            CaptureOutcome::AlreadyCaptured { .. } => {
                tracing::info!(%payment_id, %external_reference, "duplicate capture ignored");
            }
            CaptureOutcome::Quarantined { issue, .. } => {
                tracing::error!(%payment_id, issue_id = %issue.id, kind = ?issue.kind, "{}", issue.details);
            }
        }
        Ok(outcome)
    }

    pub async fn mark_failed(&self, payment_id: Uuid, reason: &str) -> Result<Payment, ServiceError> {
        let change = PaymentChange::Fail {
            reason: reason.to_string(),
        };
        let payment = self.store.change_payment(payment_id, &change, Utc::now()).await?;
        tracing::info!(%payment_id, %reason, "payment failed");
        Ok(self.published(payment))
    }

    pub async fn cancel(&self, payment_id: Uuid, actor: &Actor) -> Result<Payment, ServiceError> {
        let payment = self
            .store
            .change_payment(payment_id, &PaymentChange::Cancel { actor: *actor }, Utc::now())
            .await?;
        tracing::info!(%payment_id, by = %actor.label(), "payment cancelled");
        Ok(self.published(payment))
    }

    /// Admin confirmation that a manual transfer arrived.
    pub async fn confirm_manual_payment(
        &self,
        payment_id: Uuid,
        actor: &Actor,
        reference: &str,
    ) -> Result<CaptureOutcome, ServiceError> {
        if !actor.is_admin() {
            return Err(ServiceError::AdminRequired("manual payment confirmation"));
        }
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ServiceError::Validation("a transfer reference is required".to_string()));
        }
        let payment = self.load(payment_id).await?;
        let repeat = payment.external_reference.as_deref() == Some(reference);
        if payment.status != PaymentStatus::PendingManualVerification && !repeat {
            return Err(ServiceError::InvalidStatusTransition {
                id: payment.id,
                from: payment.status,
                to: PaymentStatus::Captured.to_str().to_string(),
            });
        }
        tracing::info!(%payment_id, admin = %actor.label(), %reference, "manual payment confirmed");
        self.mark_captured(payment_id, reference).await
    }

    /// Polling fallback for a missed or delayed webhook.
    pub async fn poll_charge(&self, payment_id: Uuid) -> Result<Payment, ServiceError> {
        let payment = self.load(payment_id).await?;
        let (Some(charge_id), Some(method_id)) = (payment.gateway_charge_id.clone(), payment.payment_method_id) else {
            return Err(ServiceError::Validation(format!("payment {} has no charge to poll", payment_id)));
        };
        if !payment.status.is_precapture() {
            return Ok(payment);
        }
        let method = self
            .store
            .get_method(method_id)
            .await?
            .ok_or(ServiceError::MethodNotFound(method_id))?;
        let gateway = self.gateways.for_method(method.method_type)?;
        if !gateway.supports(Capability::GetChargeStatus) {
            return Err(ServiceError::Validation(format!(
                "{} charges are confirmed by an admin, not polled",
                method.method_type.to_str()
            )));
        }

        let status = retry_with_backoff(self.retry, "get_charge", || gateway.get_charge(&charge_id)).await?;
        match status.state {
            ChargeState::Captured { reference } => Ok(self.mark_captured(payment_id, &reference).await?.into_payment()),
            ChargeState::Failed { reason } => self.mark_failed(payment_id, &reason).await,
            ChargeState::Pending => Ok(payment),
        }
    }

    /// Verifies a provider callback, then applies it. `Ok(None)` for events
    /// that change nothing.
    pub async fn handle_webhook(
        &self,
        provider: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Option<Payment>, ServiceError> {
        let gateway = self.gateways.by_name(provider)?;
        let event = match gateway.verify_webhook(headers, body).await {
            Ok(Some(event)) => event,
            Ok(None) => return Ok(None),
            Err(err) => {
                tracing::warn!(provider, error = %err, "webhook rejected");
                return Err(err.into());
            }
        };

        let Some(payment) = self.store.get_payment_by_charge(&event.charge_id).await? else {
            tracing::warn!(provider, charge_id = %event.charge_id, "webhook for unknown charge");
            return Ok(None);
        };

        match event.state {
            ChargeState::Captured { reference } => {
                Ok(Some(self.mark_captured(payment.id, &reference).await?.into_payment()))
            }
            ChargeState::Failed { reason } => {
                if !payment.status.is_precapture() {
                    tracing::warn!(payment_id = %payment.id, status = payment.status.to_str(), "late failure event ignored");
                    return Ok(None);
                }
                self.mark_failed(payment.id, &reason).await.map(Some)
            }
            ChargeState::Pending if gateway.supports(Capability::GetChargeStatus) => {
                self.poll_charge(payment.id).await.map(Some)
            }
            ChargeState::Pending => Ok(None),
        }
    }

    /// Operator status write restricted to the whitelist.
    pub async fn update_status(
        &self,
        payment_id: Uuid,
        actor: &Actor,
        status: &str,
        note: &str,
    ) -> Result<Payment, ServiceError> {
        if !actor.is_admin() {
            return Err(ServiceError::AdminRequired("payment status update"));
        }
        let payment = self.load(payment_id).await?;
        let update: PaymentStatusUpdate = status.parse().map_err(|_| ServiceError::InvalidStatusTransition {
            id: payment.id,
            from: payment.status,
            to: status.to_string(),
        })?;
        let change = PaymentChange::UpdateStatus {
            update,
            actor: *actor,
            note: note.to_string(),
        };
        let payment = self.store.change_payment(payment_id, &change, Utc::now()).await?;
        tracing::info!(%payment_id, status = payment.status.to_str(), admin = %actor.label(), "payment status updated");
        Ok(self.published(payment))
    }
}
