// service/escrow_service.rs
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    db::SettlementStore,
    models::{
        escrowmodel::{
            DisputeResolution, EscrowCommand, EscrowStatus, EscrowTransaction, IntegrityIssue, IntegrityIssueKind,
            ObligationAttempt, ObligationKind, ObligationStatus, SettlementObligation, SettlementPlan,
        },
        paymentmodel::Payment,
        usermodel::Actor,
    },
    service::{
        error::ServiceError,
        notification_service::{NotificationService, SettlementEvent},
        payment_provider::{retry_with_backoff, GatewayRegistry, RetryPolicy, TransferReceipt, TransferRequest},
    },
    utils::crypto::AccountVault,
};

/// Obligations re-driven per sweep.
const SWEEP_BATCH: i64 = 100;

/// Rows an escrow call wrote, with the obligation as it stands after dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementOutcome {
    pub escrow: EscrowTransaction,
    pub payment: Option<Payment>,
    pub obligation: Option<SettlementObligation>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub orphans_quarantined: usize,
    pub releases_refired: usize,
    pub disputes_carried_over: usize,
    pub obligations_sent: usize,
    pub obligations_pending: usize,
}

/// Owns every escrow transition after funding, and the money that leaves
/// the platform when an escrow closes.
pub struct EscrowService {
    store: Arc<dyn SettlementStore>,
    gateways: GatewayRegistry,
    vault: Arc<AccountVault>,
    notifications: Arc<NotificationService>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for EscrowService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscrowService").field("gateways", &self.gateways).finish()
    }
}

impl EscrowService {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        gateways: GatewayRegistry,
        vault: Arc<AccountVault>,
        notifications: Arc<NotificationService>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            gateways,
            vault,
            notifications,
            retry,
        }
    }

    async fn load(&self, escrow_id: Uuid) -> Result<EscrowTransaction, ServiceError> {
        self.store
            .get_escrow(escrow_id)
            .await?
            .ok_or(ServiceError::EscrowNotFound(escrow_id))
    }

    pub async fn get_escrow(&self, escrow_id: Uuid, actor: &Actor) -> Result<EscrowTransaction, ServiceError> {
        let escrow = self.load(escrow_id).await?;
        if !actor.is_admin() && !escrow.is_party(actor) {
            return Err(ServiceError::NotParty(escrow_id));
        }
        Ok(escrow)
    }

    pub async fn obligations(&self, escrow_id: Uuid, actor: &Actor) -> Result<Vec<SettlementObligation>, ServiceError> {
        self.get_escrow(escrow_id, actor).await?;
        self.store.obligations_for_escrow(escrow_id).await
    }

    async fn command(
        &self,
        escrow_id: Uuid,
        command: EscrowCommand,
        now: DateTime<Utc>,
    ) -> Result<SettlementOutcome, ServiceError> {
        match self.store.apply_escrow_command(escrow_id, &command, now).await? {
            Some(plan) => Ok(self.after_commit(plan).await),
            None => Ok(SettlementOutcome {
                escrow: self.load(escrow_id).await?,
                payment: None,
                obligation: None,
            }),
        }
    }

    /// Publishes a committed plan and dispatches the obligation it recorded.
    /// Dispatch failures stay on the obligation row for the sweep.
    pub async fn after_commit(&self, plan: SettlementPlan) -> SettlementOutcome {
        let escrow = plan.escrow;
        self.notifications.publish(SettlementEvent::EscrowChanged {
            escrow_id: escrow.id,
            facility_id: escrow.facility_id,
            professional_id: escrow.professional_id,
            status: escrow.status,
        });
        if let Some(payment) = &plan.payment {
            self.notifications.publish(SettlementEvent::PaymentChanged {
                payment_id: payment.id,
                application_id: payment.application_id,
                payer_id: payment.payer_id,
                status: payment.status,
            });
        }
        if let Some(issue) = &plan.issue {
            tracing::error!(issue_id = %issue.id, kind = ?issue.kind, entity_id = %issue.entity_id, "{}", issue.details);
        }

        let obligation = match plan.obligation {
            Some(obligation) if obligation.status == ObligationStatus::Pending => {
                match self.dispatch(obligation.clone(), Utc::now()).await {
                    Ok(dispatched) => Some(dispatched),
                    Err(err) => {
                        tracing::error!(obligation_id = %obligation.id, error = %err, "obligation dispatch failed");
                        Some(obligation)
                    }
                }
            }
            other => other,
        };

        SettlementOutcome {
            escrow,
            payment: plan.payment,
            obligation,
        }
    }

    /// Parties, admins and the system may mark it, but only once the
    /// application is `completed`.
    pub async fn mark_release_conditions_met(
        &self,
        escrow_id: Uuid,
        actor: &Actor,
    ) -> Result<SettlementOutcome, ServiceError> {
        let command = EscrowCommand::MarkReleaseConditionsMet { actor: *actor };
        self.command(escrow_id, command, Utc::now()).await
    }

    /// Called once an application reaches `completed`. Moves no money.
    /// `Ok(None)` when the payment has not been captured yet; the sweep
    /// picks such escrows up once they are funded.
    pub async fn shift_completed(&self, application_id: Uuid) -> Result<Option<SettlementOutcome>, ServiceError> {
        let Some(escrow) = self.store.escrow_for_application(application_id).await? else {
            tracing::info!(%application_id, "shift completed before capture; release deferred");
            return Ok(None);
        };
        if escrow.status != EscrowStatus::Funded {
            return Ok(None);
        }
        self.mark_release_conditions_met(escrow.id, &Actor::System).await.map(Some)
    }

    /// Admin status write. `status` is the raw value from the caller.
    pub async fn update_escrow_status(
        &self,
        escrow_id: Uuid,
        status: &str,
        actor: &Actor,
        note: &str,
    ) -> Result<SettlementOutcome, ServiceError> {
        if !actor.is_admin() {
            return Err(ServiceError::AdminRequired("escrow status update"));
        }
        let target: EscrowStatus = status.parse()?;
        let command = EscrowCommand::UpdateStatus {
            target,
            actor: *actor,
            note: note.to_string(),
        };
        self.command(escrow_id, command, Utc::now()).await
    }

    pub async fn file_dispute(&self, escrow_id: Uuid, actor: &Actor, reason: &str) -> Result<SettlementOutcome, ServiceError> {
        if reason.trim().is_empty() {
            return Err(ServiceError::Validation("a dispute needs a reason".to_string()));
        }
        let command = EscrowCommand::FileDispute {
            actor: *actor,
            reason: reason.trim().to_string(),
        };
        self.command(escrow_id, command, Utc::now()).await
    }

    pub async fn resolve_dispute(
        &self,
        escrow_id: Uuid,
        actor: &Actor,
        resolution: DisputeResolution,
        note: &str,
    ) -> Result<SettlementOutcome, ServiceError> {
        let command = EscrowCommand::ResolveDispute {
            actor: *actor,
            resolution,
            note: note.to_string(),
        };
        self.command(escrow_id, command, Utc::now()).await
    }

    pub async fn dispatch_obligation(&self, obligation_id: Uuid) -> Result<SettlementObligation, ServiceError> {
        let obligation = self
            .store
            .get_obligation(obligation_id)
            .await?
            .ok_or(ServiceError::ObligationNotFound(obligation_id))?;
        self.dispatch(obligation, Utc::now()).await
    }

    /// Sends one obligation through its provider. The provider call runs with
    /// no row lock held; its outcome is recorded afterwards.
    async fn dispatch(
        &self,
        mut obligation: SettlementObligation,
        now: DateTime<Utc>,
    ) -> Result<SettlementObligation, ServiceError> {
        if obligation.status == ObligationStatus::AwaitingMethod {
            let Some(method) = self.store.default_method(obligation.beneficiary_id).await? else {
                return Ok(obligation);
            };
            obligation = self
                .store
                .record_obligation_attempt(obligation.id, &ObligationAttempt::MethodAssigned { method_id: method.id }, now)
                .await?;
        }
        if !matches!(obligation.status, ObligationStatus::Pending | ObligationStatus::Failed) {
            return Ok(obligation);
        }

        let attempt = match self.send(&obligation).await {
            Ok(TransferReceipt::Sent { reference }) => {
                tracing::info!(obligation_id = %obligation.id, kind = ?obligation.kind, %reference, "obligation sent");
                ObligationAttempt::Sent { reference }
            }
            Ok(TransferReceipt::ManualActionRequired { instructions }) => {
                tracing::warn!(obligation_id = %obligation.id, %instructions, "obligation needs an operator");
                self.notifications.publish(SettlementEvent::ManualActionRequired {
                    obligation_id: obligation.id,
                    kind: obligation.kind,
                    instructions: instructions.clone(),
                });
                ObligationAttempt::ManualActionRequired { note: instructions }
            }
            Err(err) => {
                tracing::error!(obligation_id = %obligation.id, kind = ?obligation.kind, error = %err, "obligation attempt failed");
                self.notifications.publish(SettlementEvent::ObligationFailed {
                    obligation_id: obligation.id,
                    kind: obligation.kind,
                    beneficiary_id: obligation.beneficiary_id,
                    error: err.to_string(),
                });
                ObligationAttempt::Failed { error: err.to_string() }
            }
        };

        self.store.record_obligation_attempt(obligation.id, &attempt, Utc::now()).await
    }

    async fn send(&self, obligation: &SettlementObligation) -> Result<TransferReceipt, ServiceError> {
        let Some(method_id) = obligation.payment_method_id else {
            return Ok(TransferReceipt::ManualActionRequired {
                instructions: format!("no payment method on file for {}", obligation.beneficiary_id),
            });
        };
        let Some(method) = self.store.get_method(method_id).await? else {
            return Ok(TransferReceipt::ManualActionRequired {
                instructions: format!("payment method {} was removed", method_id),
            });
        };
        let gateway = self.gateways.for_method(method.method_type)?;
        let destination = self.vault.open(method.owner_id, &method.encrypted_account)?;

        let request = TransferRequest {
            idempotency_key: obligation.id,
            amount: obligation.amount.clone(),
            currency: obligation.currency.clone(),
            destination,
            note: format!("escrow {}", obligation.escrow_id),
        };

        let receipt = match obligation.kind {
            ObligationKind::Payout => {
                retry_with_backoff(self.retry, "send_payout", || gateway.send_payout(&request)).await?
            }
            ObligationKind::Refund => {
                let payment = self
                    .store
                    .get_payment(obligation.payment_id)
                    .await?
                    .ok_or(ServiceError::PaymentNotFound(obligation.payment_id))?;
                let capture = payment.external_reference.ok_or_else(|| ServiceError::IntegrityViolation {
                    entity: "payment",
                    id: payment.id,
                    details: "refund owed on a payment that never captured".to_string(),
                })?;
                retry_with_backoff(self.retry, "refund_charge", || gateway.refund_charge(&capture, &request)).await?
            }
        };
        Ok(receipt)
    }

    /// Closes an obligation an operator settled by hand.
    pub async fn confirm_obligation(
        &self,
        obligation_id: Uuid,
        actor: &Actor,
        reference: &str,
    ) -> Result<SettlementObligation, ServiceError> {
        if !actor.is_admin() {
            return Err(ServiceError::AdminRequired("obligation confirmation"));
        }
        if reference.trim().is_empty() {
            return Err(ServiceError::Validation("a transfer reference is required".to_string()));
        }
        let attempt = ObligationAttempt::Sent {
            reference: reference.trim().to_string(),
        };
        let obligation = self.store.record_obligation_attempt(obligation_id, &attempt, Utc::now()).await?;
        tracing::info!(%obligation_id, admin = %actor.label(), "obligation confirmed manually");
        Ok(obligation)
    }

    /// One reconciliation pass: quarantines orphaned escrows, re-fires release
    /// conditions the completion hook missed, and re-drives outstanding
    /// obligations. Individual failures are logged and skipped.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<ReconcileReport, ServiceError> {
        let mut report = ReconcileReport::default();

        for escrow in self.store.orphaned_escrows().await? {
            let issue = IntegrityIssue::new(
                IntegrityIssueKind::OrphanedEscrow,
                escrow.id,
                format!("payment {} does not link back to escrow {}", escrow.payment_id, escrow.id),
                now,
            );
            tracing::error!(escrow_id = %escrow.id, payment_id = %escrow.payment_id, "orphaned escrow quarantined");
            self.store.quarantine(&issue).await?;
            report.orphans_quarantined += 1;
        }

        for escrow in self.store.funded_escrows_for_completed_applications().await? {
            match self.mark_release_conditions_met(escrow.id, &Actor::System).await {
                Ok(_) => report.releases_refired += 1,
                Err(err) => tracing::warn!(escrow_id = %escrow.id, error = %err, "release conditions not re-fired"),
            }
        }

        // a capture that lands after the application was disputed funds an undisputed escrow
        for escrow in self.store.undisputed_escrows_for_disputed_applications().await? {
            let command = EscrowCommand::FileDispute {
                actor: Actor::System,
                reason: "application disputed before funds were captured".to_string(),
            };
            match self.command(escrow.id, command, now).await {
                Ok(_) => report.disputes_carried_over += 1,
                Err(err) => tracing::warn!(escrow_id = %escrow.id, error = %err, "application dispute not carried over"),
            }
        }

        for obligation in self.store.outstanding_obligations(SWEEP_BATCH).await? {
            match self.dispatch(obligation.clone(), now).await {
                Ok(done) if done.status == ObligationStatus::Sent => report.obligations_sent += 1,
                Ok(_) => report.obligations_pending += 1,
                Err(err) => {
                    report.obligations_pending += 1;
                    tracing::warn!(obligation_id = %obligation.id, error = %err, "obligation not re-driven");
                }
            }
        }

        tracing::info!(?report, "settlement reconciliation finished");
        Ok(report)
    }

    pub async fn open_integrity_issues(&self, actor: &Actor) -> Result<Vec<IntegrityIssue>, ServiceError> {
        if !actor.is_admin() {
            return Err(ServiceError::AdminRequired("integrity issues"));
        }
        self.store.open_integrity_issues().await
    }

    pub async fn resolve_integrity_issue(&self, issue_id: Uuid, actor: &Actor) -> Result<IntegrityIssue, ServiceError> {
        if !actor.is_admin() {
            return Err(ServiceError::AdminRequired("integrity issues"));
        }
        let issue = self.store.resolve_integrity_issue(issue_id, Utc::now()).await?;
        tracing::info!(%issue_id, admin = %actor.label(), "integrity issue resolved");
        Ok(issue)
    }
}
