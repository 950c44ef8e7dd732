use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    models::{
        audit_line,
        paymentmodel::{Payment, PaymentStatus, PaymentStatusUpdate},
        shiftmodel::ApplicationStatus,
        usermodel::Actor,
    },
    service::error::ServiceError,
};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "escrow_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Funded,
    PendingRelease,
    Released,
    Disputed,
    Refunded,
    Cancelled,
}

impl FromStr for EscrowStatus {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "funded" => Ok(EscrowStatus::Funded),
            "pending_release" => Ok(EscrowStatus::PendingRelease),
            "released" => Ok(EscrowStatus::Released),
            "disputed" => Ok(EscrowStatus::Disputed),
            "refunded" => Ok(EscrowStatus::Refunded),
            "cancelled" => Ok(EscrowStatus::Cancelled),
            other => Err(ServiceError::InvalidEscrowStatus(other.to_string())),
        }
    }
}

impl EscrowStatus {
    pub fn to_str(&self) -> &str {
        match self {
            EscrowStatus::Funded => "funded",
            EscrowStatus::PendingRelease => "pending_release",
            EscrowStatus::Released => "released",
            EscrowStatus::Disputed => "disputed",
            EscrowStatus::Refunded => "refunded",
            EscrowStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EscrowStatus::Released | EscrowStatus::Refunded | EscrowStatus::Cancelled)
    }

    /// Money is held and nobody has contested it yet.
    pub fn holds_undisputed_funds(&self) -> bool {
        matches!(self, EscrowStatus::Funded | EscrowStatus::PendingRelease)
    }

    pub fn can_transition_to(&self, next: EscrowStatus) -> bool {
        use EscrowStatus::*;
        matches!(
            (self, next),
            (Funded, PendingRelease)
                | (Funded, Disputed)
                | (Funded, Refunded)
                | (Funded, Cancelled)
                | (PendingRelease, Released)
                | (PendingRelease, Disputed)
                | (PendingRelease, Refunded)
                | (PendingRelease, Cancelled)
                | (Disputed, Released)
                | (Disputed, Refunded)
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DisputeResolution {
    ReleaseToProfessional,
    RefundToFacility,
}

impl DisputeResolution {
    pub fn target(&self) -> EscrowStatus {
        match self {
            DisputeResolution::ReleaseToProfessional => EscrowStatus::Released,
            DisputeResolution::RefundToFacility => EscrowStatus::Refunded,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq)]
pub struct EscrowTransaction {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub shift_id: Uuid,
    pub facility_id: Uuid,
    pub professional_id: Uuid,
    pub held_amount: BigDecimal,
    pub currency: String,
    pub status: EscrowStatus,
    pub funded_at: DateTime<Utc>,
    pub release_conditions_met_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub dispute_opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Append-only audit log, one line per transition.
    pub notes: String,
}

#[derive(Debug, Clone)]
pub enum EscrowCommand {
    MarkReleaseConditionsMet { actor: Actor },
    FileDispute { actor: Actor, reason: String },
    UpdateStatus { target: EscrowStatus, actor: Actor, note: String },
    ResolveDispute { actor: Actor, resolution: DisputeResolution, note: String },
    /// Funds go back to the facility because the shift will not be worked.
    AutomatedRefund { note: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "obligation_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ObligationKind {
    Payout,
    Refund,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "obligation_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ObligationStatus {
    Pending,
    Sent,
    Failed,
    AwaitingMethod,
    ManualActionRequired,
}

impl ObligationStatus {
    /// Picked up by the reconciliation sweep.
    pub fn is_outstanding(&self) -> bool {
        matches!(
            self,
            ObligationStatus::Pending | ObligationStatus::Failed | ObligationStatus::AwaitingMethod
        )
    }
}

/// Money the platform still owes someone after an escrow closed.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq)]
pub struct SettlementObligation {
    pub id: Uuid,
    pub escrow_id: Uuid,
    pub payment_id: Uuid,
    pub kind: ObligationKind,
    pub beneficiary_id: Uuid,
    pub payment_method_id: Option<Uuid>,
    pub amount: BigDecimal,
    pub currency: String,
    pub status: ObligationStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub external_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum ObligationAttempt {
    Sent { reference: String },
    Failed { error: String },
    ManualActionRequired { note: String },
    MethodAssigned { method_id: Uuid },
}

impl SettlementObligation {
    pub fn record_attempt(&self, attempt: &ObligationAttempt, now: DateTime<Utc>) -> Result<SettlementObligation, ServiceError> {
        if self.status == ObligationStatus::Sent {
            return Err(ServiceError::terminal("obligation", self.id, self.status));
        }
        let mut next = SettlementObligation {
            updated_at: now,
            ..self.clone()
        };
        match attempt {
            ObligationAttempt::Sent { reference } => {
                next.status = ObligationStatus::Sent;
                next.attempts += 1;
                next.external_reference = Some(reference.clone());
                next.last_error = None;
            }
            ObligationAttempt::Failed { error } => {
                next.status = ObligationStatus::Failed;
                next.attempts += 1;
                next.last_error = Some(error.clone());
            }
            ObligationAttempt::ManualActionRequired { note } => {
                next.status = ObligationStatus::ManualActionRequired;
                next.attempts += 1;
                next.last_error = Some(note.clone());
            }
            ObligationAttempt::MethodAssigned { method_id } => {
                if self.status != ObligationStatus::AwaitingMethod {
                    return Err(ServiceError::Validation(format!("obligation {} already has a method", self.id)));
                }
                next.status = ObligationStatus::Pending;
                next.payment_method_id = Some(*method_id);
            }
        }
        Ok(next)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "integrity_issue_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IntegrityIssueKind {
    OrphanedEscrow,
    MissingDefaultMethod,
    LateCapture,
    CaptureReferenceMismatch,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq)]
pub struct IntegrityIssue {
    pub id: Uuid,
    pub kind: IntegrityIssueKind,
    pub entity_id: Uuid,
    pub details: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl IntegrityIssue {
    pub fn new(kind: IntegrityIssueKind, entity_id: Uuid, details: impl Into<String>, now: DateTime<Utc>) -> Self {
        IntegrityIssue {
            id: Uuid::new_v4(),
            kind,
            entity_id,
            details: details.into(),
            created_at: now,
            resolved_at: None,
        }
    }
}

/// Every row an escrow transition writes, computed up front so the store can
/// persist it in one database transaction.
#[derive(Debug, Clone)]
pub struct SettlementPlan {
    pub escrow: EscrowTransaction,
    pub payment: Option<Payment>,
    pub obligation: Option<SettlementObligation>,
    pub issue: Option<IntegrityIssue>,
}

/// Money side of withdrawing an accepted application.
#[derive(Debug, Clone)]
pub enum Unwind {
    CancelledPayment(Payment),
    RefundedEscrow(SettlementPlan),
}

/// Cancels a payment that never captured, or refunds the escrow holding a
/// captured one.
pub fn unwind_for_withdrawal(
    payment: &Payment,
    escrow: Option<&EscrowTransaction>,
    now: DateTime<Utc>,
) -> Result<Unwind, ServiceError> {
    if payment.status.is_precapture() {
        let cancelled = payment.transition(PaymentStatus::Cancelled, &Actor::System, "application withdrawn", now)?;
        return Ok(Unwind::CancelledPayment(cancelled));
    }
    let escrow = escrow.ok_or_else(|| ServiceError::IntegrityViolation {
        entity: "payment",
        id: payment.id,
        details: format!("{} payment has no escrow to refund", payment.status.to_str()),
    })?;
    let command = EscrowCommand::AutomatedRefund {
        note: "application withdrawn".to_string(),
    };
    match escrow.plan(payment, ApplicationStatus::Withdrawn, &command, None, now)? {
        Some(plan) => Ok(Unwind::RefundedEscrow(plan)),
        None => Err(ServiceError::terminal("escrow", escrow.id, escrow.status)),
    }
}

/// Escrow side of disputing an application. `Ok(None)` when there is nothing
/// undisputed to freeze: no capture yet, or the escrow is already disputed.
pub fn dispute_for_application(
    payment: &Payment,
    escrow: Option<&EscrowTransaction>,
    command: &EscrowCommand,
    now: DateTime<Utc>,
) -> Result<Option<SettlementPlan>, ServiceError> {
    let Some(escrow) = escrow else {
        if payment.status.is_precapture() {
            return Ok(None);
        }
        return Err(ServiceError::IntegrityViolation {
            entity: "payment",
            id: payment.id,
            details: format!("{} payment has no escrow to dispute", payment.status.to_str()),
        });
    };
    if !escrow.status.holds_undisputed_funds() {
        return Ok(None);
    }
    escrow.plan(payment, ApplicationStatus::Disputed, command, None, now)
}

impl EscrowTransaction {
    /// Opens the escrow for a freshly captured payment.
    pub fn fund(payment: &Payment, shift_id: Uuid, now: DateTime<Utc>) -> EscrowTransaction {
        let id = Uuid::new_v4();
        EscrowTransaction {
            id,
            payment_id: payment.id,
            shift_id,
            facility_id: payment.payer_id,
            professional_id: payment.payee_id,
            held_amount: payment.amount.clone(),
            currency: payment.currency.clone(),
            status: EscrowStatus::Funded,
            funded_at: now,
            release_conditions_met_at: None,
            released_at: None,
            dispute_opened_at: None,
            closed_at: None,
            notes: audit_line(
                now,
                &Actor::System,
                &format!("funded {} {} from payment {}", payment.amount, payment.currency, payment.id),
            ),
        }
    }

    pub fn is_party(&self, actor: &Actor) -> bool {
        actor.is_user(self.facility_id) || actor.is_user(self.professional_id)
    }

    fn guard_open(&self) -> Result<(), ServiceError> {
        if self.status.is_terminal() {
            return Err(ServiceError::terminal("escrow", self.id, self.status));
        }
        Ok(())
    }

    fn guard_edge(&self, to: EscrowStatus) -> Result<(), ServiceError> {
        self.guard_open()?;
        if !self.status.can_transition_to(to) {
            return Err(ServiceError::InvalidEscrowTransition {
                id: self.id,
                from: self.status,
                to,
            });
        }
        Ok(())
    }

    /// Funds are only earmarked for release once the work is signed off.
    fn guard_work_completed(
        &self,
        payment: &Payment,
        application: ApplicationStatus,
        action: &'static str,
    ) -> Result<(), ServiceError> {
        if application != ApplicationStatus::Completed {
            return Err(ServiceError::InvalidState {
                id: payment.application_id,
                current: application,
                action,
            });
        }
        Ok(())
    }

    /// Computes the rows a command writes. `Ok(None)` means the command is an
    /// idempotent repeat and nothing changes.
    ///
    /// `application` is the current status of the application the payment
    /// settles. `payout_method` is the professional's current default payment
    /// method, consulted only when funds are released.
    pub fn plan(
        &self,
        payment: &Payment,
        application: ApplicationStatus,
        command: &EscrowCommand,
        payout_method: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Option<SettlementPlan>, ServiceError> {
        if payment.id != self.payment_id {
            return Err(ServiceError::IntegrityViolation {
                entity: "escrow",
                id: self.id,
                details: format!("payment {} does not back this escrow", payment.id),
            });
        }

        match command {
            EscrowCommand::MarkReleaseConditionsMet { actor } => {
                if !matches!(actor, Actor::System) && !actor.is_admin() && !self.is_party(actor) {
                    return Err(ServiceError::NotParty(self.id));
                }
                self.guard_open()?;
                self.guard_work_completed(payment, application, "mark release conditions met")?;
                if self.status == EscrowStatus::PendingRelease {
                    return Ok(None);
                }
                self.guard_edge(EscrowStatus::PendingRelease)?;
                Ok(Some(self.settle(payment, EscrowStatus::PendingRelease, actor, "release conditions met", None, now)?))
            }
            EscrowCommand::FileDispute { actor, reason } => {
                if !matches!(actor, Actor::System) && !self.is_party(actor) {
                    return Err(ServiceError::NotParty(self.id));
                }
                self.guard_edge(EscrowStatus::Disputed)?;
                Ok(Some(self.settle(payment, EscrowStatus::Disputed, actor, reason, None, now)?))
            }
            EscrowCommand::UpdateStatus { target, actor, note } => {
                if !actor.is_admin() {
                    return Err(ServiceError::AdminRequired("escrow status update"));
                }
                self.guard_edge(*target)?;
                if *target == EscrowStatus::PendingRelease {
                    self.guard_work_completed(payment, application, "move escrow to pending release")?;
                }
                Ok(Some(self.settle(payment, *target, actor, note, payout_method, now)?))
            }
            EscrowCommand::ResolveDispute { actor, resolution, note } => {
                if !actor.is_admin() {
                    return Err(ServiceError::AdminRequired("dispute resolution"));
                }
                self.guard_open()?;
                if self.status != EscrowStatus::Disputed {
                    return Err(ServiceError::InvalidEscrowTransition {
                        id: self.id,
                        from: self.status,
                        to: resolution.target(),
                    });
                }
                let note = format!("dispute resolved ({:?}): {}", resolution, note);
                Ok(Some(self.settle(payment, resolution.target(), actor, &note, payout_method, now)?))
            }
            EscrowCommand::AutomatedRefund { note } => {
                self.guard_edge(EscrowStatus::Refunded)?;
                Ok(Some(self.settle(payment, EscrowStatus::Refunded, &Actor::System, note, None, now)?))
            }
        }
    }

    fn settle(
        &self,
        payment: &Payment,
        target: EscrowStatus,
        actor: &Actor,
        note: &str,
        payout_method: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<SettlementPlan, ServiceError> {
        let mut escrow = EscrowTransaction {
            status: target,
            ..self.clone()
        };
        escrow.notes.push_str(&audit_line(
            now,
            actor,
            &format!("{} -> {}: {}", self.status.to_str(), target.to_str(), note),
        ));

        let mut plan = SettlementPlan {
            escrow,
            payment: None,
            obligation: None,
            issue: None,
        };

        match target {
            EscrowStatus::Funded => {}
            EscrowStatus::PendingRelease => {
                plan.escrow.release_conditions_met_at.get_or_insert(now);
            }
            EscrowStatus::Disputed => {
                plan.escrow.dispute_opened_at = Some(now);
                plan.payment = Some(payment.apply_status_update(PaymentStatusUpdate::Disputed, actor, note, now)?);
            }
            EscrowStatus::Released => {
                // an admin release out of a dispute counts as the completion confirmation
                plan.escrow.release_conditions_met_at.get_or_insert(now);
                plan.escrow.released_at = Some(now);
                plan.escrow.closed_at = Some(now);
                plan.payment = Some(payment.apply_status_update(PaymentStatusUpdate::EscrowReleased, actor, note, now)?);

                let payout = &self.held_amount - &payment.transaction_fee;
                let mut obligation = self.obligation(ObligationKind::Payout, self.professional_id, payout_method, payout, now);
                if payout_method.is_none() {
                    obligation.status = ObligationStatus::AwaitingMethod;
                    plan.issue = Some(IntegrityIssue::new(
                        IntegrityIssueKind::MissingDefaultMethod,
                        self.professional_id,
                        format!("escrow {} released but professional has no default payment method", self.id),
                        now,
                    ));
                }
                plan.obligation = Some(obligation);
            }
            EscrowStatus::Refunded | EscrowStatus::Cancelled => {
                plan.escrow.closed_at = Some(now);
                let update = if target == EscrowStatus::Refunded {
                    PaymentStatusUpdate::Refunded
                } else {
                    PaymentStatusUpdate::Cancelled
                };
                plan.payment = Some(payment.apply_status_update(update, actor, note, now)?);
                plan.obligation = Some(self.obligation(
                    ObligationKind::Refund,
                    self.facility_id,
                    payment.payment_method_id,
                    self.held_amount.clone(),
                    now,
                ));
            }
        }

        Ok(plan)
    }

    fn obligation(
        &self,
        kind: ObligationKind,
        beneficiary_id: Uuid,
        payment_method_id: Option<Uuid>,
        amount: BigDecimal,
        now: DateTime<Utc>,
    ) -> SettlementObligation {
        SettlementObligation {
            id: Uuid::new_v4(),
            escrow_id: self.id,
            payment_id: self.payment_id,
            kind,
            beneficiary_id,
            payment_method_id,
            amount,
            currency: self.currency.clone(),
            status: ObligationStatus::Pending,
            attempts: 0,
            last_error: None,
            external_reference: None,
            created_at: now,
            updated_at: now,
        }
    }
}
