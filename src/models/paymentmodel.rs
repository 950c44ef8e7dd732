use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    models::{
        audit_line,
        escrowmodel::IntegrityIssueKind,
        shiftmodel::{ApplicationStatus, Shift, ShiftApplication},
        usermodel::Actor,
    },
    service::error::ServiceError,
};

/// A positive amount with at most two fractional digits in a three-letter
/// currency. Built only through `Money::new`/`Money::parse`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Money {
    amount: BigDecimal,
    currency: String,
}

impl Money {
    pub fn new(amount: BigDecimal, currency: &str) -> Result<Money, ServiceError> {
        if amount <= BigDecimal::zero() {
            return Err(ServiceError::InvalidAmount(format!("{} must be greater than zero", amount)));
        }
        let (_, exponent) = amount.normalized().as_bigint_and_exponent();
        if exponent > 2 {
            return Err(ServiceError::InvalidAmount(format!("{} has more than two decimal places", amount)));
        }
        let currency = currency.trim().to_ascii_uppercase();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ServiceError::InvalidAmount(format!("'{}' is not an ISO currency code", currency)));
        }
        Ok(Money {
            amount: amount.with_scale(2),
            currency,
        })
    }

    pub fn parse(amount: &str, currency: &str) -> Result<Money, ServiceError> {
        let amount = BigDecimal::from_str(amount.trim())
            .map_err(|_| ServiceError::InvalidAmount(format!("'{}' is not a decimal amount", amount)))?;
        Money::new(amount, currency)
    }

    pub fn amount(&self) -> &BigDecimal {
        &self.amount
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "payment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    PendingManualVerification,
    Captured,
    InEscrow,
    Completed,
    Failed,
    Refunded,
    Disputed,
    Cancelled,
}

impl PaymentStatus {
    pub fn to_str(&self) -> &str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::PendingManualVerification => "pending_manual_verification",
            PaymentStatus::Captured => "captured",
            PaymentStatus::InEscrow => "in_escrow",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Disputed => "disputed",
            PaymentStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Completed | PaymentStatus::Failed | PaymentStatus::Refunded | PaymentStatus::Cancelled
        )
    }

    /// Not yet captured: no money has moved and no escrow exists.
    pub fn is_precapture(&self) -> bool {
        matches!(self, PaymentStatus::Pending | PaymentStatus::PendingManualVerification)
    }

    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, PendingManualVerification)
                | (Pending, Captured)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (PendingManualVerification, Captured)
                | (PendingManualVerification, Failed)
                | (PendingManualVerification, Cancelled)
                | (Captured, InEscrow)
                | (InEscrow, Completed)
                | (InEscrow, Refunded)
                | (InEscrow, Disputed)
                | (InEscrow, Cancelled)
                | (Disputed, Completed)
                | (Disputed, Refunded)
        )
    }
}

/// Statuses accepted by the operator-facing `update_status`. `escrow_released`
/// is the legacy spelling of a completed payment and maps onto `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatusUpdate {
    Completed,
    Refunded,
    Disputed,
    Cancelled,
    EscrowReleased,
}

impl FromStr for PaymentStatusUpdate {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "completed" => Ok(PaymentStatusUpdate::Completed),
            "refunded" => Ok(PaymentStatusUpdate::Refunded),
            "disputed" => Ok(PaymentStatusUpdate::Disputed),
            "cancelled" => Ok(PaymentStatusUpdate::Cancelled),
            "escrow_released" => Ok(PaymentStatusUpdate::EscrowReleased),
            _ => Err(()),
        }
    }
}

impl PaymentStatusUpdate {
    pub fn target(&self) -> PaymentStatus {
        match self {
            PaymentStatusUpdate::Completed | PaymentStatusUpdate::EscrowReleased => PaymentStatus::Completed,
            PaymentStatusUpdate::Refunded => PaymentStatus::Refunded,
            PaymentStatusUpdate::Disputed => PaymentStatus::Disputed,
            PaymentStatusUpdate::Cancelled => PaymentStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq)]
pub struct Payment {
    pub id: Uuid,
    pub application_id: Uuid,
    pub payer_id: Uuid,
    pub payee_id: Uuid,
    pub payment_method_id: Option<Uuid>,
    pub amount: BigDecimal,
    pub currency: String,
    pub transaction_fee: BigDecimal,
    pub status: PaymentStatus,
    pub gateway_charge_id: Option<String>,
    pub approval_url: Option<String>,
    pub external_reference: Option<String>,
    pub escrow_transaction_id: Option<Uuid>,
    pub failure_reason: Option<String>,
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub captured_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum CaptureDecision {
    /// Same external reference seen before; nothing to do.
    AlreadyCaptured,
    Capture(Payment),
    /// Money arrived for a payment that cannot take it. Never auto-corrected.
    Quarantine(IntegrityIssueKind, String),
}

#[derive(Debug, Clone)]
pub enum PaymentChange {
    Fail { reason: String },
    Cancel { actor: Actor },
    UpdateStatus { update: PaymentStatusUpdate, actor: Actor, note: String },
    RecordManualIntent { method_id: Uuid, charge_id: String },
    AttachCharge { method_id: Uuid, charge_id: String, approval_url: Option<String> },
}

impl Payment {
    /// Opens a pending payment for an accepted application. Only the facility
    /// owning the shift can pay for it.
    pub fn new(
        application: &ShiftApplication,
        shift: &Shift,
        payer_id: Uuid,
        money: &Money,
        transaction_fee: BigDecimal,
        payment_method_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Payment, ServiceError> {
        if shift.facility_id != payer_id {
            return Err(ServiceError::NotOwner(payer_id));
        }
        if application.status != ApplicationStatus::Accepted {
            return Err(ServiceError::ApplicationNotAccepted(application.id));
        }

        let id = Uuid::new_v4();
        Ok(Payment {
            id,
            application_id: application.id,
            payer_id,
            payee_id: application.professional_id,
            payment_method_id,
            amount: money.amount().clone(),
            currency: money.currency().to_string(),
            transaction_fee,
            status: PaymentStatus::Pending,
            gateway_charge_id: None,
            approval_url: None,
            external_reference: None,
            escrow_transaction_id: None,
            failure_reason: None,
            notes: audit_line(now, &Actor::facility(payer_id), "initiated"),
            created_at: now,
            captured_at: None,
            updated_at: now,
        })
    }

    pub fn transition(
        &self,
        next: PaymentStatus,
        actor: &Actor,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<Payment, ServiceError> {
        if self.status.is_terminal() {
            return Err(ServiceError::terminal("payment", self.id, self.status));
        }
        if !self.status.can_transition_to(next) {
            return Err(ServiceError::InvalidStatusTransition {
                id: self.id,
                from: self.status,
                to: next.to_str().to_string(),
            });
        }
        let mut notes = self.notes.clone();
        notes.push_str(&audit_line(now, actor, &format!("{} -> {}: {}", self.status.to_str(), next.to_str(), note)));
        Ok(Payment {
            status: next,
            notes,
            updated_at: now,
            ..self.clone()
        })
    }

    pub fn capture(&self, external_reference: &str, now: DateTime<Utc>) -> CaptureDecision {
        if self.status.is_precapture() {
            return match self.transition(PaymentStatus::Captured, &Actor::System, external_reference, now) {
                Ok(mut captured) => {
                    captured.external_reference = Some(external_reference.to_string());
                    captured.captured_at = Some(now);
                    CaptureDecision::Capture(captured)
                }
                Err(err) => CaptureDecision::Quarantine(IntegrityIssueKind::LateCapture, err.to_string()),
            };
        }

        match self.external_reference.as_deref() {
            Some(existing) if existing == external_reference => CaptureDecision::AlreadyCaptured,
            Some(existing) => CaptureDecision::Quarantine(
                IntegrityIssueKind::CaptureReferenceMismatch,
                format!("captured as {} but gateway reported {}", existing, external_reference),
            ),
            None => CaptureDecision::Quarantine(
                IntegrityIssueKind::LateCapture,
                format!("capture {} arrived while payment was {}", external_reference, self.status.to_str()),
            ),
        }
    }

    /// Whitelisted status write with an audit note. The escrow ledger settles
    /// the payment side of every escrow transition through here.
    pub fn apply_status_update(
        &self,
        update: PaymentStatusUpdate,
        actor: &Actor,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<Payment, ServiceError> {
        self.transition(update.target(), actor, note, now)
    }

    /// Captured -> InEscrow, written together with the escrow row.
    pub fn link_escrow(&self, escrow_id: Uuid, now: DateTime<Utc>) -> Result<Payment, ServiceError> {
        let mut linked = self.transition(PaymentStatus::InEscrow, &Actor::System, &format!("escrow {}", escrow_id), now)?;
        linked.escrow_transaction_id = Some(escrow_id);
        Ok(linked)
    }

    /// Pre-escrow changes. Everything touching an open escrow goes through the
    /// escrow ledger instead.
    pub fn apply_change(&self, change: &PaymentChange, now: DateTime<Utc>) -> Result<Payment, ServiceError> {
        match change {
            PaymentChange::Fail { reason } => {
                let mut failed = self.transition(PaymentStatus::Failed, &Actor::System, reason, now)?;
                failed.failure_reason = Some(reason.clone());
                Ok(failed)
            }
            PaymentChange::Cancel { actor } => {
                if !actor.is_admin() && !actor.is_user(self.payer_id) {
                    return Err(ServiceError::NotOwner(actor.user_id().unwrap_or_default()));
                }
                if !self.status.is_precapture() {
                    return Err(ServiceError::InvalidStatusTransition {
                        id: self.id,
                        from: self.status,
                        to: PaymentStatus::Cancelled.to_str().to_string(),
                    });
                }
                self.transition(PaymentStatus::Cancelled, actor, "cancelled before capture", now)
            }
            PaymentChange::UpdateStatus { update, actor, note } => {
                if self.escrow_transaction_id.is_some() && !self.status.is_terminal() {
                    // money sits in escrow; only the escrow ledger may settle it
                    return Err(ServiceError::InvalidStatusTransition {
                        id: self.id,
                        from: self.status,
                        to: format!("{} (escrow still open)", update.target().to_str()),
                    });
                }
                self.apply_status_update(*update, actor, note, now)
            }
            PaymentChange::RecordManualIntent { method_id, charge_id } => {
                let mut waiting = self.transition(
                    PaymentStatus::PendingManualVerification,
                    &Actor::System,
                    "awaiting manual transfer",
                    now,
                )?;
                waiting.payment_method_id = Some(*method_id);
                waiting.gateway_charge_id = Some(charge_id.clone());
                Ok(waiting)
            }
            PaymentChange::AttachCharge { method_id, charge_id, approval_url } => {
                if !self.status.is_precapture() {
                    return Err(ServiceError::InvalidStatusTransition {
                        id: self.id,
                        from: self.status,
                        to: "charge attached".to_string(),
                    });
                }
                if let Some(existing) = self.gateway_charge_id.as_deref() {
                    if existing != charge_id {
                        return Err(ServiceError::IntegrityViolation {
                            entity: "payment",
                            id: self.id,
                            details: format!("already bound to charge {}", existing),
                        });
                    }
                }
                let mut notes = self.notes.clone();
                notes.push_str(&audit_line(now, &Actor::System, &format!("charge {} created", charge_id)));
                Ok(Payment {
                    payment_method_id: Some(*method_id),
                    gateway_charge_id: Some(charge_id.clone()),
                    approval_url: approval_url.clone(),
                    notes,
                    updated_at: now,
                    ..self.clone()
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::shiftmodel::ShiftStatus;

    fn accepted_pair(now: DateTime<Utc>) -> (ShiftApplication, Shift) {
        let shift = Shift {
            id: Uuid::new_v4(),
            facility_id: Uuid::new_v4(),
            starts_at: now,
            ends_at: now,
            status: ShiftStatus::Filled,
            updated_at: now,
        };
        let mut app = ShiftApplication::new(&Shift { status: ShiftStatus::Open, ..shift.clone() }, Uuid::new_v4(), now).unwrap();
        app.status = ApplicationStatus::Accepted;
        (app, shift)
    }

    fn pending_payment(now: DateTime<Utc>) -> Payment {
        let (app, shift) = accepted_pair(now);
        let money = Money::parse("150.00", "usd").unwrap();
        Payment::new(&app, &shift, shift.facility_id, &money, BigDecimal::from(0), None, now).unwrap()
    }

    #[test]
    fn test_money_validation() {
        assert!(Money::parse("0", "USD").is_err());
        assert!(Money::parse("-5.00", "USD").is_err());
        assert!(Money::parse("1.005", "USD").is_err());
        assert!(Money::parse("abc", "USD").is_err());
        assert!(Money::parse("10", "US").is_err());

        let money = Money::parse("150", "usd").unwrap();
        assert_eq!(money.currency(), "USD");
        assert_eq!(money.amount().to_string(), "150.00");
        assert!(Money::parse("150.50", "EUR").is_ok());
    }

    #[test]
    fn test_new_payment_requires_accepted_application() {
        let now = Utc::now();
        let (mut app, shift) = accepted_pair(now);
        let money = Money::parse("20.00", "USD").unwrap();

        let err = Payment::new(&app, &shift, Uuid::new_v4(), &money, BigDecimal::from(0), None, now).unwrap_err();
        assert!(matches!(err, ServiceError::NotOwner(_)));

        app.status = ApplicationStatus::Pending;
        let err = Payment::new(&app, &shift, shift.facility_id, &money, BigDecimal::from(0), None, now).unwrap_err();
        assert!(matches!(err, ServiceError::ApplicationNotAccepted(_)));
    }

    #[test]
    fn test_capture_is_idempotent_on_reference() {
        let now = Utc::now();
        let payment = pending_payment(now);

        let captured = match payment.capture("ch_1", now) {
            CaptureDecision::Capture(p) => p,
            other => panic!("expected capture, got {:?}", other),
        };
        assert_eq!(captured.status, PaymentStatus::Captured);
        let linked = captured.link_escrow(Uuid::new_v4(), now).unwrap();
        assert_eq!(linked.status, PaymentStatus::InEscrow);

        assert!(matches!(linked.capture("ch_1", now), CaptureDecision::AlreadyCaptured));
        assert!(matches!(
            linked.capture("ch_2", now),
            CaptureDecision::Quarantine(IntegrityIssueKind::CaptureReferenceMismatch, _)
        ));
    }

    #[test]
    fn test_late_capture_on_cancelled_payment_is_quarantined() {
        let now = Utc::now();
        let payment = pending_payment(now);
        let cancelled = payment
            .apply_change(&PaymentChange::Cancel { actor: Actor::facility(payment.payer_id) }, now)
            .unwrap();
        assert!(matches!(
            cancelled.capture("ch_late", now),
            CaptureDecision::Quarantine(IntegrityIssueKind::LateCapture, _)
        ));
    }

    #[test]
    fn test_update_status_whitelist_and_escrow_guard() {
        assert!("escrow_released".parse::<PaymentStatusUpdate>().is_ok());
        assert!("captured".parse::<PaymentStatusUpdate>().is_err());
        assert_eq!(PaymentStatusUpdate::EscrowReleased.target(), PaymentStatus::Completed);

        let now = Utc::now();
        let payment = pending_payment(now);
        let admin = Actor::admin(Uuid::new_v4());
        let in_escrow = match payment.capture("ch_9", now) {
            CaptureDecision::Capture(p) => p.link_escrow(Uuid::new_v4(), now).unwrap(),
            other => panic!("unexpected {:?}", other),
        };
        let err = in_escrow
            .apply_change(
                &PaymentChange::UpdateStatus {
                    update: PaymentStatusUpdate::Completed,
                    actor: admin,
                    note: "manual".to_string(),
                },
                now,
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidStatusTransition { .. }));

        let cancelled = payment
            .apply_change(
                &PaymentChange::UpdateStatus {
                    update: PaymentStatusUpdate::Cancelled,
                    actor: admin,
                    note: "duplicate booking".to_string(),
                },
                now,
            )
            .unwrap();
        assert_eq!(cancelled.status, PaymentStatus::Cancelled);
        assert!(cancelled.notes.contains("duplicate booking"));
        assert!(cancelled.notes.contains("initiated"));

        let err = cancelled
            .apply_change(
                &PaymentChange::UpdateStatus {
                    update: PaymentStatusUpdate::Refunded,
                    actor: admin,
                    note: String::new(),
                },
                now,
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::TerminalStateViolation { .. }));
    }

    #[test]
    fn test_failure_never_follows_capture() {
        let now = Utc::now();
        let payment = pending_payment(now);
        let captured = match payment.capture("ch_3", now) {
            CaptureDecision::Capture(p) => p,
            other => panic!("unexpected {:?}", other),
        };
        let err = captured
            .apply_change(&PaymentChange::Fail { reason: "declined".to_string() }, now)
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidStatusTransition { .. }));
    }
}
