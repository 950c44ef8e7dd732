pub mod db;
pub mod shiftdb;
pub mod paymentdb;
pub mod escrowdb;
pub mod methoddb;
#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    models::{
        escrowmodel::{
            EscrowCommand, EscrowTransaction, IntegrityIssue, ObligationAttempt, SettlementObligation, SettlementPlan, Unwind,
        },
        methodmodel::PaymentMethod,
        paymentmodel::{Money, Payment, PaymentChange},
        shiftmodel::{ApplicationChange, Shift, ShiftApplication},
    },
    service::error::ServiceError,
};

/// What a committed application change wrote.
#[derive(Debug, Clone)]
pub struct ApplicationTransition {
    pub application: ShiftApplication,
    pub shift: Option<Shift>,
    pub unwound: Option<Unwind>,
    /// The escrow dispute opened alongside an application dispute.
    pub disputed: Option<SettlementPlan>,
}

#[derive(Debug, Clone)]
pub enum CaptureOutcome {
    Captured { payment: Payment, escrow: EscrowTransaction },
    AlreadyCaptured { payment: Payment },
    Quarantined { payment: Payment, issue: IntegrityIssue },
}

impl CaptureOutcome {
    pub fn into_payment(self) -> Payment {
        match self {
            CaptureOutcome::Captured { payment, .. }
            | CaptureOutcome::AlreadyCaptured { payment }
            | CaptureOutcome::Quarantined { payment, .. } => payment,
        }
    }
}

#[async_trait]
pub trait ShiftApplicationExt: Send + Sync {
    async fn get_shift(&self, shift_id: Uuid) -> Result<Option<Shift>, ServiceError>;

    async fn get_application(&self, application_id: Uuid) -> Result<Option<ShiftApplication>, ServiceError>;

    async fn list_applications_for_shift(&self, shift_id: Uuid) -> Result<Vec<ShiftApplication>, ServiceError>;

    async fn create_application(
        &self,
        shift_id: Uuid,
        professional_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ShiftApplication, ServiceError>;

    /// Locks the application and its shift, applies the change and, in the
    /// same transaction, unwinds the payment of a withdrawal after acceptance
    /// or disputes the escrow of a disputed application.
    async fn change_application(
        &self,
        application_id: Uuid,
        change: &ApplicationChange,
        now: DateTime<Utc>,
    ) -> Result<ApplicationTransition, ServiceError>;

    async fn checked_out_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ShiftApplication>, ServiceError>;
}

#[async_trait]
pub trait PaymentExt: Send + Sync {
    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<Payment>, ServiceError>;

    async fn get_payment_by_charge(&self, charge_id: &str) -> Result<Option<Payment>, ServiceError>;

    async fn create_payment(
        &self,
        application_id: Uuid,
        payer_id: Uuid,
        money: &Money,
        transaction_fee: bigdecimal::BigDecimal,
        payment_method_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Payment, ServiceError>;

    async fn change_payment(
        &self,
        payment_id: Uuid,
        change: &PaymentChange,
        now: DateTime<Utc>,
    ) -> Result<Payment, ServiceError>;

    /// Captures the payment and opens its escrow in one transaction.
    /// Idempotent on the external reference.
    async fn capture_payment(
        &self,
        payment_id: Uuid,
        external_reference: &str,
        now: DateTime<Utc>,
    ) -> Result<CaptureOutcome, ServiceError>;
}

#[async_trait]
pub trait EscrowExt: Send + Sync {
    async fn get_escrow(&self, escrow_id: Uuid) -> Result<Option<EscrowTransaction>, ServiceError>;

    async fn escrow_for_application(&self, application_id: Uuid) -> Result<Option<EscrowTransaction>, ServiceError>;

    /// `Ok(None)` when the command was an idempotent repeat.
    async fn apply_escrow_command(
        &self,
        escrow_id: Uuid,
        command: &EscrowCommand,
        now: DateTime<Utc>,
    ) -> Result<Option<SettlementPlan>, ServiceError>;

    /// Funded escrows whose application already reached `completed`.
    async fn funded_escrows_for_completed_applications(&self) -> Result<Vec<EscrowTransaction>, ServiceError>;

    /// Escrows still holding undisputed funds for a disputed application,
    /// as when the capture lands after the dispute.
    async fn undisputed_escrows_for_disputed_applications(&self) -> Result<Vec<EscrowTransaction>, ServiceError>;

    /// Escrow rows whose payment does not link back to them.
    async fn orphaned_escrows(&self) -> Result<Vec<EscrowTransaction>, ServiceError>;
}

#[async_trait]
pub trait ObligationExt: Send + Sync {
    async fn get_obligation(&self, obligation_id: Uuid) -> Result<Option<SettlementObligation>, ServiceError>;

    async fn obligations_for_escrow(&self, escrow_id: Uuid) -> Result<Vec<SettlementObligation>, ServiceError>;

    async fn outstanding_obligations(&self, limit: i64) -> Result<Vec<SettlementObligation>, ServiceError>;

    async fn record_obligation_attempt(
        &self,
        obligation_id: Uuid,
        attempt: &ObligationAttempt,
        now: DateTime<Utc>,
    ) -> Result<SettlementObligation, ServiceError>;
}

#[async_trait]
pub trait IntegrityExt: Send + Sync {
    /// Records an issue unless an unresolved one of the same kind already
    /// exists for the entity.
    async fn quarantine(&self, issue: &IntegrityIssue) -> Result<(), ServiceError>;

    async fn open_integrity_issues(&self) -> Result<Vec<IntegrityIssue>, ServiceError>;

    async fn resolve_integrity_issue(&self, issue_id: Uuid, now: DateTime<Utc>) -> Result<IntegrityIssue, ServiceError>;
}

#[async_trait]
pub trait PaymentMethodExt: Send + Sync {
    async fn get_method(&self, method_id: Uuid) -> Result<Option<PaymentMethod>, ServiceError>;

    async fn list_methods(&self, owner_id: Uuid) -> Result<Vec<PaymentMethod>, ServiceError>;

    async fn default_method(&self, owner_id: Uuid) -> Result<Option<PaymentMethod>, ServiceError>;

    /// Inserts the method; the owner's first method becomes the default.
    async fn create_method(&self, method: &PaymentMethod) -> Result<PaymentMethod, ServiceError>;

    async fn set_default_method(
        &self,
        method_id: Uuid,
        owner_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<PaymentMethod, ServiceError>;

    async fn delete_method(&self, method_id: Uuid, owner_id: Uuid) -> Result<(), ServiceError>;
}

/// Everything the settlement services need from persistence.
pub trait SettlementStore:
    ShiftApplicationExt + PaymentExt + EscrowExt + ObligationExt + IntegrityExt + PaymentMethodExt
{
}

impl<T> SettlementStore for T where
    T: ShiftApplicationExt + PaymentExt + EscrowExt + ObligationExt + IntegrityExt + PaymentMethodExt
{
}

/// Maps a violation of a named unique index onto a domain error.
pub(crate) fn map_constraint(
    err: sqlx::Error,
    mapping: impl Fn(&str) -> Option<ServiceError>,
) -> ServiceError {
    if let sqlx::Error::Database(db_err) = &err {
        if let Some(mapped) = db_err.constraint().and_then(&mapping) {
            return mapped;
        }
    }
    ServiceError::from(err)
}
