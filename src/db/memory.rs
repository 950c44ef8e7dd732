// db/memory.rs
//! In-memory `SettlementStore` for service tests. One write lock per call
//! plays the role of a database transaction: every check runs before any row
//! is written, so a failed call leaves nothing behind.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    ApplicationTransition, CaptureOutcome, EscrowExt, IntegrityExt, ObligationExt, PaymentExt, PaymentMethodExt,
    ShiftApplicationExt,
};
use crate::{
    models::{
        escrowmodel::{
            dispute_for_application, unwind_for_withdrawal, EscrowCommand, EscrowStatus, EscrowTransaction, IntegrityIssue, ObligationAttempt,
            ObligationStatus, SettlementObligation, SettlementPlan, Unwind,
        },
        methodmodel::PaymentMethod,
        paymentmodel::{CaptureDecision, Money, Payment, PaymentChange},
        shiftmodel::{ApplicationChange, ApplicationStatus, Shift, ShiftApplication, ShiftStatus},
    },
    service::error::ServiceError,
};

#[derive(Default)]
struct MemoryState {
    shifts: HashMap<Uuid, Shift>,
    applications: HashMap<Uuid, ShiftApplication>,
    payments: HashMap<Uuid, Payment>,
    escrows: HashMap<Uuid, EscrowTransaction>,
    obligations: HashMap<Uuid, SettlementObligation>,
    issues: HashMap<Uuid, IntegrityIssue>,
    methods: HashMap<Uuid, PaymentMethod>,
}

impl MemoryState {
    fn active_payment(&self, application_id: Uuid) -> Option<&Payment> {
        self.payments
            .values()
            .find(|p| p.application_id == application_id && !p.status.is_terminal())
    }

    fn default_method_id(&self, owner_id: Uuid) -> Option<Uuid> {
        self.methods
            .values()
            .find(|m| m.owner_id == owner_id && m.is_default)
            .map(|m| m.id)
    }

    fn record_issue(&mut self, issue: &IntegrityIssue) {
        let open = self
            .issues
            .values()
            .any(|i| i.kind == issue.kind && i.entity_id == issue.entity_id && i.resolved_at.is_none());
        if !open {
            self.issues.insert(issue.id, issue.clone());
        }
    }

    fn check_plan(&self, plan: &SettlementPlan) -> Result<(), ServiceError> {
        if let Some(obligation) = &plan.obligation {
            let duplicate = self
                .obligations
                .values()
                .any(|o| o.escrow_id == obligation.escrow_id && o.kind == obligation.kind);
            if duplicate {
                return Err(ServiceError::IntegrityViolation {
                    entity: "escrow",
                    id: obligation.escrow_id,
                    details: format!("{:?} obligation already recorded", obligation.kind),
                });
            }
        }
        Ok(())
    }

    fn persist_plan(&mut self, plan: &SettlementPlan) {
        self.escrows.insert(plan.escrow.id, plan.escrow.clone());
        if let Some(payment) = &plan.payment {
            self.payments.insert(payment.id, payment.clone());
        }
        if let Some(obligation) = &plan.obligation {
            self.obligations.insert(obligation.id, obligation.clone());
        }
        if let Some(issue) = &plan.issue {
            self.record_issue(issue);
        }
    }
}

#[derive(Default, Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes an open shift, as the shift-listing service would.
    pub async fn seed_shift(&self, facility_id: Uuid, starts_in: Duration) -> Shift {
        let now = Utc::now();
        let shift = Shift {
            id: Uuid::new_v4(),
            facility_id,
            starts_at: now + starts_in,
            ends_at: now + starts_in + Duration::hours(8),
            status: ShiftStatus::Open,
            updated_at: now,
        };
        self.state.write().await.shifts.insert(shift.id, shift.clone());
        shift
    }

    /// Writes an escrow row directly, bypassing capture.
    pub async fn put_escrow(&self, escrow: EscrowTransaction) {
        self.state.write().await.escrows.insert(escrow.id, escrow);
    }
}

#[async_trait]
impl ShiftApplicationExt for MemoryStore {
    async fn get_shift(&self, shift_id: Uuid) -> Result<Option<Shift>, ServiceError> {
        Ok(self.state.read().await.shifts.get(&shift_id).cloned())
    }

    async fn get_application(&self, application_id: Uuid) -> Result<Option<ShiftApplication>, ServiceError> {
        Ok(self.state.read().await.applications.get(&application_id).cloned())
    }

    async fn list_applications_for_shift(&self, shift_id: Uuid) -> Result<Vec<ShiftApplication>, ServiceError> {
        let state = self.state.read().await;
        let mut applications: Vec<_> = state
            .applications
            .values()
            .filter(|a| a.shift_id == shift_id)
            .cloned()
            .collect();
        applications.sort_by_key(|a| a.applied_at);
        Ok(applications)
    }

    async fn create_application(
        &self,
        shift_id: Uuid,
        professional_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ShiftApplication, ServiceError> {
        let mut state = self.state.write().await;
        let shift = state.shifts.get(&shift_id).ok_or(ServiceError::ShiftNotFound(shift_id))?;
        let application = ShiftApplication::new(shift, professional_id, now)?;

        let live = state.applications.values().any(|a| {
            a.shift_id == shift_id && a.professional_id == professional_id && a.status != ApplicationStatus::Withdrawn
        });
        if live {
            return Err(ServiceError::DuplicateApplication(shift_id));
        }

        state.applications.insert(application.id, application.clone());
        Ok(application)
    }

    async fn change_application(
        &self,
        application_id: Uuid,
        change: &ApplicationChange,
        now: DateTime<Utc>,
    ) -> Result<ApplicationTransition, ServiceError> {
        let mut state = self.state.write().await;
        let current = state
            .applications
            .get(&application_id)
            .cloned()
            .ok_or(ServiceError::ApplicationNotFound(application_id))?;
        let shift = state
            .shifts
            .get(&current.shift_id)
            .cloned()
            .ok_or(ServiceError::ShiftNotFound(current.shift_id))?;

        let update = current.apply_change(&shift, change, now)?;

        let engaged = |status: ApplicationStatus| {
            matches!(status, ApplicationStatus::Accepted | ApplicationStatus::CheckedIn | ApplicationStatus::CheckedOut)
        };
        if engaged(update.application.status) {
            let other_engaged = state
                .applications
                .values()
                .any(|a| a.shift_id == shift.id && a.id != application_id && engaged(a.status));
            if other_engaged {
                return Err(ServiceError::ShiftAlreadyFilled(shift.id));
            }
        }

        let unwound = if update.unwind_payment {
            match state.active_payment(application_id).cloned() {
                Some(payment) => {
                    let escrow = payment.escrow_transaction_id.and_then(|id| state.escrows.get(&id).cloned());
                    let unwind = unwind_for_withdrawal(&payment, escrow.as_ref(), now)?;
                    if let Unwind::RefundedEscrow(plan) = &unwind {
                        state.check_plan(plan)?;
                    }
                    Some(unwind)
                }
                None => None,
            }
        } else {
            None
        };
        let disputed = match (&update.escrow_dispute, state.active_payment(application_id).cloned()) {
            (Some(command), Some(payment)) => {
                let escrow = payment.escrow_transaction_id.and_then(|id| state.escrows.get(&id).cloned());
                let plan = dispute_for_application(&payment, escrow.as_ref(), command, now)?;
                if let Some(plan) = &plan {
                    state.check_plan(plan)?;
                }
                plan
            }
            _ => None,
        };

        state.applications.insert(application_id, update.application.clone());
        if let Some(shift) = &update.shift {
            state.shifts.insert(shift.id, shift.clone());
        }
        match &unwound {
            Some(Unwind::CancelledPayment(payment)) => {
                state.payments.insert(payment.id, payment.clone());
            }
            Some(Unwind::RefundedEscrow(plan)) => state.persist_plan(plan),
            None => {}
        }
        if let Some(plan) = &disputed {
            state.persist_plan(plan);
        }

        Ok(ApplicationTransition {
            application: update.application,
            shift: update.shift,
            unwound,
            disputed,
        })
    }

    async fn checked_out_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ShiftApplication>, ServiceError> {
        let state = self.state.read().await;
        Ok(state
            .applications
            .values()
            .filter(|a| a.status == ApplicationStatus::CheckedOut && a.checked_out_at.map_or(false, |t| t <= cutoff))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PaymentExt for MemoryStore {
    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<Payment>, ServiceError> {
        Ok(self.state.read().await.payments.get(&payment_id).cloned())
    }

    async fn get_payment_by_charge(&self, charge_id: &str) -> Result<Option<Payment>, ServiceError> {
        let state = self.state.read().await;
        Ok(state
            .payments
            .values()
            .find(|p| p.gateway_charge_id.as_deref() == Some(charge_id))
            .cloned())
    }

    async fn create_payment(
        &self,
        application_id: Uuid,
        payer_id: Uuid,
        money: &Money,
        transaction_fee: BigDecimal,
        payment_method_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Payment, ServiceError> {
        let mut state = self.state.write().await;
        let application = state
            .applications
            .get(&application_id)
            .ok_or(ServiceError::ApplicationNotFound(application_id))?;
        let shift = state
            .shifts
            .get(&application.shift_id)
            .ok_or(ServiceError::ShiftNotFound(application.shift_id))?;
        if state.active_payment(application_id).is_some() {
            return Err(ServiceError::DuplicateActivePayment(application_id));
        }

        let payment = Payment::new(application, shift, payer_id, money, transaction_fee, payment_method_id, now)?;
        state.payments.insert(payment.id, payment.clone());
        Ok(payment)
    }

    async fn change_payment(
        &self,
        payment_id: Uuid,
        change: &PaymentChange,
        now: DateTime<Utc>,
    ) -> Result<Payment, ServiceError> {
        let mut state = self.state.write().await;
        let current = state.payments.get(&payment_id).ok_or(ServiceError::PaymentNotFound(payment_id))?;
        let next = current.apply_change(change, now)?;

        if let Some(charge_id) = next.gateway_charge_id.as_deref() {
            let taken = state
                .payments
                .values()
                .any(|p| p.id != payment_id && p.gateway_charge_id.as_deref() == Some(charge_id));
            if taken {
                return Err(ServiceError::IntegrityViolation {
                    entity: "payment",
                    id: payment_id,
                    details: "gateway charge already bound to another payment".to_string(),
                });
            }
        }

        state.payments.insert(payment_id, next.clone());
        Ok(next)
    }

    async fn capture_payment(
        &self,
        payment_id: Uuid,
        external_reference: &str,
        now: DateTime<Utc>,
    ) -> Result<CaptureOutcome, ServiceError> {
        let mut state = self.state.write().await;
        let current = state
            .payments
            .get(&payment_id)
            .cloned()
            .ok_or(ServiceError::PaymentNotFound(payment_id))?;

        match current.capture(external_reference, now) {
            CaptureDecision::AlreadyCaptured => Ok(CaptureOutcome::AlreadyCaptured { payment: current }),
            CaptureDecision::Capture(captured) => {
                let shift_id = state
                    .applications
                    .get(&captured.application_id)
                    .map(|a| a.shift_id)
                    .ok_or(ServiceError::ApplicationNotFound(captured.application_id))?;
                let reused = state
                    .payments
                    .values()
                    .any(|p| p.id != payment_id && p.external_reference.as_deref() == Some(external_reference));
                if reused {
                    return Err(ServiceError::IntegrityViolation {
                        entity: "payment",
                        id: payment_id,
                        details: format!("external reference {} already used", external_reference),
                    });
                }

                let escrow = EscrowTransaction::fund(&captured, shift_id, now);
                let payment = captured.link_escrow(escrow.id, now)?;
                state.escrows.insert(escrow.id, escrow.clone());
                state.payments.insert(payment_id, payment.clone());
                Ok(CaptureOutcome::Captured { payment, escrow })
            }
            CaptureDecision::Quarantine(kind, details) => {
                let issue = IntegrityIssue::new(kind, payment_id, details, now);
                state.record_issue(&issue);
                Ok(CaptureOutcome::Quarantined { payment: current, issue })
            }
        }
    }
}

#[async_trait]
impl EscrowExt for MemoryStore {
    async fn get_escrow(&self, escrow_id: Uuid) -> Result<Option<EscrowTransaction>, ServiceError> {
        Ok(self.state.read().await.escrows.get(&escrow_id).cloned())
    }

    async fn escrow_for_application(&self, application_id: Uuid) -> Result<Option<EscrowTransaction>, ServiceError> {
        let state = self.state.read().await;
        Ok(state
            .escrows
            .values()
            .filter(|e| {
                state
                    .payments
                    .get(&e.payment_id)
                    .map_or(false, |p| p.application_id == application_id)
            })
            .max_by_key(|e| e.funded_at)
            .cloned())
    }

    async fn apply_escrow_command(
        &self,
        escrow_id: Uuid,
        command: &EscrowCommand,
        now: DateTime<Utc>,
    ) -> Result<Option<SettlementPlan>, ServiceError> {
        let mut state = self.state.write().await;
        let escrow = state.escrows.get(&escrow_id).cloned().ok_or(ServiceError::EscrowNotFound(escrow_id))?;
        let payment = state
            .payments
            .get(&escrow.payment_id)
            .cloned()
            .ok_or(ServiceError::PaymentNotFound(escrow.payment_id))?;
        let application = state
            .applications
            .get(&payment.application_id)
            .map(|a| a.status)
            .ok_or(ServiceError::ApplicationNotFound(payment.application_id))?;
        let payout_method = state.default_method_id(escrow.professional_id);

        let Some(plan) = escrow.plan(&payment, application, command, payout_method, now)? else {
            return Ok(None);
        };
        state.check_plan(&plan)?;
        state.persist_plan(&plan);
        Ok(Some(plan))
    }

    async fn funded_escrows_for_completed_applications(&self) -> Result<Vec<EscrowTransaction>, ServiceError> {
        let state = self.state.read().await;
        Ok(state
            .escrows
            .values()
            .filter(|e| e.status == EscrowStatus::Funded)
            .filter(|e| {
                state
                    .payments
                    .get(&e.payment_id)
                    .and_then(|p| state.applications.get(&p.application_id))
                    .map_or(false, |a| a.status == ApplicationStatus::Completed)
            })
            .cloned()
            .collect())
    }

    async fn undisputed_escrows_for_disputed_applications(&self) -> Result<Vec<EscrowTransaction>, ServiceError> {
        let state = self.state.read().await;
        Ok(state
            .escrows
            .values()
            .filter(|e| e.status.holds_undisputed_funds())
            .filter(|e| {
                state
                    .payments
                    .get(&e.payment_id)
                    .and_then(|p| state.applications.get(&p.application_id))
                    .map_or(false, |a| a.status == ApplicationStatus::Disputed)
            })
            .cloned()
            .collect())
    }

    async fn orphaned_escrows(&self) -> Result<Vec<EscrowTransaction>, ServiceError> {
        let state = self.state.read().await;
        Ok(state
            .escrows
            .values()
            .filter(|e| {
                state
                    .payments
                    .get(&e.payment_id)
                    .map_or(true, |p| p.escrow_transaction_id != Some(e.id))
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ObligationExt for MemoryStore {
    async fn get_obligation(&self, obligation_id: Uuid) -> Result<Option<SettlementObligation>, ServiceError> {
        Ok(self.state.read().await.obligations.get(&obligation_id).cloned())
    }

    async fn obligations_for_escrow(&self, escrow_id: Uuid) -> Result<Vec<SettlementObligation>, ServiceError> {
        let state = self.state.read().await;
        let mut obligations: Vec<_> = state
            .obligations
            .values()
            .filter(|o| o.escrow_id == escrow_id)
            .cloned()
            .collect();
        obligations.sort_by_key(|o| o.created_at);
        Ok(obligations)
    }

    async fn outstanding_obligations(&self, limit: i64) -> Result<Vec<SettlementObligation>, ServiceError> {
        let state = self.state.read().await;
        let mut obligations: Vec<_> = state
            .obligations
            .values()
            .filter(|o| o.status.is_outstanding())
            .cloned()
            .collect();
        obligations.sort_by_key(|o| o.updated_at);
        obligations.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(obligations)
    }

    async fn record_obligation_attempt(
        &self,
        obligation_id: Uuid,
        attempt: &ObligationAttempt,
        now: DateTime<Utc>,
    ) -> Result<SettlementObligation, ServiceError> {
        let mut state = self.state.write().await;
        let current = state
            .obligations
            .get(&obligation_id)
            .ok_or(ServiceError::ObligationNotFound(obligation_id))?;
        let next = current.record_attempt(attempt, now)?;
        state.obligations.insert(obligation_id, next.clone());
        Ok(next)
    }
}

#[async_trait]
impl IntegrityExt for MemoryStore {
    async fn quarantine(&self, issue: &IntegrityIssue) -> Result<(), ServiceError> {
        self.state.write().await.record_issue(issue);
        Ok(())
    }

    async fn open_integrity_issues(&self) -> Result<Vec<IntegrityIssue>, ServiceError> {
        let state = self.state.read().await;
        let mut issues: Vec<_> = state.issues.values().filter(|i| i.resolved_at.is_none()).cloned().collect();
        issues.sort_by_key(|i| i.created_at);
        Ok(issues)
    }

    async fn resolve_integrity_issue(&self, issue_id: Uuid, now: DateTime<Utc>) -> Result<IntegrityIssue, ServiceError> {
        let mut state = self.state.write().await;
        match state.issues.get_mut(&issue_id) {
            Some(issue) if issue.resolved_at.is_none() => {
                issue.resolved_at = Some(now);
                Ok(issue.clone())
            }
            _ => Err(ServiceError::Validation(format!("integrity issue {} is not open", issue_id))),
        }
    }
}

#[async_trait]
impl PaymentMethodExt for MemoryStore {
    async fn get_method(&self, method_id: Uuid) -> Result<Option<PaymentMethod>, ServiceError> {
        Ok(self.state.read().await.methods.get(&method_id).cloned())
    }

    async fn list_methods(&self, owner_id: Uuid) -> Result<Vec<PaymentMethod>, ServiceError> {
        let state = self.state.read().await;
        let mut methods: Vec<_> = state.methods.values().filter(|m| m.owner_id == owner_id).cloned().collect();
        methods.sort_by(|a, b| b.is_default.cmp(&a.is_default).then(a.created_at.cmp(&b.created_at)));
        Ok(methods)
    }

    async fn default_method(&self, owner_id: Uuid) -> Result<Option<PaymentMethod>, ServiceError> {
        let state = self.state.read().await;
        Ok(state.default_method_id(owner_id).and_then(|id| state.methods.get(&id).cloned()))
    }

    async fn create_method(&self, method: &PaymentMethod) -> Result<PaymentMethod, ServiceError> {
        let mut state = self.state.write().await;
        let has_any = state.methods.values().any(|m| m.owner_id == method.owner_id);
        let is_default = method.is_default || !has_any;
        if is_default {
            for other in state.methods.values_mut().filter(|m| m.owner_id == method.owner_id) {
                other.is_default = false;
            }
        }
        let inserted = PaymentMethod {
            is_default,
            ..method.clone()
        };
        state.methods.insert(inserted.id, inserted.clone());
        Ok(inserted)
    }

    async fn set_default_method(
        &self,
        method_id: Uuid,
        owner_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<PaymentMethod, ServiceError> {
        let mut state = self.state.write().await;
        match state.methods.get(&method_id) {
            None => return Err(ServiceError::MethodNotFound(method_id)),
            Some(m) if m.owner_id != owner_id => return Err(ServiceError::NotOwner(owner_id)),
            Some(m) if m.is_default => return Ok(m.clone()),
            Some(_) => {}
        }
        for method in state.methods.values_mut().filter(|m| m.owner_id == owner_id) {
            let is_default = method.id == method_id;
            if method.is_default != is_default {
                method.is_default = is_default;
                method.updated_at = now;
            }
        }
        state.methods.get(&method_id).cloned().ok_or(ServiceError::MethodNotFound(method_id))
    }

    async fn delete_method(&self, method_id: Uuid, owner_id: Uuid) -> Result<(), ServiceError> {
        let mut state = self.state.write().await;
        let method = state.methods.get(&method_id).ok_or(ServiceError::MethodNotFound(method_id))?;
        if method.owner_id != owner_id {
            return Err(ServiceError::NotOwner(owner_id));
        }
        let in_use = state
            .payments
            .values()
            .any(|p| p.payment_method_id == Some(method_id) && !p.status.is_terminal())
            || state.obligations.values().any(|o| {
                o.payment_method_id == Some(method_id)
                    && matches!(
                        o.status,
                        ObligationStatus::Pending | ObligationStatus::Failed | ObligationStatus::ManualActionRequired
                    )
            });
        if in_use {
            return Err(ServiceError::MethodInUse(method_id));
        }
        state.methods.remove(&method_id);
        for payment in state.payments.values_mut().filter(|p| p.payment_method_id == Some(method_id)) {
            payment.payment_method_id = None;
        }
        Ok(())
    }
}
