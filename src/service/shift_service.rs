// service/shift_service.rs
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::{
    db::{ApplicationTransition, SettlementStore},
    models::{
        escrowmodel::Unwind,
        shiftmodel::{ApplicationChange, ApplicationStatus, ShiftApplication},
        usermodel::{Actor, UserRole},
    },
    service::{
        error::ServiceError,
        escrow_service::EscrowService,
        notification_service::{NotificationService, SettlementEvent},
    },
};

/// Drives shift applications from apply to completion and hands completed
/// work to the escrow ledger.
pub struct ShiftService {
    store: Arc<dyn SettlementStore>,
    escrow_service: Arc<EscrowService>,
    notifications: Arc<NotificationService>,
    withdrawal_window: Duration,
    auto_complete_grace: Duration,
}

impl std::fmt::Debug for ShiftService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShiftService")
            .field("withdrawal_window", &self.withdrawal_window)
            .field("auto_complete_grace", &self.auto_complete_grace)
            .finish()
    }
}

impl ShiftService {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        escrow_service: Arc<EscrowService>,
        notifications: Arc<NotificationService>,
        withdrawal_window: Duration,
        auto_complete_grace: Duration,
    ) -> Self {
        Self {
            store,
            escrow_service,
            notifications,
            withdrawal_window,
            auto_complete_grace,
        }
    }

    fn published(&self, application: ShiftApplication) -> ShiftApplication {
        self.notifications.publish(SettlementEvent::ApplicationChanged {
            application_id: application.id,
            shift_id: application.shift_id,
            professional_id: application.professional_id,
            status: application.status,
        });
        application
    }

    async fn change(&self, application_id: Uuid, change: ApplicationChange) -> Result<ApplicationTransition, ServiceError> {
        let transition = self.store.change_application(application_id, &change, Utc::now()).await?;
        tracing::info!(
            %application_id,
            action = change.action(),
            status = transition.application.status.to_str(),
            "application transition committed"
        );
        Ok(transition)
    }

    pub async fn get_application(&self, application_id: Uuid, actor: &Actor) -> Result<ShiftApplication, ServiceError> {
        let application = self
            .store
            .get_application(application_id)
            .await?
            .ok_or(ServiceError::ApplicationNotFound(application_id))?;
        if actor.is_admin() || actor.is_user(application.professional_id) {
            return Ok(application);
        }
        let shift = self
            .store
            .get_shift(application.shift_id)
            .await?
            .ok_or(ServiceError::ShiftNotFound(application.shift_id))?;
        if !actor.is_user(shift.facility_id) {
            return Err(ServiceError::NotOwner(actor.user_id().unwrap_or_default()));
        }
        Ok(application)
    }

    pub async fn list_for_shift(&self, shift_id: Uuid, actor: &Actor) -> Result<Vec<ShiftApplication>, ServiceError> {
        let shift = self
            .store
            .get_shift(shift_id)
            .await?
            .ok_or(ServiceError::ShiftNotFound(shift_id))?;
        if !actor.is_admin() && !actor.is_user(shift.facility_id) {
            return Err(ServiceError::NotOwner(actor.user_id().unwrap_or_default()));
        }
        self.store.list_applications_for_shift(shift_id).await
    }

    pub async fn apply(&self, shift_id: Uuid, actor: &Actor) -> Result<ShiftApplication, ServiceError> {
        let professional_id = actor.require_role(UserRole::Professional)?;
        let application = self.store.create_application(shift_id, professional_id, Utc::now()).await?;
        tracing::info!(application_id = %application.id, %shift_id, %professional_id, "applied to shift");
        Ok(self.published(application))
    }

    /// Accepts the application and fills the shift in one transaction.
    pub async fn accept(&self, application_id: Uuid, actor: &Actor) -> Result<ShiftApplication, ServiceError> {
        let facility_id = actor.require_role(UserRole::Facility)?;
        let transition = self.change(application_id, ApplicationChange::Accept { facility_id }).await?;
        Ok(self.published(transition.application))
    }

    pub async fn reject(&self, application_id: Uuid, actor: &Actor) -> Result<ShiftApplication, ServiceError> {
        let facility_id = actor.require_role(UserRole::Facility)?;
        let transition = self.change(application_id, ApplicationChange::Reject { facility_id }).await?;
        Ok(self.published(transition.application))
    }

    /// Withdrawing after acceptance re-opens the shift and unwinds the
    /// payment in the same transaction.
    pub async fn withdraw(&self, application_id: Uuid, actor: &Actor) -> Result<ShiftApplication, ServiceError> {
        let professional_id = actor.require_role(UserRole::Professional)?;
        let change = ApplicationChange::Withdraw {
            professional_id,
            window: self.withdrawal_window,
        };
        let transition = self.change(application_id, change).await?;

        match transition.unwound {
            Some(Unwind::CancelledPayment(payment)) => {
                tracing::info!(payment_id = %payment.id, %application_id, "pending payment cancelled by withdrawal");
                self.notifications.publish(SettlementEvent::PaymentChanged {
                    payment_id: payment.id,
                    application_id: payment.application_id,
                    payer_id: payment.payer_id,
                    status: payment.status,
                });
            }
            Some(Unwind::RefundedEscrow(plan)) => {
                tracing::info!(escrow_id = %plan.escrow.id, %application_id, "escrow refunded by withdrawal");
                self.escrow_service.after_commit(plan).await;
            }
            None => {}
        }
        Ok(self.published(transition.application))
    }

    pub async fn check_in(&self, application_id: Uuid, actor: &Actor) -> Result<ShiftApplication, ServiceError> {
        let professional_id = actor.require_role(UserRole::Professional)?;
        let transition = self.change(application_id, ApplicationChange::CheckIn { professional_id }).await?;
        Ok(self.published(transition.application))
    }

    pub async fn check_out(&self, application_id: Uuid, actor: &Actor) -> Result<ShiftApplication, ServiceError> {
        let professional_id = actor.require_role(UserRole::Professional)?;
        let transition = self.change(application_id, ApplicationChange::CheckOut { professional_id }).await?;
        Ok(self.published(transition.application))
    }

    /// Facility owner or admin confirms the work. Notifies the escrow ledger
    /// after commit; the reconciliation sweep repeats the notification if
    /// this one fails.
    pub async fn confirm_completion(&self, application_id: Uuid, actor: &Actor) -> Result<ShiftApplication, ServiceError> {
        let transition = self
            .change(application_id, ApplicationChange::ConfirmCompletion { actor: *actor })
            .await?;
        self.completed(&transition.application).await;
        Ok(self.published(transition.application))
    }

    async fn completed(&self, application: &ShiftApplication) {
        if let Err(err) = self.escrow_service.shift_completed(application.id).await {
            tracing::warn!(application_id = %application.id, error = %err, "escrow not notified of completion");
        }
    }

    /// Marks the application disputed and, when the money is still held,
    /// disputes the escrow in the same transaction. Either both move or
    /// neither does.
    pub async fn file_dispute(
        &self,
        application_id: Uuid,
        actor: &Actor,
        reason: &str,
    ) -> Result<ShiftApplication, ServiceError> {
        let change = ApplicationChange::FileDispute {
            actor: *actor,
            reason: reason.to_string(),
        };
        let transition = self.change(application_id, change).await?;

        if let Some(plan) = transition.disputed {
            tracing::info!(escrow_id = %plan.escrow.id, %application_id, "escrow disputed with application");
            self.escrow_service.after_commit(plan).await;
        }
        Ok(self.published(transition.application))
    }

    pub async fn submit_review(
        &self,
        application_id: Uuid,
        actor: &Actor,
        rating: i16,
        text: Option<String>,
    ) -> Result<ShiftApplication, ServiceError> {
        let change = ApplicationChange::Review {
            actor: *actor,
            rating,
            text: text.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
        };
        let transition = self.change(application_id, change).await?;
        Ok(transition.application)
    }

    /// Completes applications checked out longer than the grace period ago.
    /// Rows another caller moved in the meantime are skipped.
    pub async fn auto_complete_overdue(&self, now: DateTime<Utc>) -> Result<Vec<ShiftApplication>, ServiceError> {
        let due = self.store.checked_out_before(now - self.auto_complete_grace).await?;
        let mut completed = Vec::with_capacity(due.len());

        for application in due {
            let change = ApplicationChange::AutoComplete {
                grace: self.auto_complete_grace,
            };
            match self.store.change_application(application.id, &change, now).await {
                Ok(transition) if transition.application.status == ApplicationStatus::Completed => {
                    tracing::info!(application_id = %application.id, "application auto-completed");
                    self.completed(&transition.application).await;
                    completed.push(self.published(transition.application));
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(application_id = %application.id, error = %err, "auto-complete skipped");
                }
            }
        }
        Ok(completed)
    }
}
