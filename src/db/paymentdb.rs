// db/paymentdb.rs
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    db::{insert_issue, lock_application, lock_payment, save_payment, DBClient},
    map_constraint, CaptureOutcome, PaymentExt,
};
use crate::{
    models::{
        escrowmodel::{EscrowTransaction, IntegrityIssue},
        paymentmodel::{CaptureDecision, Money, Payment, PaymentChange},
        shiftmodel::Shift,
    },
    service::error::ServiceError,
};

#[async_trait]
impl PaymentExt for DBClient {
    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<Payment>, ServiceError> {
        let payment = sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1")
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(payment)
    }

    async fn get_payment_by_charge(&self, charge_id: &str) -> Result<Option<Payment>, ServiceError> {
        let payment = sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE gateway_charge_id = $1")
            .bind(charge_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(payment)
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
        let mut tx = self.pool.begin().await?;

        let application = lock_application(&mut tx, application_id).await?;
        let shift = sqlx::query_as::<_, Shift>("SELECT * FROM shifts WHERE id = $1")
            .bind(application.shift_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(ServiceError::ShiftNotFound(application.shift_id))?;

        let active: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM payments
            WHERE application_id = $1
              AND status NOT IN ('completed', 'failed', 'refunded', 'cancelled')
            "#,
        )
        .bind(application_id)
        .fetch_optional(&mut *tx)
        .await?;
        if active.is_some() {
            return Err(ServiceError::DuplicateActivePayment(application_id));
        }

        let payment = Payment::new(&application, &shift, payer_id, money, transaction_fee, payment_method_id, now)?;

        let inserted = sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO payments
            (id, application_id, payer_id, payee_id, payment_method_id, amount, currency,
             transaction_fee, status, notes, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING *
            "#,
        )
        .bind(payment.id)
        .bind(payment.application_id)
        .bind(payment.payer_id)
        .bind(payment.payee_id)
        .bind(payment.payment_method_id)
        .bind(&payment.amount)
        .bind(&payment.currency)
        .bind(&payment.transaction_fee)
        .bind(payment.status)
        .bind(&payment.notes)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            map_constraint(e, |name| {
                (name == "payments_single_active").then(|| ServiceError::DuplicateActivePayment(application_id))
            })
        })?;

        tx.commit().await?;
        Ok(inserted)
    }

    async fn change_payment(
        &self,
        payment_id: Uuid,
        change: &PaymentChange,
        now: DateTime<Utc>,
    ) -> Result<Payment, ServiceError> {
        let mut tx = self.pool.begin().await?;

        let current = lock_payment(&mut tx, payment_id).await?;
        let next = current.apply_change(change, now)?;
        let saved = save_payment(&mut tx, &next).await.map_err(|e| match e {
            ServiceError::Database(err) => map_constraint(err, |name| {
                (name == "payments_gateway_charge").then(|| ServiceError::IntegrityViolation {
                    entity: "payment",
                    id: payment_id,
                    details: "gateway charge already bound to another payment".to_string(),
                })
            }),
            other => other,
        })?;

        tx.commit().await?;
        tracing::info!(%payment_id, status = saved.status.to_str(), "payment updated");
        Ok(saved)
    }

    async fn capture_payment(
        &self,
        payment_id: Uuid,
        external_reference: &str,
        now: DateTime<Utc>,
    ) -> Result<CaptureOutcome, ServiceError> {
        let mut tx = self.pool.begin().await?;

        let current = lock_payment(&mut tx, payment_id).await?;
        let outcome = match current.capture(external_reference, now) {
            CaptureDecision::AlreadyCaptured => CaptureOutcome::AlreadyCaptured { payment: current },
            CaptureDecision::Capture(captured) => {
                let shift_id: Uuid = sqlx::query_scalar("SELECT shift_id FROM shift_applications WHERE id = $1")
                    .bind(captured.application_id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or(ServiceError::ApplicationNotFound(captured.application_id))?;

                let escrow = EscrowTransaction::fund(&captured, shift_id, now);
                let escrow = sqlx::query_as::<_, EscrowTransaction>(
                    r#"
                    INSERT INTO escrow_transactions
                    (id, payment_id, shift_id, facility_id, professional_id, held_amount, currency,
                     status, funded_at, notes)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                    RETURNING *
                    "#,
                )
                .bind(escrow.id)
                .bind(escrow.payment_id)
                .bind(escrow.shift_id)
                .bind(escrow.facility_id)
                .bind(escrow.professional_id)
                .bind(&escrow.held_amount)
                .bind(&escrow.currency)
                .bind(escrow.status)
                .bind(escrow.funded_at)
                .bind(&escrow.notes)
                .fetch_one(&mut *tx)
                .await?;

                let linked = captured.link_escrow(escrow.id, now)?;
                let payment = save_payment(&mut tx, &linked).await.map_err(|e| match e {
                    ServiceError::Database(err) => map_constraint(err, |name| {
                        (name == "payments_external_reference").then(|| ServiceError::IntegrityViolation {
                            entity: "payment",
                            id: payment_id,
                            details: format!("external reference {} already used", external_reference),
                        })
                    }),
                    other => other,
                })?;
                tracing::info!(%payment_id, escrow_id = %escrow.id, external_reference, "payment captured into escrow");
                CaptureOutcome::Captured { payment, escrow }
            }
            CaptureDecision::Quarantine(kind, details) => {
                let issue = IntegrityIssue::new(kind, payment_id, details, now);
                insert_issue(&mut tx, &issue).await?;
                tracing::error!(%payment_id, ?kind, details = %issue.details, "capture quarantined");
                CaptureOutcome::Quarantined { payment: current, issue }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }
}
