// db/shiftdb.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use super::{
    db::{lock_application, lock_escrow, lock_shift, persist_plan, save_payment, DBClient},
    map_constraint, ApplicationTransition, ShiftApplicationExt,
};
use crate::{
    models::{
        escrowmodel::{dispute_for_application, unwind_for_withdrawal, EscrowCommand, EscrowTransaction, SettlementPlan, Unwind},
        paymentmodel::Payment,
        shiftmodel::{ApplicationChange, Shift, ShiftApplication},
    },
    service::error::ServiceError,
};

async fn save_application(
    conn: &mut PgConnection,
    application: &ShiftApplication,
) -> Result<ShiftApplication, ServiceError> {
    sqlx::query_as::<_, ShiftApplication>(
        r#"
        UPDATE shift_applications
        SET status = $2, decided_at = $3, checked_in_at = $4, checked_out_at = $5, completed_at = $6,
            rating_for_professional = $7, review_for_professional = $8,
            rating_for_facility = $9, review_for_facility = $10, updated_at = $11
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(application.id)
    .bind(application.status)
    .bind(application.decided_at)
    .bind(application.checked_in_at)
    .bind(application.checked_out_at)
    .bind(application.completed_at)
    .bind(application.rating_for_professional)
    .bind(&application.review_for_professional)
    .bind(application.rating_for_facility)
    .bind(&application.review_for_facility)
    .bind(application.updated_at)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| {
        map_constraint(e, |name| {
            (name == "shift_applications_single_engaged").then(|| ServiceError::ShiftAlreadyFilled(application.shift_id))
        })
    })
}

async fn save_shift(conn: &mut PgConnection, shift: &Shift) -> Result<Shift, ServiceError> {
    let saved = sqlx::query_as::<_, Shift>(
        "UPDATE shifts SET status = $2, updated_at = $3 WHERE id = $1 RETURNING *",
    )
    .bind(shift.id)
    .bind(shift.status)
    .bind(shift.updated_at)
    .fetch_one(&mut *conn)
    .await?;
    Ok(saved)
}

/// The application's non-terminal payment and its escrow, both row-locked.
async fn lock_active_payment(
    conn: &mut PgConnection,
    application_id: Uuid,
) -> Result<Option<(Payment, Option<EscrowTransaction>)>, ServiceError> {
    let payment = sqlx::query_as::<_, Payment>(
        r#"
        SELECT * FROM payments
        WHERE application_id = $1
          AND status NOT IN ('completed', 'failed', 'refunded', 'cancelled')
        FOR UPDATE NOWAIT
        "#,
    )
    .bind(application_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(payment) = payment else {
        return Ok(None);
    };

    let escrow = match payment.escrow_transaction_id {
        Some(escrow_id) => Some(lock_escrow(conn, escrow_id).await?),
        None => None,
    };
    Ok(Some((payment, escrow)))
}

async fn unwind_payment(
    conn: &mut PgConnection,
    application_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<Unwind>, ServiceError> {
    let Some((payment, escrow)) = lock_active_payment(conn, application_id).await? else {
        return Ok(None);
    };

    let unwind = match unwind_for_withdrawal(&payment, escrow.as_ref(), now)? {
        Unwind::CancelledPayment(cancelled) => Unwind::CancelledPayment(save_payment(conn, &cancelled).await?),
        Unwind::RefundedEscrow(plan) => Unwind::RefundedEscrow(persist_plan(conn, &plan).await?),
    };
    Ok(Some(unwind))
}

async fn dispute_escrow(
    conn: &mut PgConnection,
    application_id: Uuid,
    command: &EscrowCommand,
    now: DateTime<Utc>,
) -> Result<Option<SettlementPlan>, ServiceError> {
    let Some((payment, escrow)) = lock_active_payment(conn, application_id).await? else {
        return Ok(None);
    };
    match dispute_for_application(&payment, escrow.as_ref(), command, now)? {
        Some(plan) => Ok(Some(persist_plan(conn, &plan).await?)),
        None => Ok(None),
    }
}

#[async_trait]
impl ShiftApplicationExt for DBClient {
    async fn get_shift(&self, shift_id: Uuid) -> Result<Option<Shift>, ServiceError> {
        let shift = sqlx::query_as::<_, Shift>("SELECT * FROM shifts WHERE id = $1")
            .bind(shift_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(shift)
    }

    async fn get_application(&self, application_id: Uuid) -> Result<Option<ShiftApplication>, ServiceError> {
        let application = sqlx::query_as::<_, ShiftApplication>("SELECT * FROM shift_applications WHERE id = $1")
            .bind(application_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(application)
    }

    async fn list_applications_for_shift(&self, shift_id: Uuid) -> Result<Vec<ShiftApplication>, ServiceError> {
        let applications = sqlx::query_as::<_, ShiftApplication>(
            "SELECT * FROM shift_applications WHERE shift_id = $1 ORDER BY applied_at",
        )
        .bind(shift_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(applications)
    }

    async fn create_application(
        &self,
        shift_id: Uuid,
        professional_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ShiftApplication, ServiceError> {
        let mut tx = self.pool.begin().await?;

        // shared lock: an accept in flight holds FOR UPDATE and makes this fail fast
        let shift = sqlx::query_as::<_, Shift>("SELECT * FROM shifts WHERE id = $1 FOR SHARE NOWAIT")
            .bind(shift_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(ServiceError::ShiftNotFound(shift_id))?;

        let application = ShiftApplication::new(&shift, professional_id, now)?;

        let inserted = sqlx::query_as::<_, ShiftApplication>(
            r#"
            INSERT INTO shift_applications (id, shift_id, professional_id, status, applied_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(application.id)
        .bind(application.shift_id)
        .bind(application.professional_id)
        .bind(application.status)
        .bind(application.applied_at)
        .bind(application.updated_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            map_constraint(e, |name| {
                (name == "shift_applications_live_pair").then(|| ServiceError::DuplicateApplication(shift_id))
            })
        })?;

        tx.commit().await?;
        tracing::info!(application_id = %inserted.id, %shift_id, %professional_id, "application created");
        Ok(inserted)
    }

    async fn change_application(
        &self,
        application_id: Uuid,
        change: &ApplicationChange,
        now: DateTime<Utc>,
    ) -> Result<ApplicationTransition, ServiceError> {
        let mut tx = self.pool.begin().await?;

        let current = lock_application(&mut tx, application_id).await?;
        let shift = lock_shift(&mut tx, current.shift_id).await?;
        let update = current.apply_change(&shift, change, now)?;

        let application = save_application(&mut tx, &update.application).await?;
        let shift = match &update.shift {
            Some(shift) => Some(save_shift(&mut tx, shift).await?),
            None => None,
        };
        let unwound = if update.unwind_payment {
            unwind_payment(&mut tx, application_id, now).await?
        } else {
            None
        };
        let disputed = match &update.escrow_dispute {
            Some(command) => dispute_escrow(&mut tx, application_id, command, now).await?,
            None => None,
        };

        tx.commit().await?;

        Ok(ApplicationTransition {
            application,
            shift,
            unwound,
            disputed,
        })
    }

    async fn checked_out_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ShiftApplication>, ServiceError> {
        let applications = sqlx::query_as::<_, ShiftApplication>(
            r#"
            SELECT * FROM shift_applications
            WHERE status = 'checked_out' AND checked_out_at <= $1
            ORDER BY checked_out_at
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(applications)
    }
}
