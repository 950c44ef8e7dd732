// db/db.rs
use sqlx::{PgConnection, Pool, Postgres};
use uuid::Uuid;

use crate::{
    models::{
        escrowmodel::{EscrowTransaction, IntegrityIssue, SettlementObligation, SettlementPlan},
        paymentmodel::Payment,
        shiftmodel::{Shift, ShiftApplication},
    },
    service::error::ServiceError,
};

#[derive(Clone)]
pub struct DBClient {
    pub pool: Pool<Postgres>,
}

impl std::fmt::Debug for DBClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DBClient")
            .field("pool", &"Pool<Postgres>")
            .finish()
    }
}

impl DBClient {
    pub fn new(pool: Pool<Postgres>) -> Self {
        DBClient { pool }
    }
}

// Row locks. NOWAIT turns a busy row into 55P03, which surfaces as
// ConcurrentModification instead of queueing behind the other writer.

pub(super) async fn lock_shift(conn: &mut PgConnection, shift_id: Uuid) -> Result<Shift, ServiceError> {
    sqlx::query_as::<_, Shift>("SELECT * FROM shifts WHERE id = $1 FOR UPDATE NOWAIT")
        .bind(shift_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(ServiceError::ShiftNotFound(shift_id))
}

pub(super) async fn lock_application(
    conn: &mut PgConnection,
    application_id: Uuid,
) -> Result<ShiftApplication, ServiceError> {
    sqlx::query_as::<_, ShiftApplication>("SELECT * FROM shift_applications WHERE id = $1 FOR UPDATE NOWAIT")
        .bind(application_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(ServiceError::ApplicationNotFound(application_id))
}

pub(super) async fn lock_payment(conn: &mut PgConnection, payment_id: Uuid) -> Result<Payment, ServiceError> {
    sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1 FOR UPDATE NOWAIT")
        .bind(payment_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(ServiceError::PaymentNotFound(payment_id))
}

pub(super) async fn lock_escrow(conn: &mut PgConnection, escrow_id: Uuid) -> Result<EscrowTransaction, ServiceError> {
    sqlx::query_as::<_, EscrowTransaction>("SELECT * FROM escrow_transactions WHERE id = $1 FOR UPDATE NOWAIT")
        .bind(escrow_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(ServiceError::EscrowNotFound(escrow_id))
}

pub(super) async fn save_payment(conn: &mut PgConnection, payment: &Payment) -> Result<Payment, ServiceError> {
    let saved = sqlx::query_as::<_, Payment>(
        r#"
        UPDATE payments
        SET payment_method_id = $2, status = $3, gateway_charge_id = $4, approval_url = $5,
            external_reference = $6, escrow_transaction_id = $7, failure_reason = $8,
            notes = $9, captured_at = $10, updated_at = $11
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(payment.id)
    .bind(payment.payment_method_id)
    .bind(payment.status)
    .bind(&payment.gateway_charge_id)
    .bind(&payment.approval_url)
    .bind(&payment.external_reference)
    .bind(payment.escrow_transaction_id)
    .bind(&payment.failure_reason)
    .bind(&payment.notes)
    .bind(payment.captured_at)
    .bind(payment.updated_at)
    .fetch_one(&mut *conn)
    .await?;
    Ok(saved)
}

pub(super) async fn save_escrow(
    conn: &mut PgConnection,
    escrow: &EscrowTransaction,
) -> Result<EscrowTransaction, ServiceError> {
    // held_amount is fixed at funding and never written here
    let saved = sqlx::query_as::<_, EscrowTransaction>(
        r#"
        UPDATE escrow_transactions
        SET status = $2, release_conditions_met_at = $3, released_at = $4,
            dispute_opened_at = $5, closed_at = $6, notes = $7
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(escrow.id)
    .bind(escrow.status)
    .bind(escrow.release_conditions_met_at)
    .bind(escrow.released_at)
    .bind(escrow.dispute_opened_at)
    .bind(escrow.closed_at)
    .bind(&escrow.notes)
    .fetch_one(&mut *conn)
    .await?;
    Ok(saved)
}

pub(super) async fn insert_obligation(
    conn: &mut PgConnection,
    obligation: &SettlementObligation,
) -> Result<SettlementObligation, ServiceError> {
    let inserted = sqlx::query_as::<_, SettlementObligation>(
        r#"
        INSERT INTO settlement_obligations
        (id, escrow_id, payment_id, kind, beneficiary_id, payment_method_id, amount, currency,
         status, attempts, last_error, external_reference, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        RETURNING *
        "#,
    )
    .bind(obligation.id)
    .bind(obligation.escrow_id)
    .bind(obligation.payment_id)
    .bind(obligation.kind)
    .bind(obligation.beneficiary_id)
    .bind(obligation.payment_method_id)
    .bind(&obligation.amount)
    .bind(&obligation.currency)
    .bind(obligation.status)
    .bind(obligation.attempts)
    .bind(&obligation.last_error)
    .bind(&obligation.external_reference)
    .bind(obligation.created_at)
    .bind(obligation.updated_at)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| {
        super::map_constraint(e, |name| {
            (name == "settlement_obligations_one_per_kind").then(|| ServiceError::IntegrityViolation {
                entity: "escrow",
                id: obligation.escrow_id,
                details: format!("{:?} obligation already recorded", obligation.kind),
            })
        })
    })?;
    Ok(inserted)
}

pub(super) async fn insert_issue(conn: &mut PgConnection, issue: &IntegrityIssue) -> Result<(), ServiceError> {
    sqlx::query(
        r#"
        INSERT INTO integrity_issues (id, kind, entity_id, details, created_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (kind, entity_id) WHERE resolved_at IS NULL DO NOTHING
        "#,
    )
    .bind(issue.id)
    .bind(issue.kind)
    .bind(issue.entity_id)
    .bind(&issue.details)
    .bind(issue.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Writes every row of a settlement plan on the caller's transaction.
pub(super) async fn persist_plan(conn: &mut PgConnection, plan: &SettlementPlan) -> Result<SettlementPlan, ServiceError> {
    let escrow = save_escrow(conn, &plan.escrow).await?;
    let payment = match &plan.payment {
        Some(payment) => Some(save_payment(conn, payment).await?),
        None => None,
    };
    let obligation = match &plan.obligation {
        Some(obligation) => Some(insert_obligation(conn, obligation).await?),
        None => None,
    };
    if let Some(issue) = &plan.issue {
        insert_issue(conn, issue).await?;
    }
    Ok(SettlementPlan {
        escrow,
        payment,
        obligation,
        issue: plan.issue.clone(),
    })
}
