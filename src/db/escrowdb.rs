// db/escrowdb.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    db::{insert_issue, lock_escrow, lock_payment, persist_plan, DBClient},
    EscrowExt, IntegrityExt, ObligationExt,
};
use crate::{
    models::{
        escrowmodel::{
            EscrowCommand, EscrowTransaction, IntegrityIssue, ObligationAttempt, SettlementObligation, SettlementPlan,
        },
        shiftmodel::ApplicationStatus,
    },
    service::error::ServiceError,
};

#[async_trait]
impl EscrowExt for DBClient {
    async fn get_escrow(&self, escrow_id: Uuid) -> Result<Option<EscrowTransaction>, ServiceError> {
        let escrow = sqlx::query_as::<_, EscrowTransaction>("SELECT * FROM escrow_transactions WHERE id = $1")
            .bind(escrow_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(escrow)
    }

    async fn escrow_for_application(&self, application_id: Uuid) -> Result<Option<EscrowTransaction>, ServiceError> {
        let escrow = sqlx::query_as::<_, EscrowTransaction>(
            r#"
            SELECT e.* FROM escrow_transactions e
            JOIN payments p ON p.id = e.payment_id
            WHERE p.application_id = $1
            ORDER BY e.funded_at DESC
            LIMIT 1
            "#,
        )
        .bind(application_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(escrow)
    }

    async fn apply_escrow_command(
        &self,
        escrow_id: Uuid,
        command: &EscrowCommand,
        now: DateTime<Utc>,
    ) -> Result<Option<SettlementPlan>, ServiceError> {
        let mut tx = self.pool.begin().await?;

        let escrow = lock_escrow(&mut tx, escrow_id).await?;
        let payment = lock_payment(&mut tx, escrow.payment_id).await?;
        // shared lock so a dispute or withdrawal cannot move the application underneath the plan
        let application: ApplicationStatus =
            sqlx::query_scalar("SELECT status FROM shift_applications WHERE id = $1 FOR SHARE NOWAIT")
                .bind(payment.application_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(ServiceError::ApplicationNotFound(payment.application_id))?;
        let payout_method: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM payment_methods WHERE owner_id = $1 AND is_default",
        )
        .bind(escrow.professional_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(plan) = escrow.plan(&payment, application, command, payout_method, now)? else {
            // idempotent repeat; nothing written
            return Ok(None);
        };
        let persisted = persist_plan(&mut tx, &plan).await?;

        tx.commit().await?;
        tracing::info!(
            %escrow_id,
            from = escrow.status.to_str(),
            to = persisted.escrow.status.to_str(),
            "escrow transition committed"
        );
        Ok(Some(persisted))
    }

    async fn funded_escrows_for_completed_applications(&self) -> Result<Vec<EscrowTransaction>, ServiceError> {
        let escrows = sqlx::query_as::<_, EscrowTransaction>(
            r#"
            SELECT e.* FROM escrow_transactions e
            JOIN payments p ON p.id = e.payment_id
            JOIN shift_applications a ON a.id = p.application_id
            WHERE e.status = 'funded' AND a.status = 'completed'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(escrows)
    }

    async fn undisputed_escrows_for_disputed_applications(&self) -> Result<Vec<EscrowTransaction>, ServiceError> {
        let escrows = sqlx::query_as::<_, EscrowTransaction>(
            r#"
            SELECT e.* FROM escrow_transactions e
            JOIN payments p ON p.id = e.payment_id
            JOIN shift_applications a ON a.id = p.application_id
            WHERE e.status IN ('funded', 'pending_release') AND a.status = 'disputed'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(escrows)
    }

    async fn orphaned_escrows(&self) -> Result<Vec<EscrowTransaction>, ServiceError> {
        let escrows = sqlx::query_as::<_, EscrowTransaction>(
            r#"
            SELECT e.* FROM escrow_transactions e
            LEFT JOIN payments p ON p.id = e.payment_id AND p.escrow_transaction_id = e.id
            WHERE p.id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(escrows)
    }
}

#[async_trait]
impl ObligationExt for DBClient {
    async fn get_obligation(&self, obligation_id: Uuid) -> Result<Option<SettlementObligation>, ServiceError> {
        let obligation = sqlx::query_as::<_, SettlementObligation>("SELECT * FROM settlement_obligations WHERE id = $1")
            .bind(obligation_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(obligation)
    }

    async fn obligations_for_escrow(&self, escrow_id: Uuid) -> Result<Vec<SettlementObligation>, ServiceError> {
        let obligations = sqlx::query_as::<_, SettlementObligation>(
            "SELECT * FROM settlement_obligations WHERE escrow_id = $1 ORDER BY created_at",
        )
        .bind(escrow_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(obligations)
    }

    async fn outstanding_obligations(&self, limit: i64) -> Result<Vec<SettlementObligation>, ServiceError> {
        let obligations = sqlx::query_as::<_, SettlementObligation>(
            r#"
            SELECT * FROM settlement_obligations
            WHERE status IN ('pending', 'failed', 'awaiting_method')
            ORDER BY updated_at
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(obligations)
    }

    async fn record_obligation_attempt(
        &self,
        obligation_id: Uuid,
        attempt: &ObligationAttempt,
        now: DateTime<Utc>,
    ) -> Result<SettlementObligation, ServiceError> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, SettlementObligation>(
            "SELECT * FROM settlement_obligations WHERE id = $1 FOR UPDATE NOWAIT",
        )
        .bind(obligation_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(ServiceError::ObligationNotFound(obligation_id))?;

        let next = current.record_attempt(attempt, now)?;
        let saved = sqlx::query_as::<_, SettlementObligation>(
            r#"
            UPDATE settlement_obligations
            SET status = $2, attempts = $3, last_error = $4, external_reference = $5,
                payment_method_id = $6, updated_at = $7
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(next.id)
        .bind(next.status)
        .bind(next.attempts)
        .bind(&next.last_error)
        .bind(&next.external_reference)
        .bind(next.payment_method_id)
        .bind(next.updated_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(saved)
    }
}

#[async_trait]
impl IntegrityExt for DBClient {
    async fn quarantine(&self, issue: &IntegrityIssue) -> Result<(), ServiceError> {
        let mut conn = self.pool.acquire().await?;
        insert_issue(&mut conn, issue).await
    }

    async fn open_integrity_issues(&self) -> Result<Vec<IntegrityIssue>, ServiceError> {
        let issues = sqlx::query_as::<_, IntegrityIssue>(
            "SELECT * FROM integrity_issues WHERE resolved_at IS NULL ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(issues)
    }

    async fn resolve_integrity_issue(&self, issue_id: Uuid, now: DateTime<Utc>) -> Result<IntegrityIssue, ServiceError> {
        sqlx::query_as::<_, IntegrityIssue>(
            "UPDATE integrity_issues SET resolved_at = $2 WHERE id = $1 AND resolved_at IS NULL RETURNING *",
        )
        .bind(issue_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ServiceError::Validation(format!("integrity issue {} is not open", issue_id)))
    }
}
