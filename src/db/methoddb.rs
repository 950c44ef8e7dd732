// db/methoddb.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{db::DBClient, map_constraint, PaymentMethodExt};
use crate::{models::methodmodel::PaymentMethod, service::error::ServiceError};

#[async_trait]
impl PaymentMethodExt for DBClient {
    async fn get_method(&self, method_id: Uuid) -> Result<Option<PaymentMethod>, ServiceError> {
        let method = sqlx::query_as::<_, PaymentMethod>("SELECT * FROM payment_methods WHERE id = $1")
            .bind(method_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(method)
    }

    async fn list_methods(&self, owner_id: Uuid) -> Result<Vec<PaymentMethod>, ServiceError> {
        let methods = sqlx::query_as::<_, PaymentMethod>(
            "SELECT * FROM payment_methods WHERE owner_id = $1 ORDER BY is_default DESC, created_at",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(methods)
    }

    async fn default_method(&self, owner_id: Uuid) -> Result<Option<PaymentMethod>, ServiceError> {
        let method = sqlx::query_as::<_, PaymentMethod>(
            "SELECT * FROM payment_methods WHERE owner_id = $1 AND is_default",
        )
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(method)
    }

    async fn create_method(&self, method: &PaymentMethod) -> Result<PaymentMethod, ServiceError> {
        let mut tx = self.pool.begin().await?;

        let existing: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM payment_methods WHERE owner_id = $1 ORDER BY id FOR UPDATE",
        )
        .bind(method.owner_id)
        .fetch_all(&mut *tx)
        .await?;

        let is_default = method.is_default || existing.is_empty();
        if is_default && !existing.is_empty() {
            sqlx::query("UPDATE payment_methods SET is_default = false, updated_at = $2 WHERE owner_id = $1 AND is_default")
                .bind(method.owner_id)
                .bind(method.updated_at)
                .execute(&mut *tx)
                .await?;
        }

        let inserted = sqlx::query_as::<_, PaymentMethod>(
            r#"
            INSERT INTO payment_methods
            (id, owner_id, method_type, encrypted_account, account_hint, is_default, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(method.id)
        .bind(method.owner_id)
        .bind(method.method_type)
        .bind(&method.encrypted_account)
        .bind(&method.account_hint)
        .bind(is_default)
        .bind(method.created_at)
        .bind(method.updated_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            // two concurrent first inserts both claimed the default
            map_constraint(e, |name| (name == "payment_methods_single_default").then_some(ServiceError::ConcurrentModification))
        })?;

        tx.commit().await?;
        tracing::info!(method_id = %inserted.id, owner_id = %inserted.owner_id, is_default, "payment method added");
        Ok(inserted)
    }

    async fn set_default_method(
        &self,
        method_id: Uuid,
        owner_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<PaymentMethod, ServiceError> {
        let mut tx = self.pool.begin().await?;

        // every row of the owner, in a fixed order, so concurrent calls queue instead of deadlocking
        let methods = sqlx::query_as::<_, PaymentMethod>(
            "SELECT * FROM payment_methods WHERE owner_id = $1 ORDER BY id FOR UPDATE",
        )
        .bind(owner_id)
        .fetch_all(&mut *tx)
        .await?;

        let Some(target) = methods.iter().find(|m| m.id == method_id) else {
            let exists: Option<Uuid> = sqlx::query_scalar("SELECT owner_id FROM payment_methods WHERE id = $1")
                .bind(method_id)
                .fetch_optional(&mut *tx)
                .await?;
            return Err(match exists {
                Some(_) => ServiceError::NotOwner(owner_id),
                None => ServiceError::MethodNotFound(method_id),
            });
        };
        if target.is_default {
            return Ok(target.clone());
        }

        sqlx::query("UPDATE payment_methods SET is_default = false, updated_at = $2 WHERE owner_id = $1 AND is_default")
            .bind(owner_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        let updated = sqlx::query_as::<_, PaymentMethod>(
            r#"
            UPDATE payment_methods
            SET is_default = true, updated_at = $3
            WHERE id = $1 AND owner_id = $2
            RETURNING *
            "#,
        )
        .bind(method_id)
        .bind(owner_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!(%method_id, %owner_id, "default payment method changed");
        Ok(updated)
    }

    async fn delete_method(&self, method_id: Uuid, owner_id: Uuid) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await?;

        let method = sqlx::query_as::<_, PaymentMethod>("SELECT * FROM payment_methods WHERE id = $1 FOR UPDATE NOWAIT")
            .bind(method_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(ServiceError::MethodNotFound(method_id))?;
        if method.owner_id != owner_id {
            return Err(ServiceError::NotOwner(owner_id));
        }

        let in_use: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM payments
                WHERE payment_method_id = $1
                  AND status NOT IN ('completed', 'failed', 'refunded', 'cancelled')
            ) OR EXISTS (
                SELECT 1 FROM settlement_obligations
                WHERE payment_method_id = $1
                  AND status IN ('pending', 'failed', 'manual_action_required')
            )
            "#,
        )
        .bind(method_id)
        .fetch_one(&mut *tx)
        .await?;
        if in_use {
            return Err(ServiceError::MethodInUse(method_id));
        }

        sqlx::query("DELETE FROM payment_methods WHERE id = $1")
            .bind(method_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::info!(%method_id, %owner_id, "payment method deleted");
        Ok(())
    }
}
