//! User directory
//!
//! Lookup and status mutation over the `users` table. The billing core
//! only touches `account_status`, `has_consumed_initial_trial`, and the
//! provider customer mapping; everything else about users is owned
//! elsewhere.

use sqlx::PgPool;
use uuid::Uuid;

use ledgerd_shared::{AccountStatus, User};

use crate::error::{BillingError, BillingResult};

#[derive(Clone)]
pub struct UserDirectory {
    pool: PgPool,
}

impl UserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_user(&self, user_id: Uuid) -> BillingResult<User> {
        let user: Option<User> = sqlx::query_as(
            r#"
            SELECT id, email, account_status, has_consumed_initial_trial,
                   stripe_customer_id, created_at, updated_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        user.ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))
    }

    pub async fn get_user_by_stripe_customer_id(&self, customer_id: &str) -> BillingResult<User> {
        let user: Option<User> = sqlx::query_as(
            r#"
            SELECT id, email, account_status, has_consumed_initial_trial,
                   stripe_customer_id, created_at, updated_at
            FROM users
            WHERE stripe_customer_id = $1
            "#,
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        user.ok_or_else(|| BillingError::UserNotFound(customer_id.to_string()))
    }

    pub async fn set_account_status(
        &self,
        user_id: Uuid,
        status: AccountStatus,
    ) -> BillingResult<()> {
        sqlx::query("UPDATE users SET account_status = $1, updated_at = NOW() WHERE id = $2")
            .bind(status.as_str())
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        tracing::info!(user_id = %user_id, status = %status, "Account status updated");
        Ok(())
    }

    pub async fn mark_trial_consumed(&self, user_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            "UPDATE users SET has_consumed_initial_trial = TRUE, updated_at = NOW() WHERE id = $1",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
