//! Credit Ledger
//!
//! Owns per-user credit balances and the append-only transaction log.
//! Every balance mutation happens inside one database transaction that
//! updates the account row and appends exactly one transaction row; the
//! account row is locked with `SELECT ... FOR UPDATE` so concurrent
//! add/spend calls for the same user serialize. The balance is always
//! the sum of the signed transaction amounts and never goes negative.

use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use ledgerd_shared::{CreditAccount, CreditTransaction, TransactionType};

use crate::error::{is_foreign_key_violation, is_unique_violation, BillingError, BillingResult};

/// Parameters for a ledger credit
#[derive(Debug, Clone)]
pub struct AddCreditsParams {
    pub user_id: Uuid,
    pub amount: Decimal,
    pub transaction_type: TransactionType,
    pub reference_id: Option<String>,
    pub description: String,
    pub plan_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
}

impl AddCreditsParams {
    pub fn new(user_id: Uuid, amount: Decimal, transaction_type: TransactionType) -> Self {
        Self {
            user_id,
            amount,
            transaction_type,
            reference_id: None,
            description: String::new(),
            plan_id: None,
            subscription_id: None,
        }
    }

    pub fn reference(mut self, reference_id: impl Into<String>) -> Self {
        self.reference_id = Some(reference_id.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn plan(mut self, plan_id: Uuid) -> Self {
        self.plan_id = Some(plan_id);
        self
    }

    pub fn subscription(mut self, subscription_id: Uuid) -> Self {
        self.subscription_id = Some(subscription_id);
        self
    }
}

/// One page of ledger history
#[derive(Debug, Clone)]
pub struct TransactionHistory {
    pub transactions: Vec<CreditTransaction>,
    pub total_count: i64,
    /// Current balance snapshot; callers annotate each entry with this
    /// rather than a balance-at-transaction-time.
    pub balance: Decimal,
}

#[derive(Clone)]
pub struct CreditLedger {
    pool: PgPool,
}

impl CreditLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Return the user's account, creating a zero-balance one on first
    /// access. Safe to call repeatedly and concurrently. An unknown user
    /// surfaces as `UserNotFound`, not a raw constraint error.
    pub async fn get_or_create_account(&self, user_id: Uuid) -> BillingResult<CreditAccount> {
        sqlx::query("INSERT INTO credit_accounts (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::map_account_error(e, user_id))?;

        let account: CreditAccount = sqlx::query_as(
            "SELECT user_id, balance, updated_at FROM credit_accounts WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(account)
    }

    /// Credit the account, appending one transaction row atomically with
    /// the balance update.
    pub async fn add(&self, params: AddCreditsParams) -> BillingResult<CreditTransaction> {
        if params.amount <= Decimal::ZERO {
            return Err(BillingError::InvalidAmount(format!(
                "credit amount must be positive, got {}",
                params.amount
            )));
        }

        let mut tx = self.pool.begin().await?;

        let balance = Self::lock_account(&mut tx, params.user_id).await?;
        let new_balance = balance + params.amount;

        sqlx::query(
            "UPDATE credit_accounts SET balance = $1, updated_at = NOW() WHERE user_id = $2",
        )
        .bind(new_balance)
        .bind(params.user_id)
        .execute(&mut *tx)
        .await?;

        // The unique index on reference_id is the authoritative replay
        // guard; a duplicate insert rolls the whole transaction back.
        let transaction: CreditTransaction = sqlx::query_as(
            r#"
            INSERT INTO credit_transactions
                (account_id, amount, transaction_type, reference_id, description,
                 plan_id, subscription_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, account_id, amount, transaction_type, reference_id,
                      description, plan_id, subscription_id, created_at
            "#,
        )
        .bind(params.user_id)
        .bind(params.amount)
        .bind(params.transaction_type.as_str())
        .bind(&params.reference_id)
        .bind(&params.description)
        .bind(params.plan_id)
        .bind(params.subscription_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Self::map_reference_error(e, params.reference_id.as_deref()))?;

        tx.commit().await?;

        tracing::info!(
            user_id = %params.user_id,
            amount = %params.amount,
            transaction_type = %params.transaction_type,
            new_balance = %new_balance,
            "Credits added"
        );

        Ok(transaction)
    }

    /// Debit the account. The balance check and decrement run under the
    /// same row lock, so two spends racing for the last credits cannot
    /// both pass a stale check.
    pub async fn spend(
        &self,
        user_id: Uuid,
        amount: Decimal,
        reference_id: Option<String>,
        description: &str,
    ) -> BillingResult<CreditTransaction> {
        if amount <= Decimal::ZERO {
            return Err(BillingError::InvalidAmount(format!(
                "spend amount must be positive, got {}",
                amount
            )));
        }

        let mut tx = self.pool.begin().await?;

        let balance = Self::lock_account(&mut tx, user_id).await?;
        if balance < amount {
            return Err(BillingError::InsufficientCredits {
                available: balance,
                requested: amount,
            });
        }

        let new_balance = balance - amount;

        sqlx::query(
            "UPDATE credit_accounts SET balance = $1, updated_at = NOW() WHERE user_id = $2",
        )
        .bind(new_balance)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        // Debits are recorded with a signed (negative) amount so the
        // balance stays the sum of all transaction amounts.
        let transaction: CreditTransaction = sqlx::query_as(
            r#"
            INSERT INTO credit_transactions
                (account_id, amount, transaction_type, reference_id, description)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, account_id, amount, transaction_type, reference_id,
                      description, plan_id, subscription_id, created_at
            "#,
        )
        .bind(user_id)
        .bind(-amount)
        .bind(TransactionType::CreditUsed.as_str())
        .bind(&reference_id)
        .bind(description)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Self::map_reference_error(e, reference_id.as_deref()))?;

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            amount = %amount,
            new_balance = %new_balance,
            "Credits spent"
        );

        Ok(transaction)
    }

    /// Whether any transaction already carries this reference id.
    /// Used as a replay guard by the purchase orchestrator.
    pub async fn has_reference(&self, reference_id: &str) -> BillingResult<bool> {
        let exists: (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM credit_transactions WHERE reference_id = $1)",
        )
        .bind(reference_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists.0)
    }

    /// Page of transactions, newest first, with total count and the
    /// current balance snapshot.
    pub async fn history(
        &self,
        user_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> BillingResult<TransactionHistory> {
        let account = self.get_or_create_account(user_id).await?;

        let total: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM credit_transactions WHERE account_id = $1")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;

        let transactions: Vec<CreditTransaction> = sqlx::query_as(
            r#"
            SELECT id, account_id, amount, transaction_type, reference_id,
                   description, plan_id, subscription_id, created_at
            FROM credit_transactions
            WHERE account_id = $1
            ORDER BY created_at DESC
            OFFSET $2 LIMIT $3
            "#,
        )
        .bind(user_id)
        .bind(offset)
        .bind(limit.clamp(1, 100))
        .fetch_all(&self.pool)
        .await?;

        Ok(TransactionHistory {
            transactions,
            total_count: total.0,
            balance: account.balance,
        })
    }

    /// Ensure the account row exists inside the transaction and lock it,
    /// returning the current balance.
    async fn lock_account(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
    ) -> BillingResult<Decimal> {
        sqlx::query("INSERT INTO credit_accounts (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
            .bind(user_id)
            .execute(&mut **tx)
            .await
            .map_err(|e| Self::map_account_error(e, user_id))?;

        let row: (Decimal,) =
            sqlx::query_as("SELECT balance FROM credit_accounts WHERE user_id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_one(&mut **tx)
                .await?;

        Ok(row.0)
    }

    fn map_account_error(err: sqlx::Error, user_id: Uuid) -> BillingError {
        if is_foreign_key_violation(&err) {
            BillingError::UserNotFound(user_id.to_string())
        } else {
            err.into()
        }
    }

    fn map_reference_error(err: sqlx::Error, reference_id: Option<&str>) -> BillingError {
        match reference_id {
            Some(reference) if is_unique_violation(&err) => {
                BillingError::DuplicateReference(reference.to_string())
            }
            _ => err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_params_builder() {
        let user_id = Uuid::new_v4();
        let plan_id = Uuid::new_v4();
        let params = AddCreditsParams::new(
            user_id,
            Decimal::from(100),
            TransactionType::PlanPurchase,
        )
        .reference("sub_123")
        .description("Plan purchase")
        .plan(plan_id);

        assert_eq!(params.user_id, user_id);
        assert_eq!(params.reference_id.as_deref(), Some("sub_123"));
        assert_eq!(params.plan_id, Some(plan_id));
        assert_eq!(params.subscription_id, None);
    }
}
