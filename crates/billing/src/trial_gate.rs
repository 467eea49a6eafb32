//! Card-fingerprint uniqueness gate
//!
//! Enforces at-most-one free-trial activation per physical card. The
//! application pre-check only fails fast; the unique index on
//! `card_fingerprint` is the authoritative arbiter. A lost insert race
//! surfaces as a unique violation inside a savepoint, which rolls back
//! the savepoint alone and maps to a domain conflict, never a 500.

use sqlx::{Acquire, PgPool};
use uuid::Uuid;

use crate::error::{is_unique_violation, BillingResult};

/// Outcome of a gate check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Fingerprint registered to this user; trial may proceed.
    Registered,
    /// Fingerprint already consumed a trial (pre-check hit or lost race).
    Conflict,
}

/// Parameters for registering a trial card fingerprint
#[derive(Debug, Clone)]
pub struct RegisterFingerprintParams {
    pub user_id: Uuid,
    pub card_fingerprint: String,
    pub payment_method_id: String,
    pub stripe_subscription_id: Option<String>,
    pub stripe_customer_id: Option<String>,
}

#[derive(Clone)]
pub struct TrialFingerprintGate {
    pool: PgPool,
}

impl TrialFingerprintGate {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Check whether the fingerprint has already consumed a trial and, if
    /// not, register it. Check and insert run in one transaction; the
    /// insert sits in a savepoint so a concurrent writer winning the race
    /// between check and insert degrades to `Conflict` instead of
    /// aborting the transaction.
    pub async fn check_and_register(
        &self,
        params: RegisterFingerprintParams,
    ) -> BillingResult<GateOutcome> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<(Uuid,)> = sqlx::query_as(
            "SELECT user_id FROM used_trial_card_fingerprints WHERE card_fingerprint = $1",
        )
        .bind(&params.card_fingerprint)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((prior_user,)) = existing {
            tracing::info!(
                user_id = %params.user_id,
                prior_user_id = %prior_user,
                "Trial card fingerprint already registered"
            );
            return Ok(GateOutcome::Conflict);
        }

        let mut savepoint = tx.begin().await?;

        let insert_result = sqlx::query(
            r#"
            INSERT INTO used_trial_card_fingerprints
                (user_id, card_fingerprint, payment_method_id,
                 stripe_subscription_id, stripe_customer_id)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(params.user_id)
        .bind(&params.card_fingerprint)
        .bind(&params.payment_method_id)
        .bind(&params.stripe_subscription_id)
        .bind(&params.stripe_customer_id)
        .execute(&mut *savepoint)
        .await;

        match insert_result {
            Ok(_) => {
                savepoint.commit().await?;
                tx.commit().await?;

                tracing::info!(
                    user_id = %params.user_id,
                    "Trial card fingerprint registered"
                );
                Ok(GateOutcome::Registered)
            }
            Err(e) if is_unique_violation(&e) => {
                // A concurrent writer won the race between the pre-check
                // and the insert. Roll back only the savepoint.
                savepoint.rollback().await?;
                tx.commit().await?;

                tracing::info!(
                    user_id = %params.user_id,
                    "Lost trial fingerprint registration race"
                );
                Ok(GateOutcome::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a fingerprint is already registered. Read-only helper for
    /// diagnostics and tests.
    pub async fn is_registered(&self, card_fingerprint: &str) -> BillingResult<bool> {
        let exists: (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM used_trial_card_fingerprints WHERE card_fingerprint = $1)",
        )
        .bind(card_fingerprint)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists.0)
    }
}
