//! Subscription state machine
//!
//! Maps provider subscription status onto the internal subscription record
//! and the coarser per-user account status, with edge-triggered side
//! effects: freeze/unfreeze notifications fire only when the account
//! actually changes state, and the initial trial grant runs exactly once
//! per user behind the card-fingerprint gate.

use std::sync::Arc;

use rust_decimal::Decimal;
use sqlx::PgPool;
use time::{Date, Duration, Month, OffsetDateTime, PrimitiveDateTime};
use uuid::Uuid;

use ledgerd_shared::{AccountStatus, Subscription, SubscriptionStatus, TransactionType, User};

use crate::error::{BillingError, BillingResult};
use crate::events::{publish_best_effort, DomainEvent, DomainEventType, EventPublisher};
use crate::ledger::{AddCreditsParams, CreditLedger};
use crate::plans::PlanCatalog;
use crate::provider::ProviderGateway;
use crate::trial_gate::{GateOutcome, RegisterFingerprintParams, TrialFingerprintGate};
use crate::users::UserDirectory;

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, plan_id, stripe_subscription_id, status, \
     is_active, auto_renew, start_date, renewal_date, last_renewal_date, created_at, updated_at";

/// Next renewal date: same calendar day in the following month, clamped
/// to the last valid day of that month (Jan 31 -> Feb 28/29). Falls back
/// to +30 days only if date construction fails unexpectedly.
pub fn next_renewal_date(from: OffsetDateTime) -> OffsetDateTime {
    let date = from.date();
    let next_month = date.month().next();
    let year = if next_month == Month::January {
        date.year() + 1
    } else {
        date.year()
    };
    let day = date.day().min(next_month.length(year));

    match Date::from_calendar_date(year, next_month, day) {
        Ok(d) => PrimitiveDateTime::new(d, from.time()).assume_offset(from.offset()),
        Err(_) => from + Duration::days(30),
    }
}

/// Map a provider subscription status onto the internal status.
pub fn map_provider_status(status: stripe::SubscriptionStatus) -> SubscriptionStatus {
    match status {
        stripe::SubscriptionStatus::Active => SubscriptionStatus::Active,
        stripe::SubscriptionStatus::Trialing => SubscriptionStatus::Trialing,
        stripe::SubscriptionStatus::PastDue => SubscriptionStatus::PastDue,
        stripe::SubscriptionStatus::Canceled => SubscriptionStatus::Canceled,
        stripe::SubscriptionStatus::Unpaid => SubscriptionStatus::Unpaid,
        stripe::SubscriptionStatus::Incomplete => SubscriptionStatus::Incomplete,
        stripe::SubscriptionStatus::IncompleteExpired => SubscriptionStatus::Canceled,
        // No payment is being collected; treated as unpaid for access purposes
        stripe::SubscriptionStatus::Paused => SubscriptionStatus::Unpaid,
    }
}

/// Whether a failed invoice with this billing reason should freeze the
/// account. One-off invoice failures never freeze.
pub fn freezes_on_failure(reason: Option<stripe::InvoiceBillingReason>) -> bool {
    matches!(
        reason,
        Some(
            stripe::InvoiceBillingReason::SubscriptionCycle
                | stripe::InvoiceBillingReason::SubscriptionCreate
                | stripe::InvoiceBillingReason::SubscriptionUpdate
                | stripe::InvoiceBillingReason::Subscription
        )
    )
}

#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
    ledger: CreditLedger,
    plans: PlanCatalog,
    gate: TrialFingerprintGate,
    users: UserDirectory,
    provider: Arc<dyn ProviderGateway>,
    publisher: Arc<dyn EventPublisher>,
    trial_credit_amount: Decimal,
}

impl SubscriptionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        ledger: CreditLedger,
        plans: PlanCatalog,
        gate: TrialFingerprintGate,
        users: UserDirectory,
        provider: Arc<dyn ProviderGateway>,
        publisher: Arc<dyn EventPublisher>,
        trial_credit_amount: Decimal,
    ) -> Self {
        Self {
            pool,
            ledger,
            plans,
            gate,
            users,
            provider,
            publisher,
            trial_credit_amount,
        }
    }

    // =========================================================================
    // Webhook entry points
    // =========================================================================

    /// Apply a provider subscription object (from created/updated events)
    /// to the local record and account status.
    pub async fn sync_from_provider(
        &self,
        subscription: &stripe::Subscription,
    ) -> BillingResult<()> {
        let customer_id = match &subscription.customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(c) => c.id.to_string(),
        };
        let user = self.users.get_user_by_stripe_customer_id(&customer_id).await?;

        let price_id = subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|p| p.id.to_string());

        let local = self
            .get_or_create(user.id, subscription.id.as_str(), price_id.as_deref())
            .await?;

        let status = map_provider_status(subscription.status);
        self.apply_status(&user, &local, status).await
    }

    /// Handle a provider-side deletion: the subscription is gone for good.
    pub async fn handle_provider_cancellation(
        &self,
        subscription: &stripe::Subscription,
    ) -> BillingResult<()> {
        let customer_id = match &subscription.customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(c) => c.id.to_string(),
        };
        let user = self.users.get_user_by_stripe_customer_id(&customer_id).await?;

        if let Some(local) = self.get_by_stripe_id(subscription.id.as_str()).await? {
            self.apply_status(&user, &local, SubscriptionStatus::Canceled)
                .await?;
        } else {
            tracing::warn!(
                stripe_subscription_id = %subscription.id,
                "Cancellation for unknown subscription, updating account only"
            );
            self.users
                .set_account_status(user.id, AccountStatus::Canceled)
                .await?;
        }

        Ok(())
    }

    /// Handle a successful subscription invoice: grant renewal credits on
    /// billing cycles, unfreeze a frozen account, and always publish
    /// `invoice.paid`.
    pub async fn handle_invoice_paid(&self, invoice: &stripe::Invoice) -> BillingResult<()> {
        let user = self.user_for_invoice(invoice).await?;
        let invoice_id = invoice.id.to_string();

        let subscription_id = match invoice.subscription.as_ref() {
            Some(stripe::Expandable::Id(id)) => Some(id.to_string()),
            Some(stripe::Expandable::Object(s)) => Some(s.id.to_string()),
            None => None,
        };

        if let Some(stripe_sub_id) = subscription_id.as_deref() {
            if matches!(
                invoice.billing_reason,
                Some(stripe::InvoiceBillingReason::SubscriptionCycle)
            ) {
                self.record_renewal(&user, stripe_sub_id, &invoice_id).await?;
            }

            if user.status() == Some(AccountStatus::Frozen) {
                self.users
                    .set_account_status(user.id, AccountStatus::Active)
                    .await?;
                publish_best_effort(
                    self.publisher.as_ref(),
                    DomainEvent::new(DomainEventType::AccountUnfrozen, user.id).with_payload(
                        serde_json::json!({ "stripe_subscription_id": stripe_sub_id }),
                    ),
                )
                .await;
            }
        }

        publish_best_effort(
            self.publisher.as_ref(),
            DomainEvent::new(DomainEventType::InvoicePaid, user.id).with_payload(
                serde_json::json!({
                    "invoice_id": invoice_id,
                    "amount_paid_cents": invoice.amount_paid,
                }),
            ),
        )
        .await;

        Ok(())
    }

    /// Handle a failed invoice: freeze only when the billing reason points
    /// at a subscription cycle/create/update; always publish
    /// `invoice.failed`.
    pub async fn handle_invoice_failed(&self, invoice: &stripe::Invoice) -> BillingResult<()> {
        let user = self.user_for_invoice(invoice).await?;
        let invoice_id = invoice.id.to_string();

        if freezes_on_failure(invoice.billing_reason) {
            if user.status() != Some(AccountStatus::Frozen) {
                self.users
                    .set_account_status(user.id, AccountStatus::Frozen)
                    .await?;
                publish_best_effort(
                    self.publisher.as_ref(),
                    DomainEvent::new(DomainEventType::AccountFrozen, user.id)
                        .with_payload(serde_json::json!({ "invoice_id": invoice_id })),
                )
                .await;
            }
        } else {
            tracing::info!(
                user_id = %user.id,
                invoice_id = %invoice_id,
                billing_reason = ?invoice.billing_reason,
                "One-off invoice failure, account not frozen"
            );
        }

        publish_best_effort(
            self.publisher.as_ref(),
            DomainEvent::new(DomainEventType::InvoiceFailed, user.id).with_payload(
                serde_json::json!({
                    "invoice_id": invoice_id,
                    "billing_reason": invoice.billing_reason.as_ref().map(|r| format!("{:?}", r)),
                }),
            ),
        )
        .await;

        Ok(())
    }

    // =========================================================================
    // State transitions
    // =========================================================================

    async fn apply_status(
        &self,
        user: &User,
        subscription: &Subscription,
        status: SubscriptionStatus,
    ) -> BillingResult<()> {
        match status {
            SubscriptionStatus::Active => {
                self.update_status(subscription.id, SubscriptionStatus::Active, true)
                    .await?;
                if user.status() == Some(AccountStatus::Frozen) {
                    self.users
                        .set_account_status(user.id, AccountStatus::Active)
                        .await?;
                    publish_best_effort(
                        self.publisher.as_ref(),
                        DomainEvent::new(DomainEventType::AccountUnfrozen, user.id),
                    )
                    .await;
                } else if user.status() != Some(AccountStatus::Active) {
                    self.users
                        .set_account_status(user.id, AccountStatus::Active)
                        .await?;
                }
            }
            SubscriptionStatus::Trialing => {
                self.update_status(subscription.id, SubscriptionStatus::Trialing, true)
                    .await?;
                if user.has_consumed_initial_trial {
                    if user.status() != Some(AccountStatus::Trialing) {
                        self.users
                            .set_account_status(user.id, AccountStatus::Trialing)
                            .await?;
                    }
                } else {
                    self.start_initial_trial(user, subscription).await?;
                }
            }
            SubscriptionStatus::PastDue
            | SubscriptionStatus::Incomplete
            | SubscriptionStatus::Unpaid => {
                self.update_status(subscription.id, status, true).await?;
                if user.status() != Some(AccountStatus::Frozen) {
                    self.users
                        .set_account_status(user.id, AccountStatus::Frozen)
                        .await?;
                    publish_best_effort(
                        self.publisher.as_ref(),
                        DomainEvent::new(DomainEventType::AccountFrozen, user.id).with_payload(
                            serde_json::json!({ "subscription_status": status.as_str() }),
                        ),
                    )
                    .await;
                }
            }
            SubscriptionStatus::Canceled => {
                self.update_status(subscription.id, SubscriptionStatus::Canceled, false)
                    .await?;
                self.users
                    .set_account_status(user.id, AccountStatus::Canceled)
                    .await?;
            }
            // Internal-only states are never produced by the provider
            SubscriptionStatus::Replaced
            | SubscriptionStatus::PaymentIssue
            | SubscriptionStatus::Inactive => {
                self.update_status(subscription.id, status, false).await?;
            }
        }

        Ok(())
    }

    /// First `trialing` for a user who has not consumed their trial:
    /// run the uniqueness gate, grant the trial credits, and flip the
    /// consumed flag. On a gate conflict: no credits, best-effort remote
    /// cancellation, account marked rejected.
    async fn start_initial_trial(
        &self,
        user: &User,
        subscription: &Subscription,
    ) -> BillingResult<()> {
        let stripe_sub_id = subscription
            .stripe_subscription_id
            .clone()
            .ok_or_else(|| BillingError::Internal("trial subscription has no provider id".into()))?;

        let card = self.provider.card_fingerprint(&stripe_sub_id).await?;

        let outcome = match card {
            Some(ref identity) => {
                self.gate
                    .check_and_register(RegisterFingerprintParams {
                        user_id: user.id,
                        card_fingerprint: identity.fingerprint.clone(),
                        payment_method_id: identity.payment_method_id.clone(),
                        stripe_subscription_id: Some(stripe_sub_id.clone()),
                        stripe_customer_id: identity.customer_id.clone(),
                    })
                    .await?
            }
            None => {
                // No card on file means nothing to deduplicate on.
                tracing::warn!(
                    user_id = %user.id,
                    stripe_subscription_id = %stripe_sub_id,
                    "Trial subscription has no card fingerprint, skipping gate"
                );
                GateOutcome::Registered
            }
        };

        match outcome {
            GateOutcome::Registered => {
                self.ledger
                    .add(
                        AddCreditsParams::new(
                            user.id,
                            self.trial_credit_amount,
                            TransactionType::TrialCreditGrant,
                        )
                        .reference(format!("trial-{}", stripe_sub_id))
                        .description("Initial trial credit grant")
                        .subscription(subscription.id),
                    )
                    .await?;

                self.users.mark_trial_consumed(user.id).await?;
                self.users
                    .set_account_status(user.id, AccountStatus::Trialing)
                    .await?;

                publish_best_effort(
                    self.publisher.as_ref(),
                    DomainEvent::new(DomainEventType::TrialStarted, user.id).with_payload(
                        serde_json::json!({
                            "stripe_subscription_id": stripe_sub_id,
                            "credits": self.trial_credit_amount.to_string(),
                        }),
                    ),
                )
                .await;

                tracing::info!(user_id = %user.id, "Initial trial started");
            }
            GateOutcome::Conflict => {
                // Compensations are best-effort; the conflict response wins.
                if let Err(e) = self.provider.cancel_subscription(&stripe_sub_id).await {
                    tracing::warn!(
                        user_id = %user.id,
                        stripe_subscription_id = %stripe_sub_id,
                        error = %e,
                        "Failed to cancel trial subscription with provider after gate conflict"
                    );
                }

                self.update_status(subscription.id, SubscriptionStatus::Canceled, false)
                    .await?;
                self.users
                    .set_account_status(user.id, AccountStatus::TrialRejected)
                    .await?;

                publish_best_effort(
                    self.publisher.as_ref(),
                    DomainEvent::new(DomainEventType::TrialBlocked, user.id).with_payload(
                        serde_json::json!({ "stripe_subscription_id": stripe_sub_id }),
                    ),
                )
                .await;

                tracing::info!(user_id = %user.id, "Trial blocked by fingerprint gate");
            }
        }

        Ok(())
    }

    /// Grant renewal credits for a billing-cycle invoice and advance the
    /// renewal dates. Guarded by the invoice id so a replayed webhook
    /// cannot double-grant.
    async fn record_renewal(
        &self,
        user: &User,
        stripe_sub_id: &str,
        invoice_id: &str,
    ) -> BillingResult<()> {
        if self.ledger.has_reference(invoice_id).await? {
            tracing::info!(
                user_id = %user.id,
                invoice_id = %invoice_id,
                "Renewal invoice already credited, skipping"
            );
            return Ok(());
        }

        let Some(subscription) = self.get_by_stripe_id(stripe_sub_id).await? else {
            tracing::warn!(
                stripe_subscription_id = %stripe_sub_id,
                "Renewal invoice for unknown subscription"
            );
            return Ok(());
        };

        let plan = self.plans.get_plan_by_id(subscription.plan_id).await?;

        self.ledger
            .add(
                AddCreditsParams::new(user.id, plan.credit_amount, TransactionType::PlanRenewal)
                    .reference(invoice_id)
                    .description(format!("Renewal of plan {}", plan.name))
                    .plan(plan.id)
                    .subscription(subscription.id),
            )
            .await?;

        let now = OffsetDateTime::now_utc();
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET last_renewal_date = $1, renewal_date = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(now)
        .bind(next_renewal_date(now))
        .bind(subscription.id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            user_id = %user.id,
            subscription_id = %subscription.id,
            credits = %plan.credit_amount,
            "Renewal credited"
        );

        Ok(())
    }

    // =========================================================================
    // Persistence helpers
    // =========================================================================

    /// Local record for a provider subscription id, created on first
    /// sight. Plan resolution falls back to the first active plan when
    /// the price id has no exact match.
    pub async fn get_or_create(
        &self,
        user_id: Uuid,
        stripe_sub_id: &str,
        price_id: Option<&str>,
    ) -> BillingResult<Subscription> {
        if let Some(existing) = self.get_by_stripe_id(stripe_sub_id).await? {
            return Ok(existing);
        }

        let plan = self.plans.resolve_for_price(price_id).await?;
        let now = OffsetDateTime::now_utc();

        let inserted: Option<Subscription> = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions
                (user_id, plan_id, stripe_subscription_id, status, renewal_date)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (stripe_subscription_id) WHERE stripe_subscription_id IS NOT NULL
            DO NOTHING
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(user_id)
        .bind(plan.id)
        .bind(stripe_sub_id)
        .bind(SubscriptionStatus::Incomplete.as_str())
        .bind(next_renewal_date(now))
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(subscription) => Ok(subscription),
            // A concurrent webhook created it between the check and insert
            None => self
                .get_by_stripe_id(stripe_sub_id)
                .await?
                .ok_or_else(|| BillingError::SubscriptionNotFound(stripe_sub_id.to_string())),
        }
    }

    /// Insert a subscription row for a direct purchase.
    pub async fn create_for_purchase(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        stripe_sub_id: Option<&str>,
        status: SubscriptionStatus,
        renewal_date: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let subscription: Subscription = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions
                (user_id, plan_id, stripe_subscription_id, status, renewal_date)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(user_id)
        .bind(plan_id)
        .bind(stripe_sub_id)
        .bind(status.as_str())
        .bind(renewal_date)
        .fetch_one(&self.pool)
        .await?;

        Ok(subscription)
    }

    /// Replace a subscription with a fresh row on another plan, carrying
    /// the provider id and the renewal dates over. The old row survives
    /// as an audit record stamped `replaced`. Both writes commit together.
    pub async fn replace_with_plan(
        &self,
        current: &Subscription,
        new_plan_id: Uuid,
    ) -> BillingResult<Subscription> {
        let mut tx = self.pool.begin().await?;

        // The provider id moves to the replacement row; the partial unique
        // index allows only one row per provider subscription.
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET is_active = FALSE, status = $1, auto_renew = FALSE,
                stripe_subscription_id = NULL, updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(SubscriptionStatus::Replaced.as_str())
        .bind(current.id)
        .execute(&mut *tx)
        .await?;

        let replacement: Subscription = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions
                (user_id, plan_id, stripe_subscription_id, status,
                 renewal_date, last_renewal_date)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(current.user_id)
        .bind(new_plan_id)
        .bind(&current.stripe_subscription_id)
        .bind(SubscriptionStatus::Active.as_str())
        .bind(current.renewal_date)
        .bind(current.last_renewal_date)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(replacement)
    }

    pub async fn get_by_id(&self, subscription_id: Uuid) -> BillingResult<Option<Subscription>> {
        let subscription: Option<Subscription> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }

    pub async fn get_by_stripe_id(
        &self,
        stripe_sub_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let subscription: Option<Subscription> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE stripe_subscription_id = $1"
        ))
        .bind(stripe_sub_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }

    /// Deactivate every active subscription for the user, stamping the
    /// given status (e.g. `replaced` on a new purchase).
    pub async fn deactivate_active(
        &self,
        user_id: Uuid,
        status: SubscriptionStatus,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET is_active = FALSE, status = $1, auto_renew = FALSE, updated_at = NOW()
            WHERE user_id = $2 AND is_active = TRUE
            "#,
        )
        .bind(status.as_str())
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn update_status(
        &self,
        subscription_id: Uuid,
        status: SubscriptionStatus,
        is_active: bool,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $1, is_active = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(status.as_str())
        .bind(is_active)
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn user_for_invoice(&self, invoice: &stripe::Invoice) -> BillingResult<User> {
        let customer_id = match &invoice.customer {
            Some(stripe::Expandable::Id(id)) => id.to_string(),
            Some(stripe::Expandable::Object(c)) => c.id.to_string(),
            None => return Err(BillingError::Internal("No customer on invoice".to_string())),
        };

        self.users.get_user_by_stripe_customer_id(&customer_id).await
    }
}
