//! Purchase orchestrator
//!
//! Front door for money-facing operations: one-time credit purchases,
//! subscription purchases, upgrades, and cancellations. Sequences the
//! ledger, the plan catalog, the fingerprint gate, and the provider
//! gateway, and owns the replay guards that make each entry point safe
//! to call twice with the same reference.

use std::sync::Arc;

use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

use ledgerd_shared::{
    AccountStatus, CreditTransaction, Subscription, SubscriptionStatus, TransactionType,
};

use crate::error::{BillingError, BillingResult};
use crate::events::{publish_best_effort, DomainEvent, DomainEventType, EventPublisher};
use crate::ledger::{AddCreditsParams, CreditLedger};
use crate::plans::PlanCatalog;
use crate::provider::ProviderGateway;
use crate::subscriptions::{next_renewal_date, SubscriptionService};
use crate::trial_gate::{GateOutcome, RegisterFingerprintParams, TrialFingerprintGate};
use crate::users::UserDirectory;

/// Parameters for a subscription purchase.
#[derive(Debug, Clone)]
pub struct SubscriptionPurchaseParams {
    pub user_id: Uuid,
    /// Provider subscription backing this purchase. Doubles as the
    /// replay guard.
    pub stripe_subscription_id: String,
    /// Credits to grant instead of the plan's default amount.
    pub credit_override: Option<Decimal>,
}

/// A completed subscription purchase: the new subscription plus the
/// ledger transaction that granted its credits.
#[derive(Debug, Clone)]
pub struct SubscriptionPurchase {
    pub subscription: Subscription,
    pub transaction: CreditTransaction,
}

/// Result of a cancellation attempt.
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    /// False when the subscription was already inactive.
    pub canceled: bool,
    /// Set when the requested provider-side cancellation failed; the
    /// local cancellation still landed.
    pub provider_error: Option<String>,
}

/// Credits granted on an upgrade: the positive difference, floored at
/// zero so a plan with equal or fewer credits grants nothing.
pub fn upgrade_credit_delta(current: Decimal, new: Decimal) -> Decimal {
    (new - current).max(Decimal::ZERO)
}

#[derive(Clone)]
pub struct PurchaseOrchestrator {
    ledger: CreditLedger,
    plans: PlanCatalog,
    gate: TrialFingerprintGate,
    users: UserDirectory,
    subscriptions: SubscriptionService,
    provider: Arc<dyn ProviderGateway>,
    publisher: Arc<dyn EventPublisher>,
}

impl PurchaseOrchestrator {
    pub fn new(
        ledger: CreditLedger,
        plans: PlanCatalog,
        gate: TrialFingerprintGate,
        users: UserDirectory,
        subscriptions: SubscriptionService,
        provider: Arc<dyn ProviderGateway>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            ledger,
            plans,
            gate,
            users,
            subscriptions,
            provider,
            publisher,
        }
    }

    /// One-time credit purchase: the paid amount of credits, at the
    /// quoted price, against a payment reference. The reference doubles
    /// as the replay guard: a second call with the same reference is
    /// rejected before any ledger write.
    pub async fn purchase_one_time(
        &self,
        user_id: Uuid,
        amount: Decimal,
        price_cents: i64,
        reference_id: &str,
    ) -> BillingResult<CreditTransaction> {
        if self.ledger.has_reference(reference_id).await? {
            return Err(BillingError::DuplicateReference(reference_id.to_string()));
        }

        let transaction = self
            .ledger
            .add(
                AddCreditsParams::new(user_id, amount, TransactionType::PurchaseOneTime)
                    .reference(reference_id)
                    .description(format!(
                        "One-time purchase of {} credits (${}.{:02})",
                        amount,
                        price_cents / 100,
                        price_cents % 100
                    )),
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            credits = %amount,
            price_cents = price_cents,
            reference_id = %reference_id,
            "One-time purchase completed"
        );

        Ok(transaction)
    }

    /// Subscription purchase against a provider subscription. The plan
    /// is resolved from the subscription's price id; any previously
    /// active subscription is stamped `replaced`; limited-free plans
    /// pass through the fingerprint gate first. After the local state is
    /// written the provider subscription is verified, and a failed
    /// verification deactivates what was just created.
    pub async fn purchase_subscription(
        &self,
        params: SubscriptionPurchaseParams,
    ) -> BillingResult<SubscriptionPurchase> {
        let stripe_sub_id = params.stripe_subscription_id.as_str();

        if self
            .subscriptions
            .get_by_stripe_id(stripe_sub_id)
            .await?
            .is_some()
        {
            return Err(BillingError::AlreadyProcessed(stripe_sub_id.to_string()));
        }

        let price_id = self.provider.subscription_price_id(stripe_sub_id).await?;
        let plan = self.plans.resolve_for_price(price_id.as_deref()).await?;
        let user = self.users.get_user(params.user_id).await?;

        if plan.is_limited_free {
            self.run_trial_gate(&user.id, stripe_sub_id).await?;
        }

        let replaced = self
            .subscriptions
            .deactivate_active(params.user_id, SubscriptionStatus::Replaced)
            .await?;
        if replaced > 0 {
            tracing::info!(
                user_id = %params.user_id,
                count = replaced,
                "Previous subscriptions replaced"
            );
        }

        let subscription = self
            .subscriptions
            .create_for_purchase(
                params.user_id,
                plan.id,
                Some(stripe_sub_id),
                SubscriptionStatus::Active,
                next_renewal_date(OffsetDateTime::now_utc()),
            )
            .await?;

        let credits = params.credit_override.unwrap_or(plan.credit_amount);
        let transaction = self
            .ledger
            .add(
                AddCreditsParams::new(params.user_id, credits, TransactionType::PlanPurchase)
                    .reference(stripe_sub_id)
                    .description(format!("Purchase of plan {}", plan.name))
                    .plan(plan.id)
                    .subscription(subscription.id),
            )
            .await?;

        self.verify_with_provider(&subscription, stripe_sub_id).await?;

        self.users
            .set_account_status(params.user_id, AccountStatus::Active)
            .await?;

        tracing::info!(
            user_id = %params.user_id,
            subscription_id = %subscription.id,
            plan_id = %plan.id,
            credits = %credits,
            "Subscription purchase completed"
        );

        Ok(SubscriptionPurchase {
            subscription,
            transaction,
        })
    }

    /// Move a subscription to a strictly higher-priced plan. The old row
    /// is stamped `replaced` and a new one is created carrying the
    /// original renewal date, so the history of what the user was on
    /// stays in the table. Only the positive credit difference is
    /// granted; equal credit amounts produce no transaction row.
    pub async fn upgrade(
        &self,
        user_id: Uuid,
        subscription_id: Uuid,
        new_plan_id: Uuid,
    ) -> BillingResult<Subscription> {
        let subscription = self
            .subscriptions
            .get_by_id(subscription_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.to_string()))?;

        if subscription.user_id != user_id {
            return Err(BillingError::NotOwner);
        }
        if !subscription.is_active {
            return Err(BillingError::SubscriptionNotFound(subscription_id.to_string()));
        }

        let current_plan = self.plans.get_plan_by_id(subscription.plan_id).await?;
        let new_plan = self.plans.get_plan_by_id(new_plan_id).await?;

        if new_plan.price_cents <= current_plan.price_cents {
            return Err(BillingError::NotAnUpgrade);
        }

        let replacement = self
            .subscriptions
            .replace_with_plan(&subscription, new_plan.id)
            .await?;

        let credit_diff = upgrade_credit_delta(current_plan.credit_amount, new_plan.credit_amount);
        if credit_diff > Decimal::ZERO {
            self.ledger
                .add(
                    AddCreditsParams::new(user_id, credit_diff, TransactionType::PlanUpgrade)
                        .reference(format!("upgrade-{}-{}", subscription.id, new_plan.id))
                        .description(format!(
                            "Upgrade from {} to {}",
                            current_plan.name, new_plan.name
                        ))
                        .plan(new_plan.id)
                        .subscription(replacement.id),
                )
                .await?;
        }

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            replacement_id = %replacement.id,
            from_plan = %current_plan.name,
            to_plan = %new_plan.name,
            credit_diff = %credit_diff,
            "Subscription upgraded"
        );

        Ok(replacement)
    }

    /// Cancel a subscription. `canceled` is false when it is already
    /// inactive. The remote cancellation, when requested, is
    /// best-effort: a provider failure is reported in the outcome and
    /// the local cancellation still lands.
    pub async fn cancel(
        &self,
        user_id: Uuid,
        subscription_id: Uuid,
        cancel_with_provider: bool,
    ) -> BillingResult<CancelOutcome> {
        let subscription = self
            .subscriptions
            .get_by_id(subscription_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.to_string()))?;

        if subscription.user_id != user_id {
            return Err(BillingError::NotOwner);
        }
        if !subscription.is_active {
            return Ok(CancelOutcome {
                canceled: false,
                provider_error: None,
            });
        }

        let mut provider_error = None;
        if cancel_with_provider {
            if let Some(stripe_sub_id) = subscription.stripe_subscription_id.as_deref() {
                if let Err(e) = self.provider.cancel_subscription(stripe_sub_id).await {
                    tracing::warn!(
                        subscription_id = %subscription.id,
                        stripe_subscription_id = %stripe_sub_id,
                        error = %e,
                        "Provider-side cancellation failed, canceling locally anyway"
                    );
                    provider_error = Some(e.to_string());
                }
            }
        }

        self.subscriptions
            .update_status(subscription.id, SubscriptionStatus::Canceled, false)
            .await?;
        self.users
            .set_account_status(user_id, AccountStatus::Canceled)
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            "Subscription canceled"
        );

        Ok(CancelOutcome {
            canceled: true,
            provider_error,
        })
    }

    /// Gate a limited-free purchase on the card fingerprint. A conflict
    /// triggers the same compensations as the webhook trial path:
    /// best-effort remote cancellation, account marked rejected, and a
    /// `trial.blocked` notification.
    async fn run_trial_gate(&self, user_id: &Uuid, stripe_sub_id: &str) -> BillingResult<()> {
        let Some(identity) = self.provider.card_fingerprint(stripe_sub_id).await? else {
            tracing::warn!(
                user_id = %user_id,
                stripe_subscription_id = %stripe_sub_id,
                "No card fingerprint available, gate skipped"
            );
            return Ok(());
        };

        let outcome = self
            .gate
            .check_and_register(RegisterFingerprintParams {
                user_id: *user_id,
                card_fingerprint: identity.fingerprint,
                payment_method_id: identity.payment_method_id,
                stripe_subscription_id: Some(stripe_sub_id.to_string()),
                stripe_customer_id: identity.customer_id,
            })
            .await?;

        match outcome {
            GateOutcome::Registered => Ok(()),
            GateOutcome::Conflict => {
                if let Err(e) = self.provider.cancel_subscription(stripe_sub_id).await {
                    tracing::warn!(
                        user_id = %user_id,
                        stripe_subscription_id = %stripe_sub_id,
                        error = %e,
                        "Failed to cancel subscription with provider after gate conflict"
                    );
                }

                self.users
                    .set_account_status(*user_id, AccountStatus::TrialRejected)
                    .await?;

                publish_best_effort(
                    self.publisher.as_ref(),
                    DomainEvent::new(DomainEventType::TrialBlocked, *user_id).with_payload(
                        serde_json::json!({ "stripe_subscription_id": stripe_sub_id }),
                    ),
                )
                .await;

                tracing::info!(user_id = %user_id, "Purchase blocked by fingerprint gate");
                Err(BillingError::TrialCardReused)
            }
        }
    }

    /// The provider is the source of truth for whether money actually
    /// moved. A subscription that fails verification is deactivated
    /// rather than left granting access.
    async fn verify_with_provider(
        &self,
        subscription: &Subscription,
        stripe_sub_id: &str,
    ) -> BillingResult<()> {
        let active = match self.provider.is_subscription_active(stripe_sub_id).await {
            Ok(active) => active,
            Err(e) => {
                tracing::error!(
                    subscription_id = %subscription.id,
                    error = %e,
                    "Provider verification call failed"
                );
                false
            }
        };

        if active {
            return Ok(());
        }

        self.subscriptions
            .update_status(subscription.id, SubscriptionStatus::Inactive, false)
            .await?;

        Err(BillingError::ProviderVerification(format!(
            "subscription {} is not active with the provider",
            stripe_sub_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upgrade_credit_delta_positive_difference() {
        assert_eq!(
            upgrade_credit_delta(Decimal::from(50), Decimal::from(200)),
            Decimal::from(150)
        );
    }

    #[test]
    fn test_upgrade_credit_delta_floors_at_zero() {
        assert_eq!(
            upgrade_credit_delta(Decimal::from(100), Decimal::from(100)),
            Decimal::ZERO
        );
        assert_eq!(
            upgrade_credit_delta(Decimal::from(200), Decimal::from(50)),
            Decimal::ZERO
        );
    }
}
