//! Payment provider gateway
//!
//! Narrow seam over the provider API calls the billing core needs:
//! subscription verification, remote cancellation, and card-fingerprint
//! lookup. Behind a trait so orchestrator tests can substitute a fake.

use async_trait::async_trait;
use stripe::{CancelSubscription, PaymentMethod, PaymentMethodId, Subscription, SubscriptionId};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// Whether the provider considers the subscription active or trialing.
    async fn is_subscription_active(&self, subscription_id: &str) -> BillingResult<bool>;

    /// Cancel the subscription on the provider side.
    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()>;

    /// The price id of the subscription's first item, if any.
    async fn subscription_price_id(&self, subscription_id: &str) -> BillingResult<Option<String>>;

    /// Resolve the card fingerprint behind a subscription's default
    /// payment method, if one exists.
    async fn card_fingerprint(&self, subscription_id: &str) -> BillingResult<Option<CardIdentity>>;
}

/// Card identity needed by the trial uniqueness gate
#[derive(Debug, Clone)]
pub struct CardIdentity {
    pub fingerprint: String,
    pub payment_method_id: String,
    pub customer_id: Option<String>,
}

/// Provider gateway backed by the Stripe API
#[derive(Clone)]
pub struct StripeGateway {
    stripe: StripeClient,
}

impl StripeGateway {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    fn parse_subscription_id(subscription_id: &str) -> BillingResult<SubscriptionId> {
        subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::ProviderApi(format!("Invalid subscription ID: {}", e)))
    }
}

#[async_trait]
impl ProviderGateway for StripeGateway {
    async fn is_subscription_active(&self, subscription_id: &str) -> BillingResult<bool> {
        let sub_id = Self::parse_subscription_id(subscription_id)?;
        let subscription = Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;

        Ok(matches!(
            subscription.status,
            stripe::SubscriptionStatus::Active | stripe::SubscriptionStatus::Trialing
        ))
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()> {
        let sub_id = Self::parse_subscription_id(subscription_id)?;

        let params = CancelSubscription {
            cancellation_details: None,
            invoice_now: None,
            prorate: None,
        };

        let subscription = Subscription::cancel(self.stripe.inner(), &sub_id, params).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            status = ?subscription.status,
            "Cancelled subscription with provider"
        );

        Ok(())
    }

    async fn subscription_price_id(&self, subscription_id: &str) -> BillingResult<Option<String>> {
        let sub_id = Self::parse_subscription_id(subscription_id)?;
        let subscription = Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;

        Ok(subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.to_string()))
    }

    async fn card_fingerprint(&self, subscription_id: &str) -> BillingResult<Option<CardIdentity>> {
        let sub_id = Self::parse_subscription_id(subscription_id)?;
        let subscription = Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;

        let customer_id = match &subscription.customer {
            stripe::Expandable::Id(id) => Some(id.to_string()),
            stripe::Expandable::Object(c) => Some(c.id.to_string()),
        };

        let pm_id_str = match subscription.default_payment_method.as_ref() {
            Some(stripe::Expandable::Id(id)) => id.to_string(),
            Some(stripe::Expandable::Object(pm)) => pm.id.to_string(),
            None => return Ok(None),
        };

        let pm_id = pm_id_str
            .parse::<PaymentMethodId>()
            .map_err(|e| BillingError::ProviderApi(format!("Invalid payment method ID: {}", e)))?;

        let payment_method = PaymentMethod::retrieve(self.stripe.inner(), &pm_id, &[]).await?;

        Ok(payment_method
            .card
            .and_then(|card| card.fingerprint)
            .map(|fingerprint| CardIdentity {
                fingerprint,
                payment_method_id: pm_id.to_string(),
                customer_id: customer_id.clone(),
            }))
    }
}
