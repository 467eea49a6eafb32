//! Stripe client configuration

use rust_decimal::Decimal;
use stripe::Client;

use crate::error::{BillingError, BillingResult};

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Credits granted when a first trial starts
    pub trial_credit_amount: Decimal,
    /// Optional sink URL for internal domain-event notifications
    pub event_sink_url: Option<String>,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let trial_credit_amount = std::env::var("TRIAL_CREDIT_AMOUNT")
            .ok()
            .and_then(|s| s.parse::<Decimal>().ok())
            .unwrap_or_else(|| Decimal::from(25));

        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
            trial_credit_amount,
            event_sink_url: std::env::var("EVENT_SINK_URL").ok(),
        })
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: &StripeConfig) -> Self {
        Self {
            client: Client::new(&config.secret_key),
        }
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }
}
