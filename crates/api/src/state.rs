//! Shared application state

use std::sync::Arc;

use sqlx::PgPool;

use ledgerd_billing::{
    BillingResult, CreditLedger, EventPublisher, HttpEventPublisher, NoopEventPublisher,
    PlanCatalog, ProviderGateway, PurchaseOrchestrator, StripeClient, StripeConfig, StripeGateway,
    SubscriptionService, TrialFingerprintGate, UserDirectory, WebhookHandler,
};

/// State shared by all request handlers. Services are constructed once
/// at startup and cloned per request (they are cheap handles over the
/// pool).
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub ledger: CreditLedger,
    pub plans: PlanCatalog,
    pub purchase: PurchaseOrchestrator,
    pub webhooks: WebhookHandler,
}

impl AppState {
    pub fn build(pool: PgPool, stripe_config: StripeConfig) -> BillingResult<Self> {
        let publisher: Arc<dyn EventPublisher> = match &stripe_config.event_sink_url {
            Some(url) => Arc::new(HttpEventPublisher::new(url.clone())),
            None => Arc::new(NoopEventPublisher),
        };

        let provider: Arc<dyn ProviderGateway> =
            Arc::new(StripeGateway::new(StripeClient::new(&stripe_config)));

        let ledger = CreditLedger::new(pool.clone());
        let plans = PlanCatalog::new(pool.clone());
        let gate = TrialFingerprintGate::new(pool.clone());
        let users = UserDirectory::new(pool.clone());

        let subscriptions = SubscriptionService::new(
            pool.clone(),
            ledger.clone(),
            plans.clone(),
            gate.clone(),
            users.clone(),
            provider.clone(),
            publisher.clone(),
            stripe_config.trial_credit_amount,
        );

        let purchase = PurchaseOrchestrator::new(
            ledger.clone(),
            plans.clone(),
            gate,
            users,
            subscriptions.clone(),
            provider,
            publisher,
        );

        let webhooks =
            WebhookHandler::new(pool.clone(), subscriptions, stripe_config.webhook_secret);

        Ok(Self {
            pool,
            ledger,
            plans,
            purchase,
            webhooks,
        })
    }
}
