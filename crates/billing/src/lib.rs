//! Billing core for ledgerd
//!
//! Credit ledger, plan catalog, subscription state machine, trial
//! fingerprint gate, purchase orchestration, and webhook handling.
//! Everything here is storage- and provider-facing; HTTP concerns live
//! in the api crate.

pub mod client;
pub mod error;
pub mod events;
pub mod ledger;
pub mod plans;
pub mod provider;
pub mod purchase;
pub mod subscriptions;
pub mod trial_gate;
pub mod users;
pub mod webhooks;

pub use client::{StripeClient, StripeConfig};
pub use error::{BillingError, BillingResult};
pub use events::{
    DomainEvent, DomainEventType, EventPublisher, HttpEventPublisher, NoopEventPublisher,
};
pub use ledger::{AddCreditsParams, CreditLedger, TransactionHistory};
pub use plans::PlanCatalog;
pub use provider::{CardIdentity, ProviderGateway, StripeGateway};
pub use purchase::{
    CancelOutcome, PurchaseOrchestrator, SubscriptionPurchase, SubscriptionPurchaseParams,
};
pub use subscriptions::SubscriptionService;
pub use trial_gate::{GateOutcome, RegisterFingerprintParams, TrialFingerprintGate};
pub use users::UserDirectory;
pub use webhooks::{WebhookHandler, WebhookOutcome};
