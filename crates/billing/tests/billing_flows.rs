//! Integration tests for the billing core
//!
//! These tests run against a real Postgres database and verify the
//! concurrency guarantees the services promise: the balance/transaction
//! sum invariant, single-winner spends on the last credits, the trial
//! fingerprint gate under racing registrations, and the webhook-driven
//! trial and freeze/unfreeze lifecycles.
//!
//! ## Running Tests
//! ```bash
//! export DATABASE_URL="postgres://localhost/ledgerd_test"
//! cargo test -p ledgerd-billing --test billing_flows -- --ignored
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use ledgerd_billing::{
    AddCreditsParams, BillingError, CardIdentity, CreditLedger, DomainEvent, EventPublisher,
    GateOutcome, PlanCatalog, ProviderGateway, PurchaseOrchestrator, RegisterFingerprintParams,
    SubscriptionPurchaseParams, SubscriptionService, TrialFingerprintGate, UserDirectory,
};
use ledgerd_shared::TransactionType;

// ============================================================================
// Test Utilities
// ============================================================================

async fn setup_pool() -> PgPool {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");

    sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("Failed to connect to test database")
}

async fn create_test_user(pool: &PgPool) -> Uuid {
    let email = format!("test-{}@example.com", Uuid::new_v4());
    let row: (Uuid,) = sqlx::query_as("INSERT INTO users (email) VALUES ($1) RETURNING id")
        .bind(email)
        .fetch_one(pool)
        .await
        .expect("Failed to create test user");
    row.0
}

async fn create_test_customer(pool: &PgPool) -> (Uuid, String) {
    let email = format!("test-{}@example.com", Uuid::new_v4());
    let customer_id = format!("cus_{}", Uuid::new_v4().simple());
    let row: (Uuid,) = sqlx::query_as(
        "INSERT INTO users (email, stripe_customer_id) VALUES ($1, $2) RETURNING id",
    )
    .bind(email)
    .bind(&customer_id)
    .fetch_one(pool)
    .await
    .expect("Failed to create test user");
    (row.0, customer_id)
}

async fn create_test_plan(
    pool: &PgPool,
    credits: i64,
    price_cents: i64,
    price_id: &str,
    is_limited_free: bool,
) -> Uuid {
    let name = format!("test-plan-{}", Uuid::new_v4());
    let row: (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO plans (name, credit_amount, price_cents, stripe_price_id, is_limited_free)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id
        "#,
    )
    .bind(name)
    .bind(Decimal::from(credits))
    .bind(price_cents)
    .bind(price_id)
    .bind(is_limited_free)
    .fetch_one(pool)
    .await
    .expect("Failed to create test plan");
    row.0
}

async fn account_status_of(pool: &PgPool, user_id: Uuid) -> String {
    let row: (String,) = sqlx::query_as("SELECT account_status FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_one(pool)
        .await
        .expect("user lookup failed");
    row.0
}

async fn trial_consumed(pool: &PgPool, user_id: Uuid) -> bool {
    let row: (bool,) =
        sqlx::query_as("SELECT has_consumed_initial_trial FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_one(pool)
            .await
            .expect("user lookup failed");
    row.0
}

async fn balance_of(pool: &PgPool, user_id: Uuid) -> Decimal {
    CreditLedger::new(pool.clone())
        .get_or_create_account(user_id)
        .await
        .expect("account lookup failed")
        .balance
}

/// Gateway stub with a fixed card identity and price id; counts
/// fingerprint lookups and cancellations so tests can assert which
/// provider calls ran.
struct StubGateway {
    fingerprint: Option<String>,
    price_id: Option<String>,
    fingerprint_calls: AtomicUsize,
    cancel_calls: AtomicUsize,
}

impl StubGateway {
    fn new(fingerprint: Option<String>, price_id: Option<String>) -> Self {
        Self {
            fingerprint,
            price_id,
            fingerprint_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ProviderGateway for StubGateway {
    async fn is_subscription_active(&self, _subscription_id: &str) -> Result<bool, BillingError> {
        Ok(true)
    }

    async fn cancel_subscription(&self, _subscription_id: &str) -> Result<(), BillingError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscription_price_id(
        &self,
        _subscription_id: &str,
    ) -> Result<Option<String>, BillingError> {
        Ok(self.price_id.clone())
    }

    async fn card_fingerprint(
        &self,
        _subscription_id: &str,
    ) -> Result<Option<CardIdentity>, BillingError> {
        self.fingerprint_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.fingerprint.as_ref().map(|fp| CardIdentity {
            fingerprint: fp.clone(),
            payment_method_id: "pm_test".to_string(),
            customer_id: Some("cus_test".to_string()),
        }))
    }
}

/// Publisher that records event names instead of sending them.
#[derive(Default)]
struct RecordingPublisher {
    events: Mutex<Vec<String>>,
}

impl RecordingPublisher {
    fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.as_str() == name)
            .count()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: DomainEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(event.event.as_str().to_string());
        Ok(())
    }
}

fn build_service(
    pool: &PgPool,
    provider: Arc<dyn ProviderGateway>,
    publisher: Arc<dyn EventPublisher>,
) -> SubscriptionService {
    SubscriptionService::new(
        pool.clone(),
        CreditLedger::new(pool.clone()),
        PlanCatalog::new(pool.clone()),
        TrialFingerprintGate::new(pool.clone()),
        UserDirectory::new(pool.clone()),
        provider,
        publisher,
        Decimal::from(25),
    )
}

fn build_orchestrator_with(
    pool: &PgPool,
    gateway: Arc<StubGateway>,
    publisher: Arc<dyn EventPublisher>,
) -> PurchaseOrchestrator {
    let provider: Arc<dyn ProviderGateway> = gateway;
    let subscriptions = build_service(pool, provider.clone(), publisher.clone());
    PurchaseOrchestrator::new(
        CreditLedger::new(pool.clone()),
        PlanCatalog::new(pool.clone()),
        TrialFingerprintGate::new(pool.clone()),
        UserDirectory::new(pool.clone()),
        subscriptions,
        provider,
        publisher,
    )
}

fn build_orchestrator(pool: &PgPool, gateway: Arc<StubGateway>) -> PurchaseOrchestrator {
    build_orchestrator_with(pool, gateway, Arc::new(RecordingPublisher::default()))
}

fn provider_subscription(
    sub_id: &str,
    customer_id: &str,
    price_id: &str,
    status: stripe::SubscriptionStatus,
) -> stripe::Subscription {
    let price = stripe::Price {
        id: price_id.parse().expect("bad price id"),
        ..Default::default()
    };
    let item = stripe::SubscriptionItem {
        price: Some(price),
        ..Default::default()
    };

    stripe::Subscription {
        id: sub_id.parse().expect("bad subscription id"),
        customer: stripe::Expandable::Id(customer_id.parse().expect("bad customer id")),
        status,
        items: stripe::List {
            data: vec![item],
            ..Default::default()
        },
        ..Default::default()
    }
}

fn provider_invoice(
    invoice_id: &str,
    customer_id: &str,
    sub_id: Option<&str>,
    billing_reason: Option<stripe::InvoiceBillingReason>,
) -> stripe::Invoice {
    stripe::Invoice {
        id: invoice_id.parse().expect("bad invoice id"),
        customer: Some(stripe::Expandable::Id(
            customer_id.parse().expect("bad customer id"),
        )),
        subscription: sub_id
            .map(|s| stripe::Expandable::Id(s.parse().expect("bad subscription id"))),
        billing_reason,
        amount_paid: Some(1999),
        ..Default::default()
    }
}

// ============================================================================
// Ledger invariants
// ============================================================================

#[tokio::test]
#[ignore]
async fn test_balance_matches_transaction_sum() {
    let pool = setup_pool().await;
    let ledger = CreditLedger::new(pool.clone());
    let user_id = create_test_user(&pool).await;

    ledger
        .add(AddCreditsParams::new(
            user_id,
            Decimal::from(100),
            TransactionType::CreditAdded,
        ))
        .await
        .expect("add failed");
    ledger
        .spend(user_id, Decimal::from(30), None, "usage")
        .await
        .expect("spend failed");
    ledger
        .add(AddCreditsParams::new(
            user_id,
            Decimal::from(5),
            TransactionType::Refund,
        ))
        .await
        .expect("refund failed");

    let sum: (Option<Decimal>,) =
        sqlx::query_as("SELECT SUM(amount) FROM credit_transactions WHERE account_id = $1")
            .bind(user_id)
            .fetch_one(&pool)
            .await
            .expect("sum query failed");

    assert_eq!(balance_of(&pool, user_id).await, Decimal::from(75));
    assert_eq!(sum.0, Some(Decimal::from(75)));
}

#[tokio::test]
#[ignore]
async fn test_spend_rejects_insufficient_balance() {
    let pool = setup_pool().await;
    let ledger = CreditLedger::new(pool.clone());
    let user_id = create_test_user(&pool).await;

    ledger
        .add(AddCreditsParams::new(
            user_id,
            Decimal::from(10),
            TransactionType::CreditAdded,
        ))
        .await
        .expect("add failed");

    let result = ledger.spend(user_id, Decimal::from(11), None, "usage").await;
    assert!(matches!(
        result,
        Err(BillingError::InsufficientCredits { .. })
    ));

    assert_eq!(balance_of(&pool, user_id).await, Decimal::from(10));
}

#[tokio::test]
#[ignore]
async fn test_concurrent_spends_cannot_both_take_last_credits() {
    let pool = setup_pool().await;
    let ledger = CreditLedger::new(pool.clone());
    let user_id = create_test_user(&pool).await;

    ledger
        .add(AddCreditsParams::new(
            user_id,
            Decimal::from(100),
            TransactionType::CreditAdded,
        ))
        .await
        .expect("add failed");

    // Both spends pass a stale pre-check; the row lock must serialize
    // them so only one succeeds.
    let (a, b) = tokio::join!(
        ledger.spend(user_id, Decimal::from(60), None, "race a"),
        ledger.spend(user_id, Decimal::from(60), None, "race b"),
    );

    let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(successes, 1, "exactly one racing spend must win");

    assert_eq!(balance_of(&pool, user_id).await, Decimal::from(40));
}

#[tokio::test]
#[ignore]
async fn test_unknown_user_surfaces_as_not_found() {
    let pool = setup_pool().await;
    let ledger = CreditLedger::new(pool.clone());

    let result = ledger.get_or_create_account(Uuid::new_v4()).await;
    assert!(matches!(result, Err(BillingError::UserNotFound(_))));

    let result = ledger
        .add(AddCreditsParams::new(
            Uuid::new_v4(),
            Decimal::from(10),
            TransactionType::CreditAdded,
        ))
        .await;
    assert!(matches!(result, Err(BillingError::UserNotFound(_))));
}

#[tokio::test]
#[ignore]
async fn test_duplicate_reference_rejected_by_constraint() {
    let pool = setup_pool().await;
    let ledger = CreditLedger::new(pool.clone());
    let user_id = create_test_user(&pool).await;
    let reference = format!("in_{}", Uuid::new_v4().simple());

    ledger
        .add(
            AddCreditsParams::new(user_id, Decimal::from(40), TransactionType::PlanRenewal)
                .reference(&reference),
        )
        .await
        .expect("first add failed");

    // Straight to the insert, bypassing any pre-check a caller might do:
    // the unique index must reject the duplicate and roll the balance
    // update back with it.
    let result = ledger
        .add(
            AddCreditsParams::new(user_id, Decimal::from(40), TransactionType::PlanRenewal)
                .reference(&reference),
        )
        .await;
    assert!(matches!(result, Err(BillingError::DuplicateReference(_))));

    assert_eq!(balance_of(&pool, user_id).await, Decimal::from(40));
}

// ============================================================================
// Trial fingerprint gate
// ============================================================================

#[tokio::test]
#[ignore]
async fn test_gate_rejects_second_registration() {
    let pool = setup_pool().await;
    let gate = TrialFingerprintGate::new(pool.clone());
    let first = create_test_user(&pool).await;
    let second = create_test_user(&pool).await;
    let fingerprint = format!("fp_{}", Uuid::new_v4());

    let params = |user_id| RegisterFingerprintParams {
        user_id,
        card_fingerprint: fingerprint.clone(),
        payment_method_id: "pm_test".to_string(),
        stripe_subscription_id: None,
        stripe_customer_id: None,
    };

    assert!(!gate
        .is_registered(&fingerprint)
        .await
        .expect("lookup failed"));

    let outcome = gate
        .check_and_register(params(first))
        .await
        .expect("first registration failed");
    assert_eq!(outcome, GateOutcome::Registered);
    assert!(gate
        .is_registered(&fingerprint)
        .await
        .expect("lookup failed"));

    let outcome = gate
        .check_and_register(params(second))
        .await
        .expect("second registration errored");
    assert_eq!(outcome, GateOutcome::Conflict);
}

#[tokio::test]
#[ignore]
async fn test_gate_concurrent_registrations_single_winner() {
    let pool = setup_pool().await;
    let gate = TrialFingerprintGate::new(pool.clone());
    let first = create_test_user(&pool).await;
    let second = create_test_user(&pool).await;
    let fingerprint = format!("fp_{}", Uuid::new_v4());

    let params = |user_id| RegisterFingerprintParams {
        user_id,
        card_fingerprint: fingerprint.clone(),
        payment_method_id: "pm_test".to_string(),
        stripe_subscription_id: None,
        stripe_customer_id: None,
    };

    let (a, b) = tokio::join!(
        gate.check_and_register(params(first)),
        gate.check_and_register(params(second)),
    );

    let outcomes = [
        a.expect("first call errored"),
        b.expect("second call errored"),
    ];
    let registered = outcomes
        .iter()
        .filter(|o| **o == GateOutcome::Registered)
        .count();
    assert_eq!(registered, 1, "exactly one registration must win");

    let count: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM used_trial_card_fingerprints WHERE card_fingerprint = $1",
    )
    .bind(&fingerprint)
    .fetch_one(&pool)
    .await
    .expect("count query failed");
    assert_eq!(count.0, 1);
}

// ============================================================================
// Purchase orchestration
// ============================================================================

#[tokio::test]
#[ignore]
async fn test_one_time_purchase_rejects_duplicate_reference() {
    let pool = setup_pool().await;
    let orchestrator = build_orchestrator(&pool, Arc::new(StubGateway::new(None, None)));
    let user_id = create_test_user(&pool).await;
    let reference = format!("ch_{}", Uuid::new_v4());

    orchestrator
        .purchase_one_time(user_id, Decimal::from(50), 999, &reference)
        .await
        .expect("first purchase failed");

    let result = orchestrator
        .purchase_one_time(user_id, Decimal::from(50), 999, &reference)
        .await;
    assert!(matches!(result, Err(BillingError::DuplicateReference(_))));

    assert_eq!(balance_of(&pool, user_id).await, Decimal::from(50));
}

#[tokio::test]
#[ignore]
async fn test_subscription_purchase_replays_are_rejected() {
    let pool = setup_pool().await;
    let price_id = format!("price_{}", Uuid::new_v4());
    create_test_plan(&pool, 100, 1999, &price_id, false).await;
    let orchestrator =
        build_orchestrator(&pool, Arc::new(StubGateway::new(None, Some(price_id))));
    let user_id = create_test_user(&pool).await;
    let stripe_sub_id = format!("sub_{}", Uuid::new_v4().simple());

    let purchase = orchestrator
        .purchase_subscription(SubscriptionPurchaseParams {
            user_id,
            stripe_subscription_id: stripe_sub_id.clone(),
            credit_override: None,
        })
        .await
        .expect("purchase failed");
    assert_eq!(
        purchase.transaction.reference_id.as_deref(),
        Some(stripe_sub_id.as_str())
    );

    let result = orchestrator
        .purchase_subscription(SubscriptionPurchaseParams {
            user_id,
            stripe_subscription_id: stripe_sub_id,
            credit_override: None,
        })
        .await;
    assert!(matches!(result, Err(BillingError::AlreadyProcessed(_))));

    assert_eq!(balance_of(&pool, user_id).await, Decimal::from(100));
}

#[tokio::test]
#[ignore]
async fn test_gate_not_consulted_for_regular_plans() {
    let pool = setup_pool().await;
    let price_id = format!("price_{}", Uuid::new_v4());
    create_test_plan(&pool, 100, 1999, &price_id, false).await;
    let gateway = Arc::new(StubGateway::new(
        Some(format!("fp_{}", Uuid::new_v4())),
        Some(price_id),
    ));
    let orchestrator = build_orchestrator(&pool, gateway.clone());
    let user_id = create_test_user(&pool).await;

    orchestrator
        .purchase_subscription(SubscriptionPurchaseParams {
            user_id,
            stripe_subscription_id: format!("sub_{}", Uuid::new_v4().simple()),
            credit_override: None,
        })
        .await
        .expect("purchase failed");

    assert_eq!(
        gateway.fingerprint_calls.load(Ordering::SeqCst),
        0,
        "fingerprint lookup must not run for non-limited plans"
    );
}

#[tokio::test]
#[ignore]
async fn test_limited_free_purchase_blocked_on_reused_card() {
    let pool = setup_pool().await;
    let price_id = format!("price_{}", Uuid::new_v4());
    create_test_plan(&pool, 25, 0, &price_id, true).await;
    let fingerprint = format!("fp_{}", Uuid::new_v4());

    // The card already consumed a trial under another user
    let prior_user = create_test_user(&pool).await;
    TrialFingerprintGate::new(pool.clone())
        .check_and_register(RegisterFingerprintParams {
            user_id: prior_user,
            card_fingerprint: fingerprint.clone(),
            payment_method_id: "pm_test".to_string(),
            stripe_subscription_id: None,
            stripe_customer_id: None,
        })
        .await
        .expect("seed registration failed");

    let gateway = Arc::new(StubGateway::new(Some(fingerprint), Some(price_id)));
    let publisher = Arc::new(RecordingPublisher::default());
    let orchestrator = build_orchestrator_with(&pool, gateway.clone(), publisher.clone());
    let user_id = create_test_user(&pool).await;

    let result = orchestrator
        .purchase_subscription(SubscriptionPurchaseParams {
            user_id,
            stripe_subscription_id: format!("sub_{}", Uuid::new_v4().simple()),
            credit_override: None,
        })
        .await;
    assert!(matches!(result, Err(BillingError::TrialCardReused)));

    // Full conflict compensation: provider-side cancel, rejected account
    // status, blocked notification. No credits, no active subscription.
    assert_eq!(gateway.cancel_calls.load(Ordering::SeqCst), 1);
    assert_eq!(account_status_of(&pool, user_id).await, "trial_rejected");
    assert_eq!(publisher.count("trial.blocked"), 1);
    assert_eq!(balance_of(&pool, user_id).await, Decimal::ZERO);
    let active: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM subscriptions WHERE user_id = $1 AND is_active = TRUE",
    )
    .bind(user_id)
    .fetch_one(&pool)
    .await
    .expect("count query failed");
    assert_eq!(active.0, 0);
}

#[tokio::test]
#[ignore]
async fn test_credit_override_replaces_plan_amount() {
    let pool = setup_pool().await;
    let price_id = format!("price_{}", Uuid::new_v4());
    create_test_plan(&pool, 100, 1999, &price_id, false).await;
    let orchestrator =
        build_orchestrator(&pool, Arc::new(StubGateway::new(None, Some(price_id))));
    let user_id = create_test_user(&pool).await;

    orchestrator
        .purchase_subscription(SubscriptionPurchaseParams {
            user_id,
            stripe_subscription_id: format!("sub_{}", Uuid::new_v4().simple()),
            credit_override: Some(Decimal::from(250)),
        })
        .await
        .expect("purchase failed");

    assert_eq!(balance_of(&pool, user_id).await, Decimal::from(250));
}

#[tokio::test]
#[ignore]
async fn test_upgrade_replaces_row_and_preserves_renewal() {
    let pool = setup_pool().await;
    let price_id = format!("price_{}", Uuid::new_v4());
    let small = create_test_plan(&pool, 50, 999, &price_id, false).await;
    let large = create_test_plan(
        &pool,
        200,
        2999,
        &format!("price_{}", Uuid::new_v4()),
        false,
    )
    .await;
    let orchestrator =
        build_orchestrator(&pool, Arc::new(StubGateway::new(None, Some(price_id))));
    let user_id = create_test_user(&pool).await;

    let subscription = orchestrator
        .purchase_subscription(SubscriptionPurchaseParams {
            user_id,
            stripe_subscription_id: format!("sub_{}", Uuid::new_v4().simple()),
            credit_override: None,
        })
        .await
        .expect("purchase failed")
        .subscription;

    // Downgrade attempt is rejected
    let result = orchestrator.upgrade(user_id, subscription.id, small).await;
    assert!(matches!(result, Err(BillingError::NotAnUpgrade)));

    let upgraded = orchestrator
        .upgrade(user_id, subscription.id, large)
        .await
        .expect("upgrade failed");

    // A new row carries the plan change; the old one stays for audit.
    assert_ne!(upgraded.id, subscription.id);
    assert_eq!(upgraded.plan_id, large);
    assert!(upgraded.is_active);
    assert_eq!(upgraded.renewal_date, subscription.renewal_date);
    assert_eq!(
        upgraded.stripe_subscription_id,
        subscription.stripe_subscription_id
    );

    let rows: Vec<(Uuid, String, bool)> = sqlx::query_as(
        "SELECT id, status, is_active FROM subscriptions WHERE user_id = $1 ORDER BY created_at",
    )
    .bind(user_id)
    .fetch_all(&pool)
    .await
    .expect("row query failed");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].0, subscription.id);
    assert_eq!(rows[0].1, "replaced");
    assert!(!rows[0].2);

    // Balance is initial grant plus the difference, not the new full amount
    assert_eq!(balance_of(&pool, user_id).await, Decimal::from(200));
}

#[tokio::test]
#[ignore]
async fn test_cancel_is_noop_on_inactive_subscription() {
    let pool = setup_pool().await;
    let price_id = format!("price_{}", Uuid::new_v4());
    create_test_plan(&pool, 50, 999, &price_id, false).await;
    let orchestrator =
        build_orchestrator(&pool, Arc::new(StubGateway::new(None, Some(price_id))));
    let user_id = create_test_user(&pool).await;

    let subscription = orchestrator
        .purchase_subscription(SubscriptionPurchaseParams {
            user_id,
            stripe_subscription_id: format!("sub_{}", Uuid::new_v4().simple()),
            credit_override: None,
        })
        .await
        .expect("purchase failed")
        .subscription;

    let outcome = orchestrator
        .cancel(user_id, subscription.id, true)
        .await
        .expect("cancel failed");
    assert!(outcome.canceled);
    assert!(outcome.provider_error.is_none());

    let outcome = orchestrator
        .cancel(user_id, subscription.id, true)
        .await
        .expect("second cancel errored");
    assert!(!outcome.canceled);
}

#[tokio::test]
#[ignore]
async fn test_cancel_rejects_other_users_subscription() {
    let pool = setup_pool().await;
    let price_id = format!("price_{}", Uuid::new_v4());
    create_test_plan(&pool, 50, 999, &price_id, false).await;
    let orchestrator =
        build_orchestrator(&pool, Arc::new(StubGateway::new(None, Some(price_id))));
    let owner = create_test_user(&pool).await;
    let stranger = create_test_user(&pool).await;

    let subscription = orchestrator
        .purchase_subscription(SubscriptionPurchaseParams {
            user_id: owner,
            stripe_subscription_id: format!("sub_{}", Uuid::new_v4().simple()),
            credit_override: None,
        })
        .await
        .expect("purchase failed")
        .subscription;

    let result = orchestrator.cancel(stranger, subscription.id, false).await;
    assert!(matches!(result, Err(BillingError::NotOwner)));
}

// ============================================================================
// Webhook-driven trial lifecycle
// ============================================================================

#[tokio::test]
#[ignore]
async fn test_trial_subscription_grants_credits_once() {
    let pool = setup_pool().await;
    let price_id = format!("price_{}", Uuid::new_v4());
    create_test_plan(&pool, 25, 0, &price_id, true).await;
    let (user_id, customer_id) = create_test_customer(&pool).await;
    let sub_id = format!("sub_{}", Uuid::new_v4().simple());

    let gateway = Arc::new(StubGateway::new(
        Some(format!("fp_{}", Uuid::new_v4())),
        Some(price_id.clone()),
    ));
    let publisher = Arc::new(RecordingPublisher::default());
    let service = build_service(&pool, gateway, publisher.clone());

    let remote = provider_subscription(
        &sub_id,
        &customer_id,
        &price_id,
        stripe::SubscriptionStatus::Trialing,
    );
    service.sync_from_provider(&remote).await.expect("sync failed");

    assert_eq!(balance_of(&pool, user_id).await, Decimal::from(25));
    assert_eq!(account_status_of(&pool, user_id).await, "trialing");
    assert!(trial_consumed(&pool, user_id).await);
    assert_eq!(publisher.count("trial.started"), 1);

    // A replayed trialing update must not grant a second time
    service.sync_from_provider(&remote).await.expect("resync failed");
    assert_eq!(balance_of(&pool, user_id).await, Decimal::from(25));
    assert_eq!(publisher.count("trial.started"), 1);
}

#[tokio::test]
#[ignore]
async fn test_trial_blocked_on_reused_card_via_webhook() {
    let pool = setup_pool().await;
    let price_id = format!("price_{}", Uuid::new_v4());
    create_test_plan(&pool, 25, 0, &price_id, true).await;
    let fingerprint = format!("fp_{}", Uuid::new_v4());

    let prior_user = create_test_user(&pool).await;
    TrialFingerprintGate::new(pool.clone())
        .check_and_register(RegisterFingerprintParams {
            user_id: prior_user,
            card_fingerprint: fingerprint.clone(),
            payment_method_id: "pm_test".to_string(),
            stripe_subscription_id: None,
            stripe_customer_id: None,
        })
        .await
        .expect("seed registration failed");

    let (user_id, customer_id) = create_test_customer(&pool).await;
    let sub_id = format!("sub_{}", Uuid::new_v4().simple());
    let gateway = Arc::new(StubGateway::new(Some(fingerprint), Some(price_id.clone())));
    let publisher = Arc::new(RecordingPublisher::default());
    let service = build_service(&pool, gateway.clone(), publisher.clone());

    let remote = provider_subscription(
        &sub_id,
        &customer_id,
        &price_id,
        stripe::SubscriptionStatus::Trialing,
    );
    service.sync_from_provider(&remote).await.expect("sync failed");

    assert_eq!(balance_of(&pool, user_id).await, Decimal::ZERO);
    assert_eq!(account_status_of(&pool, user_id).await, "trial_rejected");
    assert_eq!(gateway.cancel_calls.load(Ordering::SeqCst), 1);
    assert_eq!(publisher.count("trial.blocked"), 1);
    assert_eq!(publisher.count("trial.started"), 0);
}

// ============================================================================
// Invoice freeze/unfreeze cycle
// ============================================================================

#[tokio::test]
#[ignore]
async fn test_invoice_failure_freezes_and_payment_unfreezes() {
    let pool = setup_pool().await;
    let price_id = format!("price_{}", Uuid::new_v4());
    create_test_plan(&pool, 100, 1999, &price_id, false).await;
    let (user_id, customer_id) = create_test_customer(&pool).await;
    let sub_id = format!("sub_{}", Uuid::new_v4().simple());

    let gateway = Arc::new(StubGateway::new(None, Some(price_id.clone())));
    let publisher = Arc::new(RecordingPublisher::default());
    let service = build_service(&pool, gateway, publisher.clone());

    let remote = provider_subscription(
        &sub_id,
        &customer_id,
        &price_id,
        stripe::SubscriptionStatus::Active,
    );
    service.sync_from_provider(&remote).await.expect("sync failed");
    assert_eq!(account_status_of(&pool, user_id).await, "active");

    // Subscription-cycle failure freezes the account once
    let failed = provider_invoice(
        &format!("in_{}", Uuid::new_v4().simple()),
        &customer_id,
        Some(&sub_id),
        Some(stripe::InvoiceBillingReason::SubscriptionCycle),
    );
    service
        .handle_invoice_failed(&failed)
        .await
        .expect("failed-invoice handling errored");
    assert_eq!(account_status_of(&pool, user_id).await, "frozen");
    assert_eq!(publisher.count("account.frozen"), 1);

    // A second failure is edge-triggered: no second freeze notification
    service
        .handle_invoice_failed(&failed)
        .await
        .expect("repeat failed-invoice handling errored");
    assert_eq!(publisher.count("account.frozen"), 1);
    assert_eq!(publisher.count("invoice.failed"), 2);

    // A paid cycle invoice unfreezes and grants renewal credits once
    let paid_id = format!("in_{}", Uuid::new_v4().simple());
    let paid = provider_invoice(
        &paid_id,
        &customer_id,
        Some(&sub_id),
        Some(stripe::InvoiceBillingReason::SubscriptionCycle),
    );
    service
        .handle_invoice_paid(&paid)
        .await
        .expect("paid-invoice handling errored");
    assert_eq!(account_status_of(&pool, user_id).await, "active");
    assert_eq!(publisher.count("account.unfrozen"), 1);
    assert_eq!(balance_of(&pool, user_id).await, Decimal::from(100));

    // A replayed delivery of the same invoice must not double-grant
    service
        .handle_invoice_paid(&paid)
        .await
        .expect("replayed paid-invoice handling errored");
    assert_eq!(balance_of(&pool, user_id).await, Decimal::from(100));
    assert_eq!(publisher.count("invoice.paid"), 2);
}

#[tokio::test]
#[ignore]
async fn test_one_off_invoice_failure_does_not_freeze() {
    let pool = setup_pool().await;
    let price_id = format!("price_{}", Uuid::new_v4());
    create_test_plan(&pool, 100, 1999, &price_id, false).await;
    let (user_id, customer_id) = create_test_customer(&pool).await;

    let gateway = Arc::new(StubGateway::new(None, Some(price_id)));
    let publisher = Arc::new(RecordingPublisher::default());
    let service = build_service(&pool, gateway, publisher.clone());

    let failed = provider_invoice(
        &format!("in_{}", Uuid::new_v4().simple()),
        &customer_id,
        None,
        Some(stripe::InvoiceBillingReason::Manual),
    );
    service
        .handle_invoice_failed(&failed)
        .await
        .expect("failed-invoice handling errored");

    assert_eq!(account_status_of(&pool, user_id).await, "new_user");
    assert_eq!(publisher.count("account.frozen"), 0);
    assert_eq!(publisher.count("invoice.failed"), 1);
}

// ============================================================================
// Webhook idempotency markers
// ============================================================================

#[tokio::test]
#[ignore]
async fn test_processed_event_marker_is_idempotent() {
    let pool = setup_pool().await;
    let gateway = Arc::new(StubGateway::new(None, None));
    let service = build_service(
        &pool,
        gateway,
        Arc::new(RecordingPublisher::default()),
    );
    let handler =
        ledgerd_billing::WebhookHandler::new(pool.clone(), service, "whsec_test".to_string());

    let event_id = format!("evt_{}", Uuid::new_v4());
    assert!(!handler.is_processed(&event_id).await);

    handler
        .mark_processed(&event_id, "customer.subscription.created")
        .await
        .expect("first mark failed");
    // A replayed delivery marking the same event is a no-op, not an error
    handler
        .mark_processed(&event_id, "customer.subscription.created")
        .await
        .expect("replayed mark errored");

    assert!(handler.is_processed(&event_id).await);

    let count: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM processed_events WHERE stripe_event_id = $1")
            .bind(&event_id)
            .fetch_one(&pool)
            .await
            .expect("count query failed");
    assert_eq!(count.0, 1);
}
