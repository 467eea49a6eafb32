//! Common types used across ledgerd

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Enums
// =============================================================================

/// Type of a credit ledger transaction.
///
/// Stored as TEXT in `credit_transactions.transaction_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    PurchaseOneTime,
    CreditAdded,
    CreditUsed,
    PlanPurchase,
    PlanRenewal,
    PlanUpgrade,
    TrialCreditGrant,
    Refund,
    CreditExpired,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::PurchaseOneTime => "purchase_one_time",
            TransactionType::CreditAdded => "credit_added",
            TransactionType::CreditUsed => "credit_used",
            TransactionType::PlanPurchase => "plan_purchase",
            TransactionType::PlanRenewal => "plan_renewal",
            TransactionType::PlanUpgrade => "plan_upgrade",
            TransactionType::TrialCreditGrant => "trial_credit_grant",
            TransactionType::Refund => "refund",
            TransactionType::CreditExpired => "credit_expired",
        }
    }

    /// Whether this transaction type debits the account balance.
    pub fn is_debit(&self) -> bool {
        matches!(
            self,
            TransactionType::CreditUsed | TransactionType::CreditExpired
        )
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Coarse account lifecycle status for a user.
///
/// `TrialRejected` is absorbing: it is only entered from a trial-card
/// conflict and nothing transitions out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    NewUser,
    Trialing,
    Active,
    Frozen,
    Canceled,
    TrialRejected,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::NewUser => "new_user",
            AccountStatus::Trialing => "trialing",
            AccountStatus::Active => "active",
            AccountStatus::Frozen => "frozen",
            AccountStatus::Canceled => "canceled",
            AccountStatus::TrialRejected => "trial_rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new_user" => Some(AccountStatus::NewUser),
            "trialing" => Some(AccountStatus::Trialing),
            "active" => Some(AccountStatus::Active),
            "frozen" => Some(AccountStatus::Frozen),
            "canceled" => Some(AccountStatus::Canceled),
            "trial_rejected" => Some(AccountStatus::TrialRejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Internal subscription status.
///
/// Mirrors the provider's status values plus two internal-only states:
/// `Replaced` (superseded by a new purchase) and `PaymentIssue` (credit
/// grant failed after the subscription was created).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Unpaid,
    Incomplete,
    Replaced,
    PaymentIssue,
    Inactive,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::Replaced => "replaced",
            SubscriptionStatus::PaymentIssue => "payment_issue",
            SubscriptionStatus::Inactive => "inactive",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Row Types
// =============================================================================

/// A user, as seen by the billing system.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub account_status: String,
    pub has_consumed_initial_trial: bool,
    pub stripe_customer_id: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl User {
    pub fn status(&self) -> Option<AccountStatus> {
        AccountStatus::parse(&self.account_status)
    }
}

/// Per-user credit account. Created lazily and mutated only through
/// the ledger.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CreditAccount {
    pub user_id: Uuid,
    pub balance: Decimal,
    pub updated_at: OffsetDateTime,
}

/// Immutable, append-only record of one ledger mutation.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub account_id: Uuid,
    pub amount: Decimal,
    pub transaction_type: String,
    pub reference_id: Option<String>,
    pub description: String,
    pub plan_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
}

/// Purchasable plan from the catalog.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub credit_amount: Decimal,
    pub price_cents: i64,
    pub is_active: bool,
    pub stripe_price_id: Option<String>,
    pub stripe_product_id: Option<String>,
    pub is_limited_free: bool,
    pub created_at: OffsetDateTime,
}

/// A user's subscription to a plan.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub stripe_subscription_id: Option<String>,
    pub status: String,
    pub is_active: bool,
    pub auto_renew: bool,
    pub start_date: OffsetDateTime,
    pub renewal_date: OffsetDateTime,
    pub last_renewal_date: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Write-once record of a card fingerprint that has consumed a free trial.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UsedTrialCardFingerprint {
    pub id: Uuid,
    pub user_id: Uuid,
    pub card_fingerprint: String,
    pub payment_method_id: String,
    pub stripe_subscription_id: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Idempotency marker for a fully handled provider event.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub stripe_event_id: String,
    pub event_type: String,
    pub processed_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_type_strings() {
        assert_eq!(TransactionType::PlanPurchase.as_str(), "plan_purchase");
        assert_eq!(
            TransactionType::TrialCreditGrant.to_string(),
            "trial_credit_grant"
        );
        assert_eq!(TransactionType::CreditUsed.as_str(), "credit_used");
    }

    #[test]
    fn test_transaction_type_debit() {
        assert!(TransactionType::CreditUsed.is_debit());
        assert!(TransactionType::CreditExpired.is_debit());
        assert!(!TransactionType::PlanPurchase.is_debit());
        assert!(!TransactionType::TrialCreditGrant.is_debit());
    }

    #[test]
    fn test_account_status_round_trip() {
        for status in [
            AccountStatus::NewUser,
            AccountStatus::Trialing,
            AccountStatus::Active,
            AccountStatus::Frozen,
            AccountStatus::Canceled,
            AccountStatus::TrialRejected,
        ] {
            assert_eq!(AccountStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(AccountStatus::parse("bogus"), None);
    }

    #[test]
    fn test_subscription_status_strings() {
        assert_eq!(SubscriptionStatus::PastDue.as_str(), "past_due");
        assert_eq!(SubscriptionStatus::Replaced.to_string(), "replaced");
    }
}
