//! Billing endpoints: webhook intake, purchases, subscriptions, and
//! credit balance/history.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use ledgerd_billing::WebhookOutcome;
use ledgerd_shared::{CreditTransaction, Plan, Subscription};

use crate::error::ApiError;
use crate::state::AppState;

fn rfc3339(ts: time::OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_default()
}

// ============================================================================
// Webhook
// ============================================================================

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
}

/// Handle provider webhook events
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookResponse>, ApiError> {
    tracing::info!(body_len = body.len(), "Webhook received");

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Webhook missing signature header");
            ApiError::BadRequest("Missing webhook signature".to_string())
        })?;

    let event = state.webhooks.verify_event(&body, signature)?;

    tracing::info!(
        event_type = %event.type_,
        event_id = %event.id,
        "Webhook event verified"
    );

    let outcome = state.webhooks.handle_event(event).await.map_err(|e| {
        tracing::error!(error = %e, "Webhook handling error");
        ApiError::from(e)
    })?;

    tracing::info!(outcome = ?outcome, "Webhook processed");

    let status = match outcome {
        WebhookOutcome::Processed => "processed",
        WebhookOutcome::AlreadyProcessed => "already_processed",
        WebhookOutcome::Ignored => "ignored",
    };

    Ok(Json(WebhookResponse { status }))
}

// ============================================================================
// Plans
// ============================================================================

#[derive(Debug, Serialize)]
pub struct PlanResponse {
    pub id: Uuid,
    pub name: String,
    pub credit_amount: String,
    pub price_cents: i64,
    pub is_limited_free: bool,
}

impl From<Plan> for PlanResponse {
    fn from(plan: Plan) -> Self {
        Self {
            id: plan.id,
            name: plan.name,
            credit_amount: plan.credit_amount.to_string(),
            price_cents: plan.price_cents,
            is_limited_free: plan.is_limited_free,
        }
    }
}

/// List purchasable plans
pub async fn list_plans(
    State(state): State<AppState>,
) -> Result<Json<Vec<PlanResponse>>, ApiError> {
    let plans = state.plans.get_active_plans().await?;
    Ok(Json(plans.into_iter().map(PlanResponse::from).collect()))
}

// ============================================================================
// Balance and history
// ============================================================================

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub user_id: Uuid,
    pub balance: String,
}

/// Get the current credit balance
pub async fn get_balance(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let account = state.ledger.get_or_create_account(user_id).await?;
    Ok(Json(BalanceResponse {
        user_id,
        balance: account.balance.to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    25
}

#[derive(Debug, Serialize)]
pub struct TransactionResponse {
    pub id: Uuid,
    pub amount: String,
    pub transaction_type: String,
    pub reference_id: Option<String>,
    pub description: String,
    pub created_at: String,
}

impl From<CreditTransaction> for TransactionResponse {
    fn from(t: CreditTransaction) -> Self {
        Self {
            id: t.id,
            amount: t.amount.to_string(),
            transaction_type: t.transaction_type,
            reference_id: t.reference_id,
            description: t.description,
            created_at: rfc3339(t.created_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub transactions: Vec<TransactionResponse>,
    pub total_count: i64,
    pub balance: String,
    pub page: i64,
    pub page_size: i64,
}

/// Get transaction history, newest first
pub async fn get_history(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let page = query.page.max(1);
    let page_size = query.page_size.clamp(1, 100);
    let offset = (page - 1) * page_size;

    let history = state.ledger.history(user_id, offset, page_size).await?;

    Ok(Json(HistoryResponse {
        transactions: history
            .transactions
            .into_iter()
            .map(TransactionResponse::from)
            .collect(),
        total_count: history.total_count,
        balance: history.balance.to_string(),
        page,
        page_size,
    }))
}

// ============================================================================
// Purchases
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct OneTimePurchaseRequest {
    pub amount: rust_decimal::Decimal,
    pub price_cents: i64,
    pub reference_id: String,
}

/// One-time credit purchase
pub async fn purchase_one_time(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(request): Json<OneTimePurchaseRequest>,
) -> Result<(StatusCode, Json<TransactionResponse>), ApiError> {
    if request.reference_id.trim().is_empty() {
        return Err(ApiError::BadRequest("reference_id is required".to_string()));
    }

    let transaction = state
        .purchase
        .purchase_one_time(
            user_id,
            request.amount,
            request.price_cents,
            &request.reference_id,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(transaction.into())))
}

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub stripe_subscription_id: String,
    pub credit_override: Option<rust_decimal::Decimal>,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub status: String,
    pub is_active: bool,
    pub renewal_date: String,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionPurchaseResponse {
    pub subscription: SubscriptionResponse,
    pub transaction: TransactionResponse,
}

impl From<Subscription> for SubscriptionResponse {
    fn from(s: Subscription) -> Self {
        Self {
            id: s.id,
            plan_id: s.plan_id,
            status: s.status,
            is_active: s.is_active,
            renewal_date: rfc3339(s.renewal_date),
        }
    }
}

/// Purchase a subscription plan
pub async fn purchase_subscription(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(request): Json<SubscribeRequest>,
) -> Result<(StatusCode, Json<SubscriptionPurchaseResponse>), ApiError> {
    if request.stripe_subscription_id.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "stripe_subscription_id is required".to_string(),
        ));
    }

    let purchase = state
        .purchase
        .purchase_subscription(ledgerd_billing::SubscriptionPurchaseParams {
            user_id,
            stripe_subscription_id: request.stripe_subscription_id,
            credit_override: request.credit_override,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(SubscriptionPurchaseResponse {
            subscription: purchase.subscription.into(),
            transaction: purchase.transaction.into(),
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct UpgradeRequest {
    pub plan_id: Uuid,
}

/// Upgrade a subscription to a higher-priced plan
pub async fn upgrade_subscription(
    State(state): State<AppState>,
    Path((user_id, subscription_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<UpgradeRequest>,
) -> Result<Json<SubscriptionResponse>, ApiError> {
    let subscription = state
        .purchase
        .upgrade(user_id, subscription_id, request.plan_id)
        .await?;

    Ok(Json(subscription.into()))
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    #[serde(default = "default_true")]
    pub cancel_with_provider: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CancelRequest {
    fn default() -> Self {
        Self {
            cancel_with_provider: true,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub canceled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_error: Option<String>,
}

/// Cancel a subscription
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Path((user_id, subscription_id)): Path<(Uuid, Uuid)>,
    request: Option<Json<CancelRequest>>,
) -> Result<Json<CancelResponse>, ApiError> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let outcome = state
        .purchase
        .cancel(user_id, subscription_id, request.cancel_with_provider)
        .await?;
    Ok(Json(CancelResponse {
        canceled: outcome.canceled,
        provider_error: outcome.provider_error,
    }))
}
