//! Plan catalog
//!
//! Read-mostly lookup of purchasable plans. Catalog administration
//! (creating and editing plans) happens out of band.

use sqlx::PgPool;
use uuid::Uuid;

use ledgerd_shared::Plan;

use crate::error::{BillingError, BillingResult};

const PLAN_COLUMNS: &str = "id, name, credit_amount, price_cents, is_active, \
     stripe_price_id, stripe_product_id, is_limited_free, created_at";

#[derive(Clone)]
pub struct PlanCatalog {
    pool: PgPool,
}

impl PlanCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_active_plans(&self) -> BillingResult<Vec<Plan>> {
        let plans: Vec<Plan> = sqlx::query_as(&format!(
            "SELECT {PLAN_COLUMNS} FROM plans WHERE is_active = TRUE ORDER BY price_cents ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(plans)
    }

    pub async fn get_plan_by_id(&self, plan_id: Uuid) -> BillingResult<Plan> {
        let plan: Option<Plan> =
            sqlx::query_as(&format!("SELECT {PLAN_COLUMNS} FROM plans WHERE id = $1"))
                .bind(plan_id)
                .fetch_optional(&self.pool)
                .await?;

        plan.ok_or_else(|| BillingError::PlanNotFound(plan_id.to_string()))
    }

    pub async fn get_plan_by_stripe_price_id(&self, price_id: &str) -> BillingResult<Option<Plan>> {
        let plan: Option<Plan> = sqlx::query_as(&format!(
            "SELECT {PLAN_COLUMNS} FROM plans WHERE stripe_price_id = $1 AND is_active = TRUE"
        ))
        .bind(price_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(plan)
    }

    /// Resolve the plan for a provider price id, falling back to the first
    /// active plan when there is no exact match. Errors only when the
    /// catalog has no active plans at all.
    pub async fn resolve_for_price(&self, price_id: Option<&str>) -> BillingResult<Plan> {
        if let Some(price_id) = price_id {
            if let Some(plan) = self.get_plan_by_stripe_price_id(price_id).await? {
                return Ok(plan);
            }
            tracing::warn!(
                price_id = %price_id,
                "No plan matches provider price id, falling back to first active plan"
            );
        }

        self.get_active_plans()
            .await?
            .into_iter()
            .next()
            .ok_or(BillingError::NoPlansConfigured)
    }
}
