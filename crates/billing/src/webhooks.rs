//! Webhook intake and dispatch
//!
//! Verifies provider webhook signatures, enforces exactly-once handling
//! through the `processed_events` table, and routes each event to the
//! subscription state machine. The processed marker is written only
//! after the handler succeeds, so a failed delivery is retried by the
//! provider and replays of a finished event are acknowledged without
//! side effects.

use sqlx::PgPool;

use crate::error::{BillingError, BillingResult};
use crate::subscriptions::SubscriptionService;

/// How a delivered event was disposed of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Handled now and marked processed.
    Processed,
    /// Seen before; acknowledged without running any handler.
    AlreadyProcessed,
    /// Event type this service does not handle.
    Ignored,
}

#[derive(Clone)]
pub struct WebhookHandler {
    pool: PgPool,
    subscriptions: SubscriptionService,
    webhook_secret: String,
}

impl WebhookHandler {
    pub fn new(pool: PgPool, subscriptions: SubscriptionService, webhook_secret: String) -> Self {
        Self {
            pool,
            subscriptions,
            webhook_secret,
        }
    }

    /// Verify the payload signature and parse the event. Fails closed:
    /// any verification problem rejects the delivery.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<stripe::Event> {
        stripe::Webhook::construct_event(payload, signature, &self.webhook_secret).map_err(|e| {
            tracing::warn!(error = %e, "Webhook signature verification failed");
            BillingError::WebhookSignatureInvalid
        })
    }

    /// Handle a verified event exactly once.
    pub async fn handle_event(&self, event: stripe::Event) -> BillingResult<WebhookOutcome> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();

        if self.is_processed(&event_id).await {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                "Webhook event already processed, acknowledging"
            );
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        tracing::info!(
            event_id = %event_id,
            event_type = %event_type,
            "Processing webhook event"
        );

        let handled = match event.type_ {
            stripe::EventType::CustomerSubscriptionCreated
            | stripe::EventType::CustomerSubscriptionUpdated => {
                let subscription = Self::extract_subscription(&event)?;
                self.subscriptions.sync_from_provider(subscription).await?;
                true
            }
            stripe::EventType::CustomerSubscriptionDeleted => {
                let subscription = Self::extract_subscription(&event)?;
                self.subscriptions
                    .handle_provider_cancellation(subscription)
                    .await?;
                true
            }
            stripe::EventType::InvoicePaymentSucceeded => {
                let invoice = Self::extract_invoice(&event)?;
                self.subscriptions.handle_invoice_paid(invoice).await?;
                true
            }
            stripe::EventType::InvoicePaymentFailed => {
                let invoice = Self::extract_invoice(&event)?;
                self.subscriptions.handle_invoice_failed(invoice).await?;
                true
            }
            _ => {
                tracing::debug!(event_type = %event_type, "Unhandled webhook event type");
                false
            }
        };

        // Unhandled types are marked too, so a later replay short-circuits.
        self.mark_processed(&event_id, &event_type).await?;

        Ok(if handled {
            WebhookOutcome::Processed
        } else {
            WebhookOutcome::Ignored
        })
    }

    /// Whether the event id is already marked processed. A transient
    /// lookup failure reads as "not processed"; downstream reference
    /// guards keep a rerun from double-granting.
    pub async fn is_processed(&self, event_id: &str) -> bool {
        let result: Result<(bool,), sqlx::Error> = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM processed_events WHERE stripe_event_id = $1)",
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok((exists,)) => exists,
            Err(e) => {
                tracing::warn!(
                    event_id = %event_id,
                    error = %e,
                    "Processed-event lookup failed, treating as unprocessed"
                );
                false
            }
        }
    }

    pub async fn mark_processed(&self, event_id: &str, event_type: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO processed_events (stripe_event_id, event_type)
            VALUES ($1, $2)
            ON CONFLICT (stripe_event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn extract_subscription(event: &stripe::Event) -> BillingResult<&stripe::Subscription> {
        match &event.data.object {
            stripe::EventObject::Subscription(subscription) => Ok(subscription),
            other => Err(BillingError::Internal(format!(
                "Expected subscription object in {} event, got {:?}",
                event.type_, other
            ))),
        }
    }

    fn extract_invoice(event: &stripe::Event) -> BillingResult<&stripe::Invoice> {
        match &event.data.object {
            stripe::EventObject::Invoice(invoice) => Ok(invoice),
            other => Err(BillingError::Internal(format!(
                "Expected invoice object in {} event, got {:?}",
                event.type_, other
            ))),
        }
    }
}
