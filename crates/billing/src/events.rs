//! Internal domain-event publishing
//!
//! Fire-and-forget fan-out of billing notifications to external consumers
//! (trial started/blocked, account frozen/unfrozen, invoice paid/failed).
//! Publishing is best-effort: a failed publish is logged and swallowed and
//! never aborts the operation that produced the event.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Names of the domain events this system publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainEventType {
    TrialStarted,
    TrialBlocked,
    AccountFrozen,
    AccountUnfrozen,
    InvoicePaid,
    InvoiceFailed,
}

impl DomainEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainEventType::TrialStarted => "trial.started",
            DomainEventType::TrialBlocked => "trial.blocked",
            DomainEventType::AccountFrozen => "account.frozen",
            DomainEventType::AccountUnfrozen => "account.unfrozen",
            DomainEventType::InvoicePaid => "invoice.paid",
            DomainEventType::InvoiceFailed => "invoice.failed",
        }
    }
}

impl std::fmt::Display for DomainEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A domain event with its payload
#[derive(Debug, Clone, Serialize)]
pub struct DomainEvent {
    pub event: DomainEventType,
    pub user_id: Uuid,
    pub payload: serde_json::Value,
}

impl DomainEvent {
    pub fn new(event: DomainEventType, user_id: Uuid) -> Self {
        Self {
            event,
            user_id,
            payload: serde_json::json!({}),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Sink for domain events
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: DomainEvent) -> anyhow::Result<()>;
}

/// Publish an event, logging and swallowing any failure.
pub async fn publish_best_effort(publisher: &dyn EventPublisher, event: DomainEvent) {
    let name = event.event;
    let user_id = event.user_id;
    if let Err(e) = publisher.publish(event).await {
        tracing::warn!(
            event = %name,
            user_id = %user_id,
            error = %e,
            "Failed to publish domain event (best-effort, continuing)"
        );
    }
}

/// HTTP sink that POSTs each event as JSON to a configured URL
pub struct HttpEventPublisher {
    client: reqwest::Client,
    sink_url: String,
}

impl HttpEventPublisher {
    pub fn new(sink_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self { client, sink_url }
    }
}

#[async_trait]
impl EventPublisher for HttpEventPublisher {
    async fn publish(&self, event: DomainEvent) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.sink_url)
            .json(&serde_json::json!({
                "event": event.event.as_str(),
                "user_id": event.user_id,
                "payload": event.payload,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("event sink returned status {}", response.status());
        }

        tracing::debug!(event = %event.event, user_id = %event.user_id, "Domain event published");
        Ok(())
    }
}

/// Publisher that drops all events. Used when no sink is configured
/// and in tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, event: DomainEvent) -> anyhow::Result<()> {
        tracing::debug!(event = %event.event, user_id = %event.user_id, "Domain event dropped (no sink configured)");
        Ok(())
    }
}
