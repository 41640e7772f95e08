//! Stripe webhook handling
//!
//! Every delivery passes through the same gates in order: signature check,
//! envelope parse, atomic claim in the event store, dispatch to the
//! subscription state machine, then a terminal `processed`/`failed` mark.
//! Operators and the worker can replay failed or stuck events from the
//! stored payload snapshot.

use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult, ErrorKind};
use crate::events::{
    BillingEventRecord, ClaimOutcome, EventStatus, EventStore, FailureKind, NewBillingEvent,
};
use crate::signature::verify_signature;
use crate::stripe_event::WebhookEvent;
use crate::subscriptions::{Disposition, HandlerOutcome, SubscriptionStateMachine};

/// Maximum page size for event listings.
pub const MAX_EVENT_PAGE: i64 = 200;

/// Result of handling one delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processed {
        event_id: String,
        event_type: String,
        org_id: Option<Uuid>,
        license_id: Option<Uuid>,
    },
    /// Handled without a state change (missing linkage, canceled license).
    Skipped {
        event_id: String,
        event_type: String,
        reason: String,
    },
    /// Event type the billing core does not act on.
    Ignored { event_id: String, event_type: String },
    /// Already processed, or in flight in another delivery.
    Duplicate { event_id: String, status: EventStatus },
    Failed {
        event_id: String,
        event_type: String,
        kind: FailureKind,
        message: String,
    },
}

impl WebhookOutcome {
    /// Error classification of a delivery that did not simply succeed.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            WebhookOutcome::Processed { .. } | WebhookOutcome::Ignored { .. } => None,
            WebhookOutcome::Skipped { .. } => Some(ErrorKind::LinkageNotFound),
            WebhookOutcome::Duplicate { .. } => Some(ErrorKind::DuplicateEvent),
            WebhookOutcome::Failed { kind, .. } => Some(match kind {
                FailureKind::Configuration => ErrorKind::Configuration,
                FailureKind::Unhandled => ErrorKind::Unhandled,
            }),
        }
    }

    /// Whether the provider should get a 2xx. Only unhandled failures ask
    /// for re-delivery; configuration failures wait for an operator.
    pub fn acknowledge(&self) -> bool {
        self.kind() != Some(ErrorKind::Unhandled)
    }

    pub fn event_id(&self) -> &str {
        match self {
            WebhookOutcome::Processed { event_id, .. }
            | WebhookOutcome::Skipped { event_id, .. }
            | WebhookOutcome::Ignored { event_id, .. }
            | WebhookOutcome::Duplicate { event_id, .. }
            | WebhookOutcome::Failed { event_id, .. } => event_id,
        }
    }
}

/// Summary of a batch replay
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub attempted: usize,
    pub processed: usize,
    pub failed: usize,
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    events: Arc<dyn EventStore>,
    machine: SubscriptionStateMachine,
    webhook_secret: String,
    tolerance_secs: i64,
}

impl WebhookHandler {
    pub fn new(
        events: Arc<dyn EventStore>,
        machine: SubscriptionStateMachine,
        webhook_secret: impl Into<String>,
        tolerance_secs: i64,
    ) -> Self {
        Self {
            events,
            machine,
            webhook_secret: webhook_secret.into(),
            tolerance_secs,
        }
    }

    /// Verify, record and process one delivery.
    ///
    /// Signature and parse failures return `Err` with nothing persisted.
    /// Handler failures are recorded on the event and come back as
    /// [`WebhookOutcome::Failed`].
    pub async fn handle_webhook(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> BillingResult<WebhookOutcome> {
        verify_signature(&self.webhook_secret, payload, signature, self.tolerance_secs)?;

        let event = WebhookEvent::parse(payload).map_err(|e| {
            tracing::warn!(error = %e, "Failed to parse webhook payload");
            e
        })?;
        let snapshot: serde_json::Value = serde_json::from_slice(payload)?;

        let claim = self
            .events
            .claim(&NewBillingEvent {
                external_event_id: event.id.clone(),
                event_type: event.event_type.clone(),
                payload: snapshot,
            })
            .await
            .map_err(|e| {
                tracing::error!(event_id = %event.id, error = %e, "Failed to claim webhook event");
                e
            })?;

        match claim {
            ClaimOutcome::AlreadyRecorded { status } => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    status = %status,
                    "Duplicate webhook event"
                );
                Ok(WebhookOutcome::Duplicate {
                    event_id: event.id,
                    status,
                })
            }
            ClaimOutcome::Claimed { attempt } => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    attempt,
                    "Processing Stripe webhook event"
                );
                self.process_claimed(&event).await
            }
        }
    }

    /// Run the handler for an event this process has claimed and record
    /// the result.
    async fn process_claimed(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        match self.machine.dispatch(event).await {
            Ok(outcome) => {
                self.mark_processed(event, &outcome).await?;
                Ok(match outcome.disposition {
                    Disposition::Applied => WebhookOutcome::Processed {
                        event_id: event.id.clone(),
                        event_type: event.event_type.clone(),
                        org_id: outcome.org_id,
                        license_id: outcome.license_id,
                    },
                    Disposition::Skipped(reason) => WebhookOutcome::Skipped {
                        event_id: event.id.clone(),
                        event_type: event.event_type.clone(),
                        reason,
                    },
                    Disposition::Ignored => WebhookOutcome::Ignored {
                        event_id: event.id.clone(),
                        event_type: event.event_type.clone(),
                    },
                })
            }
            Err(err) => {
                let kind = failure_kind(&err);
                let message = err.to_string();
                match kind {
                    FailureKind::Configuration => tracing::error!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        error = %message,
                        "Webhook event needs operator attention"
                    ),
                    FailureKind::Unhandled => tracing::error!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        error = %message,
                        "Webhook event processing failed"
                    ),
                }

                self.events
                    .mark_failed(&event.id, &message, kind)
                    .await
                    .map_err(|e| {
                        tracing::error!(event_id = %event.id, error = %e, "Failed to record webhook failure");
                        e
                    })?;

                Ok(WebhookOutcome::Failed {
                    event_id: event.id.clone(),
                    event_type: event.event_type.clone(),
                    kind,
                    message,
                })
            }
        }
    }

    async fn mark_processed(
        &self,
        event: &WebhookEvent,
        outcome: &HandlerOutcome,
    ) -> BillingResult<()> {
        let first = self
            .events
            .mark_processed(&event.id, outcome.org_id, outcome.license_id)
            .await;
        let Err(e) = first else {
            return Ok(());
        };

        // State is already committed. An unmarked event is picked up again
        // once it goes stale.
        tracing::warn!(event_id = %event.id, error = %e, "Failed to mark event processed, retrying");
        self.events
            .mark_processed(&event.id, outcome.org_id, outcome.license_id)
            .await
            .map_err(|retry_err| {
                tracing::error!(
                    event_id = %event.id,
                    first_error = %e,
                    error = %retry_err,
                    "Event left in received state"
                );
                retry_err
            })
    }

    /// Re-run a failed or stuck event from its stored snapshot.
    ///
    /// The snapshot was signature-checked when it was received, so it is
    /// not verified again.
    pub async fn replay_event(&self, external_event_id: &str) -> BillingResult<WebhookOutcome> {
        let existing = self
            .events
            .find(external_event_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("billing event {external_event_id}")))?;

        if existing.status == EventStatus::Processed {
            return Err(BillingError::InvalidInput(format!(
                "event {external_event_id} was already processed"
            )));
        }

        let Some(record) = self.events.reclaim_for_replay(external_event_id).await? else {
            return Err(BillingError::InvalidInput(format!(
                "event {external_event_id} is currently being processed"
            )));
        };

        tracing::info!(
            event_id = %record.external_event_id,
            event_type = %record.event_type,
            previous_status = %existing.status,
            previous_error = ?existing.failure_reason,
            attempt = record.attempts,
            "Replaying webhook event"
        );

        let event: WebhookEvent = match serde_json::from_value(record.payload.clone()) {
            Ok(event) => event,
            Err(e) => {
                let message = format!("stored payload is unreadable: {e}");
                self.events
                    .mark_failed(external_event_id, &message, FailureKind::Configuration)
                    .await?;
                return Ok(WebhookOutcome::Failed {
                    event_id: record.external_event_id,
                    event_type: record.event_type,
                    kind: FailureKind::Configuration,
                    message,
                });
            }
        };

        let outcome = self.process_claimed(&event).await?;
        tracing::info!(
            event_id = %external_event_id,
            success = outcome.acknowledge(),
            "Webhook replay completed"
        );
        Ok(outcome)
    }

    /// Replay unhandled failures below `max_attempts` and stuck events.
    pub async fn replay_pending(&self, max_attempts: i32, limit: i64) -> BillingResult<ReplaySummary> {
        let ids = self.events.list_replayable(max_attempts, limit).await?;
        let mut summary = ReplaySummary::default();

        for id in ids {
            summary.attempted += 1;
            match self.replay_event(&id).await {
                Ok(WebhookOutcome::Failed { .. }) => summary.failed += 1,
                Ok(_) => summary.processed += 1,
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(event_id = %id, error = %e, "Failed to replay webhook event");
                }
            }
        }

        if summary.attempted > 0 {
            tracing::info!(
                attempted = summary.attempted,
                processed = summary.processed,
                failed = summary.failed,
                "Replayed pending webhook events"
            );
        }
        Ok(summary)
    }

    pub async fn list_events(
        &self,
        status: Option<EventStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<BillingEventRecord>> {
        self.events
            .list(status, limit.clamp(1, MAX_EVENT_PAGE), offset.max(0))
            .await
    }

    pub async fn get_event(&self, external_event_id: &str) -> BillingResult<Option<BillingEventRecord>> {
        self.events.find(external_event_id).await
    }
}

fn failure_kind(err: &BillingError) -> FailureKind {
    match err.kind() {
        ErrorKind::Configuration => FailureKind::Configuration,
        _ => FailureKind::Unhandled,
    }
}
