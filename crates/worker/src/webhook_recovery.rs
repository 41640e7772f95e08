//! Webhook recovery jobs
//!
//! Replays events that failed with a retryable error, or that were claimed
//! by a delivery that never finished, from their stored payload snapshots.

use dealerhub_billing::{EventStatus, FailureKind, ReplaySummary, WebhookHandler};
use tracing::{error, info, warn};

/// Events replayed per cycle.
pub const REPLAY_BATCH_SIZE: i64 = 100;

/// Page size when scanning for events that need an operator.
const BACKLOG_PAGE: i64 = 200;

/// One replay pass. Errors are logged; the next tick tries again.
pub async fn run_replay_cycle(webhooks: &WebhookHandler, max_attempts: i32) -> ReplaySummary {
    match webhooks.replay_pending(max_attempts, REPLAY_BATCH_SIZE).await {
        Ok(summary) => {
            if summary.attempted > 0 {
                info!(
                    attempted = summary.attempted,
                    processed = summary.processed,
                    failed = summary.failed,
                    "Webhook recovery cycle complete"
                );
            }
            summary
        }
        Err(e) => {
            error!(error = %e, "Webhook recovery cycle failed");
            ReplaySummary::default()
        }
    }
}

/// Count failed events that replay cannot fix: configuration failures, and
/// unhandled failures that have used up their attempts.
pub async fn report_operator_backlog(webhooks: &WebhookHandler, max_attempts: i32) -> usize {
    let mut backlog = 0;
    let mut offset = 0;

    loop {
        let page = match webhooks
            .list_events(Some(EventStatus::Failed), BACKLOG_PAGE, offset)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                error!(error = %e, "Failed to list failed webhook events");
                return backlog;
            }
        };

        for event in &page {
            let stuck = match event.failure_kind {
                Some(FailureKind::Configuration) => true,
                Some(FailureKind::Unhandled) | None => event.attempts >= max_attempts,
            };
            if stuck {
                backlog += 1;
                warn!(
                    event_id = %event.external_event_id,
                    event_type = %event.event_type,
                    attempts = event.attempts,
                    failure_kind = ?event.failure_kind,
                    reason = ?event.failure_reason,
                    "Webhook event needs operator attention"
                );
            }
        }

        if (page.len() as i64) < BACKLOG_PAGE {
            break;
        }
        offset += BACKLOG_PAGE;
    }

    if backlog > 0 {
        warn!(backlog, "Billing events awaiting operator review");
    }
    backlog
}
