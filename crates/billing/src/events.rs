//! Billing event store
//!
//! Append-only record of every inbound provider event, keyed by the
//! provider's event ID. The unique index on `external_event_id` is the
//! idempotency boundary for at-least-once delivery: a delivery only runs
//! handlers after it has atomically claimed the row.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Events stuck in `received` longer than this may be reclaimed.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30 * 60);

/// Processing status of a stored event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Received,
    Processed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Received => "received",
            EventStatus::Processed => "processed",
            EventStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "received" => Some(EventStatus::Received),
            "processed" => Some(EventStatus::Processed),
            "failed" => Some(EventStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a failed event failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Needs operator action (catalog or metadata); never replayed automatically.
    Configuration,
    /// Transient or unexpected; eligible for automatic replay.
    Unhandled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Configuration => "configuration",
            FailureKind::Unhandled => "unhandled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "configuration" => Some(FailureKind::Configuration),
            "unhandled" => Some(FailureKind::Unhandled),
            _ => None,
        }
    }
}

/// A stored billing event
#[derive(Debug, Clone, Serialize)]
pub struct BillingEventRecord {
    pub id: Uuid,
    pub external_event_id: String,
    pub event_type: String,
    pub status: EventStatus,
    pub org_id: Option<Uuid>,
    pub license_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub failure_reason: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub attempts: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Event about to be claimed
#[derive(Debug, Clone)]
pub struct NewBillingEvent {
    pub external_event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// Result of trying to claim an event for processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This delivery owns processing. `attempt` starts at 1.
    Claimed { attempt: i32 },
    /// Another delivery already processed it or is processing it right now.
    AlreadyRecorded { status: EventStatus },
}

/// Persistence contract for billing events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert the event as `received`, or reclaim it when it previously
    /// failed or has been stuck in `received` longer than the stale timeout.
    async fn claim(&self, event: &NewBillingEvent) -> BillingResult<ClaimOutcome>;

    /// Claim an already stored event for an operator or worker replay.
    /// Returns `None` when the event is not in a replayable state.
    async fn reclaim_for_replay(&self, external_event_id: &str)
        -> BillingResult<Option<BillingEventRecord>>;

    async fn mark_processed(
        &self,
        external_event_id: &str,
        org_id: Option<Uuid>,
        license_id: Option<Uuid>,
    ) -> BillingResult<()>;

    async fn mark_failed(
        &self,
        external_event_id: &str,
        reason: &str,
        kind: FailureKind,
    ) -> BillingResult<()>;

    async fn find(&self, external_event_id: &str) -> BillingResult<Option<BillingEventRecord>>;

    async fn list(
        &self,
        status: Option<EventStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<BillingEventRecord>>;

    /// External IDs eligible for automatic replay: unhandled failures below
    /// the attempt cap, and stale `received` rows.
    async fn list_replayable(&self, max_attempts: i32, limit: i64) -> BillingResult<Vec<String>>;
}

#[derive(Debug, sqlx::FromRow)]
struct BillingEventRow {
    id: Uuid,
    external_event_id: String,
    event_type: String,
    status: String,
    org_id: Option<Uuid>,
    license_id: Option<Uuid>,
    payload: serde_json::Value,
    failure_reason: Option<String>,
    failure_kind: Option<String>,
    attempts: i32,
    received_at: OffsetDateTime,
    processed_at: Option<OffsetDateTime>,
    updated_at: OffsetDateTime,
}

impl TryFrom<BillingEventRow> for BillingEventRecord {
    type Error = BillingError;

    fn try_from(row: BillingEventRow) -> Result<Self, Self::Error> {
        let status = EventStatus::parse(&row.status).ok_or_else(|| {
            BillingError::Internal(format!("unknown billing event status '{}'", row.status))
        })?;
        Ok(Self {
            id: row.id,
            external_event_id: row.external_event_id,
            event_type: row.event_type,
            status,
            org_id: row.org_id,
            license_id: row.license_id,
            payload: row.payload,
            failure_reason: row.failure_reason,
            failure_kind: row.failure_kind.as_deref().and_then(FailureKind::parse),
            attempts: row.attempts,
            received_at: row.received_at,
            processed_at: row.processed_at,
            updated_at: row.updated_at,
        })
    }
}

const EVENT_COLUMNS: &str = "id, external_event_id, event_type, status, org_id, license_id, \
     payload, failure_reason, failure_kind, attempts, received_at, processed_at, updated_at";

/// PostgreSQL-backed event store
#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
    stale_after: Duration,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    fn stale_seconds(&self) -> i64 {
        self.stale_after.as_secs() as i64
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn claim(&self, event: &NewBillingEvent) -> BillingResult<ClaimOutcome> {
        // INSERT .. ON CONFLICT .. RETURNING hands exclusive processing rights
        // to exactly one concurrent delivery.
        let claimed: Option<(i32,)> = sqlx::query_as(
            r#"
            INSERT INTO billing_events (id, external_event_id, event_type, status, payload)
            VALUES ($1, $2, $3, 'received', $4)
            ON CONFLICT (external_event_id) DO UPDATE SET
                status = 'received',
                attempts = billing_events.attempts + 1,
                payload = EXCLUDED.payload,
                failure_reason = NULL,
                failure_kind = NULL,
                updated_at = NOW()
            WHERE billing_events.status = 'failed'
               OR (billing_events.status = 'received'
                   AND billing_events.updated_at < NOW() - make_interval(secs => $5))
            RETURNING attempts
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&event.external_event_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(self.stale_seconds() as f64)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((attempt,)) = claimed {
            return Ok(ClaimOutcome::Claimed { attempt });
        }

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT status FROM billing_events WHERE external_event_id = $1")
                .bind(&event.external_event_id)
                .fetch_optional(&self.pool)
                .await?;

        let status = existing
            .and_then(|(status,)| EventStatus::parse(&status))
            .unwrap_or(EventStatus::Received);

        Ok(ClaimOutcome::AlreadyRecorded { status })
    }

    async fn reclaim_for_replay(
        &self,
        external_event_id: &str,
    ) -> BillingResult<Option<BillingEventRecord>> {
        let row: Option<BillingEventRow> = sqlx::query_as(&format!(
            r#"
            UPDATE billing_events
            SET status = 'received',
                attempts = attempts + 1,
                failure_reason = NULL,
                failure_kind = NULL,
                updated_at = NOW()
            WHERE external_event_id = $1
              AND (status = 'failed'
                   OR (status = 'received' AND updated_at < NOW() - make_interval(secs => $2)))
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(external_event_id)
        .bind(self.stale_seconds() as f64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BillingEventRecord::try_from).transpose()
    }

    async fn mark_processed(
        &self,
        external_event_id: &str,
        org_id: Option<Uuid>,
        license_id: Option<Uuid>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_events
            SET status = 'processed',
                org_id = COALESCE($2, org_id),
                license_id = COALESCE($3, license_id),
                processed_at = NOW(),
                updated_at = NOW()
            WHERE external_event_id = $1
            "#,
        )
        .bind(external_event_id)
        .bind(org_id)
        .bind(license_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        external_event_id: &str,
        reason: &str,
        kind: FailureKind,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_events
            SET status = 'failed', failure_reason = $2, failure_kind = $3, updated_at = NOW()
            WHERE external_event_id = $1
            "#,
        )
        .bind(external_event_id)
        .bind(reason)
        .bind(kind.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(&self, external_event_id: &str) -> BillingResult<Option<BillingEventRecord>> {
        let row: Option<BillingEventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM billing_events WHERE external_event_id = $1"
        ))
        .bind(external_event_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BillingEventRecord::try_from).transpose()
    }

    async fn list(
        &self,
        status: Option<EventStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<BillingEventRecord>> {
        let rows: Vec<BillingEventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM billing_events
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY received_at DESC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BillingEventRecord::try_from).collect()
    }

    async fn list_replayable(&self, max_attempts: i32, limit: i64) -> BillingResult<Vec<String>> {
        let ids: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT external_event_id
            FROM billing_events
            WHERE (status = 'failed' AND failure_kind = 'unhandled' AND attempts < $1)
               OR (status = 'received' AND updated_at < NOW() - make_interval(secs => $2))
            ORDER BY received_at ASC
            LIMIT $3
            "#,
        )
        .bind(max_attempts)
        .bind(self.stale_seconds() as f64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_status_round_trips_through_text() {
        for status in [EventStatus::Received, EventStatus::Processed, EventStatus::Failed] {
            assert_eq!(EventStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(EventStatus::parse("processing"), None);
    }

    #[test]
    fn test_failure_kind_parse() {
        assert_eq!(FailureKind::parse("configuration"), Some(FailureKind::Configuration));
        assert_eq!(FailureKind::parse("unhandled"), Some(FailureKind::Unhandled));
        assert_eq!(FailureKind::parse("other"), None);
    }
}
