//! Organization licenses
//!
//! One license row per organization. Webhook handlers write it through
//! [`LicenseRepository`]; everything else reads it through the car-limit
//! guard or [`LicenseService`].
//!
//! Canceled subscriptions are terminal: every write that originates from a
//! provider event carries a `subscription_status <> 'canceled'` guard in its
//! `WHERE` clause, so a late or re-ordered event cannot bring a canceled
//! license back. The only exception is an explicit reactivation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::tiers::{LicenseTier, TierCatalog};

/// Stripe subscription status as stored on the license
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// No paid subscription (free or admin-created license)
    None,
    Active,
    Trialing,
    PastDue,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Unpaid,
    Paused,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::None => "none",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Paused => "paused",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(SubscriptionStatus::None),
            "active" => Some(SubscriptionStatus::Active),
            "trialing" => Some(SubscriptionStatus::Trialing),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "canceled" => Some(SubscriptionStatus::Canceled),
            "incomplete" => Some(SubscriptionStatus::Incomplete),
            "incomplete_expired" => Some(SubscriptionStatus::IncompleteExpired),
            "unpaid" => Some(SubscriptionStatus::Unpaid),
            "paused" => Some(SubscriptionStatus::Paused),
            _ => None,
        }
    }

    /// Statuses under which the customer keeps using the product.
    /// `past_due` is included: Stripe is still retrying the payment.
    pub fn grants_access(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing | SubscriptionStatus::PastDue
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An organization's license
#[derive(Debug, Clone, Serialize)]
pub struct License {
    pub id: Uuid,
    pub org_id: Uuid,
    pub license_type: String,
    pub car_limit: i32,
    pub is_active: bool,
    pub is_free_account: bool,
    pub free_reason: Option<String>,
    pub limit_override_reason: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub stripe_price_id: Option<String>,
    pub subscription_status: SubscriptionStatus,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub canceled_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Subscription facts written when a subscription is first linked to an org
#[derive(Debug, Clone)]
pub struct SubscriptionLink {
    pub org_id: Uuid,
    pub license_type: String,
    pub car_limit: i32,
    pub stripe_customer_id: String,
    pub stripe_subscription_id: String,
    pub stripe_price_id: String,
    pub status: SubscriptionStatus,
    pub cancel_at_period_end: bool,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
}

impl SubscriptionLink {
    pub fn new(
        org_id: Uuid,
        tier: &LicenseTier,
        stripe_customer_id: impl Into<String>,
        stripe_subscription_id: impl Into<String>,
        status: SubscriptionStatus,
    ) -> Self {
        Self {
            org_id,
            license_type: tier.name.clone(),
            car_limit: tier.car_limit,
            stripe_customer_id: stripe_customer_id.into(),
            stripe_subscription_id: stripe_subscription_id.into(),
            stripe_price_id: tier.stripe_price_id.clone(),
            status,
            cancel_at_period_end: false,
            current_period_start: None,
            current_period_end: None,
        }
    }
}

/// Tier switch carried by a subscription update
#[derive(Debug, Clone)]
pub struct TierChange {
    pub license_type: String,
    pub car_limit: i32,
    pub stripe_price_id: String,
}

impl From<&LicenseTier> for TierChange {
    fn from(tier: &LicenseTier) -> Self {
        Self {
            license_type: tier.name.clone(),
            car_limit: tier.car_limit,
            stripe_price_id: tier.stripe_price_id.clone(),
        }
    }
}

/// Changes from a `customer.subscription.updated` event
#[derive(Debug, Clone)]
pub struct SubscriptionChange {
    pub status: SubscriptionStatus,
    pub cancel_at_period_end: bool,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub tier: Option<TierChange>,
}

/// Payment outcome from invoice events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentState {
    Paid,
    PastDue,
}

impl PaymentState {
    pub fn status(&self) -> SubscriptionStatus {
        match self {
            PaymentState::Paid => SubscriptionStatus::Active,
            PaymentState::PastDue => SubscriptionStatus::PastDue,
        }
    }
}

/// Free license grant
#[derive(Debug, Clone, Deserialize)]
pub struct FreeGrant {
    pub license_type: String,
    pub car_limit: i32,
    pub reason: String,
}

/// Admin edit. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminLicenseUpdate {
    pub license_type: Option<String>,
    pub car_limit: Option<i32>,
    pub is_active: Option<bool>,
    pub override_reason: Option<String>,
}

/// Fully resolved admin edit as written to the store
#[derive(Debug, Clone)]
pub struct ResolvedLicenseUpdate {
    pub license_type: String,
    pub car_limit: i32,
    pub is_active: bool,
    pub limit_override_reason: Option<String>,
}

#[async_trait]
pub trait LicenseRepository: Send + Sync {
    async fn find_by_org(&self, org_id: Uuid) -> BillingResult<Option<License>>;
    async fn find_by_subscription(&self, subscription_id: &str) -> BillingResult<Option<License>>;
    async fn find_by_customer(&self, customer_id: &str) -> BillingResult<Option<License>>;

    /// Insert or replace the org's license with a subscription.
    /// Returns `None` when the org's license already holds this subscription
    /// in canceled state.
    async fn upsert_subscription(&self, link: &SubscriptionLink) -> BillingResult<Option<License>>;

    /// Apply a subscription update. Returns `None` when no license holds the
    /// subscription, or it is canceled and `allow_reactivation` is false.
    async fn apply_subscription_update(
        &self,
        subscription_id: &str,
        change: &SubscriptionChange,
        allow_reactivation: bool,
    ) -> BillingResult<Option<License>>;

    /// Remember a subscription that was deleted while no license held it.
    async fn record_canceled_subscription(
        &self,
        subscription_id: &str,
        canceled_at: Option<OffsetDateTime>,
    ) -> BillingResult<()>;

    /// Whether [`record_canceled_subscription`](Self::record_canceled_subscription)
    /// saw this subscription.
    async fn is_canceled_subscription(&self, subscription_id: &str) -> BillingResult<bool>;

    /// Terminal cancellation; deactivates the license.
    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        canceled_at: Option<OffsetDateTime>,
    ) -> BillingResult<Option<License>>;

    /// Returns `None` when nothing is linked or the license is canceled.
    async fn set_payment_state(
        &self,
        subscription_id: &str,
        state: PaymentState,
    ) -> BillingResult<Option<License>>;

    async fn grant_free(&self, org_id: Uuid, grant: &FreeGrant) -> BillingResult<License>;

    async fn admin_update(
        &self,
        org_id: Uuid,
        update: &ResolvedLicenseUpdate,
    ) -> BillingResult<Option<License>>;
}

#[derive(Debug, sqlx::FromRow)]
struct LicenseRow {
    id: Uuid,
    org_id: Uuid,
    license_type: String,
    car_limit: i32,
    is_active: bool,
    is_free_account: bool,
    free_reason: Option<String>,
    limit_override_reason: Option<String>,
    stripe_customer_id: Option<String>,
    stripe_subscription_id: Option<String>,
    stripe_price_id: Option<String>,
    subscription_status: String,
    cancel_at_period_end: bool,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    canceled_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<LicenseRow> for License {
    type Error = BillingError;

    fn try_from(row: LicenseRow) -> Result<Self, Self::Error> {
        let subscription_status =
            SubscriptionStatus::parse(&row.subscription_status).ok_or_else(|| {
                BillingError::Internal(format!(
                    "license {} has unknown subscription status '{}'",
                    row.id, row.subscription_status
                ))
            })?;
        Ok(Self {
            id: row.id,
            org_id: row.org_id,
            license_type: row.license_type,
            car_limit: row.car_limit,
            is_active: row.is_active,
            is_free_account: row.is_free_account,
            free_reason: row.free_reason,
            limit_override_reason: row.limit_override_reason,
            stripe_customer_id: row.stripe_customer_id,
            stripe_subscription_id: row.stripe_subscription_id,
            stripe_price_id: row.stripe_price_id,
            subscription_status,
            cancel_at_period_end: row.cancel_at_period_end,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            canceled_at: row.canceled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_license(row: Option<LicenseRow>) -> BillingResult<Option<License>> {
    row.map(License::try_from).transpose()
}

/// Insert the first license of a freshly provisioned organization on the
/// caller's transaction.
pub(crate) async fn insert_linked_license(
    conn: &mut PgConnection,
    link: &SubscriptionLink,
) -> BillingResult<License> {
    let row: LicenseRow = sqlx::query_as(&format!(
        r#"
        INSERT INTO licenses (
            id, org_id, license_type, car_limit, is_active, is_free_account,
            stripe_customer_id, stripe_subscription_id, stripe_price_id,
            subscription_status, cancel_at_period_end,
            current_period_start, current_period_end
        ) VALUES ($1, $2, $3, $4, $5, FALSE, $6, $7, $8, $9, $10, $11, $12)
        RETURNING {LICENSE_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(link.org_id)
    .bind(&link.license_type)
    .bind(link.car_limit)
    .bind(link.status.grants_access())
    .bind(&link.stripe_customer_id)
    .bind(&link.stripe_subscription_id)
    .bind(&link.stripe_price_id)
    .bind(link.status.as_str())
    .bind(link.cancel_at_period_end)
    .bind(link.current_period_start)
    .bind(link.current_period_end)
    .fetch_one(conn)
    .await?;
    License::try_from(row)
}

const LICENSE_COLUMNS: &str = "id, org_id, license_type, car_limit, is_active, is_free_account, \
     free_reason, limit_override_reason, stripe_customer_id, stripe_subscription_id, \
     stripe_price_id, subscription_status, cancel_at_period_end, current_period_start, \
     current_period_end, canceled_at, created_at, updated_at";

/// PostgreSQL-backed license repository
#[derive(Clone)]
pub struct PgLicenseRepository {
    pool: PgPool,
}

impl PgLicenseRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_where(&self, column: &str, value: &str) -> BillingResult<Option<License>> {
        let row: Option<LicenseRow> = sqlx::query_as(&format!(
            "SELECT {LICENSE_COLUMNS} FROM licenses WHERE {column} = $1 \
             ORDER BY updated_at DESC LIMIT 1"
        ))
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;
        into_license(row)
    }
}

#[async_trait]
impl LicenseRepository for PgLicenseRepository {
    async fn find_by_org(&self, org_id: Uuid) -> BillingResult<Option<License>> {
        let row: Option<LicenseRow> = sqlx::query_as(&format!(
            "SELECT {LICENSE_COLUMNS} FROM licenses WHERE org_id = $1"
        ))
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;
        into_license(row)
    }

    async fn find_by_subscription(&self, subscription_id: &str) -> BillingResult<Option<License>> {
        self.find_where("stripe_subscription_id", subscription_id)
            .await
    }

    async fn find_by_customer(&self, customer_id: &str) -> BillingResult<Option<License>> {
        self.find_where("stripe_customer_id", customer_id).await
    }

    async fn upsert_subscription(&self, link: &SubscriptionLink) -> BillingResult<Option<License>> {
        // A subscription replaces any free or admin grant, so the override
        // and free markers are cleared along with the limit.
        let row: Option<LicenseRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO licenses (
                id, org_id, license_type, car_limit, is_active, is_free_account,
                stripe_customer_id, stripe_subscription_id, stripe_price_id,
                subscription_status, cancel_at_period_end,
                current_period_start, current_period_end
            ) VALUES ($1, $2, $3, $4, $5, FALSE, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (org_id) DO UPDATE SET
                license_type = EXCLUDED.license_type,
                car_limit = EXCLUDED.car_limit,
                is_active = EXCLUDED.is_active,
                is_free_account = FALSE,
                free_reason = NULL,
                limit_override_reason = NULL,
                stripe_customer_id = EXCLUDED.stripe_customer_id,
                stripe_subscription_id = EXCLUDED.stripe_subscription_id,
                stripe_price_id = EXCLUDED.stripe_price_id,
                subscription_status = EXCLUDED.subscription_status,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                canceled_at = NULL,
                updated_at = NOW()
            WHERE NOT (
                licenses.subscription_status = 'canceled'
                AND licenses.stripe_subscription_id = EXCLUDED.stripe_subscription_id
            )
            RETURNING {LICENSE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(link.org_id)
        .bind(&link.license_type)
        .bind(link.car_limit)
        .bind(link.status.grants_access())
        .bind(&link.stripe_customer_id)
        .bind(&link.stripe_subscription_id)
        .bind(&link.stripe_price_id)
        .bind(link.status.as_str())
        .bind(link.cancel_at_period_end)
        .bind(link.current_period_start)
        .bind(link.current_period_end)
        .fetch_optional(&self.pool)
        .await?;
        into_license(row)
    }

    async fn apply_subscription_update(
        &self,
        subscription_id: &str,
        change: &SubscriptionChange,
        allow_reactivation: bool,
    ) -> BillingResult<Option<License>> {
        let tier = change.tier.as_ref();
        let row: Option<LicenseRow> = sqlx::query_as(&format!(
            r#"
            UPDATE licenses SET
                subscription_status = $2,
                cancel_at_period_end = $3,
                current_period_start = COALESCE($4, current_period_start),
                current_period_end = COALESCE($5, current_period_end),
                is_active = is_active OR $6,
                canceled_at = CASE WHEN subscription_status = 'canceled' THEN NULL ELSE canceled_at END,
                license_type = COALESCE($7, license_type),
                car_limit = CASE WHEN $8::INT IS NOT NULL AND NOT is_free_account THEN $8 ELSE car_limit END,
                limit_override_reason = CASE WHEN $8::INT IS NOT NULL AND NOT is_free_account
                    THEN NULL ELSE limit_override_reason END,
                stripe_price_id = COALESCE($9, stripe_price_id),
                updated_at = NOW()
            WHERE stripe_subscription_id = $1
              AND (subscription_status <> 'canceled' OR $10)
            RETURNING {LICENSE_COLUMNS}
            "#
        ))
        .bind(subscription_id)
        .bind(change.status.as_str())
        .bind(change.cancel_at_period_end)
        .bind(change.current_period_start)
        .bind(change.current_period_end)
        .bind(change.status.grants_access())
        .bind(tier.map(|t| t.license_type.as_str()))
        .bind(tier.map(|t| t.car_limit))
        .bind(tier.map(|t| t.stripe_price_id.as_str()))
        .bind(allow_reactivation)
        .fetch_optional(&self.pool)
        .await?;
        into_license(row)
    }

    async fn record_canceled_subscription(
        &self,
        subscription_id: &str,
        canceled_at: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO canceled_subscriptions (stripe_subscription_id, canceled_at)
            VALUES ($1, $2)
            ON CONFLICT (stripe_subscription_id) DO NOTHING
            "#,
        )
        .bind(subscription_id)
        .bind(canceled_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_canceled_subscription(&self, subscription_id: &str) -> BillingResult<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM canceled_subscriptions WHERE stripe_subscription_id = $1)",
        )
        .bind(subscription_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        canceled_at: Option<OffsetDateTime>,
    ) -> BillingResult<Option<License>> {
        let row: Option<LicenseRow> = sqlx::query_as(&format!(
            r#"
            UPDATE licenses SET
                subscription_status = 'canceled',
                is_active = FALSE,
                cancel_at_period_end = FALSE,
                canceled_at = COALESCE($2, canceled_at, NOW()),
                updated_at = NOW()
            WHERE stripe_subscription_id = $1
            RETURNING {LICENSE_COLUMNS}
            "#
        ))
        .bind(subscription_id)
        .bind(canceled_at)
        .fetch_optional(&self.pool)
        .await?;
        into_license(row)
    }

    async fn set_payment_state(
        &self,
        subscription_id: &str,
        state: PaymentState,
    ) -> BillingResult<Option<License>> {
        let row: Option<LicenseRow> = sqlx::query_as(&format!(
            r#"
            UPDATE licenses SET
                subscription_status = $2,
                is_active = is_active OR $3,
                updated_at = NOW()
            WHERE stripe_subscription_id = $1
              AND subscription_status <> 'canceled'
            RETURNING {LICENSE_COLUMNS}
            "#
        ))
        .bind(subscription_id)
        .bind(state.status().as_str())
        .bind(state == PaymentState::Paid)
        .fetch_optional(&self.pool)
        .await?;
        into_license(row)
    }

    async fn grant_free(&self, org_id: Uuid, grant: &FreeGrant) -> BillingResult<License> {
        let row: LicenseRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO licenses (
                id, org_id, license_type, car_limit, is_active, is_free_account, free_reason
            ) VALUES ($1, $2, $3, $4, TRUE, TRUE, $5)
            ON CONFLICT (org_id) DO UPDATE SET
                license_type = EXCLUDED.license_type,
                car_limit = EXCLUDED.car_limit,
                is_active = TRUE,
                is_free_account = TRUE,
                free_reason = EXCLUDED.free_reason,
                limit_override_reason = NULL,
                updated_at = NOW()
            RETURNING {LICENSE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(org_id)
        .bind(&grant.license_type)
        .bind(grant.car_limit)
        .bind(&grant.reason)
        .fetch_one(&self.pool)
        .await?;
        License::try_from(row)
    }

    async fn admin_update(
        &self,
        org_id: Uuid,
        update: &ResolvedLicenseUpdate,
    ) -> BillingResult<Option<License>> {
        let row: Option<LicenseRow> = sqlx::query_as(&format!(
            r#"
            UPDATE licenses SET
                license_type = $2,
                car_limit = $3,
                is_active = $4,
                limit_override_reason = $5,
                updated_at = NOW()
            WHERE org_id = $1
            RETURNING {LICENSE_COLUMNS}
            "#
        ))
        .bind(org_id)
        .bind(&update.license_type)
        .bind(update.car_limit)
        .bind(update.is_active)
        .bind(&update.limit_override_reason)
        .fetch_optional(&self.pool)
        .await?;
        into_license(row)
    }
}

/// License reads and admin edits
#[derive(Clone)]
pub struct LicenseService {
    licenses: Arc<dyn LicenseRepository>,
    tiers: Arc<dyn TierCatalog>,
}

impl LicenseService {
    pub fn new(licenses: Arc<dyn LicenseRepository>, tiers: Arc<dyn TierCatalog>) -> Self {
        Self { licenses, tiers }
    }

    /// The organization's license, active or not.
    pub async fn get_for_org(&self, org_id: Uuid) -> BillingResult<Option<License>> {
        self.licenses.find_by_org(org_id).await
    }

    /// Grant (or convert to) a free license.
    pub async fn grant_free(&self, org_id: Uuid, grant: FreeGrant) -> BillingResult<License> {
        let reason = grant.reason.trim();
        if reason.is_empty() {
            return Err(BillingError::InvalidInput(
                "a reason is required for free licenses".to_string(),
            ));
        }
        if grant.car_limit < 0 {
            return Err(BillingError::InvalidInput(
                "car_limit must not be negative".to_string(),
            ));
        }
        if grant.license_type.trim().is_empty() {
            return Err(BillingError::InvalidInput(
                "license_type is required".to_string(),
            ));
        }

        let grant = FreeGrant {
            license_type: grant.license_type.trim().to_string(),
            car_limit: grant.car_limit,
            reason: reason.to_string(),
        };
        let license = self.licenses.grant_free(org_id, &grant).await?;

        tracing::info!(
            org_id = %org_id,
            license_type = %license.license_type,
            car_limit = license.car_limit,
            reason = %grant.reason,
            "Free license granted"
        );
        Ok(license)
    }

    /// Admin edit of type, limit or active flag.
    ///
    /// A paid license whose limit differs from its tier's limit must carry an
    /// override reason; going back to the tier limit clears it.
    pub async fn admin_update(
        &self,
        org_id: Uuid,
        update: AdminLicenseUpdate,
    ) -> BillingResult<License> {
        let current = self
            .licenses
            .find_by_org(org_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("license for organization {org_id}")))?;

        let license_type = update
            .license_type
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| current.license_type.clone());
        let type_changed = license_type != current.license_type;

        let tier = self.tiers.find_by_name(&license_type).await?;

        let car_limit = match (update.car_limit, &tier) {
            (Some(limit), _) => limit,
            (None, Some(tier)) if type_changed => tier.car_limit,
            (None, _) => current.car_limit,
        };
        if car_limit < 0 {
            return Err(BillingError::InvalidInput(
                "car_limit must not be negative".to_string(),
            ));
        }

        let new_reason = update
            .override_reason
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string);

        let matches_tier = tier.as_ref().is_some_and(|t| t.car_limit == car_limit);
        let limit_override_reason = if current.is_free_account || matches_tier {
            None
        } else if new_reason.is_some() {
            new_reason
        } else if !type_changed && car_limit == current.car_limit {
            current.limit_override_reason.clone()
        } else {
            None
        };

        if !current.is_free_account && !matches_tier && limit_override_reason.is_none() {
            return Err(BillingError::InvalidInput(format!(
                "override_reason is required when car_limit ({car_limit}) differs from the '{license_type}' tier limit"
            )));
        }

        let resolved = ResolvedLicenseUpdate {
            license_type,
            car_limit,
            is_active: update.is_active.unwrap_or(current.is_active),
            limit_override_reason,
        };

        let license = self
            .licenses
            .admin_update(org_id, &resolved)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("license for organization {org_id}")))?;

        tracing::info!(
            org_id = %org_id,
            license_type = %license.license_type,
            car_limit = license.car_limit,
            is_active = license.is_active,
            override_reason = ?license.limit_override_reason,
            "License updated by admin"
        );
        Ok(license)
    }
}
