//! License tier catalog
//!
//! Maps Stripe price IDs to license tiers. Rows are seeded out of band and
//! only ever read here.

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;

use crate::error::BillingResult;

/// A purchasable license tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct LicenseTier {
    /// Tier name, also stored as the license type
    pub name: String,
    pub display_name: String,
    pub monthly_price_cents: i32,
    /// Maximum number of non-sold cars
    pub car_limit: i32,
    pub stripe_price_id: String,
}

impl LicenseTier {
    /// Price formatted for display, e.g. `$49.00`
    pub fn display_price(&self) -> String {
        format!(
            "${}.{:02}",
            self.monthly_price_cents / 100,
            self.monthly_price_cents % 100
        )
    }
}

#[async_trait]
pub trait TierCatalog: Send + Sync {
    async fn find_by_price_id(&self, price_id: &str) -> BillingResult<Option<LicenseTier>>;
    async fn find_by_name(&self, name: &str) -> BillingResult<Option<LicenseTier>>;
    async fn list(&self) -> BillingResult<Vec<LicenseTier>>;
}

#[derive(Clone)]
pub struct PgTierCatalog {
    pool: PgPool,
}

impl PgTierCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TierCatalog for PgTierCatalog {
    async fn find_by_price_id(&self, price_id: &str) -> BillingResult<Option<LicenseTier>> {
        let tier = sqlx::query_as::<_, LicenseTier>(
            r#"
            SELECT name, display_name, monthly_price_cents, car_limit, stripe_price_id
            FROM license_tiers
            WHERE stripe_price_id = $1
            "#,
        )
        .bind(price_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(tier)
    }

    async fn find_by_name(&self, name: &str) -> BillingResult<Option<LicenseTier>> {
        let tier = sqlx::query_as::<_, LicenseTier>(
            r#"
            SELECT name, display_name, monthly_price_cents, car_limit, stripe_price_id
            FROM license_tiers
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(tier)
    }

    async fn list(&self) -> BillingResult<Vec<LicenseTier>> {
        let tiers = sqlx::query_as::<_, LicenseTier>(
            r#"
            SELECT name, display_name, monthly_price_cents, car_limit, stripe_price_id
            FROM license_tiers
            ORDER BY monthly_price_cents ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(tiers)
    }
}
