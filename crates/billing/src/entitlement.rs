//! Car-limit enforcement
//!
//! [`CarLimitGuard`] is the only component outside the webhook path that
//! reads license state. Inventory code calls it before adding a vehicle.

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::licenses::{License, LicenseRepository, SubscriptionStatus};

/// Why an organization may not add (or read) vehicles
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapacityError {
    #[error("Organization has no license")]
    NoLicense,

    #[error("License is inactive")]
    Inactive,

    #[error("Subscription payment is past due; update your payment method to add vehicles")]
    PastDue,

    #[error("Subscription is {status}; an active subscription is required to add vehicles")]
    SubscriptionNotActive { status: SubscriptionStatus },

    #[error("Car limit reached ({current}/{limit})")]
    LimitReached { current: i64, limit: i64 },
}

/// Counts vehicles that occupy a license slot.
#[async_trait]
pub trait CarInventory: Send + Sync {
    /// Number of cars whose status is not `sold`.
    async fn count_active_cars(&self, org_id: Uuid) -> BillingResult<i64>;
}

#[derive(Clone)]
pub struct PgCarInventory {
    pool: PgPool,
}

impl PgCarInventory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CarInventory for PgCarInventory {
    async fn count_active_cars(&self, org_id: Uuid) -> BillingResult<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM cars WHERE org_id = $1 AND status <> 'sold'")
                .bind(org_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

/// Capacity summary for the UI
#[derive(Debug, Clone, Serialize)]
pub struct CapacityReport {
    pub license_type: Option<String>,
    pub current: i64,
    pub limit: i64,
    pub remaining: i64,
    pub can_add: bool,
    /// Human-readable reason when `can_add` is false
    pub reason: Option<String>,
}

#[derive(Clone)]
pub struct CarLimitGuard {
    licenses: Arc<dyn LicenseRepository>,
    inventory: Arc<dyn CarInventory>,
}

impl CarLimitGuard {
    pub fn new(licenses: Arc<dyn LicenseRepository>, inventory: Arc<dyn CarInventory>) -> Self {
        Self {
            licenses,
            inventory,
        }
    }

    /// Reject the add unless the license is active, paid (or free) and below
    /// its car limit.
    pub async fn ensure_can_add_car(&self, org_id: Uuid) -> BillingResult<()> {
        let license = self
            .licenses
            .find_by_org(org_id)
            .await?
            .ok_or(CapacityError::NoLicense)?;
        check_license_allows_writes(&license)?;

        let current = self.inventory.count_active_cars(org_id).await?;
        let limit = i64::from(license.car_limit);
        if current >= limit {
            tracing::debug!(org_id = %org_id, current, limit, "Car limit reached");
            return Err(CapacityError::LimitReached { current, limit }.into());
        }
        Ok(())
    }

    /// Reads stay open through `past_due` so dealers can still see stock
    /// while a payment is retried.
    pub async fn ensure_can_read(&self, org_id: Uuid) -> BillingResult<()> {
        let license = self
            .licenses
            .find_by_org(org_id)
            .await?
            .ok_or(CapacityError::NoLicense)?;
        if !license.is_active {
            return Err(CapacityError::Inactive.into());
        }
        Ok(())
    }

    pub async fn capacity(&self, org_id: Uuid) -> BillingResult<CapacityReport> {
        let current = self.inventory.count_active_cars(org_id).await?;
        let Some(license) = self.licenses.find_by_org(org_id).await? else {
            return Ok(CapacityReport {
                license_type: None,
                current,
                limit: 0,
                remaining: 0,
                can_add: false,
                reason: Some(CapacityError::NoLicense.to_string()),
            });
        };

        let limit = i64::from(license.car_limit);
        let blocked = check_license_allows_writes(&license).err().or_else(|| {
            (current >= limit).then_some(CapacityError::LimitReached { current, limit })
        });

        Ok(CapacityReport {
            license_type: Some(license.license_type),
            current,
            limit,
            remaining: (limit - current).max(0),
            can_add: blocked.is_none(),
            reason: blocked.map(|e| e.to_string()),
        })
    }
}

fn check_license_allows_writes(license: &License) -> Result<(), CapacityError> {
    if !license.is_active {
        return Err(CapacityError::Inactive);
    }
    if license.is_free_account {
        return Ok(());
    }
    match license.subscription_status {
        SubscriptionStatus::Active | SubscriptionStatus::Trialing => Ok(()),
        // Admin-created paid licenses carry no subscription.
        SubscriptionStatus::None if license.stripe_subscription_id.is_none() => Ok(()),
        SubscriptionStatus::PastDue => Err(CapacityError::PastDue),
        status => Err(CapacityError::SubscriptionNotActive { status }),
    }
}
