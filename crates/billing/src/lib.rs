// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries owned messages for the event log
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! DealerHub Billing Module
//!
//! Turns Stripe's at-least-once, out-of-order webhook stream into
//! consistent organization and license records.
//!
//! ## Features
//!
//! - **Webhooks**: signature verification, idempotent event store, replay
//! - **Subscription lifecycle**: created/updated/deleted and invoice events
//! - **Provisioning**: first-time tenants from checkout metadata
//! - **Car limits**: the guard inventory code calls before adding vehicles
//! - **Email Notifications**: welcome, status change, cancellation, payment failed
//! - **Checkout/Portal**: hosted Stripe sessions

pub mod checkout;
pub mod client;
pub mod config;
pub mod email;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod licenses;
pub mod organizations;
pub mod provisioner;
pub mod signature;
pub mod stripe_event;
pub mod subscriptions;
pub mod tiers;
pub mod webhooks;

#[cfg(any(test, feature = "test-util"))]
pub mod memory;

#[cfg(test)]
mod edge_case_tests;

// Checkout
pub use checkout::{CheckoutRequest, CheckoutResponse, CheckoutService, PortalResponse};

// Client
pub use client::StripeClient;

// Config
pub use config::BillingConfig;

// Email
pub use email::{BillingEmailService, EmailConfig, Notifier, QueuedNotifier, TemplateCache};

// Entitlement
pub use entitlement::{CapacityError, CapacityReport, CarInventory, CarLimitGuard, PgCarInventory};

// Error
pub use error::{BillingError, BillingResult, ErrorKind};

// Events
pub use events::{BillingEventRecord, EventStatus, EventStore, FailureKind, PgEventStore};

// Licenses
pub use licenses::{
    AdminLicenseUpdate, FreeGrant, License, LicenseRepository, LicenseService,
    PgLicenseRepository, SubscriptionStatus,
};

// Organizations
pub use organizations::{Organization, OrganizationRepository, PgOrganizationRepository, User};

// Provisioning
pub use provisioner::{OrganizationProvisioner, ProvisionOutcome, ProvisionRequest};

// Subscriptions
pub use subscriptions::SubscriptionStateMachine;

// Tiers
pub use tiers::{LicenseTier, PgTierCatalog, TierCatalog};

// Webhooks
pub use webhooks::{ReplaySummary, WebhookHandler, WebhookOutcome};

use sqlx::PgPool;
use std::sync::Arc;

/// Capacity of the outbound notification queue.
const NOTIFICATION_QUEUE_CAPACITY: usize = 256;

/// Storage backends the billing core runs against
#[derive(Clone)]
pub struct BillingStores {
    pub events: Arc<dyn EventStore>,
    pub tiers: Arc<dyn TierCatalog>,
    pub licenses: Arc<dyn LicenseRepository>,
    pub organizations: Arc<dyn OrganizationRepository>,
    pub inventory: Arc<dyn CarInventory>,
}

impl BillingStores {
    pub fn postgres(pool: PgPool, config: &BillingConfig) -> Self {
        Self {
            events: Arc::new(
                PgEventStore::new(pool.clone()).with_stale_after(config.webhook_stale_after),
            ),
            tiers: Arc::new(PgTierCatalog::new(pool.clone())),
            licenses: Arc::new(PgLicenseRepository::new(pool.clone())),
            organizations: Arc::new(PgOrganizationRepository::new(pool.clone())),
            inventory: Arc::new(PgCarInventory::new(pool)),
        }
    }
}

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub webhooks: WebhookHandler,
    pub licenses: LicenseService,
    pub guard: CarLimitGuard,
    pub tiers: Arc<dyn TierCatalog>,
    /// Present only when a Stripe API key is configured
    pub checkout: Option<CheckoutService>,
    pub config: BillingConfig,
}

impl BillingService {
    /// Create the billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Self::from_pool(pool, BillingConfig::from_env()?)
    }

    /// PostgreSQL stores with queued Resend delivery. Must be called inside
    /// a tokio runtime.
    pub fn from_pool(pool: PgPool, config: BillingConfig) -> BillingResult<Self> {
        let templates = Arc::new(TemplateCache::load(config.email.template_dir.as_deref())?);
        let email = BillingEmailService::new(config.email.clone(), templates);
        if !email.is_enabled() {
            tracing::warn!("Billing email notifications not configured (missing RESEND_API_KEY)");
        }
        let (notifier, _worker) = QueuedNotifier::spawn(Arc::new(email), NOTIFICATION_QUEUE_CAPACITY);

        let stores = BillingStores::postgres(pool, &config);
        Self::from_parts(stores, Arc::new(notifier), config)
    }

    pub fn from_parts(
        stores: BillingStores,
        notifier: Arc<dyn Notifier>,
        config: BillingConfig,
    ) -> BillingResult<Self> {
        let machine = SubscriptionStateMachine::new(
            stores.licenses.clone(),
            stores.organizations.clone(),
            stores.tiers.clone(),
            notifier,
        )
        .with_name_matching(config.match_org_by_name)
        .with_login_url(config.email.login_url.clone());

        let webhooks = WebhookHandler::new(
            stores.events.clone(),
            machine,
            config.webhook_secret.clone(),
            config.webhook_tolerance_secs,
        );

        let checkout = match config.stripe_secret_key.as_deref() {
            Some(key) => Some(CheckoutService::new(
                StripeClient::new(key)?,
                stores.tiers.clone(),
                stores.licenses.clone(),
                config.checkout_success_url.clone(),
                config.checkout_cancel_url.clone(),
                config.portal_return_url.clone(),
            )),
            None => {
                tracing::warn!("Stripe API key not configured; checkout and portal disabled");
                None
            }
        };

        Ok(Self {
            webhooks,
            licenses: LicenseService::new(stores.licenses.clone(), stores.tiers.clone()),
            guard: CarLimitGuard::new(stores.licenses, stores.inventory),
            tiers: stores.tiers,
            checkout,
            config,
        })
    }

    /// Checkout/portal service, or `NotConfigured` without a Stripe key.
    pub fn checkout(&self) -> BillingResult<&CheckoutService> {
        self.checkout
            .as_ref()
            .ok_or_else(|| BillingError::NotConfigured("STRIPE_SECRET_KEY".to_string()))
    }
}
