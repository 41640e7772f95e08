//! Billing configuration from the environment

use std::path::PathBuf;
use std::time::Duration;

use crate::email::EmailConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::DEFAULT_STALE_AFTER;
use crate::signature::DEFAULT_TOLERANCE_SECS;

/// Default cap on automatic replays of an unhandled failure.
pub const DEFAULT_MAX_REPLAY_ATTEMPTS: i32 = 5;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Stripe API key; checkout and portal are disabled without it.
    pub stripe_secret_key: Option<String>,
    /// Webhook endpoint signing secret (`whsec_...`)
    pub webhook_secret: String,
    pub webhook_tolerance_secs: i64,
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,
    pub portal_return_url: String,
    /// Fall back to matching organizations by name when no email matches.
    pub match_org_by_name: bool,
    /// How long a `received` event may sit before it counts as stuck.
    pub webhook_stale_after: Duration,
    pub max_replay_attempts: i32,
    pub email: EmailConfig,
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BillingError::NotConfigured("STRIPE_WEBHOOK_SECRET".to_string()))?;

        let stripe_secret_key = std::env::var("STRIPE_SECRET_KEY")
            .ok()
            .filter(|s| !s.is_empty());

        let app_url =
            std::env::var("APP_LOGIN_URL").unwrap_or_else(|_| "http://localhost:3000/login".into());

        Ok(Self {
            stripe_secret_key,
            webhook_secret,
            webhook_tolerance_secs: env_parse("STRIPE_WEBHOOK_TOLERANCE_SECS", DEFAULT_TOLERANCE_SECS),
            checkout_success_url: std::env::var("CHECKOUT_SUCCESS_URL")
                .unwrap_or_else(|_| "http://localhost:3000/billing/success".to_string()),
            checkout_cancel_url: std::env::var("CHECKOUT_CANCEL_URL")
                .unwrap_or_else(|_| "http://localhost:3000/billing/canceled".to_string()),
            portal_return_url: std::env::var("PORTAL_RETURN_URL")
                .unwrap_or_else(|_| "http://localhost:3000/settings/billing".to_string()),
            match_org_by_name: env_parse("BILLING_MATCH_ORG_BY_NAME", true),
            webhook_stale_after: Duration::from_secs(
                env_parse("WEBHOOK_STALE_AFTER_MINUTES", DEFAULT_STALE_AFTER.as_secs() / 60) * 60,
            ),
            max_replay_attempts: env_parse("WEBHOOK_MAX_REPLAY_ATTEMPTS", DEFAULT_MAX_REPLAY_ATTEMPTS),
            email: EmailConfig {
                resend_api_key: std::env::var("RESEND_API_KEY").ok().filter(|s| !s.is_empty()),
                from: std::env::var("EMAIL_FROM")
                    .unwrap_or_else(|_| "DealerHub <billing@dealerhub.app>".to_string()),
                template_dir: std::env::var("EMAIL_TEMPLATE_DIR").ok().map(PathBuf::from),
                login_url: app_url,
            },
        })
    }

    /// Config for tests and local tooling.
    pub fn for_webhook_secret(webhook_secret: impl Into<String>) -> Self {
        Self {
            stripe_secret_key: None,
            webhook_secret: webhook_secret.into(),
            webhook_tolerance_secs: DEFAULT_TOLERANCE_SECS,
            checkout_success_url: "http://localhost:3000/billing/success".to_string(),
            checkout_cancel_url: "http://localhost:3000/billing/canceled".to_string(),
            portal_return_url: "http://localhost:3000/settings/billing".to_string(),
            match_org_by_name: true,
            webhook_stale_after: DEFAULT_STALE_AFTER,
            max_replay_attempts: DEFAULT_MAX_REPLAY_ATTEMPTS,
            email: EmailConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "Ignoring unparseable environment value");
                default
            }
        },
        Err(_) => default,
    }
}
