//! Stripe API client wrapper

use crate::error::{BillingError, BillingResult};

/// Thin wrapper over the async-stripe client
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
}

impl StripeClient {
    pub fn new(secret_key: &str) -> BillingResult<Self> {
        if !secret_key.starts_with("sk_") && !secret_key.starts_with("rk_") {
            return Err(BillingError::NotConfigured(
                "STRIPE_SECRET_KEY must be a secret (sk_) or restricted (rk_) key".to_string(),
            ));
        }
        Ok(Self {
            inner: stripe::Client::new(secret_key),
        })
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }
}
