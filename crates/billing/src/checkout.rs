//! Hosted checkout and billing portal sessions
//!
//! Pass-through to Stripe. The organization details collected on our
//! signup form travel as metadata on both the session and the
//! subscription, which is where the webhook handlers read them back.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use stripe::{
    BillingPortalSession, CheckoutSession, CheckoutSessionMode, CreateBillingPortalSession,
    CreateCheckoutSession, CreateCheckoutSessionLineItems, CreateCheckoutSessionSubscriptionData,
    CustomerId,
};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::licenses::LicenseRepository;
use crate::tiers::TierCatalog;

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    pub price_id: String,
    pub organization_name: String,
    pub owner_email: String,
    pub owner_name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

impl CheckoutRequest {
    fn validate(&self) -> BillingResult<()> {
        if self.organization_name.trim().is_empty() {
            return Err(BillingError::InvalidInput(
                "organization_name is required".to_string(),
            ));
        }
        let email = self.owner_email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(BillingError::InvalidInput(
                "a valid owner_email is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Metadata read back by the subscription handlers
    pub fn metadata(&self) -> HashMap<String, String> {
        let mut metadata = HashMap::from([
            (
                "organization_name".to_string(),
                self.organization_name.trim().to_string(),
            ),
            ("owner_email".to_string(), self.owner_email.trim().to_string()),
        ]);
        for (key, value) in [
            ("owner_name", &self.owner_name),
            ("phone", &self.phone),
            ("address", &self.address),
        ] {
            if let Some(value) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                metadata.insert(key.to_string(), value.to_string());
            }
        }
        metadata
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortalResponse {
    pub url: String,
}

#[derive(Clone)]
pub struct CheckoutService {
    stripe: StripeClient,
    tiers: Arc<dyn TierCatalog>,
    licenses: Arc<dyn LicenseRepository>,
    success_url: String,
    cancel_url: String,
    portal_return_url: String,
}

impl CheckoutService {
    pub fn new(
        stripe: StripeClient,
        tiers: Arc<dyn TierCatalog>,
        licenses: Arc<dyn LicenseRepository>,
        success_url: String,
        cancel_url: String,
        portal_return_url: String,
    ) -> Self {
        Self {
            stripe,
            tiers,
            licenses,
            success_url,
            cancel_url,
            portal_return_url,
        }
    }

    /// Subscription checkout for a catalog price.
    pub async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<CheckoutResponse> {
        request.validate()?;

        let tier = self
            .tiers
            .find_by_price_id(&request.price_id)
            .await?
            .ok_or_else(|| BillingError::InvalidInput(format!("unknown price {}", request.price_id)))?;

        let metadata = request.metadata();
        let owner_email = request.owner_email.trim();

        let mut params = CreateCheckoutSession::new();
        params.mode = Some(CheckoutSessionMode::Subscription);
        params.success_url = Some(&self.success_url);
        params.cancel_url = Some(&self.cancel_url);
        params.customer_email = Some(owner_email);
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(tier.stripe_price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(metadata.clone());
        params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
            metadata: Some(metadata),
            ..Default::default()
        });

        let session = CheckoutSession::create(self.stripe.inner(), params).await?;
        let url = session
            .url
            .ok_or_else(|| BillingError::StripeApi("No checkout URL returned".to_string()))?;

        tracing::info!(
            session_id = %session.id,
            tier = %tier.name,
            organization_name = %request.organization_name.trim(),
            "Checkout session created"
        );

        Ok(CheckoutResponse {
            session_id: session.id.to_string(),
            url,
        })
    }

    /// Billing portal for an organization with a Stripe customer.
    pub async fn create_portal_session(&self, org_id: Uuid) -> BillingResult<PortalResponse> {
        let customer_id = self
            .licenses
            .find_by_org(org_id)
            .await?
            .and_then(|license| license.stripe_customer_id)
            .ok_or_else(|| {
                BillingError::NotFound(format!("billing customer for organization {org_id}"))
            })?;

        let customer_id: CustomerId = customer_id
            .parse()
            .map_err(|_| BillingError::Internal(format!("invalid customer id {customer_id}")))?;

        let mut params = CreateBillingPortalSession::new(customer_id);
        params.return_url = Some(&self.portal_return_url);

        let session = BillingPortalSession::create(self.stripe.inner(), params).await?;

        tracing::info!(org_id = %org_id, session_id = %session.id, "Portal session created");

        Ok(PortalResponse { url: session.url })
    }
}
