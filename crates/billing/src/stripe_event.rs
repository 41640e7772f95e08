//! Stripe webhook wire types
//!
//! Only the fields the billing core reads are modelled. Stripe adds fields
//! and moves things between API versions, so everything beyond the event
//! envelope is optional and unknown fields are ignored.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Event types the state machine acts on.
pub mod event_types {
    pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
    pub const SUBSCRIPTION_CREATED: &str = "customer.subscription.created";
    pub const SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
    pub const SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";
    pub const INVOICE_PAID: &str = "invoice.paid";
    pub const INVOICE_PAYMENT_SUCCEEDED: &str = "invoice.payment_succeeded";
    pub const INVOICE_PAYMENT_FAILED: &str = "invoice.payment_failed";
}

/// Event envelope
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: Option<i64>,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
    #[serde(default)]
    pub previous_attributes: Option<serde_json::Value>,
}

impl WebhookEvent {
    pub fn parse(payload: &[u8]) -> BillingResult<Self> {
        let event: WebhookEvent = serde_json::from_slice(payload)?;
        if event.id.is_empty() || event.event_type.is_empty() {
            return Err(BillingError::MalformedPayload(
                "event id and type are required".to_string(),
            ));
        }
        Ok(event)
    }

    /// Decode `data.object` into a typed object.
    pub fn object<T: DeserializeOwned>(&self) -> BillingResult<T> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            BillingError::MalformedPayload(format!("{} object: {e}", self.event_type))
        })
    }

    /// `data.previous_attributes.status`, present when the status changed.
    pub fn previous_status(&self) -> Option<&str> {
        self.data
            .previous_attributes
            .as_ref()?
            .get("status")?
            .as_str()
    }
}

/// Expandable reference: either a bare ID or the expanded object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IdOrObject {
    Id(String),
    Object { id: String },
}

impl IdOrObject {
    pub fn id(&self) -> &str {
        match self {
            IdOrObject::Id(value) => value,
            IdOrObject::Object { id } => id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub customer: IdOrObject,
    pub status: String,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub ended_at: Option<i64>,
    pub items: SubscriptionItems,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub price: Option<PriceObject>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceObject {
    pub id: String,
}

impl SubscriptionObject {
    /// Price of the first subscription item.
    pub fn price_id(&self) -> Option<&str> {
        self.items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.as_str())
    }

    /// Billing period; newer API versions carry it on the item instead.
    pub fn period(&self) -> (Option<OffsetDateTime>, Option<OffsetDateTime>) {
        let item = self.items.data.first();
        let start = self
            .current_period_start
            .or_else(|| item.and_then(|i| i.current_period_start));
        let end = self
            .current_period_end
            .or_else(|| item.and_then(|i| i.current_period_end));
        (start.and_then(from_unix), end.and_then(from_unix))
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        non_empty(self.metadata.get(key))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<IdOrObject>,
    #[serde(default)]
    pub subscription: Option<IdOrObject>,
    #[serde(default)]
    pub parent: Option<InvoiceParent>,
    #[serde(default)]
    pub amount_due: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub attempt_count: Option<i64>,
    #[serde(default)]
    pub hosted_invoice_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceParent {
    #[serde(default)]
    pub subscription_details: Option<InvoiceSubscriptionDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceSubscriptionDetails {
    #[serde(default)]
    pub subscription: Option<IdOrObject>,
}

impl InvoiceObject {
    /// Linked subscription; moved under `parent` in newer API versions.
    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription
            .as_ref()
            .or_else(|| {
                self.parent
                    .as_ref()?
                    .subscription_details
                    .as_ref()?
                    .subscription
                    .as_ref()
            })
            .map(IdOrObject::id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<IdOrObject>,
    #[serde(default)]
    pub subscription: Option<IdOrObject>,
    #[serde(default)]
    pub customer_details: Option<CustomerDetails>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomerDetails {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl CheckoutSessionObject {
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        non_empty(self.metadata.get(key))
    }

    /// Owner email from metadata, falling back to the customer details
    /// Stripe collected on the hosted page.
    pub fn owner_email(&self) -> Option<&str> {
        self.metadata_value("owner_email").or_else(|| {
            self.customer_details
                .as_ref()?
                .email
                .as_deref()
                .filter(|email| !email.trim().is_empty())
        })
    }
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty())
}

pub(crate) fn from_unix(seconds: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(seconds).ok()
}
