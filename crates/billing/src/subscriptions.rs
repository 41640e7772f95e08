//! Subscription state machine
//!
//! One handler per Stripe event type. Each handler computes the next
//! license state from the event and the stored license, writes it through
//! the repository, then queues notifications. Status lattice:
//!
//! ```text
//! none -> active -> (past_due <-> active) -> canceled
//! ```
//!
//! `canceled` is terminal except for an explicit reactivation.

use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::email::{templates, Notifier};
use crate::error::{BillingError, BillingResult};
use crate::licenses::{
    License, LicenseRepository, PaymentState, SubscriptionChange, SubscriptionLink,
    SubscriptionStatus, TierChange,
};
use crate::organizations::OrganizationRepository;
use crate::provisioner::{OrganizationProvisioner, ProvisionOutcome, ProvisionRequest};
use crate::stripe_event::{
    event_types, from_unix, CheckoutSessionObject, InvoiceObject, SubscriptionObject, WebhookEvent,
};
use crate::tiers::TierCatalog;

/// What a handler did with an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// State was written (or, for checkout, validated).
    Applied,
    /// Nothing to act on: no linkage, or a terminal license.
    Skipped(String),
    /// Event type the billing core does not handle.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOutcome {
    pub org_id: Option<Uuid>,
    pub license_id: Option<Uuid>,
    pub disposition: Disposition,
}

impl HandlerOutcome {
    fn applied(org_id: Uuid, license_id: Option<Uuid>) -> Self {
        Self {
            org_id: Some(org_id),
            license_id,
            disposition: Disposition::Applied,
        }
    }

    fn skipped(reason: impl Into<String>) -> Self {
        Self {
            org_id: None,
            license_id: None,
            disposition: Disposition::Skipped(reason.into()),
        }
    }

    fn skipped_for(org_id: Uuid, license_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            org_id: Some(org_id),
            license_id: Some(license_id),
            disposition: Disposition::Skipped(reason.into()),
        }
    }

    fn ignored() -> Self {
        Self {
            org_id: None,
            license_id: None,
            disposition: Disposition::Ignored,
        }
    }
}

/// How the organization for a new subscription was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedBy {
    Subscription,
    Customer,
    Email,
    Name,
    Provisioned,
    ConcurrentProvision,
}

impl MatchedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchedBy::Subscription => "subscription",
            MatchedBy::Customer => "customer",
            MatchedBy::Email => "email",
            MatchedBy::Name => "name",
            MatchedBy::Provisioned => "provisioned",
            MatchedBy::ConcurrentProvision => "concurrent_provision",
        }
    }
}

struct ResolvedOrganization {
    org_id: Uuid,
    matched_by: MatchedBy,
    /// Set when provisioning already wrote the license.
    license: Option<License>,
    welcome: Option<WelcomeEmail>,
}

struct WelcomeEmail {
    recipient: String,
    variables: HashMap<String, String>,
}

#[derive(Clone)]
pub struct SubscriptionStateMachine {
    licenses: Arc<dyn LicenseRepository>,
    organizations: Arc<dyn OrganizationRepository>,
    tiers: Arc<dyn TierCatalog>,
    provisioner: OrganizationProvisioner,
    notifier: Arc<dyn Notifier>,
    match_org_by_name: bool,
    login_url: String,
}

impl SubscriptionStateMachine {
    pub fn new(
        licenses: Arc<dyn LicenseRepository>,
        organizations: Arc<dyn OrganizationRepository>,
        tiers: Arc<dyn TierCatalog>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            provisioner: OrganizationProvisioner::new(organizations.clone()),
            licenses,
            organizations,
            tiers,
            notifier,
            match_org_by_name: true,
            login_url: String::new(),
        }
    }

    pub fn with_name_matching(mut self, enabled: bool) -> Self {
        self.match_org_by_name = enabled;
        self
    }

    pub fn with_login_url(mut self, login_url: impl Into<String>) -> Self {
        self.login_url = login_url.into();
        self
    }

    /// Route an event to its handler.
    pub async fn dispatch(&self, event: &WebhookEvent) -> BillingResult<HandlerOutcome> {
        match event.event_type.as_str() {
            event_types::CHECKOUT_SESSION_COMPLETED => self.handle_checkout_completed(event).await,
            event_types::SUBSCRIPTION_CREATED => self.handle_subscription_created(event).await,
            event_types::SUBSCRIPTION_UPDATED => self.handle_subscription_updated(event).await,
            event_types::SUBSCRIPTION_DELETED => self.handle_subscription_deleted(event).await,
            event_types::INVOICE_PAID | event_types::INVOICE_PAYMENT_SUCCEEDED => {
                self.handle_invoice_paid(event).await
            }
            event_types::INVOICE_PAYMENT_FAILED => self.handle_invoice_payment_failed(event).await,
            other => {
                tracing::debug!(event_id = %event.id, event_type = %other, "Unhandled event type");
                Ok(HandlerOutcome::ignored())
            }
        }
    }

    /// Validates the metadata the subscription handlers will need.
    async fn handle_checkout_completed(&self, event: &WebhookEvent) -> BillingResult<HandlerOutcome> {
        let session: CheckoutSessionObject = event.object()?;

        let organization_name = session
            .metadata_value("organization_name")
            .ok_or_else(|| BillingError::MissingMetadata("organization_name".to_string()))?;
        let owner_email = session
            .owner_email()
            .ok_or_else(|| BillingError::MissingMetadata("owner_email".to_string()))?;

        tracing::info!(
            session_id = %session.id,
            customer = ?session.customer.as_ref().map(|c| c.id()),
            subscription = ?session.subscription.as_ref().map(|s| s.id()),
            organization_name = %organization_name,
            owner_email = %owner_email,
            "Checkout completed"
        );

        // The subscription events may already have linked a license.
        if let Some(subscription) = session.subscription.as_ref() {
            if let Some(license) = self.licenses.find_by_subscription(subscription.id()).await? {
                return Ok(HandlerOutcome::applied(license.org_id, Some(license.id)));
            }
        }

        Ok(HandlerOutcome {
            org_id: None,
            license_id: None,
            disposition: Disposition::Applied,
        })
    }

    async fn handle_subscription_created(
        &self,
        event: &WebhookEvent,
    ) -> BillingResult<HandlerOutcome> {
        let sub: SubscriptionObject = event.object()?;
        let status = parse_status(&sub.status)?;

        if self.licenses.is_canceled_subscription(&sub.id).await? {
            tracing::warn!(
                subscription_id = %sub.id,
                customer_id = %sub.customer.id(),
                "Created event for a subscription that was already deleted"
            );
            return Ok(HandlerOutcome::skipped("subscription already canceled"));
        }

        // Resolve the tier before touching anything so an unknown price
        // leaves no partial rows behind.
        let price_id = sub
            .price_id()
            .ok_or_else(|| BillingError::MissingMetadata("subscription price".to_string()))?;
        let tier = self
            .tiers
            .find_by_price_id(price_id)
            .await?
            .ok_or_else(|| BillingError::UnknownPrice {
                price_id: price_id.to_string(),
            })?;

        let (period_start, period_end) = sub.period();
        let link_for = |org_id: Uuid| {
            let mut link = SubscriptionLink::new(org_id, &tier, sub.customer.id(), &sub.id, status);
            link.cancel_at_period_end = sub.cancel_at_period_end;
            link.current_period_start = period_start;
            link.current_period_end = period_end;
            link
        };

        let Some(resolved) = self.resolve_organization(&sub, &link_for).await? else {
            tracing::warn!(
                subscription_id = %sub.id,
                customer_id = %sub.customer.id(),
                "Subscription has no linked organization and no provisioning metadata"
            );
            return Ok(HandlerOutcome::skipped("no organization for subscription"));
        };

        let license = match resolved.license {
            Some(license) => license,
            None => {
                let Some(license) = self
                    .licenses
                    .upsert_subscription(&link_for(resolved.org_id))
                    .await?
                else {
                    tracing::warn!(
                        org_id = %resolved.org_id,
                        subscription_id = %sub.id,
                        "Subscription already canceled; ignoring late created event"
                    );
                    return Ok(HandlerOutcome {
                        org_id: Some(resolved.org_id),
                        license_id: None,
                        disposition: Disposition::Skipped("subscription already canceled".to_string()),
                    });
                };
                license
            }
        };

        tracing::info!(
            org_id = %license.org_id,
            license_id = %license.id,
            subscription_id = %sub.id,
            license_type = %license.license_type,
            car_limit = license.car_limit,
            status = %license.subscription_status,
            matched_by = resolved.matched_by.as_str(),
            "License linked to subscription"
        );

        if let Some(welcome) = resolved.welcome {
            self.notify(
                templates::WELCOME_CREDENTIALS,
                &welcome.recipient,
                &welcome.variables,
            )
            .await;
        }

        Ok(HandlerOutcome::applied(license.org_id, Some(license.id)))
    }

    /// Existing linkage first, then email, then (optionally) name, then
    /// provisioning from subscription metadata.
    async fn resolve_organization(
        &self,
        sub: &SubscriptionObject,
        link_for: &impl Fn(Uuid) -> SubscriptionLink,
    ) -> BillingResult<Option<ResolvedOrganization>> {
        let found = |org_id, matched_by| {
            Some(ResolvedOrganization {
                org_id,
                matched_by,
                license: None,
                welcome: None,
            })
        };

        if let Some(license) = self.licenses.find_by_subscription(&sub.id).await? {
            return Ok(found(license.org_id, MatchedBy::Subscription));
        }
        if let Some(license) = self.licenses.find_by_customer(sub.customer.id()).await? {
            return Ok(found(license.org_id, MatchedBy::Customer));
        }

        let owner_email = sub.metadata_value("owner_email");
        let organization_name = sub.metadata_value("organization_name");

        if let Some(email) = owner_email {
            if let Some(org) = self.organizations.find_by_email(email).await? {
                return Ok(found(org.id, MatchedBy::Email));
            }
        }

        if let (Some(name), true) = (organization_name, self.match_org_by_name) {
            let matches = self.organizations.find_by_name(name).await?;
            match matches.as_slice() {
                [org] => {
                    tracing::warn!(
                        org_id = %org.id,
                        organization_name = %name,
                        subscription_id = %sub.id,
                        "Matched organization by name only; verify this linkage"
                    );
                    return Ok(found(org.id, MatchedBy::Name));
                }
                [] => {}
                _ => {
                    tracing::warn!(
                        organization_name = %name,
                        subscription_id = %sub.id,
                        "Several organizations share this name; not matching by name"
                    );
                }
            }
        }

        let (Some(organization_name), Some(owner_email)) = (organization_name, owner_email) else {
            return Ok(None);
        };

        let request = ProvisionRequest {
            organization_name: organization_name.to_string(),
            owner_email: owner_email.to_string(),
            owner_name: sub.metadata_value("owner_name").map(str::to_string),
            phone: sub.metadata_value("phone").map(str::to_string),
            address: sub.metadata_value("address").map(str::to_string),
        };

        match self.provisioner.provision(&request, link_for).await? {
            ProvisionOutcome::Created {
                organization,
                owner,
                license,
                temporary_password,
            } => {
                let welcome = match (owner, temporary_password) {
                    (Some(owner), Some(password)) => Some(WelcomeEmail {
                        recipient: owner.email.clone(),
                        variables: vars([
                            ("organization_name", organization.name.clone()),
                            (
                                "owner_name",
                                owner.name.clone().unwrap_or_else(|| "there".to_string()),
                            ),
                            ("email", owner.email),
                            ("temporary_password", password),
                            ("login_url", self.login_url.clone()),
                        ]),
                    }),
                    _ => None,
                };
                Ok(Some(ResolvedOrganization {
                    org_id: organization.id,
                    matched_by: MatchedBy::Provisioned,
                    license: Some(license),
                    welcome,
                }))
            }
            ProvisionOutcome::Existing { organization } => {
                Ok(found(organization.id, MatchedBy::ConcurrentProvision))
            }
        }
    }

    async fn handle_subscription_updated(
        &self,
        event: &WebhookEvent,
    ) -> BillingResult<HandlerOutcome> {
        let sub: SubscriptionObject = event.object()?;
        let status = parse_status(&sub.status)?;

        let Some(current) = self.licenses.find_by_subscription(&sub.id).await? else {
            tracing::warn!(subscription_id = %sub.id, "No license for updated subscription");
            return Ok(HandlerOutcome::skipped("no license for subscription"));
        };

        let previous_status = event.previous_status();
        let reactivation = current.subscription_status == SubscriptionStatus::Canceled
            && previous_status == Some(SubscriptionStatus::Canceled.as_str())
            && status.grants_access();

        if current.subscription_status == SubscriptionStatus::Canceled && !reactivation {
            tracing::info!(
                org_id = %current.org_id,
                subscription_id = %sub.id,
                incoming_status = %status,
                "Ignoring update for canceled subscription"
            );
            return Ok(HandlerOutcome::skipped_for(
                current.org_id,
                current.id,
                "subscription is canceled",
            ));
        }

        let tier = match sub.price_id() {
            Some(price_id) if Some(price_id) != current.stripe_price_id.as_deref() => {
                let tier = self
                    .tiers
                    .find_by_price_id(price_id)
                    .await?
                    .ok_or_else(|| BillingError::UnknownPrice {
                        price_id: price_id.to_string(),
                    })?;
                Some(TierChange::from(&tier))
            }
            _ => None,
        };

        let (period_start, period_end) = sub.period();
        let change = SubscriptionChange {
            status,
            cancel_at_period_end: sub.cancel_at_period_end,
            current_period_start: period_start,
            current_period_end: period_end,
            tier,
        };

        let Some(license) = self
            .licenses
            .apply_subscription_update(&sub.id, &change, reactivation)
            .await?
        else {
            return Ok(HandlerOutcome::skipped_for(
                current.org_id,
                current.id,
                "subscription is canceled",
            ));
        };

        tracing::info!(
            org_id = %license.org_id,
            subscription_id = %sub.id,
            old_status = %current.subscription_status,
            new_status = %license.subscription_status,
            license_type = %license.license_type,
            is_active = license.is_active,
            cancel_at_period_end = license.cancel_at_period_end,
            reactivation,
            "Subscription updated"
        );

        if let Some(previous) = previous_status.filter(|p| *p != status.as_str()) {
            self.notify_org(
                license.org_id,
                templates::SUBSCRIPTION_STATUS_CHANGED,
                vars([
                    ("old_status", previous.to_string()),
                    ("new_status", status.as_str().to_string()),
                ]),
            )
            .await;
        }

        if sub.cancel_at_period_end && !current.cancel_at_period_end {
            let period_end = license
                .current_period_end
                .map(format_date)
                .unwrap_or_else(|| "the end of the billing period".to_string());
            self.notify_org(
                license.org_id,
                templates::SUBSCRIPTION_CANCELLATION_SCHEDULED,
                vars([
                    ("license_type", license.license_type.clone()),
                    ("period_end", period_end),
                ]),
            )
            .await;
        }

        Ok(HandlerOutcome::applied(license.org_id, Some(license.id)))
    }

    /// The only handler that deactivates a license.
    async fn handle_subscription_deleted(
        &self,
        event: &WebhookEvent,
    ) -> BillingResult<HandlerOutcome> {
        let sub: SubscriptionObject = event.object()?;
        let canceled_at = sub.canceled_at.or(sub.ended_at).and_then(from_unix);

        let Some(current) = self.licenses.find_by_subscription(&sub.id).await? else {
            // Deleted can overtake created; the marker makes the later
            // created event a no-op.
            self.licenses
                .record_canceled_subscription(&sub.id, canceled_at)
                .await?;
            tracing::warn!(
                subscription_id = %sub.id,
                "No license for deleted subscription; cancellation recorded"
            );
            return Ok(HandlerOutcome::skipped("no license for subscription"));
        };
        let already_canceled = current.subscription_status == SubscriptionStatus::Canceled;

        let Some(license) = self
            .licenses
            .cancel_subscription(&sub.id, canceled_at)
            .await?
        else {
            return Ok(HandlerOutcome::skipped("no license for subscription"));
        };

        tracing::info!(
            org_id = %license.org_id,
            subscription_id = %sub.id,
            previous_status = %current.subscription_status,
            "Subscription canceled; license deactivated"
        );

        if !already_canceled {
            self.notify_org(
                license.org_id,
                templates::SUBSCRIPTION_CANCELED,
                vars([("license_type", license.license_type.clone())]),
            )
            .await;
        }

        Ok(HandlerOutcome::applied(license.org_id, Some(license.id)))
    }

    async fn handle_invoice_paid(&self, event: &WebhookEvent) -> BillingResult<HandlerOutcome> {
        let invoice: InvoiceObject = event.object()?;
        let Some(subscription_id) = invoice.subscription_id() else {
            tracing::debug!(invoice_id = %invoice.id, "Paid invoice has no subscription");
            return Ok(HandlerOutcome::skipped("invoice has no subscription"));
        };

        match self
            .licenses
            .set_payment_state(subscription_id, PaymentState::Paid)
            .await?
        {
            Some(license) => {
                tracing::info!(
                    org_id = %license.org_id,
                    subscription_id = %subscription_id,
                    invoice_id = %invoice.id,
                    "Invoice paid; license active"
                );
                Ok(HandlerOutcome::applied(license.org_id, Some(license.id)))
            }
            None => Ok(self.payment_skip(subscription_id, &invoice.id).await?),
        }
    }

    async fn handle_invoice_payment_failed(
        &self,
        event: &WebhookEvent,
    ) -> BillingResult<HandlerOutcome> {
        let invoice: InvoiceObject = event.object()?;
        let Some(subscription_id) = invoice.subscription_id() else {
            tracing::debug!(invoice_id = %invoice.id, "Failed invoice has no subscription");
            return Ok(HandlerOutcome::skipped("invoice has no subscription"));
        };

        let Some(license) = self
            .licenses
            .set_payment_state(subscription_id, PaymentState::PastDue)
            .await?
        else {
            return self.payment_skip(subscription_id, &invoice.id).await;
        };

        tracing::warn!(
            org_id = %license.org_id,
            subscription_id = %subscription_id,
            invoice_id = %invoice.id,
            attempt_count = ?invoice.attempt_count,
            "Invoice payment failed; license past due"
        );

        let amount_due = invoice
            .amount_due
            .map(|cents| format_amount(cents, invoice.currency.as_deref().unwrap_or("usd")))
            .unwrap_or_default();
        self.notify_org(
            license.org_id,
            templates::PAYMENT_FAILED,
            vars([
                ("amount_due", amount_due),
                (
                    "attempt_count",
                    invoice.attempt_count.unwrap_or(1).to_string(),
                ),
                (
                    "hosted_invoice_url",
                    invoice.hosted_invoice_url.clone().unwrap_or_default(),
                ),
            ]),
        )
        .await;

        Ok(HandlerOutcome::applied(license.org_id, Some(license.id)))
    }

    async fn payment_skip(
        &self,
        subscription_id: &str,
        invoice_id: &str,
    ) -> BillingResult<HandlerOutcome> {
        match self.licenses.find_by_subscription(subscription_id).await? {
            Some(license) => {
                tracing::info!(
                    org_id = %license.org_id,
                    subscription_id = %subscription_id,
                    invoice_id = %invoice_id,
                    "Ignoring invoice for canceled subscription"
                );
                Ok(HandlerOutcome::skipped_for(
                    license.org_id,
                    license.id,
                    "subscription is canceled",
                ))
            }
            None => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    invoice_id = %invoice_id,
                    "No license for invoice subscription"
                );
                Ok(HandlerOutcome::skipped("no license for subscription"))
            }
        }
    }

    /// Email the organization's contact address. Failures are logged only.
    async fn notify_org(
        &self,
        org_id: Uuid,
        template: &str,
        mut variables: HashMap<String, String>,
    ) {
        let organization = match self.organizations.find_by_id(org_id).await {
            Ok(Some(org)) => org,
            Ok(None) => {
                tracing::warn!(org_id = %org_id, template, "No organization to notify");
                return;
            }
            Err(e) => {
                tracing::warn!(org_id = %org_id, template, error = %e, "Failed to load organization for notification");
                return;
            }
        };
        variables
            .entry("organization_name".to_string())
            .or_insert_with(|| organization.name.clone());
        self.notify(template, &organization.contact_email, &variables)
            .await;
    }

    async fn notify(&self, template: &str, recipient: &str, variables: &HashMap<String, String>) {
        if let Err(e) = self.notifier.send(template, recipient, variables).await {
            tracing::warn!(template, recipient, error = %e, "Failed to queue billing notification");
        }
    }
}

fn parse_status(raw: &str) -> BillingResult<SubscriptionStatus> {
    SubscriptionStatus::parse(raw)
        .ok_or_else(|| BillingError::MalformedPayload(format!("unknown subscription status '{raw}'")))
}

fn vars<const N: usize>(pairs: [(&str, String); N]) -> HashMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn format_amount(cents: i64, currency: &str) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    let (major, minor) = (abs / 100, abs % 100);
    if currency.eq_ignore_ascii_case("usd") {
        format!("{sign}${major}.{minor:02}")
    } else {
        format!("{sign}{major}.{minor:02} {}", currency.to_uppercase())
    }
}

fn format_date(at: time::OffsetDateTime) -> String {
    format!("{}-{:02}-{:02}", at.year(), u8::from(at.month()), at.day())
}
