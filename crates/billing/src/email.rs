//! Billing email notifications
//!
//! Handlers only ever see the [`Notifier`] contract: a template name, a
//! recipient and a variable map. [`BillingEmailService`] renders templates
//! from a [`TemplateCache`] and delivers through the Resend API;
//! [`QueuedNotifier`] moves delivery off the webhook request path.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult};

const RESEND_API_URL: &str = "https://api.resend.com/emails";

/// Template names used by the billing core
pub mod templates {
    pub const WELCOME_CREDENTIALS: &str = "welcome_credentials";
    pub const SUBSCRIPTION_STATUS_CHANGED: &str = "subscription_status_changed";
    pub const SUBSCRIPTION_CANCELLATION_SCHEDULED: &str = "subscription_cancellation_scheduled";
    pub const SUBSCRIPTION_CANCELED: &str = "subscription_canceled";
    pub const PAYMENT_FAILED: &str = "payment_failed";
}

/// Outbound notification contract
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        template: &str,
        recipient: &str,
        variables: &HashMap<String, String>,
    ) -> BillingResult<()>;
}

#[derive(Debug, Clone, Default)]
pub struct EmailConfig {
    /// Resend API key; delivery is skipped when unset.
    pub resend_api_key: Option<String>,
    pub from: String,
    /// Directory with `<template>.html` overrides
    pub template_dir: Option<PathBuf>,
    /// Login page linked from the welcome email
    pub login_url: String,
}

/// A subject and HTML body with `{{variable}}` placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailTemplate {
    pub subject: String,
    pub html: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
}

/// Process-wide template cache, loaded once at startup.
#[derive(Debug, Clone)]
pub struct TemplateCache {
    templates: HashMap<String, EmailTemplate>,
}

impl TemplateCache {
    /// Built-in templates only.
    pub fn builtin() -> Self {
        let mut templates = HashMap::new();
        for (name, subject, html) in BUILTIN_TEMPLATES {
            templates.insert(
                (*name).to_string(),
                EmailTemplate {
                    subject: (*subject).to_string(),
                    html: (*html).to_string(),
                },
            );
        }
        Self { templates }
    }

    /// Built-in templates overridden by `<name>.html` files in `dir`.
    ///
    /// An override's first line may be `Subject: ...`; otherwise the
    /// built-in subject is kept.
    pub fn load(dir: Option<&Path>) -> BillingResult<Self> {
        let mut cache = Self::builtin();
        let Some(dir) = dir else {
            return Ok(cache);
        };

        let entries = std::fs::read_dir(dir).map_err(|e| {
            BillingError::NotConfigured(format!("email template dir {}: {e}", dir.display()))
        })?;

        for entry in entries {
            let path = entry
                .map_err(|e| BillingError::Internal(format!("reading template dir: {e}")))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("html") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let raw = std::fs::read_to_string(&path).map_err(|e| {
                BillingError::Internal(format!("reading template {}: {e}", path.display()))
            })?;
            cache.insert_raw(name, &raw);
            tracing::debug!(template = %name, path = %path.display(), "Loaded email template override");
        }

        Ok(cache)
    }

    fn insert_raw(&mut self, name: &str, raw: &str) {
        let (subject, html) = match raw.split_once('\n') {
            Some((first, rest)) if first.starts_with("Subject:") => (
                Some(first.trim_start_matches("Subject:").trim().to_string()),
                rest.to_string(),
            ),
            _ => (None, raw.to_string()),
        };
        let subject = subject
            .or_else(|| self.templates.get(name).map(|t| t.subject.clone()))
            .unwrap_or_else(|| name.replace('_', " "));
        self.templates
            .insert(name.to_string(), EmailTemplate { subject, html });
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    pub fn render(
        &self,
        name: &str,
        variables: &HashMap<String, String>,
    ) -> BillingResult<RenderedEmail> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| BillingError::Notification(format!("unknown email template '{name}'")))?;
        Ok(RenderedEmail {
            subject: substitute(&template.subject, variables, false),
            html: substitute(&template.html, variables, true),
        })
    }
}

/// Replace `{{name}}` placeholders. Unknown names render empty.
fn substitute(template: &str, variables: &HashMap<String, String>, escape: bool) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                if let Some(value) = variables.get(key) {
                    if escape {
                        out.push_str(&escape_html(value));
                    } else {
                        out.push_str(value);
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

const BUILTIN_TEMPLATES: &[(&str, &str, &str)] = &[
    (
        templates::WELCOME_CREDENTIALS,
        "Welcome to DealerHub, {{organization_name}}",
        "<p>Hi {{owner_name}},</p>\
         <p>Your DealerHub account for <strong>{{organization_name}}</strong> is ready.</p>\
         <p>Email: {{email}}<br>Temporary password: <code>{{temporary_password}}</code></p>\
         <p>You will be asked to choose a new password when you <a href=\"{{login_url}}\">sign in</a>.</p>",
    ),
    (
        templates::SUBSCRIPTION_STATUS_CHANGED,
        "Your DealerHub subscription is now {{new_status}}",
        "<p>The subscription for <strong>{{organization_name}}</strong> changed from \
         {{old_status}} to {{new_status}}.</p>",
    ),
    (
        templates::SUBSCRIPTION_CANCELLATION_SCHEDULED,
        "Your DealerHub subscription will end on {{period_end}}",
        "<p>The {{license_type}} subscription for <strong>{{organization_name}}</strong> is set to \
         cancel at the end of the current period ({{period_end}}). You keep full access until then.</p>",
    ),
    (
        templates::SUBSCRIPTION_CANCELED,
        "Your DealerHub subscription has been canceled",
        "<p>The subscription for <strong>{{organization_name}}</strong> has been canceled. \
         Your inventory is still available read-only; subscribe again to add vehicles.</p>",
    ),
    (
        templates::PAYMENT_FAILED,
        "Payment failed for your DealerHub subscription",
        "<p>We could not collect {{amount_due}} for <strong>{{organization_name}}</strong> \
         (attempt {{attempt_count}}).</p>\
         <p><a href=\"{{hosted_invoice_url}}\">Update your payment details</a> to keep adding vehicles.</p>",
    ),
];

/// Resend-backed email delivery
#[derive(Clone)]
pub struct BillingEmailService {
    http: reqwest::Client,
    config: EmailConfig,
    templates: Arc<TemplateCache>,
}

impl BillingEmailService {
    pub fn new(config: EmailConfig, templates: Arc<TemplateCache>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            config,
            templates,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.resend_api_key.is_some()
    }

    async fn post(&self, api_key: &str, body: &serde_json::Value) -> Result<(), DeliveryError> {
        let response = self
            .http
            .post(RESEND_API_URL)
            .bearer_auth(api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(DeliveryError::Transient(format!("{status}: {text}")))
        } else {
            Err(DeliveryError::Rejected(format!("{status}: {text}")))
        }
    }
}

#[derive(Debug)]
enum DeliveryError {
    Transient(String),
    Rejected(String),
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::Transient(msg) => write!(f, "transient: {msg}"),
            DeliveryError::Rejected(msg) => write!(f, "rejected: {msg}"),
        }
    }
}

#[async_trait]
impl Notifier for BillingEmailService {
    async fn send(
        &self,
        template: &str,
        recipient: &str,
        variables: &HashMap<String, String>,
    ) -> BillingResult<()> {
        let rendered = self.templates.render(template, variables)?;

        let Some(api_key) = self.config.resend_api_key.as_deref() else {
            tracing::info!(template, recipient, "Email delivery disabled; skipping");
            return Ok(());
        };

        let body = serde_json::json!({
            "from": self.config.from,
            "to": [recipient],
            "subject": rendered.subject,
            "html": rendered.html,
        });

        let strategy = ExponentialBackoff::from_millis(200).map(jitter).take(3);
        RetryIf::spawn(
            strategy,
            || self.post(api_key, &body),
            |e: &DeliveryError| matches!(e, DeliveryError::Transient(_)),
        )
        .await
        .map_err(|e| BillingError::Notification(format!("{template} to {recipient}: {e}")))?;

        tracing::info!(template, recipient, "Billing email sent");
        Ok(())
    }
}

struct EmailJob {
    template: String,
    recipient: String,
    variables: HashMap<String, String>,
}

/// Hands notifications to a background task over a bounded channel.
///
/// `send` only fails when the queue is full or closed; delivery errors are
/// logged by the worker task.
#[derive(Clone)]
pub struct QueuedNotifier {
    tx: mpsc::Sender<EmailJob>,
}

impl QueuedNotifier {
    pub fn spawn(inner: Arc<dyn Notifier>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<EmailJob>(capacity);
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Err(e) = inner
                    .send(&job.template, &job.recipient, &job.variables)
                    .await
                {
                    tracing::error!(
                        template = %job.template,
                        recipient = %job.recipient,
                        error = %e,
                        "Failed to deliver billing email"
                    );
                }
            }
            tracing::debug!("Notification queue closed");
        });
        (Self { tx }, handle)
    }
}

#[async_trait]
impl Notifier for QueuedNotifier {
    async fn send(
        &self,
        template: &str,
        recipient: &str,
        variables: &HashMap<String, String>,
    ) -> BillingResult<()> {
        self.tx
            .try_send(EmailJob {
                template: template.to_string(),
                recipient: recipient.to_string(),
                variables: variables.clone(),
            })
            .map_err(|e| BillingError::Notification(format!("notification queue: {e}")))
    }
}
