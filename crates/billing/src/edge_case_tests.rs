// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing System
//!
//! Scenario tests run end to end through `BillingService` against the
//! in-memory stores:
//! - Webhook delivery (signature, dedup, replay)
//! - Subscription lifecycle (provisioning, matching, cancellation, payments)
//! - Car-limit guard
//! - Admin license edits

#[cfg(test)]
mod support {
    use serde_json::{json, Value};
    use time::OffsetDateTime;

    use crate::config::BillingConfig;
    use crate::error::BillingResult;
    use crate::memory::MemoryBackend;
    use crate::signature::sign_payload;
    use crate::webhooks::WebhookOutcome;
    use crate::BillingService;

    pub const SECRET: &str = "whsec_edge_case_secret";

    pub struct Harness {
        pub backend: MemoryBackend,
        pub service: BillingService,
    }

    pub fn harness() -> Harness {
        harness_with(BillingConfig::for_webhook_secret(SECRET))
    }

    pub fn harness_with(config: BillingConfig) -> Harness {
        let backend = MemoryBackend::default();
        let service =
            BillingService::from_parts(backend.stores(), backend.notifier(), config).unwrap();
        Harness { backend, service }
    }

    impl Harness {
        pub async fn deliver(&self, event: &Value) -> BillingResult<WebhookOutcome> {
            let body = serde_json::to_vec(event).unwrap();
            let header =
                sign_payload(SECRET, OffsetDateTime::now_utc().unix_timestamp(), &body).unwrap();
            self.service.webhooks.handle_webhook(&body, &header).await
        }
    }

    pub fn event(id: &str, event_type: &str, object: Value) -> Value {
        json!({
            "id": id,
            "type": event_type,
            "created": 1_700_000_000,
            "data": { "object": object }
        })
    }

    pub fn event_with_previous(id: &str, event_type: &str, object: Value, previous: Value) -> Value {
        json!({
            "id": id,
            "type": event_type,
            "created": 1_700_000_000,
            "data": { "object": object, "previous_attributes": previous }
        })
    }

    pub fn subscription(id: &str, customer: &str, status: &str, price: &str, metadata: Value) -> Value {
        json!({
            "id": id,
            "object": "subscription",
            "customer": customer,
            "status": status,
            "cancel_at_period_end": false,
            "current_period_start": 1_700_000_000,
            "current_period_end": 1_702_592_000,
            "items": { "data": [{ "price": { "id": price } }] },
            "metadata": metadata
        })
    }

    pub fn new_customer_metadata() -> Value {
        json!({
            "organization_name": "Acme Motors",
            "owner_email": "owner@acme.test",
            "owner_name": "Ann Owner",
            "phone": "+1 555 0100"
        })
    }

    pub fn invoice(id: &str, subscription: &str) -> Value {
        json!({
            "id": id,
            "object": "invoice",
            "customer": "cus_acme",
            "subscription": subscription,
            "amount_due": 4900,
            "currency": "usd",
            "attempt_count": 1,
            "hosted_invoice_url": "https://invoice.stripe.test/in_1"
        })
    }

    /// Deliver a `customer.subscription.created` for a brand-new customer.
    pub async fn provision_acme(h: &Harness) {
        let outcome = h
            .deliver(&event(
                "evt_created",
                "customer.subscription.created",
                subscription(
                    "sub_acme",
                    "cus_acme",
                    "active",
                    "price_starter",
                    new_customer_metadata(),
                ),
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Processed { .. }));
    }
}

#[cfg(test)]
mod webhook_tests {
    use super::support::*;
    use crate::error::BillingError;
    use crate::events::{EventStatus, EventStore, FailureKind, NewBillingEvent};
    use crate::webhooks::WebhookOutcome;
    use serde_json::json;
    use std::time::Duration;

    // =========================================================================
    // Re-delivery of the same event never double-applies or double-emails
    // =========================================================================
    #[tokio::test]
    async fn test_redelivery_is_acknowledged_as_duplicate() {
        let h = harness();
        let created = event(
            "evt_1",
            "customer.subscription.created",
            subscription("sub_1", "cus_1", "active", "price_starter", new_customer_metadata()),
        );

        let first = h.deliver(&created).await.unwrap();
        assert!(matches!(first, WebhookOutcome::Processed { .. }));

        let second = h.deliver(&created).await.unwrap();
        assert_eq!(
            second,
            WebhookOutcome::Duplicate {
                event_id: "evt_1".to_string(),
                status: EventStatus::Processed,
            }
        );

        assert_eq!(h.backend.organizations.organizations().await.len(), 1);
        assert_eq!(h.backend.licenses.all().await.len(), 1);
        assert_eq!(h.backend.organizations.users().await.len(), 1);
        assert_eq!(
            h.backend
                .notifier
                .sent_with(crate::email::templates::WELCOME_CREDENTIALS)
                .await
                .len(),
            1
        );
    }

    // =========================================================================
    // Concurrent deliveries of one event: exactly one runs the handler
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_redelivery_processes_once() {
        let h = std::sync::Arc::new(harness());
        let created = event(
            "evt_race",
            "customer.subscription.created",
            subscription("sub_1", "cus_1", "active", "price_starter", new_customer_metadata()),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let h = h.clone();
            let created = created.clone();
            handles.push(tokio::spawn(async move { h.deliver(&created).await.unwrap() }));
        }
        let mut processed = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), WebhookOutcome::Processed { .. }) {
                processed += 1;
            }
        }

        assert_eq!(processed, 1);
        assert_eq!(h.backend.organizations.organizations().await.len(), 1);
        assert_eq!(h.backend.licenses.all().await.len(), 1);
    }

    // =========================================================================
    // Tampered payload is rejected and nothing is recorded
    // =========================================================================
    #[tokio::test]
    async fn test_tampered_signature_is_rejected_without_event_row() {
        let h = harness();
        let body = serde_json::to_vec(&event(
            "evt_forged",
            "invoice.paid",
            invoice("in_1", "sub_1"),
        ))
        .unwrap();
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let header = crate::signature::sign_payload(SECRET, now, &body).unwrap();

        let mut tampered = body.clone();
        let last = tampered.len() - 2;
        tampered[last] = b' ';

        let err = h
            .service
            .webhooks
            .handle_webhook(&tampered, &header)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));

        let err = h
            .service
            .webhooks
            .handle_webhook(&body, "t=1,v1=deadbeef")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::SignatureInvalid);

        assert!(h.backend.events.is_empty().await);
    }

    // =========================================================================
    // Signed but malformed payload: rejected, nothing recorded
    // =========================================================================
    #[tokio::test]
    async fn test_malformed_payload_is_not_recorded() {
        let h = harness();
        let err = h.deliver(&json!({ "type": "invoice.paid" })).await.unwrap_err();
        assert!(matches!(err, BillingError::MalformedPayload(_)));
        assert!(h.backend.events.is_empty().await);
    }

    // =========================================================================
    // Unknown event types are recorded and acknowledged as no-ops
    // =========================================================================
    #[tokio::test]
    async fn test_unknown_event_type_is_ignored_but_recorded() {
        let h = harness();
        let outcome = h
            .deliver(&event("evt_x", "customer.tax_id.created", json!({ "id": "txi_1" })))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Ignored { .. }));

        let record = h.service.webhooks.get_event("evt_x").await.unwrap().unwrap();
        assert_eq!(record.status, EventStatus::Processed);
    }

    // =========================================================================
    // Unknown price: configuration failure, acknowledged, nothing written
    // =========================================================================
    #[tokio::test]
    async fn test_unknown_price_leaves_no_rows() {
        let h = harness();
        let outcome = h
            .deliver(&event(
                "evt_bad_price",
                "customer.subscription.created",
                subscription("sub_1", "cus_1", "active", "price_unknown", new_customer_metadata()),
            ))
            .await
            .unwrap();

        match &outcome {
            WebhookOutcome::Failed { kind, message, .. } => {
                assert_eq!(*kind, FailureKind::Configuration);
                assert!(message.contains("price_unknown"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(outcome.acknowledge(), "configuration failures must not retry-loop");

        assert!(h.backend.organizations.organizations().await.is_empty());
        assert!(h.backend.licenses.all().await.is_empty());
        assert!(h.backend.organizations.users().await.is_empty());

        let record = h.service.webhooks.get_event("evt_bad_price").await.unwrap().unwrap();
        assert_eq!(record.status, EventStatus::Failed);
        assert_eq!(record.failure_kind, Some(FailureKind::Configuration));
    }

    // =========================================================================
    // Checkout without organization metadata is a configuration failure
    // =========================================================================
    #[tokio::test]
    async fn test_checkout_without_metadata_fails_configuration() {
        let h = harness();
        let outcome = h
            .deliver(&event(
                "evt_checkout",
                "checkout.session.completed",
                json!({ "id": "cs_1", "customer": "cus_1", "metadata": {} }),
            ))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            WebhookOutcome::Failed {
                kind: FailureKind::Configuration,
                ..
            }
        ));

        let outcome = h
            .deliver(&event(
                "evt_checkout_ok",
                "checkout.session.completed",
                json!({
                    "id": "cs_2",
                    "customer": "cus_1",
                    "metadata": { "organization_name": "Acme Motors" },
                    "customer_details": { "email": "owner@acme.test" }
                }),
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Processed { .. }));
    }

    // =========================================================================
    // Event store outage surfaces as an error and writes nothing
    // =========================================================================
    #[tokio::test]
    async fn test_event_store_outage_is_an_error() {
        let h = harness();
        let created = event(
            "evt_created",
            "customer.subscription.created",
            subscription("sub_acme", "cus_acme", "active", "price_starter", new_customer_metadata()),
        );

        h.backend.events.set_unavailable(true);
        let err = h.deliver(&created).await.unwrap_err();
        assert!(matches!(err, BillingError::Database(_)));
        assert!(h.backend.licenses.all().await.is_empty());

        h.backend.events.set_unavailable(false);
        let outcome = h.deliver(&created).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::Processed { .. }));
    }

    // =========================================================================
    // Unhandled failures ask for re-delivery; re-delivery re-claims the event
    // =========================================================================
    #[tokio::test]
    async fn test_failed_event_is_reclaimed_on_redelivery() {
        let h = harness();
        let bad = event(
            "evt_bad_status",
            "customer.subscription.created",
            subscription("sub_1", "cus_1", "exploded", "price_starter", new_customer_metadata()),
        );

        let first = h.deliver(&bad).await.unwrap();
        assert!(!first.acknowledge());

        let second = h.deliver(&bad).await.unwrap();
        assert!(matches!(
            second,
            WebhookOutcome::Failed {
                kind: FailureKind::Unhandled,
                ..
            }
        ));
        let record = h.service.webhooks.get_event("evt_bad_status").await.unwrap().unwrap();
        assert_eq!(record.attempts, 2);
    }

    // =========================================================================
    // In-flight events are duplicates; stuck ones are re-claimed
    // =========================================================================
    #[tokio::test]
    async fn test_stuck_event_is_reclaimed_after_timeout() {
        let h = harness();
        let created = event(
            "evt_stuck",
            "customer.subscription.created",
            subscription("sub_1", "cus_1", "active", "price_starter", new_customer_metadata()),
        );

        // Simulate a delivery that claimed the event and then crashed.
        h.backend
            .events
            .claim(&NewBillingEvent {
                external_event_id: "evt_stuck".to_string(),
                event_type: "customer.subscription.created".to_string(),
                payload: created.clone(),
            })
            .await
            .unwrap();

        let outcome = h.deliver(&created).await.unwrap();
        assert!(matches!(
            outcome,
            WebhookOutcome::Duplicate {
                status: EventStatus::Received,
                ..
            }
        ));
        assert!(h.backend.licenses.all().await.is_empty());

        h.backend
            .events
            .backdate("evt_stuck", Duration::from_secs(31 * 60))
            .await;

        let outcome = h.deliver(&created).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::Processed { .. }));
        assert_eq!(h.backend.licenses.all().await.len(), 1);
    }

    // =========================================================================
    // Operator replay from the stored snapshot
    // =========================================================================
    #[tokio::test]
    async fn test_replay_event_rules() {
        let h = harness();
        provision_acme(&h).await;

        let err = h.service.webhooks.replay_event("evt_created").await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)), "processed events are not replayed");

        let err = h.service.webhooks.replay_event("evt_missing").await.unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));

        h.deliver(&event(
            "evt_bad_price",
            "customer.subscription.updated",
            subscription("sub_acme", "cus_acme", "active", "price_unknown", json!({})),
        ))
        .await
        .unwrap();

        let outcome = h.service.webhooks.replay_event("evt_bad_price").await.unwrap();
        assert!(matches!(
            outcome,
            WebhookOutcome::Failed {
                kind: FailureKind::Configuration,
                ..
            }
        ));
        let record = h.service.webhooks.get_event("evt_bad_price").await.unwrap().unwrap();
        assert_eq!(record.attempts, 2);
    }

    // =========================================================================
    // Batch replay honours the attempt cap and skips configuration failures
    // =========================================================================
    #[tokio::test]
    async fn test_replay_pending_respects_attempt_cap() {
        let h = harness();
        h.deliver(&event(
            "evt_unhandled",
            "customer.subscription.created",
            subscription("sub_1", "cus_1", "exploded", "price_starter", new_customer_metadata()),
        ))
        .await
        .unwrap();
        h.deliver(&event(
            "evt_config",
            "customer.subscription.created",
            subscription("sub_2", "cus_2", "active", "price_unknown", new_customer_metadata()),
        ))
        .await
        .unwrap();

        let summary = h.service.webhooks.replay_pending(2, 50).await.unwrap();
        assert_eq!(summary.attempted, 1);
        assert_eq!(summary.failed, 1);

        // attempts is now 2, which reaches the cap
        let summary = h.service.webhooks.replay_pending(2, 50).await.unwrap();
        assert_eq!(summary.attempted, 0);

        let failed = h
            .service
            .webhooks
            .list_events(Some(EventStatus::Failed), 10, 0)
            .await
            .unwrap();
        assert_eq!(failed.len(), 2);
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use super::support::*;
    use crate::config::BillingConfig;
    use crate::email::templates;
    use crate::events::FailureKind;
    use crate::licenses::SubscriptionStatus;
    use crate::webhooks::WebhookOutcome;
    use serde_json::json;
    use std::sync::Arc;

    // =========================================================================
    // New customer: one organization, one license, one owner user
    // =========================================================================
    #[tokio::test]
    async fn test_new_customer_is_provisioned() {
        let h = harness();
        provision_acme(&h).await;

        let orgs = h.backend.organizations.organizations().await;
        assert_eq!(orgs.len(), 1);
        assert_eq!(orgs[0].name, "Acme Motors");
        assert_eq!(orgs[0].phone.as_deref(), Some("+1 555 0100"));

        let licenses = h.backend.licenses.all().await;
        assert_eq!(licenses.len(), 1);
        let license = &licenses[0];
        assert_eq!(license.org_id, orgs[0].id);
        assert_eq!(license.license_type, "starter");
        assert_eq!(license.car_limit, 25);
        assert!(license.is_active);
        assert_eq!(license.subscription_status, SubscriptionStatus::Active);
        assert_eq!(license.stripe_customer_id.as_deref(), Some("cus_acme"));
        assert!(license.current_period_end.is_some());

        let users = h.backend.organizations.users().await;
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].role, "owner");
        assert!(users[0].must_change_password);

        let welcome = h.backend.notifier.sent_with(templates::WELCOME_CREDENTIALS).await;
        assert_eq!(welcome.len(), 1);
        assert_eq!(welcome[0].recipient, "owner@acme.test");
        let password = welcome[0].variables.get("temporary_password").unwrap();
        assert_eq!(password.len(), 16);

        let hash = h.backend.organizations.password_hash("owner@acme.test").await.unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(!hash.contains(password.as_str()));

        let record = h.service.webhooks.get_event("evt_created").await.unwrap().unwrap();
        assert_eq!(record.org_id, Some(orgs[0].id));
        assert_eq!(record.license_id, Some(license.id));
    }

    // =========================================================================
    // Existing organization matched by email: license added, nothing duplicated
    // =========================================================================
    #[tokio::test]
    async fn test_existing_org_matched_by_email() {
        let h = harness();
        let org = h
            .backend
            .organizations
            .insert("Acme Motors LLC", "OWNER@acme.test")
            .await;

        provision_acme(&h).await;

        assert_eq!(h.backend.organizations.organizations().await.len(), 1);
        assert!(h.backend.organizations.users().await.is_empty());
        let license = h.service.licenses.get_for_org(org.id).await.unwrap().unwrap();
        assert_eq!(license.stripe_subscription_id.as_deref(), Some("sub_acme"));
        assert!(h.backend.notifier.sent_with(templates::WELCOME_CREDENTIALS).await.is_empty());

        // A second subscription for the same customer updates the same license.
        h.deliver(&event(
            "evt_created_2",
            "customer.subscription.created",
            subscription("sub_acme_2", "cus_acme", "active", "price_professional", json!({})),
        ))
        .await
        .unwrap();
        let licenses = h.backend.licenses.all().await;
        assert_eq!(licenses.len(), 1);
        assert_eq!(licenses[0].license_type, "professional");
        assert_eq!(licenses[0].car_limit, 100);
    }

    // =========================================================================
    // Name matching is a heuristic that can be switched off
    // =========================================================================
    #[tokio::test]
    async fn test_name_match_can_be_disabled() {
        let h = harness();
        let org = h.backend.organizations.insert("acme motors", "front-desk@acme.test").await;
        provision_acme(&h).await;
        assert_eq!(h.backend.organizations.organizations().await.len(), 1);
        assert!(h.service.licenses.get_for_org(org.id).await.unwrap().is_some());

        let mut config = BillingConfig::for_webhook_secret(SECRET);
        config.match_org_by_name = false;
        let h = harness_with(config);
        h.backend.organizations.insert("acme motors", "front-desk@acme.test").await;
        provision_acme(&h).await;
        assert_eq!(h.backend.organizations.organizations().await.len(), 2);
    }

    // =========================================================================
    // No linkage and no metadata: warning no-op
    // =========================================================================
    #[tokio::test]
    async fn test_subscription_without_linkage_is_skipped() {
        let h = harness();
        let outcome = h
            .deliver(&event(
                "evt_orphan",
                "customer.subscription.created",
                subscription("sub_x", "cus_x", "active", "price_starter", json!({})),
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Skipped { .. }));
        assert!(outcome.acknowledge());
        assert!(h.backend.licenses.all().await.is_empty());

        let outcome = h
            .deliver(&event(
                "evt_orphan_update",
                "customer.subscription.updated",
                subscription("sub_x", "cus_x", "past_due", "price_starter", json!({})),
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Skipped { .. }));
    }

    // =========================================================================
    // Concurrent created events for one customer: a single org/license pair
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_created_deliveries_provision_once() {
        let h = Arc::new(harness());
        let mut handles = Vec::new();
        for i in 0..6 {
            let h = h.clone();
            handles.push(tokio::spawn(async move {
                h.deliver(&event(
                    &format!("evt_created_{i}"),
                    "customer.subscription.created",
                    subscription(
                        "sub_acme",
                        "cus_acme",
                        "active",
                        "price_starter",
                        new_customer_metadata(),
                    ),
                ))
                .await
                .unwrap()
            }));
        }
        for handle in handles {
            let outcome = handle.await.unwrap();
            assert!(outcome.acknowledge(), "unexpected outcome {outcome:?}");
        }

        assert_eq!(h.backend.organizations.organizations().await.len(), 1);
        assert_eq!(h.backend.licenses.all().await.len(), 1);
        assert_eq!(h.backend.organizations.users().await.len(), 1);
        assert_eq!(
            h.backend.notifier.sent_with(templates::WELCOME_CREDENTIALS).await.len(),
            1
        );
    }

    // =========================================================================
    // License write fails during provisioning: nothing is left behind and
    // re-delivery provisions from scratch, welcome email included
    // =========================================================================
    #[tokio::test]
    async fn test_failed_provisioning_is_retried_cleanly() {
        let h = harness();
        let created = event(
            "evt_created",
            "customer.subscription.created",
            subscription("sub_acme", "cus_acme", "active", "price_starter", new_customer_metadata()),
        );

        h.backend.licenses.fail_next_write();
        let first = h.deliver(&created).await.unwrap();
        assert!(matches!(
            first,
            WebhookOutcome::Failed {
                kind: FailureKind::Unhandled,
                ..
            }
        ));
        assert!(!first.acknowledge());
        assert!(h.backend.organizations.organizations().await.is_empty());
        assert!(h.backend.organizations.users().await.is_empty());
        assert!(h.backend.licenses.all().await.is_empty());
        assert!(h.backend.notifier.sent_with(templates::WELCOME_CREDENTIALS).await.is_empty());

        let second = h.deliver(&created).await.unwrap();
        assert!(matches!(second, WebhookOutcome::Processed { .. }));

        let orgs = h.backend.organizations.organizations().await;
        assert_eq!(orgs.len(), 1);
        assert_eq!(h.backend.organizations.users().await.len(), 1);
        let licenses = h.backend.licenses.all().await;
        assert_eq!(licenses.len(), 1);
        assert_eq!(licenses[0].org_id, orgs[0].id);

        let welcome = h.backend.notifier.sent_with(templates::WELCOME_CREDENTIALS).await;
        assert_eq!(welcome.len(), 1);
        assert_eq!(welcome[0].recipient, "owner@acme.test");

        let record = h.service.webhooks.get_event("evt_created").await.unwrap().unwrap();
        assert_eq!(record.attempts, 2);
        assert_eq!(record.license_id, Some(licenses[0].id));
    }

    // =========================================================================
    // Deleted delivered before created: the subscription never activates
    // =========================================================================
    #[tokio::test]
    async fn test_deleted_before_created_stays_canceled() {
        let h = harness();

        let outcome = h
            .deliver(&event(
                "evt_deleted_early",
                "customer.subscription.deleted",
                json!({
                    "id": "sub_acme",
                    "customer": "cus_acme",
                    "status": "canceled",
                    "canceled_at": 1_701_000_000,
                    "items": { "data": [{ "price": { "id": "price_starter" } }] }
                }),
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Skipped { .. }));
        assert!(outcome.acknowledge());

        let outcome = h
            .deliver(&event(
                "evt_created_late",
                "customer.subscription.created",
                subscription(
                    "sub_acme",
                    "cus_acme",
                    "active",
                    "price_starter",
                    new_customer_metadata(),
                ),
            ))
            .await
            .unwrap();
        match &outcome {
            WebhookOutcome::Skipped { reason, .. } => {
                assert_eq!(reason, "subscription already canceled")
            }
            other => panic!("expected skip, got {other:?}"),
        }

        assert!(h.backend.licenses.all().await.is_empty());
        assert!(h.backend.organizations.organizations().await.is_empty());
        assert!(h.backend.notifier.sent_with(templates::WELCOME_CREDENTIALS).await.is_empty());

        // A different subscription for the same customer is unaffected.
        let outcome = h
            .deliver(&event(
                "evt_created_other",
                "customer.subscription.created",
                subscription(
                    "sub_acme_2",
                    "cus_acme",
                    "active",
                    "price_starter",
                    new_customer_metadata(),
                ),
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Processed { .. }));
        assert_eq!(h.backend.licenses.all().await.len(), 1);
    }

    // =========================================================================
    // Deleted is terminal against later updated events
    // =========================================================================
    #[tokio::test]
    async fn test_deleted_is_terminal() {
        let h = harness();
        provision_acme(&h).await;

        let outcome = h
            .deliver(&event(
                "evt_deleted",
                "customer.subscription.deleted",
                json!({
                    "id": "sub_acme",
                    "customer": "cus_acme",
                    "status": "canceled",
                    "canceled_at": 1_701_000_000,
                    "items": { "data": [{ "price": { "id": "price_starter" } }] }
                }),
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Processed { .. }));

        // Stale update that Stripe sent before the deletion arrives late.
        let outcome = h
            .deliver(&event_with_previous(
                "evt_late_update",
                "customer.subscription.updated",
                subscription("sub_acme", "cus_acme", "active", "price_starter", json!({})),
                json!({ "status": "past_due" }),
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Skipped { .. }));

        let outcome = h
            .deliver(&event("evt_late_invoice", "invoice.paid", invoice("in_1", "sub_acme")))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Skipped { .. }));

        let license = &h.backend.licenses.all().await[0];
        assert_eq!(license.subscription_status, SubscriptionStatus::Canceled);
        assert!(!license.is_active);
        assert_eq!(license.canceled_at.map(|t| t.unix_timestamp()), Some(1_701_000_000));

        assert_eq!(
            h.backend.notifier.sent_with(templates::SUBSCRIPTION_CANCELED).await.len(),
            1
        );
        assert!(h
            .backend
            .notifier
            .sent_with(templates::SUBSCRIPTION_STATUS_CHANGED)
            .await
            .is_empty());
    }

    // =========================================================================
    // Explicit reactivation brings a canceled license back
    // =========================================================================
    #[tokio::test]
    async fn test_reactivation_from_canceled() {
        let h = harness();
        provision_acme(&h).await;
        h.deliver(&event(
            "evt_deleted",
            "customer.subscription.deleted",
            subscription("sub_acme", "cus_acme", "canceled", "price_starter", json!({})),
        ))
        .await
        .unwrap();

        let outcome = h
            .deliver(&event_with_previous(
                "evt_reactivated",
                "customer.subscription.updated",
                subscription("sub_acme", "cus_acme", "active", "price_starter", json!({})),
                json!({ "status": "canceled" }),
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Processed { .. }));

        let license = &h.backend.licenses.all().await[0];
        assert!(license.is_active);
        assert_eq!(license.subscription_status, SubscriptionStatus::Active);
        assert!(license.canceled_at.is_none());
    }

    // =========================================================================
    // Failed then succeeded invoice restores active
    // =========================================================================
    #[tokio::test]
    async fn test_payment_failure_then_recovery() {
        let h = harness();
        provision_acme(&h).await;

        h.deliver(&event("evt_fail", "invoice.payment_failed", invoice("in_1", "sub_acme")))
            .await
            .unwrap();
        let license = &h.backend.licenses.all().await[0];
        assert_eq!(license.subscription_status, SubscriptionStatus::PastDue);
        assert!(license.is_active, "past due keeps the license active");

        let failed = h.backend.notifier.sent_with(templates::PAYMENT_FAILED).await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].recipient, "owner@acme.test");
        assert_eq!(failed[0].variables.get("amount_due").map(String::as_str), Some("$49.00"));
        assert_eq!(
            failed[0].variables.get("hosted_invoice_url").map(String::as_str),
            Some("https://invoice.stripe.test/in_1")
        );

        // Newer API versions link the subscription under `parent`.
        let outcome = h
            .deliver(&event(
                "evt_paid",
                "invoice.payment_succeeded",
                json!({
                    "id": "in_2",
                    "parent": { "subscription_details": { "subscription": "sub_acme" } }
                }),
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Processed { .. }));
        let license = &h.backend.licenses.all().await[0];
        assert_eq!(license.subscription_status, SubscriptionStatus::Active);
        assert!(license.is_active);
    }

    // =========================================================================
    // Updates: tier change, notifications, unknown price
    // =========================================================================
    #[tokio::test]
    async fn test_update_changes_tier_and_notifies() {
        let h = harness();
        provision_acme(&h).await;

        let mut upgraded =
            subscription("sub_acme", "cus_acme", "active", "price_professional", json!({}));
        upgraded["cancel_at_period_end"] = json!(true);
        h.deliver(&event_with_previous(
            "evt_upgrade",
            "customer.subscription.updated",
            upgraded,
            json!({ "cancel_at_period_end": false, "items": {} }),
        ))
        .await
        .unwrap();

        let license = &h.backend.licenses.all().await[0];
        assert_eq!(license.license_type, "professional");
        assert_eq!(license.car_limit, 100);
        assert_eq!(license.stripe_price_id.as_deref(), Some("price_professional"));
        assert!(license.cancel_at_period_end);

        assert!(h
            .backend
            .notifier
            .sent_with(templates::SUBSCRIPTION_STATUS_CHANGED)
            .await
            .is_empty());
        let scheduled = h
            .backend
            .notifier
            .sent_with(templates::SUBSCRIPTION_CANCELLATION_SCHEDULED)
            .await;
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].variables.get("period_end").map(String::as_str), Some("2023-12-14"));

        h.deliver(&event_with_previous(
            "evt_past_due",
            "customer.subscription.updated",
            subscription("sub_acme", "cus_acme", "past_due", "price_professional", json!({})),
            json!({ "status": "active" }),
        ))
        .await
        .unwrap();
        let changed = h
            .backend
            .notifier
            .sent_with(templates::SUBSCRIPTION_STATUS_CHANGED)
            .await;
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].variables.get("old_status").map(String::as_str), Some("active"));
        assert_eq!(changed[0].variables.get("new_status").map(String::as_str), Some("past_due"));
        assert_eq!(
            changed[0].variables.get("organization_name").map(String::as_str),
            Some("Acme Motors")
        );
    }

    #[tokio::test]
    async fn test_update_with_unknown_price_leaves_license_untouched() {
        let h = harness();
        provision_acme(&h).await;

        let outcome = h
            .deliver(&event(
                "evt_bad_upgrade",
                "customer.subscription.updated",
                subscription("sub_acme", "cus_acme", "past_due", "price_mystery", json!({})),
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Failed { .. }));
        assert!(outcome.acknowledge());

        let license = &h.backend.licenses.all().await[0];
        assert_eq!(license.license_type, "starter");
        assert_eq!(license.subscription_status, SubscriptionStatus::Active);
    }

    // =========================================================================
    // Notification failures never fail the event
    // =========================================================================
    #[tokio::test]
    async fn test_notification_failure_does_not_fail_event() {
        let h = harness();
        h.backend.notifier.set_failing(true);
        provision_acme(&h).await;

        let outcome = h
            .deliver(&event("evt_fail", "invoice.payment_failed", invoice("in_1", "sub_acme")))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Processed { .. }));
        assert!(h.backend.notifier.sent().await.is_empty());
    }
}

#[cfg(test)]
mod guard_tests {
    use super::support::*;
    use crate::entitlement::CapacityError;
    use crate::error::BillingError;
    use crate::licenses::FreeGrant;
    use serde_json::json;
    use uuid::Uuid;

    fn capacity(err: BillingError) -> CapacityError {
        match err {
            BillingError::Capacity(e) => e,
            other => panic!("expected capacity error, got {other:?}"),
        }
    }

    // =========================================================================
    // Car-limit boundary, and a sale frees a slot
    // =========================================================================
    #[tokio::test]
    async fn test_limit_boundary_with_sale() {
        let h = harness();
        provision_acme(&h).await;
        let org_id = h.backend.organizations.organizations().await[0].id;

        let mut cars = Vec::new();
        for _ in 0..24 {
            cars.push(h.backend.inventory.add_car(org_id).await);
        }
        h.service.guard.ensure_can_add_car(org_id).await.unwrap();
        cars.push(h.backend.inventory.add_car(org_id).await);

        let err = h.service.guard.ensure_can_add_car(org_id).await.unwrap_err();
        assert_eq!(
            capacity(err),
            CapacityError::LimitReached {
                current: 25,
                limit: 25
            }
        );

        let report = h.service.guard.capacity(org_id).await.unwrap();
        assert!(!report.can_add);
        assert_eq!(report.remaining, 0);
        assert_eq!(report.reason.as_deref(), Some("Car limit reached (25/25)"));

        h.backend.inventory.set_status(cars[0], "sold").await;
        h.service.guard.ensure_can_add_car(org_id).await.unwrap();
        let report = h.service.guard.capacity(org_id).await.unwrap();
        assert!(report.can_add);
        assert_eq!(report.current, 24);
    }

    // =========================================================================
    // Rejection reasons follow license state
    // =========================================================================
    #[tokio::test]
    async fn test_rejection_reasons() {
        let h = harness();
        let stranger = Uuid::new_v4();
        let err = h.service.guard.ensure_can_add_car(stranger).await.unwrap_err();
        assert_eq!(capacity(err), CapacityError::NoLicense);

        provision_acme(&h).await;
        let org_id = h.backend.organizations.organizations().await[0].id;

        h.deliver(&event("evt_fail", "invoice.payment_failed", invoice("in_1", "sub_acme")))
            .await
            .unwrap();
        let err = h.service.guard.ensure_can_add_car(org_id).await.unwrap_err();
        assert_eq!(capacity(err), CapacityError::PastDue);
        h.service.guard.ensure_can_read(org_id).await.unwrap();

        h.deliver(&event(
            "evt_unpaid",
            "customer.subscription.updated",
            subscription("sub_acme", "cus_acme", "unpaid", "price_starter", json!({})),
        ))
        .await
        .unwrap();
        let err = h.service.guard.ensure_can_add_car(org_id).await.unwrap_err();
        assert!(matches!(
            capacity(err),
            CapacityError::SubscriptionNotActive { .. }
        ));

        h.deliver(&event(
            "evt_deleted",
            "customer.subscription.deleted",
            subscription("sub_acme", "cus_acme", "canceled", "price_starter", json!({})),
        ))
        .await
        .unwrap();
        let err = h.service.guard.ensure_can_add_car(org_id).await.unwrap_err();
        assert_eq!(capacity(err), CapacityError::Inactive);
        assert!(h.service.guard.ensure_can_read(org_id).await.is_err());
    }

    // =========================================================================
    // Free accounts skip the subscription status check
    // =========================================================================
    #[tokio::test]
    async fn test_free_account_ignores_subscription_status() {
        let h = harness();
        let org = h.backend.organizations.insert("Friends Auto", "hi@friends.test").await;
        h.service
            .licenses
            .grant_free(
                org.id,
                FreeGrant {
                    license_type: "partner".to_string(),
                    car_limit: 2,
                    reason: "launch partner".to_string(),
                },
            )
            .await
            .unwrap();

        h.service.guard.ensure_can_add_car(org.id).await.unwrap();
        h.backend.inventory.add_car(org.id).await;
        h.backend.inventory.add_car(org.id).await;
        let err = h.service.guard.ensure_can_add_car(org.id).await.unwrap_err();
        assert_eq!(
            capacity(err),
            CapacityError::LimitReached {
                current: 2,
                limit: 2
            }
        );
    }
}

#[cfg(test)]
mod license_admin_tests {
    use super::support::*;
    use crate::error::BillingError;
    use crate::licenses::{AdminLicenseUpdate, FreeGrant};
    use uuid::Uuid;

    // =========================================================================
    // Custom limits on paid licenses need an override reason
    // =========================================================================
    #[tokio::test]
    async fn test_custom_limit_requires_reason() {
        let h = harness();
        provision_acme(&h).await;
        let org_id = h.backend.organizations.organizations().await[0].id;

        let err = h
            .service
            .licenses
            .admin_update(
                org_id,
                AdminLicenseUpdate {
                    car_limit: Some(40),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));

        let license = h
            .service
            .licenses
            .admin_update(
                org_id,
                AdminLicenseUpdate {
                    car_limit: Some(40),
                    override_reason: Some("seasonal overflow lot".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(license.car_limit, 40);
        assert_eq!(license.limit_override_reason.as_deref(), Some("seasonal overflow lot"));

        // Deactivating keeps the existing override.
        let license = h
            .service
            .licenses
            .admin_update(
                org_id,
                AdminLicenseUpdate {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!license.is_active);
        assert_eq!(license.car_limit, 40);

        // Switching tiers without a limit adopts the tier limit and clears the reason.
        let license = h
            .service
            .licenses
            .admin_update(
                org_id,
                AdminLicenseUpdate {
                    license_type: Some("enterprise".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(license.car_limit, 500);
        assert!(license.limit_override_reason.is_none());
    }

    #[tokio::test]
    async fn test_admin_update_unknown_org() {
        let h = harness();
        let err = h
            .service
            .licenses
            .admin_update(Uuid::new_v4(), AdminLicenseUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_free_grant_requires_reason() {
        let h = harness();
        let org = h.backend.organizations.insert("Friends Auto", "hi@friends.test").await;
        let err = h
            .service
            .licenses
            .grant_free(
                org.id,
                FreeGrant {
                    license_type: "starter".to_string(),
                    car_limit: 10,
                    reason: "  ".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));

        // Free accounts may carry any limit without an override reason.
        h.service
            .licenses
            .grant_free(
                org.id,
                FreeGrant {
                    license_type: "starter".to_string(),
                    car_limit: 10,
                    reason: "nonprofit".to_string(),
                },
            )
            .await
            .unwrap();
        let license = h
            .service
            .licenses
            .admin_update(
                org.id,
                AdminLicenseUpdate {
                    car_limit: Some(12),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(license.car_limit, 12);
        assert!(license.is_free_account);
    }
}
