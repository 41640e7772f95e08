//! In-memory stores for tests
//!
//! Each store mirrors the uniqueness rules and `WHERE` guards of its
//! PostgreSQL counterpart, so scenarios behave the same against either.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::email::Notifier;
use crate::entitlement::CarInventory;
use crate::error::{BillingError, BillingResult};
use crate::events::{
    BillingEventRecord, ClaimOutcome, EventStatus, EventStore, FailureKind, NewBillingEvent,
    DEFAULT_STALE_AFTER,
};
use crate::licenses::{
    FreeGrant, License, LicenseRepository, PaymentState, ResolvedLicenseUpdate,
    SubscriptionChange, SubscriptionLink, SubscriptionStatus,
};
use crate::organizations::{
    CreateOrganizationOutcome, NewOrganization, NewOwner, Organization, OrganizationRepository,
    User,
};
use crate::tiers::{LicenseTier, TierCatalog};
use crate::BillingStores;

// ============================================================================
// Events
// ============================================================================

pub struct MemoryEventStore {
    events: Mutex<HashMap<String, BillingEventRecord>>,
    stale_after: Duration,
    unavailable: AtomicBool,
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self {
            events: Mutex::new(HashMap::new()),
            stale_after: DEFAULT_STALE_AFTER,
            unavailable: AtomicBool::new(false),
        }
    }
}

impl MemoryEventStore {
    /// Make every write fail the way a dropped database connection does.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> BillingResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BillingError::Database("pool timed out".to_string()));
        }
        Ok(())
    }

    fn is_reclaimable(&self, record: &BillingEventRecord, now: OffsetDateTime) -> bool {
        match record.status {
            EventStatus::Failed => true,
            EventStatus::Received => record.updated_at < now - self.stale_after,
            EventStatus::Processed => false,
        }
    }

    fn reset_for_claim(record: &mut BillingEventRecord, now: OffsetDateTime) {
        record.status = EventStatus::Received;
        record.attempts += 1;
        record.failure_reason = None;
        record.failure_kind = None;
        record.updated_at = now;
    }

    /// Backdate an event's last update, simulating a crashed delivery.
    pub async fn backdate(&self, external_event_id: &str, by: Duration) {
        if let Some(record) = self.events.lock().await.get_mut(external_event_id) {
            record.updated_at -= by;
        }
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.lock().await.is_empty()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn claim(&self, event: &NewBillingEvent) -> BillingResult<ClaimOutcome> {
        self.check_available()?;
        let now = OffsetDateTime::now_utc();
        let mut events = self.events.lock().await;

        if let Some(record) = events.get_mut(&event.external_event_id) {
            if self.is_reclaimable(record, now) {
                Self::reset_for_claim(record, now);
                record.payload = event.payload.clone();
                return Ok(ClaimOutcome::Claimed {
                    attempt: record.attempts,
                });
            }
            return Ok(ClaimOutcome::AlreadyRecorded {
                status: record.status,
            });
        }

        events.insert(
            event.external_event_id.clone(),
            BillingEventRecord {
                id: Uuid::new_v4(),
                external_event_id: event.external_event_id.clone(),
                event_type: event.event_type.clone(),
                status: EventStatus::Received,
                org_id: None,
                license_id: None,
                payload: event.payload.clone(),
                failure_reason: None,
                failure_kind: None,
                attempts: 1,
                received_at: now,
                processed_at: None,
                updated_at: now,
            },
        );
        Ok(ClaimOutcome::Claimed { attempt: 1 })
    }

    async fn reclaim_for_replay(
        &self,
        external_event_id: &str,
    ) -> BillingResult<Option<BillingEventRecord>> {
        self.check_available()?;
        let now = OffsetDateTime::now_utc();
        let mut events = self.events.lock().await;
        match events.get_mut(external_event_id) {
            Some(record) if self.is_reclaimable(record, now) => {
                Self::reset_for_claim(record, now);
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_processed(
        &self,
        external_event_id: &str,
        org_id: Option<Uuid>,
        license_id: Option<Uuid>,
    ) -> BillingResult<()> {
        self.check_available()?;
        let now = OffsetDateTime::now_utc();
        if let Some(record) = self.events.lock().await.get_mut(external_event_id) {
            record.status = EventStatus::Processed;
            record.org_id = org_id.or(record.org_id);
            record.license_id = license_id.or(record.license_id);
            record.processed_at = Some(now);
            record.updated_at = now;
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        external_event_id: &str,
        reason: &str,
        kind: FailureKind,
    ) -> BillingResult<()> {
        self.check_available()?;
        if let Some(record) = self.events.lock().await.get_mut(external_event_id) {
            record.status = EventStatus::Failed;
            record.failure_reason = Some(reason.to_string());
            record.failure_kind = Some(kind);
            record.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn find(&self, external_event_id: &str) -> BillingResult<Option<BillingEventRecord>> {
        Ok(self.events.lock().await.get(external_event_id).cloned())
    }

    async fn list(
        &self,
        status: Option<EventStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<BillingEventRecord>> {
        let events = self.events.lock().await;
        let mut records: Vec<_> = events
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        Ok(records
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn list_replayable(&self, max_attempts: i32, limit: i64) -> BillingResult<Vec<String>> {
        let now = OffsetDateTime::now_utc();
        let events = self.events.lock().await;
        let mut records: Vec<_> = events
            .values()
            .filter(|r| match r.status {
                EventStatus::Failed => {
                    r.failure_kind == Some(FailureKind::Unhandled) && r.attempts < max_attempts
                }
                EventStatus::Received => r.updated_at < now - self.stale_after,
                EventStatus::Processed => false,
            })
            .collect();
        records.sort_by(|a, b| a.received_at.cmp(&b.received_at));
        Ok(records
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|r| r.external_event_id.clone())
            .collect())
    }
}

// ============================================================================
// Tiers
// ============================================================================

pub struct MemoryTierCatalog {
    tiers: Vec<LicenseTier>,
}

impl MemoryTierCatalog {
    pub fn new(tiers: Vec<LicenseTier>) -> Self {
        Self { tiers }
    }

    /// `starter` (25 cars, `price_starter`), `professional` (100,
    /// `price_professional`) and `enterprise` (500, `price_enterprise`).
    pub fn with_default_tiers() -> Self {
        let tier = |name: &str, display: &str, cents: i32, limit: i32| LicenseTier {
            name: name.to_string(),
            display_name: display.to_string(),
            monthly_price_cents: cents,
            car_limit: limit,
            stripe_price_id: format!("price_{name}"),
        };
        Self::new(vec![
            tier("starter", "Starter", 4900, 25),
            tier("professional", "Professional", 9900, 100),
            tier("enterprise", "Enterprise", 24900, 500),
        ])
    }
}

#[async_trait]
impl TierCatalog for MemoryTierCatalog {
    async fn find_by_price_id(&self, price_id: &str) -> BillingResult<Option<LicenseTier>> {
        Ok(self
            .tiers
            .iter()
            .find(|t| t.stripe_price_id == price_id)
            .cloned())
    }

    async fn find_by_name(&self, name: &str) -> BillingResult<Option<LicenseTier>> {
        Ok(self.tiers.iter().find(|t| t.name == name).cloned())
    }

    async fn list(&self) -> BillingResult<Vec<LicenseTier>> {
        let mut tiers = self.tiers.clone();
        tiers.sort_by_key(|t| t.monthly_price_cents);
        Ok(tiers)
    }
}

// ============================================================================
// Licenses
// ============================================================================

#[derive(Default)]
pub struct MemoryLicenseRepository {
    licenses: Mutex<HashMap<Uuid, License>>,
    canceled_subscriptions: Mutex<HashMap<String, Option<OffsetDateTime>>>,
    fail_next_write: AtomicBool,
}

impl MemoryLicenseRepository {
    /// Fail the next subscription write, including the license written
    /// while provisioning an organization.
    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    fn take_write_failure(&self) -> BillingResult<()> {
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(BillingError::Database("connection reset".to_string()));
        }
        Ok(())
    }

    /// Counterpart of the license insert inside the provisioning transaction.
    async fn insert_linked(&self, link: &SubscriptionLink) -> BillingResult<License> {
        self.take_write_failure()?;
        let now = OffsetDateTime::now_utc();
        let mut licenses = self.licenses.lock().await;
        let conflict = licenses.contains_key(&link.org_id)
            || licenses.values().any(|l| {
                l.stripe_subscription_id.as_deref() == Some(link.stripe_subscription_id.as_str())
            });
        if conflict {
            return Err(BillingError::Database(
                "duplicate key value violates unique constraint on licenses".to_string(),
            ));
        }
        let license = linked_license(link, Uuid::new_v4(), now);
        licenses.insert(link.org_id, license.clone());
        Ok(license)
    }

    pub async fn all(&self) -> Vec<License> {
        self.licenses.lock().await.values().cloned().collect()
    }

    /// Insert a license directly, bypassing the webhook path.
    pub async fn insert(&self, license: License) {
        self.licenses.lock().await.insert(license.org_id, license);
    }
}

fn linked_license(link: &SubscriptionLink, id: Uuid, created_at: OffsetDateTime) -> License {
    License {
        id,
        org_id: link.org_id,
        license_type: link.license_type.clone(),
        car_limit: link.car_limit,
        is_active: link.status.grants_access(),
        is_free_account: false,
        free_reason: None,
        limit_override_reason: None,
        stripe_customer_id: Some(link.stripe_customer_id.clone()),
        stripe_subscription_id: Some(link.stripe_subscription_id.clone()),
        stripe_price_id: Some(link.stripe_price_id.clone()),
        subscription_status: link.status,
        cancel_at_period_end: link.cancel_at_period_end,
        current_period_start: link.current_period_start,
        current_period_end: link.current_period_end,
        canceled_at: None,
        created_at,
        updated_at: OffsetDateTime::now_utc(),
    }
}

fn by_subscription<'a>(
    licenses: &'a mut HashMap<Uuid, License>,
    subscription_id: &str,
) -> Option<&'a mut License> {
    licenses
        .values_mut()
        .find(|l| l.stripe_subscription_id.as_deref() == Some(subscription_id))
}

#[async_trait]
impl LicenseRepository for MemoryLicenseRepository {
    async fn find_by_org(&self, org_id: Uuid) -> BillingResult<Option<License>> {
        Ok(self.licenses.lock().await.get(&org_id).cloned())
    }

    async fn find_by_subscription(&self, subscription_id: &str) -> BillingResult<Option<License>> {
        Ok(self
            .licenses
            .lock()
            .await
            .values()
            .find(|l| l.stripe_subscription_id.as_deref() == Some(subscription_id))
            .cloned())
    }

    async fn find_by_customer(&self, customer_id: &str) -> BillingResult<Option<License>> {
        Ok(self
            .licenses
            .lock()
            .await
            .values()
            .filter(|l| l.stripe_customer_id.as_deref() == Some(customer_id))
            .max_by_key(|l| l.updated_at)
            .cloned())
    }

    async fn upsert_subscription(&self, link: &SubscriptionLink) -> BillingResult<Option<License>> {
        self.take_write_failure()?;
        let now = OffsetDateTime::now_utc();
        let mut licenses = self.licenses.lock().await;

        let held_elsewhere = licenses.values().any(|l| {
            l.org_id != link.org_id
                && l.stripe_subscription_id.as_deref() == Some(link.stripe_subscription_id.as_str())
        });
        if held_elsewhere {
            return Err(BillingError::Database(
                "duplicate key value violates unique constraint \"licenses_stripe_subscription_id_key\""
                    .to_string(),
            ));
        }

        if let Some(existing) = licenses.get(&link.org_id) {
            if existing.subscription_status == SubscriptionStatus::Canceled
                && existing.stripe_subscription_id.as_deref()
                    == Some(link.stripe_subscription_id.as_str())
            {
                return Ok(None);
            }
        }

        let (id, created_at) = licenses
            .get(&link.org_id)
            .map(|l| (l.id, l.created_at))
            .unwrap_or_else(|| (Uuid::new_v4(), now));

        let license = linked_license(link, id, created_at);
        licenses.insert(link.org_id, license.clone());
        Ok(Some(license))
    }

    async fn apply_subscription_update(
        &self,
        subscription_id: &str,
        change: &SubscriptionChange,
        allow_reactivation: bool,
    ) -> BillingResult<Option<License>> {
        let mut licenses = self.licenses.lock().await;
        let Some(license) = by_subscription(&mut licenses, subscription_id) else {
            return Ok(None);
        };
        if license.subscription_status == SubscriptionStatus::Canceled && !allow_reactivation {
            return Ok(None);
        }

        if license.subscription_status == SubscriptionStatus::Canceled {
            license.canceled_at = None;
        }
        license.subscription_status = change.status;
        license.cancel_at_period_end = change.cancel_at_period_end;
        license.current_period_start = change.current_period_start.or(license.current_period_start);
        license.current_period_end = change.current_period_end.or(license.current_period_end);
        license.is_active = license.is_active || change.status.grants_access();
        if let Some(tier) = &change.tier {
            license.license_type = tier.license_type.clone();
            if !license.is_free_account {
                license.car_limit = tier.car_limit;
                license.limit_override_reason = None;
            }
            license.stripe_price_id = Some(tier.stripe_price_id.clone());
        }
        license.updated_at = OffsetDateTime::now_utc();
        Ok(Some(license.clone()))
    }

    async fn record_canceled_subscription(
        &self,
        subscription_id: &str,
        canceled_at: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        self.canceled_subscriptions
            .lock()
            .await
            .entry(subscription_id.to_string())
            .or_insert(canceled_at);
        Ok(())
    }

    async fn is_canceled_subscription(&self, subscription_id: &str) -> BillingResult<bool> {
        Ok(self
            .canceled_subscriptions
            .lock()
            .await
            .contains_key(subscription_id))
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        canceled_at: Option<OffsetDateTime>,
    ) -> BillingResult<Option<License>> {
        let now = OffsetDateTime::now_utc();
        let mut licenses = self.licenses.lock().await;
        let Some(license) = by_subscription(&mut licenses, subscription_id) else {
            return Ok(None);
        };
        license.subscription_status = SubscriptionStatus::Canceled;
        license.is_active = false;
        license.cancel_at_period_end = false;
        license.canceled_at = canceled_at.or(license.canceled_at).or(Some(now));
        license.updated_at = now;
        Ok(Some(license.clone()))
    }

    async fn set_payment_state(
        &self,
        subscription_id: &str,
        state: PaymentState,
    ) -> BillingResult<Option<License>> {
        let mut licenses = self.licenses.lock().await;
        let Some(license) = by_subscription(&mut licenses, subscription_id) else {
            return Ok(None);
        };
        if license.subscription_status == SubscriptionStatus::Canceled {
            return Ok(None);
        }
        license.subscription_status = state.status();
        license.is_active = license.is_active || state == PaymentState::Paid;
        license.updated_at = OffsetDateTime::now_utc();
        Ok(Some(license.clone()))
    }

    async fn grant_free(&self, org_id: Uuid, grant: &FreeGrant) -> BillingResult<License> {
        let now = OffsetDateTime::now_utc();
        let mut licenses = self.licenses.lock().await;
        let license = licenses.entry(org_id).or_insert_with(|| License {
            id: Uuid::new_v4(),
            org_id,
            license_type: grant.license_type.clone(),
            car_limit: grant.car_limit,
            is_active: true,
            is_free_account: true,
            free_reason: None,
            limit_override_reason: None,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            stripe_price_id: None,
            subscription_status: SubscriptionStatus::None,
            cancel_at_period_end: false,
            current_period_start: None,
            current_period_end: None,
            canceled_at: None,
            created_at: now,
            updated_at: now,
        });
        license.license_type = grant.license_type.clone();
        license.car_limit = grant.car_limit;
        license.is_active = true;
        license.is_free_account = true;
        license.free_reason = Some(grant.reason.clone());
        license.limit_override_reason = None;
        license.updated_at = now;
        Ok(license.clone())
    }

    async fn admin_update(
        &self,
        org_id: Uuid,
        update: &ResolvedLicenseUpdate,
    ) -> BillingResult<Option<License>> {
        let mut licenses = self.licenses.lock().await;
        let Some(license) = licenses.get_mut(&org_id) else {
            return Ok(None);
        };
        license.license_type = update.license_type.clone();
        license.car_limit = update.car_limit;
        license.is_active = update.is_active;
        license.limit_override_reason = update.limit_override_reason.clone();
        license.updated_at = OffsetDateTime::now_utc();
        Ok(Some(license.clone()))
    }
}

// ============================================================================
// Organizations
// ============================================================================

#[derive(Default)]
struct OrgState {
    organizations: Vec<Organization>,
    users: Vec<(User, String)>,
}

pub struct MemoryOrganizationRepository {
    state: Mutex<OrgState>,
    licenses: Arc<MemoryLicenseRepository>,
}

impl MemoryOrganizationRepository {
    /// Provisioning writes the first license into `licenses`.
    pub fn new(licenses: Arc<MemoryLicenseRepository>) -> Self {
        Self {
            state: Mutex::new(OrgState::default()),
            licenses,
        }
    }

    pub async fn insert(&self, name: &str, contact_email: &str) -> Organization {
        let org = Organization {
            id: Uuid::new_v4(),
            name: name.to_string(),
            contact_email: contact_email.to_string(),
            phone: None,
            address: None,
            created_at: OffsetDateTime::now_utc(),
        };
        self.state.lock().await.organizations.push(org.clone());
        org
    }

    pub async fn organizations(&self) -> Vec<Organization> {
        self.state.lock().await.organizations.clone()
    }

    pub async fn users(&self) -> Vec<User> {
        self.state
            .lock()
            .await
            .users
            .iter()
            .map(|(user, _)| user.clone())
            .collect()
    }

    pub async fn password_hash(&self, email: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .users
            .iter()
            .find(|(user, _)| user.email.eq_ignore_ascii_case(email))
            .map(|(_, hash)| hash.clone())
    }
}

#[async_trait]
impl OrganizationRepository for MemoryOrganizationRepository {
    async fn find_by_id(&self, id: Uuid) -> BillingResult<Option<Organization>> {
        Ok(self
            .state
            .lock()
            .await
            .organizations
            .iter()
            .find(|o| o.id == id)
            .cloned())
    }

    async fn find_by_email(&self, email: &str) -> BillingResult<Option<Organization>> {
        let email = email.trim();
        Ok(self
            .state
            .lock()
            .await
            .organizations
            .iter()
            .find(|o| o.contact_email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn find_by_name(&self, name: &str) -> BillingResult<Vec<Organization>> {
        let name = name.trim();
        Ok(self
            .state
            .lock()
            .await
            .organizations
            .iter()
            .filter(|o| o.name.eq_ignore_ascii_case(name))
            .take(2)
            .cloned()
            .collect())
    }

    async fn create_with_owner(
        &self,
        organization: &NewOrganization,
        owner: &NewOwner,
        license: &SubscriptionLink,
    ) -> BillingResult<CreateOrganizationOutcome> {
        let mut state = self.state.lock().await;
        let contact_email = organization.contact_email.trim();

        if let Some(existing) = state
            .organizations
            .iter()
            .find(|o| o.contact_email.eq_ignore_ascii_case(contact_email))
        {
            return Ok(CreateOrganizationOutcome::Exists(existing.clone()));
        }

        // Nothing is kept unless the license insert succeeds.
        let license = self.licenses.insert_linked(license).await?;

        let now = OffsetDateTime::now_utc();
        let org = Organization {
            id: organization.id,
            name: organization.name.trim().to_string(),
            contact_email: contact_email.to_string(),
            phone: organization.phone.clone(),
            address: organization.address.clone(),
            created_at: now,
        };
        state.organizations.push(org.clone());

        let owner_email = owner.email.trim();
        let user_taken = state
            .users
            .iter()
            .any(|(u, _)| u.email.eq_ignore_ascii_case(owner_email));
        let user = (!user_taken).then(|| User {
            id: Uuid::new_v4(),
            org_id: org.id,
            email: owner_email.to_string(),
            name: owner.name.clone(),
            role: "owner".to_string(),
            must_change_password: true,
            created_at: now,
        });
        if let Some(user) = &user {
            state.users.push((user.clone(), owner.password_hash.clone()));
        }

        Ok(CreateOrganizationOutcome::Created {
            organization: org,
            owner: user,
            license,
        })
    }
}

// ============================================================================
// Inventory
// ============================================================================

#[derive(Default)]
pub struct MemoryCarInventory {
    cars: Mutex<HashMap<Uuid, (Uuid, String)>>,
}

impl MemoryCarInventory {
    pub async fn add_car(&self, org_id: Uuid) -> Uuid {
        let id = Uuid::new_v4();
        self.cars
            .lock()
            .await
            .insert(id, (org_id, "available".to_string()));
        id
    }

    pub async fn set_status(&self, car_id: Uuid, status: &str) {
        if let Some(car) = self.cars.lock().await.get_mut(&car_id) {
            car.1 = status.to_string();
        }
    }
}

#[async_trait]
impl CarInventory for MemoryCarInventory {
    async fn count_active_cars(&self, org_id: Uuid) -> BillingResult<i64> {
        Ok(self
            .cars
            .lock()
            .await
            .values()
            .filter(|(org, status)| *org == org_id && status != "sold")
            .count() as i64)
    }
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub template: String,
    pub recipient: String,
    pub variables: HashMap<String, String>,
}

/// Records every notification; can be switched to fail.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_with(&self, template: &str) -> Vec<SentNotification> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|n| n.template == template)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(
        &self,
        template: &str,
        recipient: &str,
        variables: &HashMap<String, String>,
    ) -> BillingResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BillingError::Notification("mail server unavailable".to_string()));
        }
        self.sent.lock().await.push(SentNotification {
            template: template.to_string(),
            recipient: recipient.to_string(),
            variables: variables.clone(),
        });
        Ok(())
    }
}

// ============================================================================
// Bundle
// ============================================================================

/// Every in-memory store, kept concrete so tests can inspect them.
#[derive(Clone)]
pub struct MemoryBackend {
    pub events: Arc<MemoryEventStore>,
    pub tiers: Arc<MemoryTierCatalog>,
    pub licenses: Arc<MemoryLicenseRepository>,
    pub organizations: Arc<MemoryOrganizationRepository>,
    pub inventory: Arc<MemoryCarInventory>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        let licenses = Arc::new(MemoryLicenseRepository::default());
        Self {
            events: Arc::new(MemoryEventStore::default()),
            tiers: Arc::new(MemoryTierCatalog::with_default_tiers()),
            organizations: Arc::new(MemoryOrganizationRepository::new(licenses.clone())),
            licenses,
            inventory: Arc::new(MemoryCarInventory::default()),
            notifier: Arc::new(RecordingNotifier::default()),
        }
    }
}

impl MemoryBackend {
    pub fn stores(&self) -> BillingStores {
        BillingStores {
            events: self.events.clone(),
            tiers: self.tiers.clone(),
            licenses: self.licenses.clone(),
            organizations: self.organizations.clone(),
            inventory: self.inventory.clone(),
        }
    }

    pub fn notifier(&self) -> Arc<dyn Notifier> {
        self.notifier.clone()
    }
}
