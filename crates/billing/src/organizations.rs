//! Organizations and their owner users

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::licenses::{insert_linked_license, License, SubscriptionLink};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub contact_email: String,
    pub phone: Option<String>,
    pub address: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A user row without its password hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub org_id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub role: String,
    pub must_change_password: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewOrganization {
    pub id: Uuid,
    pub name: String,
    pub contact_email: String,
    pub phone: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewOwner {
    pub email: String,
    pub name: Option<String>,
    pub password_hash: String,
}

/// Result of [`OrganizationRepository::create_with_owner`]
#[derive(Debug, Clone)]
pub enum CreateOrganizationOutcome {
    /// This call inserted the organization and its license. `owner` is
    /// `None` when the email already belongs to a user elsewhere.
    Created {
        organization: Organization,
        owner: Option<User>,
        license: License,
    },
    /// Another writer holds the contact email; nothing was inserted.
    Exists(Organization),
}

#[async_trait]
pub trait OrganizationRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> BillingResult<Option<Organization>>;

    /// Case-insensitive contact email lookup
    async fn find_by_email(&self, email: &str) -> BillingResult<Option<Organization>>;

    /// Case-insensitive name lookup. Returns every match so callers can
    /// refuse ambiguous names.
    async fn find_by_name(&self, name: &str) -> BillingResult<Vec<Organization>>;

    /// Insert the organization, its owner and its first license in one
    /// transaction, arbitrated by the unique contact email. `license.org_id`
    /// must equal `organization.id`.
    async fn create_with_owner(
        &self,
        organization: &NewOrganization,
        owner: &NewOwner,
        license: &SubscriptionLink,
    ) -> BillingResult<CreateOrganizationOutcome>;
}

const ORG_COLUMNS: &str = "id, name, contact_email, phone, address, created_at";

#[derive(Clone)]
pub struct PgOrganizationRepository {
    pool: PgPool,
}

impl PgOrganizationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrganizationRepository for PgOrganizationRepository {
    async fn find_by_id(&self, id: Uuid) -> BillingResult<Option<Organization>> {
        let org = sqlx::query_as::<_, Organization>(&format!(
            "SELECT {ORG_COLUMNS} FROM organizations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(org)
    }

    async fn find_by_email(&self, email: &str) -> BillingResult<Option<Organization>> {
        let org = sqlx::query_as::<_, Organization>(&format!(
            "SELECT {ORG_COLUMNS} FROM organizations WHERE LOWER(contact_email) = LOWER($1)"
        ))
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await?;
        Ok(org)
    }

    async fn find_by_name(&self, name: &str) -> BillingResult<Vec<Organization>> {
        let orgs = sqlx::query_as::<_, Organization>(&format!(
            "SELECT {ORG_COLUMNS} FROM organizations WHERE LOWER(name) = LOWER($1) \
             ORDER BY created_at ASC LIMIT 2"
        ))
        .bind(name.trim())
        .fetch_all(&self.pool)
        .await?;
        Ok(orgs)
    }

    async fn create_with_owner(
        &self,
        organization: &NewOrganization,
        owner: &NewOwner,
        license: &SubscriptionLink,
    ) -> BillingResult<CreateOrganizationOutcome> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query_as::<_, Organization>(&format!(
            r#"
            INSERT INTO organizations (id, name, contact_email, phone, address)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (LOWER(contact_email)) DO NOTHING
            RETURNING {ORG_COLUMNS}
            "#
        ))
        .bind(organization.id)
        .bind(organization.name.trim())
        .bind(organization.contact_email.trim())
        .bind(&organization.phone)
        .bind(&organization.address)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(org) = inserted else {
            tx.rollback().await?;
            // The conflicting row is committed by now, so a plain read sees it.
            let existing = self
                .find_by_email(&organization.contact_email)
                .await?
                .ok_or_else(|| {
                    BillingError::Internal(format!(
                        "organization for {} conflicted but could not be read",
                        organization.contact_email
                    ))
                })?;
            return Ok(CreateOrganizationOutcome::Exists(existing));
        };

        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, org_id, email, name, password_hash, role, must_change_password)
            VALUES ($1, $2, $3, $4, $5, 'owner', TRUE)
            ON CONFLICT (LOWER(email)) DO NOTHING
            RETURNING id, org_id, email, name, role, must_change_password, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(org.id)
        .bind(owner.email.trim())
        .bind(&owner.name)
        .bind(&owner.password_hash)
        .fetch_optional(&mut *tx)
        .await?;

        let license = insert_linked_license(&mut *tx, license).await?;

        tx.commit().await?;

        Ok(CreateOrganizationOutcome::Created {
            organization: org,
            owner: user,
            license,
        })
    }
}
