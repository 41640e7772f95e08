//! First-time tenant provisioning
//!
//! Creates an organization, its owner user and its first license in one
//! transaction when a paying customer has no tenant yet. The owner gets a
//! random temporary password and must change it on first login. A failed
//! attempt leaves nothing behind, so a re-delivered event provisions again
//! and the welcome email carries a password that works.

use argon2::password_hash::{PasswordHasher, SaltString};
use argon2::Argon2;
use rand::distr::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::licenses::{License, SubscriptionLink};
use crate::organizations::{
    CreateOrganizationOutcome, NewOrganization, NewOwner, Organization, OrganizationRepository,
    User,
};

const TEMPORARY_PASSWORD_LEN: usize = 16;

/// Who to provision, usually taken from checkout or subscription metadata
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub organization_name: String,
    pub owner_email: String,
    pub owner_name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ProvisionOutcome {
    /// A new organization was created by this call.
    Created {
        organization: Organization,
        owner: Option<User>,
        license: License,
        /// Plaintext credential for the welcome email. Never stored.
        temporary_password: Option<String>,
    },
    /// A concurrent delivery created the organization first.
    Existing { organization: Organization },
}

#[derive(Clone)]
pub struct OrganizationProvisioner {
    organizations: Arc<dyn OrganizationRepository>,
}

impl OrganizationProvisioner {
    pub fn new(organizations: Arc<dyn OrganizationRepository>) -> Self {
        Self { organizations }
    }

    /// `license_for` builds the license row for the new organization's id.
    pub async fn provision<F>(
        &self,
        request: &ProvisionRequest,
        license_for: F,
    ) -> BillingResult<ProvisionOutcome>
    where
        F: FnOnce(Uuid) -> SubscriptionLink,
    {
        let organization_name = request.organization_name.trim();
        let owner_email = request.owner_email.trim();
        if organization_name.is_empty() {
            return Err(BillingError::MissingMetadata("organization_name".to_string()));
        }
        if owner_email.is_empty() || !owner_email.contains('@') {
            return Err(BillingError::MissingMetadata("owner_email".to_string()));
        }

        let temporary_password = generate_temporary_password();
        let password_hash = hash_password(&temporary_password)?;

        let org_id = Uuid::new_v4();
        let license = license_for(org_id);

        let outcome = self
            .organizations
            .create_with_owner(
                &NewOrganization {
                    id: org_id,
                    name: organization_name.to_string(),
                    contact_email: owner_email.to_string(),
                    phone: request.phone.clone(),
                    address: request.address.clone(),
                },
                &NewOwner {
                    email: owner_email.to_string(),
                    name: request.owner_name.clone(),
                    password_hash,
                },
                &license,
            )
            .await?;

        match outcome {
            CreateOrganizationOutcome::Created {
                organization,
                owner,
                license,
            } => {
                if owner.is_none() {
                    tracing::warn!(
                        org_id = %organization.id,
                        email = %owner_email,
                        "Owner email already belongs to another user; organization created without owner"
                    );
                }
                tracing::info!(
                    org_id = %organization.id,
                    license_id = %license.id,
                    name = %organization.name,
                    "Organization provisioned"
                );
                let temporary_password = owner.as_ref().map(|_| temporary_password);
                Ok(ProvisionOutcome::Created {
                    organization,
                    owner,
                    license,
                    temporary_password,
                })
            }
            CreateOrganizationOutcome::Exists(organization) => {
                tracing::info!(
                    org_id = %organization.id,
                    email = %owner_email,
                    "Organization already provisioned by a concurrent delivery"
                );
                Ok(ProvisionOutcome::Existing { organization })
            }
        }
    }
}

pub fn generate_temporary_password() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(TEMPORARY_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

pub fn hash_password(password: &str) -> BillingResult<String> {
    let salt_bytes: [u8; 16] = rand::random();
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|e| BillingError::Internal(format!("Salt encoding failed: {e}")))?;
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| BillingError::Internal(format!("Password hashing failed: {e}")))
}
