//! License read endpoints for the signed-in organization

use axum::{extract::State, Extension, Json};
use dealerhub_billing::{CapacityReport, License, LicenseTier};
use serde::Serialize;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct TierResponse {
    pub name: String,
    pub display_name: String,
    pub display_price: String,
    pub monthly_price_cents: i32,
    pub car_limit: i32,
    pub stripe_price_id: String,
}

impl From<LicenseTier> for TierResponse {
    fn from(tier: LicenseTier) -> Self {
        Self {
            display_price: tier.display_price(),
            name: tier.name,
            display_name: tier.display_name,
            monthly_price_cents: tier.monthly_price_cents,
            car_limit: tier.car_limit,
            stripe_price_id: tier.stripe_price_id,
        }
    }
}

/// The organization's license, active or not.
pub async fn get_license(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<License>> {
    state
        .billing
        .licenses
        .get_for_org(auth_user.org_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("license".to_string()))
}

pub async fn get_capacity(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<CapacityReport>> {
    Ok(Json(state.billing.guard.capacity(auth_user.org_id).await?))
}

pub async fn list_tiers(State(state): State<AppState>) -> ApiResult<Json<Vec<TierResponse>>> {
    let tiers = state.billing.tiers.list().await?;
    Ok(Json(tiers.into_iter().map(TierResponse::from).collect()))
}
