//! Staff endpoints: license overrides and webhook event review

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use dealerhub_billing::{
    AdminLicenseUpdate, BillingEventRecord, EventStatus, FreeGrant, License, WebhookOutcome,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const DEFAULT_EVENT_PAGE: i64 = 50;

#[derive(Debug, Deserialize)]
pub struct EventListQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct EventListResponse {
    pub events: Vec<BillingEventRecord>,
    pub limit: i64,
    pub offset: i64,
}

pub async fn get_license(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<Json<License>> {
    state
        .billing
        .licenses
        .get_for_org(org_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("license for organization {org_id}")))
}

pub async fn update_license(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
    Json(req): Json<AdminLicenseUpdate>,
) -> ApiResult<Json<License>> {
    tracing::info!(
        admin_user_id = %auth_user.user_id,
        org_id = %org_id,
        license_type = ?req.license_type,
        car_limit = ?req.car_limit,
        is_active = ?req.is_active,
        "Admin license update requested"
    );
    let license = state.billing.licenses.admin_update(org_id, req).await?;
    Ok(Json(license))
}

pub async fn grant_free_license(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
    Json(req): Json<FreeGrant>,
) -> ApiResult<Json<License>> {
    tracing::info!(
        admin_user_id = %auth_user.user_id,
        org_id = %org_id,
        license_type = %req.license_type,
        car_limit = req.car_limit,
        "Admin free license grant requested"
    );
    let license = state.billing.licenses.grant_free(org_id, req).await?;
    Ok(Json(license))
}

pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventListQuery>,
) -> ApiResult<Json<EventListResponse>> {
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(EventStatus::parse(raw).ok_or_else(|| {
            ApiError::Validation(format!(
                "status must be one of received, processed, failed (got '{raw}')"
            ))
        })?),
        None => None,
    };
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_PAGE);
    let offset = query.offset.unwrap_or(0);

    let events = state
        .billing
        .webhooks
        .list_events(status, limit, offset)
        .await?;

    Ok(Json(EventListResponse {
        events,
        limit,
        offset,
    }))
}

pub async fn get_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<BillingEventRecord>> {
    state
        .billing
        .webhooks
        .get_event(&event_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("billing event {event_id}")))
}

pub async fn replay_event(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<WebhookOutcome>> {
    tracing::info!(
        admin_user_id = %auth_user.user_id,
        event_id = %event_id,
        "Admin webhook replay requested"
    );
    let outcome = state.billing.webhooks.replay_event(&event_id).await?;
    Ok(Json(outcome))
}
