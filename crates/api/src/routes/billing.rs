//! Billing routes: Stripe webhook, hosted checkout, billing portal

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Extension, Json,
};
use dealerhub_billing::{
    BillingError, CheckoutRequest, CheckoutResponse, PortalResponse, WebhookOutcome,
};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const SIGNATURE_HEADER: &str = "stripe-signature";

/// Stripe webhook endpoint. Takes the raw body; the signature covers the
/// exact bytes Stripe sent.
///
/// Stripe only ever sees 200 or 400. Unhandled failures, including a
/// store that cannot record the event, answer 400 so Stripe re-delivers.
/// Everything else that got past the signature check is acknowledged with 200.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<WebhookOutcome>)> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Webhook request without stripe-signature header");
            ApiError::BadRequest("Missing stripe-signature header".to_string())
        })?;

    let outcome = state
        .billing
        .webhooks
        .handle_webhook(&body, signature)
        .await
        .map_err(webhook_rejection)?;

    let status = if outcome.acknowledge() {
        StatusCode::OK
    } else {
        tracing::warn!(
            event_id = %outcome.event_id(),
            kind = ?outcome.kind(),
            "Webhook failed; asking Stripe to retry"
        );
        StatusCode::BAD_REQUEST
    };
    Ok((status, Json(outcome)))
}

fn webhook_rejection(err: BillingError) -> ApiError {
    match err {
        BillingError::WebhookSignatureInvalid
        | BillingError::WebhookTimestampExpired { .. }
        | BillingError::MalformedPayload(_) => {
            tracing::warn!(error = %err, kind = ?err.kind(), "Webhook rejected");
            ApiError::BadRequest(err.to_string())
        }
        other => {
            tracing::error!(
                error = %other,
                kind = ?other.kind(),
                "Webhook could not be recorded; asking Stripe to retry"
            );
            ApiError::BadRequest("Webhook could not be processed, retry later".to_string())
        }
    }
}

pub async fn create_checkout(
    State(state): State<AppState>,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let session = state
        .billing
        .checkout()?
        .create_checkout_session(&req)
        .await?;
    Ok(Json(session))
}

pub async fn create_portal(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<PortalResponse>> {
    let session = state
        .billing
        .checkout()?
        .create_portal_session(auth_user.org_id)
        .await?;
    Ok(Json(session))
}
