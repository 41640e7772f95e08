//! Stripe webhook signature verification
//!
//! Header format: `t=<unix seconds>,v1=<hex hmac>[,v1=<hex hmac>...]`.
//! The signed payload is `"{t}.{body}"`, keyed with the full endpoint secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Default replay window for signed timestamps.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Hex-encoded HMAC-SHA256 of `"{timestamp}.{payload}"`.
pub fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| {
        tracing::error!("Invalid webhook secret key");
        BillingError::WebhookSignatureInvalid
    })?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Build a header value the way Stripe does. Used by tests and local tooling.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> BillingResult<String> {
    let signature = compute_signature(secret, timestamp, payload)?;
    Ok(format!("t={timestamp},v1={signature}"))
}

/// Verify a `Stripe-Signature` header against the raw request body.
pub fn verify_signature(
    secret: &str,
    payload: &[u8],
    header: &str,
    tolerance_secs: i64,
) -> BillingResult<()> {
    verify_signature_at(
        secret,
        payload,
        header,
        tolerance_secs,
        OffsetDateTime::now_utc().unix_timestamp(),
    )
}

pub(crate) fn verify_signature_at(
    secret: &str,
    payload: &[u8],
    header: &str,
    tolerance_secs: i64,
    now: i64,
) -> BillingResult<()> {
    if secret.is_empty() {
        tracing::error!("Webhook secret is not configured");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();

    for part in header.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            match key {
                "t" => timestamp = value.parse().ok(),
                "v1" => candidates.push(value),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if candidates.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    // The header is unauthenticated at this point; `t` can be any i64.
    let Some(age) = now.checked_sub(timestamp).map(i64::unsigned_abs) else {
        tracing::warn!(timestamp, now, "Webhook timestamp out of range");
        return Err(BillingError::WebhookSignatureInvalid);
    };
    if age > tolerance_secs.unsigned_abs() {
        tracing::warn!(timestamp, now, age, "Webhook timestamp outside tolerance");
        return Err(BillingError::WebhookTimestampExpired {
            age_seconds: i64::try_from(age).unwrap_or(i64::MAX),
        });
    }

    let expected = compute_signature(secret, timestamp, payload)?;
    let matched = candidates
        .iter()
        .any(|candidate| bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())));

    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}
