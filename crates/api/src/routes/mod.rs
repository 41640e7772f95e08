//! HTTP routes

pub mod admin;
pub mod billing;
pub mod licenses;


use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::auth::{require_admin, require_auth};
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    let public = Router::new()
        .route("/health", get(health))
        .route("/api/v1/billing/webhook", post(billing::stripe_webhook))
        .route("/api/v1/billing/checkout", post(billing::create_checkout))
        .route("/api/v1/tiers", get(licenses::list_tiers));

    let authenticated = Router::new()
        .route("/api/v1/billing/portal", post(billing::create_portal))
        .route("/api/v1/license", get(licenses::get_license))
        .route("/api/v1/license/capacity", get(licenses::get_capacity))
        .route_layer(middleware::from_fn_with_state(
            auth_state.clone(),
            require_auth,
        ));

    // Layers run bottom-up: authenticate, then check the staff role.
    let admin = Router::new()
        .route(
            "/api/v1/admin/licenses/{org_id}",
            get(admin::get_license).put(admin::update_license),
        )
        .route(
            "/api/v1/admin/licenses/{org_id}/free",
            post(admin::grant_free_license),
        )
        .route("/api/v1/admin/billing/events", get(admin::list_events))
        .route(
            "/api/v1/admin/billing/events/{event_id}",
            get(admin::get_event),
        )
        .route(
            "/api/v1/admin/billing/events/{event_id}/replay",
            post(admin::replay_event),
        )
        .route_layer(middleware::from_fn(require_admin))
        .route_layer(middleware::from_fn_with_state(auth_state, require_auth));

    Router::new()
        .merge(public)
        .merge(authenticated)
        .merge(admin)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}
