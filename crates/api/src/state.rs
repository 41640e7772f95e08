//! Application state

use dealerhub_billing::BillingService;
use std::sync::Arc;

use crate::{
    auth::{AuthState, JwtManager},
    config::Config,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub jwt_manager: JwtManager,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(config: Config, billing: BillingService) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret);

        if billing.checkout.is_some() {
            tracing::info!("Stripe checkout and portal enabled");
        }

        Self {
            config,
            jwt_manager,
            billing: Arc::new(billing),
        }
    }

    /// Get auth state for middleware
    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
        }
    }
}
