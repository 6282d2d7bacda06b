//! Shared application state

use std::sync::Arc;

use pixmeter_billing::BillingService;
use sqlx::PgPool;

use crate::{auth::JwtManager, config::Config};

/// State handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: PgPool,
    pub jwt: JwtManager,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(config: Config, pool: PgPool, billing: BillingService) -> Self {
        let jwt = JwtManager::new(&config.jwt_secret);
        Self {
            config: Arc::new(config),
            pool,
            jwt,
            billing: Arc::new(billing),
        }
    }
}
