//! Pixmeter API Library
//!
//! HTTP surface of the billing core: Stripe webhook ingestion, the quota read
//! API and operator financial reporting.

// Test code patterns (expected in test modules):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
