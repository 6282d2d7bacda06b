//! Billing configuration

use std::time::Duration;

use crate::error::{BillingError, BillingResult};
use crate::quota::QuotaPolicy;

/// Configuration for inbound Stripe webhooks
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe webhook signing secret (`whsec_...`)
    pub webhook_secret: String,
    /// Maximum accepted age of a signature timestamp
    pub signature_tolerance: Duration,
    /// Upper bound on dispatching one verified event
    pub handler_timeout: Duration,
}

impl StripeConfig {
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            signature_tolerance: Duration::from_secs(300),
            handler_timeout: Duration::from_secs(20),
        }
    }

    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;
        Ok(Self {
            webhook_secret,
            signature_tolerance: Duration::from_secs(env_u64("STRIPE_SIGNATURE_TOLERANCE_SECS", 300)),
            handler_timeout: Duration::from_millis(env_u64("WEBHOOK_HANDLER_TIMEOUT_MS", 20_000)),
        })
    }
}

/// Configuration for the generation provider (Replicate) API
#[derive(Debug, Clone)]
pub struct ReplicateConfig {
    pub api_token: String,
    pub base_url: String,
    pub request_timeout: Duration,
    /// Retries after the first attempt for transient failures
    pub max_retries: usize,
}

impl ReplicateConfig {
    pub fn new(api_token: impl Into<String>) -> Self {
        Self {
            api_token: api_token.into(),
            base_url: "https://api.replicate.com/v1".to_string(),
            request_timeout: Duration::from_secs(15),
            max_retries: 2,
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        let api_token = std::env::var("REPLICATE_API_TOKEN")
            .map_err(|_| BillingError::Config("REPLICATE_API_TOKEN not set".to_string()))?;
        Ok(Self {
            api_token,
            base_url: std::env::var("REPLICATE_BASE_URL")
                .unwrap_or_else(|_| "https://api.replicate.com/v1".to_string()),
            request_timeout: Duration::from_millis(env_u64("REPLICATE_TIMEOUT_MS", 15_000)),
            max_retries: env_u64("REPLICATE_MAX_RETRIES", 2) as usize,
        })
    }
}

/// Knobs for the reconciliation batch and plan defaults
#[derive(Debug, Clone)]
pub struct BillingSettings {
    /// Pause between consecutive provider lookups in a batch
    pub reconcile_delay: Duration,
    /// Default number of generations one batch run reconciles
    pub reconcile_batch_limit: i64,
    /// Name of the zero-cost plan new users get
    pub default_plan_name: String,
    /// Which covered quota breaches spend a credit
    pub quota_policy: QuotaPolicy,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            reconcile_delay: Duration::from_millis(500),
            reconcile_batch_limit: 50,
            default_plan_name: "Free".to_string(),
            quota_policy: QuotaPolicy::default(),
        }
    }
}

impl BillingSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            reconcile_delay: Duration::from_millis(env_u64("RECONCILE_DELAY_MS", 500)),
            reconcile_batch_limit: env_u64("RECONCILE_BATCH_LIMIT", 50) as i64,
            default_plan_name: std::env::var("DEFAULT_PLAN_NAME")
                .unwrap_or(defaults.default_plan_name),
            quota_policy: QuotaPolicy {
                daily_breach_spends_credit: env_bool("DAILY_BREACH_SPENDS_CREDIT", false),
            },
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}
