// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Pixmeter Billing Module
//!
//! Usage governance and financial reconciliation for metered image generation.
//!
//! ## Features
//!
//! - **Quota Enforcement**: Daily and monthly image caps, monthly cost cap, credit override
//! - **Ledgers**: Append-only credits, additive monthly/daily usage buckets
//! - **Subscriptions**: One open subscription per user, provider-driven upserts
//! - **Cost Estimation**: Per-model price table (flat or per-megapixel)
//! - **Cost Reconciliation**: Provider-measured compute cost, batched
//! - **Webhooks**: Signed, journaled, idempotent Stripe event handling with replay
//! - **Financials**: Period metrics, comparisons, reports and snapshots
//! - **Invariants**: Runnable consistency checks

pub mod config;
pub mod credits;
pub mod error;
pub mod financials;
pub mod invariants;
pub mod locks;
pub mod metering;
pub mod pricing;
pub mod quota;
pub mod reconcile;
pub mod revenue;
pub mod subscriptions;
pub mod usage;
pub mod webhooks;

// Config
pub use config::{BillingSettings, ReplicateConfig, StripeConfig};

// Credits
pub use credits::{CreditEntry, CreditLedger};

// Error
pub use error::{BillingError, BillingResult};

// Financials
pub use financials::{
    calc_change, AllTimeTotals, ChurnReport, FinancialAggregator, FinancialMetrics,
    FinancialSnapshot, MetricChanges, ModelCost, MrrPoint, Period, PeriodComparison, PeriodType,
    PnlStatement, TierRevenue, TopCustomer, TrendPoint,
};

// Invariants
pub use invariants::{InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity};

// Locks
pub use locks::{UserGuard, UserLocks};

// Metering
pub use metering::{GenerationMeter, GenerationOutcome, GenerationRequest, MeteredGeneration, MeteredOutcome};

// Pricing
pub use pricing::{CostEstimator, GenerationShape, ModelPrice, PricingMode, FALLBACK_PRICE_PER_IMAGE};

// Quota
pub use quota::{
    evaluate_quota, DenialReason, QuotaDecision, QuotaEnforcer, QuotaInputs, QuotaLimits, QuotaPolicy,
    QuotaUsage,
};

// Reconciliation
pub use reconcile::{
    BatchResult, CostReconciler, GenerationProvider, HardwareClass, ProviderPrediction, ReplicateClient,
};

// Revenue
pub use revenue::{Payment, RevenueLedger, UserMetrics};

// Subscriptions
pub use subscriptions::{
    ActiveSubscription, ProviderSubscriptionUpdate, SubscriptionManager, SubscriptionProduct,
    UserSubscription,
};

// Usage
pub use usage::{day_key, month_key, DailyUsage, MonthlyUsage, UsageLedger};

// Webhooks
pub use webhooks::{
    BillingEventProcessor, InvoiceSummary, VerifiedEvent, WebhookEventRecord, WebhookOutcome,
    WebhookReplayResult,
};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub credits: CreditLedger,
    pub usage: UsageLedger,
    pub subscriptions: SubscriptionManager,
    pub quota: QuotaEnforcer,
    pub estimator: CostEstimator,
    pub meter: GenerationMeter,
    pub reconciler: CostReconciler,
    pub webhooks: BillingEventProcessor,
    pub revenue: RevenueLedger,
    pub financials: FinancialAggregator,
    pub invariants: InvariantChecker,
    pub settings: BillingSettings,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeConfig::from_env()?;
        let provider = ReplicateClient::new(ReplicateConfig::from_env()?)?;
        Ok(Self::new(pool, stripe, Arc::new(provider), BillingSettings::from_env()))
    }

    /// Create a new billing service with explicit config and generation provider
    pub fn new(
        pool: PgPool,
        stripe: StripeConfig,
        provider: Arc<dyn GenerationProvider>,
        settings: BillingSettings,
    ) -> Self {
        let subscriptions = SubscriptionManager::new(pool.clone(), settings.default_plan_name.clone());

        Self {
            credits: CreditLedger::new(pool.clone()),
            usage: UsageLedger::new(pool.clone()),
            quota: QuotaEnforcer::new(pool.clone(), settings.quota_policy),
            estimator: CostEstimator::new(),
            meter: GenerationMeter::new(pool.clone(), settings.quota_policy),
            reconciler: CostReconciler::new(pool.clone(), provider, settings.reconcile_delay),
            webhooks: BillingEventProcessor::new(pool.clone(), stripe, subscriptions.clone()),
            revenue: RevenueLedger::new(pool.clone()),
            financials: FinancialAggregator::new(pool.clone()),
            invariants: InvariantChecker::new(pool),
            subscriptions,
            settings,
        }
    }
}
