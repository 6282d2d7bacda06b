//! Quota enforcement
//!
//! Answers "may this user start a generation right now?". All data is loaded
//! up front and the decision itself is a pure function of it
//! ([`evaluate_quota`]), so every branch is testable without a database.
//!
//! Tiers are evaluated in order: daily image cap, monthly image cap, monthly
//! cost cap. Credits can cover the two count caps; the cost cap is hard.
//! Whether a covered breach actually spends a credit is decided by the
//! monthly cap, unless [`QuotaPolicy`] says daily breaches spend one too.

use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::credits::CreditLedger;
use crate::error::BillingResult;
use crate::subscriptions::{ActiveSubscription, SubscriptionManager};
use crate::usage::UsageLedger;

/// Usage snapshot returned with every decision
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub daily_images: i64,
    pub monthly_images: i64,
    pub monthly_cost: f64,
    pub monthly_own_key_images: i64,
}

/// Plan limits returned with every decision (`None` = unlimited)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub plan: Option<String>,
    pub daily_image_limit: Option<i64>,
    pub monthly_image_limit: Option<i64>,
    pub monthly_cost_limit: Option<f64>,
}

/// Why a request was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    NoSubscription,
    DailyImageLimit,
    MonthlyImageLimit,
    MonthlyCostLimit,
}

impl DenialReason {
    pub fn message(&self) -> &'static str {
        match self {
            Self::NoSubscription => "No active subscription and no credits available",
            Self::DailyImageLimit => "Daily image limit reached and no credits available",
            Self::MonthlyImageLimit => "Monthly image limit reached and no credits available",
            Self::MonthlyCostLimit => "Monthly cost limit reached",
        }
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

/// Outcome of a quota check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub denial: Option<DenialReason>,
    /// Human-readable form of `denial`
    pub reason: Option<String>,
    pub usage: QuotaUsage,
    pub limits: QuotaLimits,
    pub available_credits: i64,
    /// A count limit is exceeded and one credit must be spent after success
    pub credit_required: bool,
}

impl QuotaDecision {
    /// This decision once the credit it relied on is gone
    pub(crate) fn without_credits(mut self) -> Self {
        let denial = if self.limits.plan.is_none() {
            DenialReason::NoSubscription
        } else if reached(self.usage.daily_images, self.limits.daily_image_limit) {
            DenialReason::DailyImageLimit
        } else {
            DenialReason::MonthlyImageLimit
        };

        self.allowed = false;
        self.denial = Some(denial);
        self.reason = Some(denial.message().to_string());
        self.available_credits = 0;
        self.credit_required = false;
        self
    }
}

/// Which covered breaches spend a credit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaPolicy {
    /// Also spend a credit when only the daily cap is exceeded. When off, a
    /// daily breach covered by credits is let through without a debit.
    pub daily_breach_spends_credit: bool,
}

/// Everything a decision depends on
#[derive(Debug, Clone, Default)]
pub struct QuotaInputs {
    pub limits: Option<QuotaLimits>,
    pub usage: QuotaUsage,
    pub credits: i64,
    pub policy: QuotaPolicy,
}

impl QuotaInputs {
    pub fn from_parts(
        subscription: Option<&ActiveSubscription>,
        usage: QuotaUsage,
        credits: i64,
        policy: QuotaPolicy,
    ) -> Self {
        let limits = subscription.map(|active| QuotaLimits {
            plan: Some(active.product.name.clone()),
            daily_image_limit: active.product.daily_image_limit.map(i64::from),
            monthly_image_limit: active.product.monthly_image_limit.map(i64::from),
            monthly_cost_limit: active.product.monthly_cost_limit,
        });
        Self {
            limits,
            usage,
            credits,
            policy,
        }
    }
}

fn reached(count: i64, limit: Option<i64>) -> bool {
    limit.is_some_and(|limit| count >= limit)
}

/// Decide whether a generation may start.
///
/// Without a subscription, credits are the only entitlement, so every allowed
/// request spends one. With a subscription, exceeding the daily or monthly
/// image cap is allowed only while credits remain. A request at or over the
/// monthly image cap costs exactly one credit, even when the daily cap is
/// exceeded as well; a daily-only breach costs one only under
/// [`QuotaPolicy::daily_breach_spends_credit`]. The monthly cost cap denies
/// regardless of credits.
pub fn evaluate_quota(inputs: &QuotaInputs) -> QuotaDecision {
    let deny = |denial: DenialReason, limits: QuotaLimits| QuotaDecision {
        allowed: false,
        denial: Some(denial),
        reason: Some(denial.message().to_string()),
        usage: inputs.usage.clone(),
        limits,
        available_credits: inputs.credits,
        credit_required: false,
    };
    let has_credits = inputs.credits > 0;

    let Some(limits) = inputs.limits.clone() else {
        if !has_credits {
            return deny(DenialReason::NoSubscription, QuotaLimits::default());
        }
        return QuotaDecision {
            allowed: true,
            denial: None,
            reason: None,
            usage: inputs.usage.clone(),
            limits: QuotaLimits::default(),
            available_credits: inputs.credits,
            credit_required: true,
        };
    };

    let daily_exceeded = reached(inputs.usage.daily_images, limits.daily_image_limit);
    if daily_exceeded && !has_credits {
        return deny(DenialReason::DailyImageLimit, limits);
    }

    let monthly_exceeded = reached(inputs.usage.monthly_images, limits.monthly_image_limit);
    if monthly_exceeded && !has_credits {
        return deny(DenialReason::MonthlyImageLimit, limits);
    }

    if limits
        .monthly_cost_limit
        .is_some_and(|cap| inputs.usage.monthly_cost >= cap)
    {
        return deny(DenialReason::MonthlyCostLimit, limits);
    }

    QuotaDecision {
        allowed: true,
        denial: None,
        reason: None,
        usage: inputs.usage.clone(),
        limits,
        available_credits: inputs.credits,
        credit_required: monthly_exceeded
            || (daily_exceeded && inputs.policy.daily_breach_spends_credit),
    }
}

/// Quota enforcer service
#[derive(Clone)]
pub struct QuotaEnforcer {
    pool: PgPool,
    policy: QuotaPolicy,
}

impl QuotaEnforcer {
    pub fn new(pool: PgPool, policy: QuotaPolicy) -> Self {
        Self { pool, policy }
    }

    /// Load the user's plan, usage and credits and decide
    pub async fn can_generate(&self, user_id: Uuid) -> BillingResult<QuotaDecision> {
        let mut conn = self.pool.acquire().await?;
        let decision =
            Self::can_generate_in(&mut conn, user_id, OffsetDateTime::now_utc(), self.policy).await?;

        if !decision.allowed {
            tracing::info!(
                user_id = %user_id,
                reason = ?decision.denial,
                monthly_images = decision.usage.monthly_images,
                monthly_cost = decision.usage.monthly_cost,
                credits = decision.available_credits,
                "Generation denied by quota"
            );
        }

        Ok(decision)
    }

    pub(crate) async fn load_inputs_in(
        conn: &mut PgConnection,
        user_id: Uuid,
        at: OffsetDateTime,
        policy: QuotaPolicy,
    ) -> BillingResult<QuotaInputs> {
        let subscription = SubscriptionManager::active_subscription_in(conn, user_id).await?;
        let monthly = UsageLedger::monthly_in(conn, user_id, at).await?;
        let daily = UsageLedger::daily_in(conn, user_id, at).await?;
        let credits = CreditLedger::balance_in(conn, user_id).await?;

        let usage = QuotaUsage {
            daily_images: daily.image_count,
            monthly_images: monthly.image_count,
            monthly_cost: monthly.total_cost,
            monthly_own_key_images: monthly.own_key_count,
        };

        Ok(QuotaInputs::from_parts(subscription.as_ref(), usage, credits, policy))
    }

    pub(crate) async fn can_generate_in(
        conn: &mut PgConnection,
        user_id: Uuid,
        at: OffsetDateTime,
        policy: QuotaPolicy,
    ) -> BillingResult<QuotaDecision> {
        let inputs = Self::load_inputs_in(conn, user_id, at, policy).await?;
        Ok(evaluate_quota(&inputs))
    }
}
