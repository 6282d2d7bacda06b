//! Common types used across Pixmeter

use serde::{Deserialize, Serialize};

// =============================================================================
// Enums
// =============================================================================

/// Lifecycle status of a user subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    /// Whether a subscription in this status still entitles the user to plan limits.
    /// Past-due subscriptions keep their plan until the provider cancels them.
    pub fn grants_access(&self) -> bool {
        !matches!(self, Self::Canceled)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Trialing => write!(f, "trialing"),
            Self::PastDue => write!(f, "past_due"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "trialing" => Ok(Self::Trialing),
            "past_due" => Ok(Self::PastDue),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            _ => Err(format!("Invalid subscription status: {}", s)),
        }
    }
}

/// Kind of credit ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CreditType {
    /// Operator or promotional grant
    Grant,
    /// Granted when a plan with bonus credits is assigned
    Bonus,
    /// Bought by the user
    Purchase,
    /// Consumed by a generation that exceeded plan limits
    Used,
    /// Manual operator adjustment (may be negative)
    Admin,
    Refund,
}

impl std::fmt::Display for CreditType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Grant => write!(f, "grant"),
            Self::Bonus => write!(f, "bonus"),
            Self::Purchase => write!(f, "purchase"),
            Self::Used => write!(f, "used"),
            Self::Admin => write!(f, "admin"),
            Self::Refund => write!(f, "refund"),
        }
    }
}

impl std::str::FromStr for CreditType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "grant" => Ok(Self::Grant),
            "bonus" => Ok(Self::Bonus),
            "purchase" => Ok(Self::Purchase),
            "used" => Ok(Self::Used),
            "admin" => Ok(Self::Admin),
            "refund" => Ok(Self::Refund),
            _ => Err(format!("Invalid credit type: {}", s)),
        }
    }
}

/// Outcome of a provider payment attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Succeeded,
    Failed,
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// What a revenue event (and the payment behind it) was charged for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RevenueEventType {
    Subscription,
    Overage,
    CreditPurchase,
    CreditUsage,
}

impl RevenueEventType {
    /// Reporting bucket this event type rolls up into
    pub fn bucket(&self) -> RevenueBucket {
        match self {
            Self::Subscription => RevenueBucket::Subscription,
            Self::Overage => RevenueBucket::Overage,
            Self::CreditPurchase | Self::CreditUsage => RevenueBucket::Credit,
        }
    }
}

impl std::fmt::Display for RevenueEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subscription => write!(f, "subscription"),
            Self::Overage => write!(f, "overage"),
            Self::CreditPurchase => write!(f, "credit_purchase"),
            Self::CreditUsage => write!(f, "credit_usage"),
        }
    }
}

impl std::str::FromStr for RevenueEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "subscription" => Ok(Self::Subscription),
            "overage" => Ok(Self::Overage),
            "credit_purchase" => Ok(Self::CreditPurchase),
            "credit_usage" => Ok(Self::CreditUsage),
            _ => Err(format!("Invalid revenue event type: {}", s)),
        }
    }
}

/// Revenue rollup buckets used in financial reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevenueBucket {
    Subscription,
    Overage,
    Credit,
}

// =============================================================================
// Money
// =============================================================================

/// Convert provider-facing minor units into dollars for reporting.
pub fn cents_to_dollars(cents: i64) -> f64 {
    cents as f64 / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_status_roundtrip_through_display() {
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::Trialing,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Canceled,
        ] {
            let parsed: SubscriptionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert_eq!(
            "cancelled".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::Canceled
        );
        assert!("paused".parse::<SubscriptionStatus>().is_err());
    }

    #[test]
    fn test_only_canceled_loses_access() {
        assert!(SubscriptionStatus::Active.grants_access());
        assert!(SubscriptionStatus::Trialing.grants_access());
        assert!(SubscriptionStatus::PastDue.grants_access());
        assert!(!SubscriptionStatus::Canceled.grants_access());
    }

    #[test]
    fn test_revenue_buckets() {
        assert_eq!(RevenueEventType::Subscription.bucket(), RevenueBucket::Subscription);
        assert_eq!(RevenueEventType::Overage.bucket(), RevenueBucket::Overage);
        assert_eq!(RevenueEventType::CreditPurchase.bucket(), RevenueBucket::Credit);
        assert_eq!(RevenueEventType::CreditUsage.bucket(), RevenueBucket::Credit);
    }

    #[test]
    fn test_cents_to_dollars() {
        assert_eq!(cents_to_dollars(0), 0.0);
        assert_eq!(cents_to_dollars(1999), 19.99);
        assert_eq!(cents_to_dollars(-500), -5.0);
    }
}
