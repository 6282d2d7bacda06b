//! Reporting periods (UTC)

use serde::{Deserialize, Serialize};
use time::{Date, Duration, Month, OffsetDateTime, UtcOffset};

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodType {
    Day,
    /// ISO week, Monday to Monday
    Week,
    Month,
    Quarter,
    Year,
}

impl std::fmt::Display for PeriodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Day => write!(f, "day"),
            Self::Week => write!(f, "week"),
            Self::Month => write!(f, "month"),
            Self::Quarter => write!(f, "quarter"),
            Self::Year => write!(f, "year"),
        }
    }
}

impl std::str::FromStr for PeriodType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "day" | "daily" => Ok(Self::Day),
            "week" | "weekly" => Ok(Self::Week),
            "month" | "monthly" => Ok(Self::Month),
            "quarter" | "quarterly" => Ok(Self::Quarter),
            "year" | "yearly" => Ok(Self::Year),
            _ => Err(format!("Invalid period type: {}", s)),
        }
    }
}

/// Half-open `[start, end)` window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub period_type: PeriodType,
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
}

impl Period {
    /// The period of `period_type` containing `at`
    pub fn containing(period_type: PeriodType, at: OffsetDateTime) -> BillingResult<Self> {
        let day = at.to_offset(UtcOffset::UTC).date();

        let (start, end) = match period_type {
            PeriodType::Day => (day, day + Duration::days(1)),
            PeriodType::Week => {
                let monday = day - Duration::days(i64::from(day.weekday().number_days_from_monday()));
                (monday, monday + Duration::days(7))
            }
            PeriodType::Month => {
                let first = first_of_month(day.year(), u8::from(day.month()))?;
                (first, add_months(first, 1)?)
            }
            PeriodType::Quarter => {
                let quarter_month = (u8::from(day.month()) - 1) / 3 * 3 + 1;
                let first = first_of_month(day.year(), quarter_month)?;
                (first, add_months(first, 3)?)
            }
            PeriodType::Year => {
                let first = first_of_month(day.year(), 1)?;
                (first, add_months(first, 12)?)
            }
        };

        Ok(Self {
            period_type,
            start: start.midnight().assume_utc(),
            end: end.midnight().assume_utc(),
        })
    }

    /// The period of the same type immediately before this one
    pub fn previous(&self) -> BillingResult<Self> {
        Self::containing(self.period_type, self.start - Duration::seconds(1))
    }

    /// `count` consecutive periods ending with the one containing `at`, oldest first
    pub fn trailing(period_type: PeriodType, at: OffsetDateTime, count: u32) -> BillingResult<Vec<Self>> {
        let mut periods = Vec::with_capacity(count as usize);
        let mut current = Self::containing(period_type, at)?;
        for _ in 0..count {
            periods.push(current);
            current = current.previous()?;
        }
        periods.reverse();
        Ok(periods)
    }
}

fn first_of_month(year: i32, month: u8) -> BillingResult<Date> {
    let month = Month::try_from(month).map_err(|e| BillingError::Internal(e.to_string()))?;
    Date::from_calendar_date(year, month, 1).map_err(|e| BillingError::Internal(e.to_string()))
}

fn add_months(first: Date, months: u32) -> BillingResult<Date> {
    let index = first.year() * 12 + i32::from(u8::from(first.month())) - 1 + months as i32;
    first_of_month(index.div_euclid(12), (index.rem_euclid(12) + 1) as u8)
}
