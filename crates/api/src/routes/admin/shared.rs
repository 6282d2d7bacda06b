//! Shared query types and parsing for admin routes

use pixmeter_billing::{Period, PeriodType};
use serde::Deserialize;
use time::{format_description::well_known::Rfc3339, macros::format_description, Date, OffsetDateTime};

use crate::error::{ApiError, ApiResult};

/// `start`/`end` window; RFC 3339 timestamps or `YYYY-MM-DD` dates
#[derive(Debug, Default, Deserialize)]
pub struct RangeQuery {
    pub start: Option<String>,
    pub end: Option<String>,
}

impl RangeQuery {
    /// Resolve to `[start, end)`, defaulting to the current UTC month up to `now`
    pub fn resolve(&self, now: OffsetDateTime) -> ApiResult<(OffsetDateTime, OffsetDateTime)> {
        let start = match &self.start {
            Some(raw) => parse_timestamp(raw)?,
            None => Period::containing(PeriodType::Month, now)?.start,
        };
        let end = match &self.end {
            Some(raw) => parse_timestamp(raw)?,
            None => now,
        };

        if start >= end {
            return Err(ApiError::Validation("start must be before end".to_string()));
        }
        Ok((start, end))
    }
}

/// `period` and optional reference timestamp `at`
#[derive(Debug, Default, Deserialize)]
pub struct PeriodQuery {
    pub period: Option<String>,
    pub at: Option<String>,
    pub periods: Option<u32>,
    pub limit: Option<i64>,
}

impl PeriodQuery {
    pub fn period_type(&self) -> ApiResult<PeriodType> {
        parse_period_type(self.period.as_deref())
    }

    pub fn at(&self, now: OffsetDateTime) -> ApiResult<OffsetDateTime> {
        self.at.as_deref().map(parse_timestamp).unwrap_or(Ok(now))
    }
}

/// Period type, monthly when absent
pub fn parse_period_type(raw: Option<&str>) -> ApiResult<PeriodType> {
    match raw {
        None => Ok(PeriodType::Month),
        Some(raw) => raw.parse().map_err(ApiError::Validation),
    }
}

pub fn parse_timestamp(raw: &str) -> ApiResult<OffsetDateTime> {
    if let Ok(ts) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Ok(ts);
    }
    parse_date(raw).map(|date| date.midnight().assume_utc())
}

pub fn parse_date(raw: &str) -> ApiResult<Date> {
    Date::parse(raw, format_description!("[year]-[month]-[day]"))
        .map_err(|_| ApiError::Validation(format!("Invalid date: {}", raw)))
}

pub fn clamp_limit(limit: Option<i64>, default: i64, max: i64) -> i64 {
    limit.unwrap_or(default).clamp(1, max)
}
