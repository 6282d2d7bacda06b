//! Platform admin routes
//!
//! - `financials`: reporting, reconciliation, snapshots, invariants and
//!   webhook replay
//! - `shared`: query types and parsing helpers

pub mod financials;
pub mod shared;
