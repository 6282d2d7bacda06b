//! Pixmeter Shared Types and Utilities
//!
//! This crate contains types, errors, and database plumbing shared by the
//! billing core, the API server and the background worker.

pub mod db;
pub mod error;
pub mod telemetry;
pub mod types;

pub use db::*;
pub use error::*;
pub use telemetry::init_tracing;
pub use types::*;
