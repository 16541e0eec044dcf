//! osha-ingest - Rate-limited ingestion of OSHA inspection and violation records
//!
//! This crate keeps a local SQLite copy of OSHA enforcement data. An
//! incremental inspection sync follows the `load_dt` watermark, and a tiered
//! violation watch rechecks stored inspections for newly issued citations.
//! Every remote call goes through one paced, rate-limit aware client.

pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod models;
pub mod otel;
pub mod sync;
