//! Energy Banking Settlement Engine
//!
//! Reconciles surplus generation against surplus demand through two
//! sequential allocation passes per settlement key, preserving a full audit
//! trail of amounts before and after each pass.
//!
//! # Pipeline
//!
//! 1. **Baseline**: aggregated surplus figures arrive from the aggregation
//!    collaborator and seed a Stage-1 record per key
//! 2. **Intra settlement**: a key's own surplus generation and demand
//!    cancel up to `min(generation, demand)`
//! 3. **Inter settlement**: leftovers are matched across the key's
//!    eligibility group (same client, date and time-of-day slot)
//!
//! The conservation validator re-checks every invariant after the fact and
//! reports violations without repairing them.
//!
//! # Example
//!
//! ```no_run
//! use banking_engine::{
//!     aggregation::StaticAggregationSource,
//!     orchestrator::{BankingOrchestrator, OrchestratorConfig},
//! };
//! use settlement_store::{DateRange, SettlementStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> banking_engine::Result<()> {
//!     let store = Arc::new(SettlementStore::open(&settlement_store::Config::default())?);
//!     let source = Arc::new(StaticAggregationSource::from_file("aggregates.json")?);
//!
//!     let orchestrator =
//!         BankingOrchestrator::new(store, source, OrchestratorConfig::default());
//!     let date = chrono::NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
//!     let report = orchestrator
//!         .run_batch(DateRange::single(date), None, false)
//!         .await?;
//!     println!("settled {} keys, {} failed", report.succeeded.len(), report.failed.len());
//!
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod aggregation;
pub mod allocation;
pub mod config;
pub mod error;
pub mod grouping;
pub mod metrics;
pub mod orchestrator;
pub mod scheduler;
pub mod slots;
pub mod validator;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use orchestrator::{BankingOrchestrator, BatchReport, CancelToken};
pub use validator::{ConservationValidator, ValidationReport};
