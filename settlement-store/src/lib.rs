//! Settlement Record Store
//!
//! Durable keyed storage for energy banking settlement records with
//! uniqueness enforcement and stage-aware updates.
//!
//! # Architecture
//!
//! - **One record per settlement key**: the identity tuple `(client_name,
//!   plant_name, cons_unit, slot_name, date, plant_type)` is the uniqueness
//!   boundary and the unit of concurrency
//! - **Three stages**: baseline aggregates, intra settlement, inter
//!   settlement; each stage transition is a single atomic write
//! - **Explicit stage markers**: completion is tracked by flags, never
//!   inferred from `0.00` amounts
//!
//! # Invariants
//!
//! - Every monetary field is non-negative with at most 2 decimal places
//! - `after_intra = baseline - intra_settlement` on both sides
//! - Inter settlement only ever decreases remaining surplus, and its debits
//!   sum to `inter_settlement`
//! - A record is never in Stage 3 without Stage 2, nor Stage 2 without
//!   Stage 1

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod config;
pub mod error;
pub mod storage;
pub mod types;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use storage::SettlementStore;
pub use types::{
    BaselineAmounts, DateRange, PlantType, RecordId, SettlementKey, SettlementRecord,
    SettlementStage, StageAmounts,
};
