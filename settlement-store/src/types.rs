//! Core types for the settlement record store
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for energy amounts)
//! - Explicit stage tracking (never inferred from zero values)

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Surrogate identifier of a settlement record (UUIDv7 for time-ordering)
pub type RecordId = Uuid;

/// Plant generation technology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlantType {
    /// Solar PV plant
    Solar,
    /// Wind plant
    Wind,
}

impl PlantType {
    /// Lowercase code as stored in the schema
    pub fn as_str(&self) -> &'static str {
        match self {
            PlantType::Solar => "solar",
            PlantType::Wind => "wind",
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "solar" => Some(PlantType::Solar),
            "wind" => Some(PlantType::Wind),
            _ => None,
        }
    }
}

impl fmt::Display for PlantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Inclusive date range used for batch scoping and queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    /// First date in the range
    pub start: NaiveDate,
    /// Last date in the range (inclusive)
    pub end: NaiveDate,
}

impl DateRange {
    /// Range covering both endpoints
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// Range covering a single date
    pub fn single(date: NaiveDate) -> Self {
        Self { start: date, end: date }
    }

    /// Whether the date falls inside the range
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}..{}", self.start, self.end)
        }
    }
}

/// Identity tuple addressing one settlement record
///
/// Uniqueness covers `(client_name, plant_name, cons_unit, slot_name, date,
/// plant_type)`. `slot_time` is a descriptive label for the slot and is
/// deliberately excluded from equality and hashing, mirroring the unique
/// index on the persisted table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementKey {
    /// Client the plant and consumption unit belong to
    pub client_name: String,

    /// Generating plant name
    pub plant_name: String,

    /// Consumption unit identifier
    pub cons_unit: String,

    /// Time-of-day slot name (e.g. "Morning Peak")
    pub slot_name: String,

    /// Slot time label (e.g. "06:00-09:00"); descriptive only
    pub slot_time: String,

    /// Settlement date
    pub date: NaiveDate,

    /// Plant type
    pub plant_type: PlantType,
}

impl SettlementKey {
    /// Byte encoding of the unique tuple, used as the key-index key
    ///
    /// Fields are joined with a 0x1F unit separator so names containing
    /// punctuation cannot collide.
    pub fn unique_tuple_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        for field in [
            self.client_name.as_str(),
            self.plant_name.as_str(),
            self.cons_unit.as_str(),
            self.slot_name.as_str(),
        ] {
            out.extend_from_slice(field.as_bytes());
            out.push(0x1f);
        }
        out.extend_from_slice(self.date.format("%Y-%m-%d").to_string().as_bytes());
        out.push(0x1f);
        out.extend_from_slice(self.plant_type.as_str().as_bytes());
        out
    }

    fn unique_tuple(&self) -> (&str, &str, &str, &str, NaiveDate, PlantType) {
        (
            &self.client_name,
            &self.plant_name,
            &self.cons_unit,
            &self.slot_name,
            self.date,
            self.plant_type,
        )
    }
}

impl PartialEq for SettlementKey {
    fn eq(&self, other: &Self) -> bool {
        self.unique_tuple() == other.unique_tuple()
    }
}

impl Eq for SettlementKey {}

impl Hash for SettlementKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.unique_tuple().hash(state);
    }
}

impl PartialOrd for SettlementKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SettlementKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.unique_tuple().cmp(&other.unique_tuple())
    }
}

impl fmt::Display for SettlementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}/{}",
            self.client_name,
            self.plant_name,
            self.cons_unit,
            self.slot_name,
            self.date,
            self.plant_type
        )
    }
}

/// Stage 1 aggregates for a settlement key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineAmounts {
    /// Aggregated surplus generation for the key
    pub surplus_generation_sum: Decimal,

    /// Aggregated surplus demand for the key
    pub surplus_demand_sum: Decimal,

    /// Energy already matched and settled before any banking pass
    pub matched_settled_sum: Decimal,
}

/// Generation/demand pair after an allocation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageAmounts {
    /// Remaining surplus generation
    pub generation: Decimal,

    /// Remaining surplus demand
    pub demand: Decimal,
}

/// Settlement stage a record has completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SettlementStage {
    /// Stage 1: baseline aggregates persisted
    Baseline,
    /// Stage 2: intra settlement applied
    IntraSettled,
    /// Stage 3: inter settlement applied (terminal)
    InterSettled,
}

impl fmt::Display for SettlementStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SettlementStage::Baseline => "baseline",
            SettlementStage::IntraSettled => "intra-settled",
            SettlementStage::InterSettled => "inter-settled",
        };
        write!(f, "{}", s)
    }
}

/// Persisted banking settlement record
///
/// One record per [`SettlementKey`]. Stage completion is tracked by the
/// `has_intra`/`has_inter` markers, never inferred from field values: a
/// `0.00` amount can mean either "not yet settled" or "fully settled with
/// no surplus".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementRecord {
    /// Surrogate record ID
    pub record_id: RecordId,

    /// Identity tuple
    pub key: SettlementKey,

    // Stage 1: baseline aggregates
    /// Aggregated surplus demand
    pub surplus_demand_sum: Decimal,
    /// Aggregated surplus generation
    pub surplus_generation_sum: Decimal,
    /// Energy matched and settled before banking
    pub matched_settled_sum: Decimal,

    // Stage 2: after intra settlement
    /// Surplus generation remaining after the intra pass
    pub surplus_generation_sum_after_intra: Decimal,
    /// Surplus demand remaining after the intra pass
    pub surplus_demand_sum_after_intra: Decimal,
    /// Energy settled by the intra pass
    pub intra_settlement: Decimal,

    // Stage 3: after inter settlement
    /// Surplus generation remaining after the inter pass
    pub surplus_generation_sum_after_inter: Decimal,
    /// Surplus demand remaining after the inter pass
    pub surplus_demand_sum_after_inter: Decimal,
    /// Energy settled by the inter pass
    pub inter_settlement: Decimal,

    /// Stage 2 completion marker
    pub has_intra: bool,

    /// Stage 3 completion marker
    pub has_inter: bool,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,
}

impl SettlementRecord {
    /// Stage the record has completed
    pub fn stage(&self) -> SettlementStage {
        match (self.has_intra, self.has_inter) {
            (_, true) => SettlementStage::InterSettled,
            (true, false) => SettlementStage::IntraSettled,
            (false, false) => SettlementStage::Baseline,
        }
    }

    /// Stage 1 aggregates
    pub fn baseline(&self) -> BaselineAmounts {
        BaselineAmounts {
            surplus_generation_sum: self.surplus_generation_sum,
            surplus_demand_sum: self.surplus_demand_sum,
            matched_settled_sum: self.matched_settled_sum,
        }
    }

    /// Remaining amounts after the intra pass
    pub fn after_intra(&self) -> StageAmounts {
        StageAmounts {
            generation: self.surplus_generation_sum_after_intra,
            demand: self.surplus_demand_sum_after_intra,
        }
    }

    /// Remaining amounts after the inter pass
    pub fn after_inter(&self) -> StageAmounts {
        StageAmounts {
            generation: self.surplus_generation_sum_after_inter,
            demand: self.surplus_demand_sum_after_inter,
        }
    }
}
