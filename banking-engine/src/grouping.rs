//! Inter-settlement eligibility grouping
//!
//! The inter pass matches leftover surplus across different plants and
//! consumption units, but only inside an explicit eligibility group. The
//! grouping rule is a plain function over the settlement key so it can be
//! tested and changed deliberately, never an implicit join.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use settlement_store::{SettlementKey, SettlementRecord};
use std::collections::BTreeMap;
use std::fmt;

/// Scope rule deciding which records may bank against each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterScope {
    /// Same client, same date, same time-of-day slot (default): a client's
    /// surplus banks across its own plants and units within the slot
    ClientDateSlot,

    /// Same client, same date, any slot
    ClientDate,
}

impl Default for InterScope {
    fn default() -> Self {
        InterScope::ClientDateSlot
    }
}

/// Identity of one eligibility group
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterGroupKey {
    /// Client owning every record in the group
    pub client_name: String,

    /// Settlement date
    pub date: NaiveDate,

    /// Slot name, present under [`InterScope::ClientDateSlot`]
    pub slot_name: Option<String>,
}

impl fmt::Display for InterGroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.slot_name {
            Some(slot) => write!(f, "{}/{}/{}", self.client_name, self.date, slot),
            None => write!(f, "{}/{}", self.client_name, self.date),
        }
    }
}

impl InterScope {
    /// Group a key belongs to under this scope rule
    pub fn group_key(&self, key: &SettlementKey) -> InterGroupKey {
        InterGroupKey {
            client_name: key.client_name.clone(),
            date: key.date,
            slot_name: match self {
                InterScope::ClientDateSlot => Some(key.slot_name.clone()),
                InterScope::ClientDate => None,
            },
        }
    }
}

/// Partition records into eligibility groups, in deterministic group order
pub fn group_records(
    scope: InterScope,
    records: Vec<SettlementRecord>,
) -> BTreeMap<InterGroupKey, Vec<SettlementRecord>> {
    let mut groups: BTreeMap<InterGroupKey, Vec<SettlementRecord>> = BTreeMap::new();
    for record in records {
        groups
            .entry(scope.group_key(&record.key))
            .or_default()
            .push(record);
    }
    groups
}
