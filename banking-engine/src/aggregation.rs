//! Aggregation seam
//!
//! Stage-1 baselines come from an external collaborator that aggregates raw
//! generation/consumption readings into per-key surplus sums. The engine
//! only sees this trait; how the readings are sourced is out of scope.

use crate::{Error, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use settlement_store::{BaselineAmounts, DateRange, PlantType, SettlementKey};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;

/// Supplier of aggregated surplus figures for settlement keys
///
/// Futures are `Send` so the orchestrator can fan out across keys. Failures
/// are [`Error::Aggregation`]; transient ones are retried with bounded
/// attempts, permanent ones mark the key `Failed`.
pub trait AggregationSource: Send + Sync {
    /// Keys needing settlement within the range, optionally filtered by
    /// client
    fn settlement_keys(
        &self,
        range: &DateRange,
        client_filter: Option<&str>,
    ) -> impl Future<Output = Result<Vec<SettlementKey>>> + Send;

    /// Aggregated surplus figures for one key
    fn surplus_for(
        &self,
        key: &SettlementKey,
        range: &DateRange,
    ) -> impl Future<Output = Result<BaselineAmounts>> + Send;
}

/// Retry policy for transient aggregation failures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts per call (including the first)
    pub max_attempts: u32,

    /// Delay between attempts (milliseconds)
    pub retry_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 500,
        }
    }
}

/// Fetch a key's surplus figures with bounded retries on transient failure
pub async fn surplus_with_retry<A: AggregationSource>(
    source: &A,
    key: &SettlementKey,
    range: &DateRange,
    retry: &RetryConfig,
) -> Result<BaselineAmounts> {
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match source.surplus_for(key, range).await {
            Ok(baseline) => return Ok(baseline),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                tracing::warn!(
                    key = %key,
                    attempt,
                    max_attempts,
                    error = %e,
                    "Aggregation attempt failed, retrying"
                );
                tokio::time::sleep(tokio::time::Duration::from_millis(retry.retry_delay_ms)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Discover settlement keys with bounded retries on transient failure
pub async fn keys_with_retry<A: AggregationSource>(
    source: &A,
    range: &DateRange,
    client_filter: Option<&str>,
    retry: &RetryConfig,
) -> Result<Vec<SettlementKey>> {
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match source.settlement_keys(range, client_filter).await {
            Ok(keys) => return Ok(keys),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                tracing::warn!(
                    range = %range,
                    attempt,
                    max_attempts,
                    error = %e,
                    "Key discovery attempt failed, retrying"
                );
                tokio::time::sleep(tokio::time::Duration::from_millis(retry.retry_delay_ms)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// One row of an aggregate export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateRow {
    /// Client name
    pub client_name: String,
    /// Plant name
    pub plant_name: String,
    /// Consumption unit
    pub cons_unit: String,
    /// Time-of-day slot name
    pub slot_name: String,
    /// Slot time label
    pub slot_time: String,
    /// Settlement date
    pub date: NaiveDate,
    /// Plant type
    pub plant_type: PlantType,
    /// Aggregated surplus generation
    pub surplus_generation_sum: Decimal,
    /// Aggregated surplus demand
    pub surplus_demand_sum: Decimal,
    /// Energy already matched before banking
    #[serde(default)]
    pub matched_settled_sum: Decimal,
}

impl AggregateRow {
    fn key(&self) -> SettlementKey {
        SettlementKey {
            client_name: self.client_name.clone(),
            plant_name: self.plant_name.clone(),
            cons_unit: self.cons_unit.clone(),
            slot_name: self.slot_name.clone(),
            slot_time: self.slot_time.clone(),
            date: self.date,
            plant_type: self.plant_type,
        }
    }

    fn baseline(&self) -> BaselineAmounts {
        BaselineAmounts {
            surplus_generation_sum: self.surplus_generation_sum,
            surplus_demand_sum: self.surplus_demand_sum,
            matched_settled_sum: self.matched_settled_sum,
        }
    }
}

/// In-memory aggregation source
///
/// Used by tests and by the batch runner, which loads a JSON export of
/// per-key aggregates produced upstream.
#[derive(Debug, Default)]
pub struct StaticAggregationSource {
    entries: HashMap<SettlementKey, BaselineAmounts>,
}

impl StaticAggregationSource {
    /// Empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace aggregates for a key
    pub fn insert(&mut self, key: SettlementKey, baseline: BaselineAmounts) {
        self.entries.insert(key, baseline);
    }

    /// Parse a JSON array of [`AggregateRow`]s
    pub fn from_json_str(json: &str) -> Result<Self> {
        let rows: Vec<AggregateRow> = serde_json::from_str(json)
            .map_err(|e| Error::aggregation_permanent(format!("invalid aggregate export: {}", e)))?;
        let mut source = Self::new();
        for row in rows {
            source.insert(row.key(), row.baseline());
        }
        Ok(source)
    }

    /// Load a JSON aggregate export from disk
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Number of keys with aggregates
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the source has no aggregates
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl AggregationSource for StaticAggregationSource {
    fn settlement_keys(
        &self,
        range: &DateRange,
        client_filter: Option<&str>,
    ) -> impl Future<Output = Result<Vec<SettlementKey>>> + Send {
        let mut keys: Vec<SettlementKey> = self
            .entries
            .keys()
            .filter(|key| range.contains(key.date))
            .filter(|key| client_filter.map_or(true, |c| key.client_name == c))
            .cloned()
            .collect();
        keys.sort();
        async move { Ok(keys) }
    }

    fn surplus_for(
        &self,
        key: &SettlementKey,
        _range: &DateRange,
    ) -> impl Future<Output = Result<BaselineAmounts>> + Send {
        let result = self
            .entries
            .get(key)
            .copied()
            .ok_or_else(|| Error::aggregation_permanent(format!("no aggregates for {}", key)));
        async move { result }
    }
}
