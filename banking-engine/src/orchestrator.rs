//! Settlement orchestrator
//!
//! Drives the three-stage pipeline per batch: baseline aggregation, intra
//! settlement, inter settlement. Keys are processed in parallel across the
//! batch and strictly in stage order within a key.
//!
//! # Per-key state machine
//!
//! ```text
//! Pending → BaselineComputed → IntraSettled → InterSettled (terminal)
//!     \            \                \
//!      └────────────┴────────────────┴──→ Failed(stage, reason)
//! ```
//!
//! Phase A runs stages 1-2 for every key concurrently (bounded by
//! `max_parallel_keys`). Phase B then groups the Stage-2 records of the
//! whole scope, allocates inter settlement inside each group and applies it
//! per key. Stage-2 records left behind by an interrupted earlier run are
//! picked up by Phase B even when their key is not in the current batch.
//!
//! One key's failure never aborts the batch; failures are collected into
//! the report per key.

use crate::{
    aggregation::{keys_with_retry, surplus_with_retry, AggregationSource, RetryConfig},
    allocation::{allocate_inter_group, compute_intra, InterPosition},
    grouping::{group_records, InterScope},
    metrics::Metrics,
    Error, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use settlement_store::{
    DateRange, SettlementKey, SettlementRecord, SettlementStage, SettlementStore, StageAmounts,
};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum keys settled concurrently during Phase A
    pub max_parallel_keys: usize,

    /// Retry policy for the aggregation source
    pub retry: RetryConfig,

    /// Inter-settlement eligibility scope
    pub inter_scope: InterScope,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel_keys: 8,
            retry: RetryConfig::default(),
            inter_scope: InterScope::default(),
        }
    }
}

/// Cancellation signal checked between keys, never mid-key
///
/// An in-flight key always completes its current stage transition so no
/// record is left half-written relative to the store invariants.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Fresh, uncancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Pipeline stage a failure occurred in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    /// Stage 1: baseline aggregation and record creation
    Baseline,
    /// Stage 2: intra settlement
    Intra,
    /// Stage 3: inter settlement
    Inter,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineStage::Baseline => "baseline",
            PipelineStage::Intra => "intra",
            PipelineStage::Inter => "inter",
        };
        write!(f, "{}", s)
    }
}

/// Per-key failure carried in the batch report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    /// Stage the key failed in
    pub stage: PipelineStage,

    /// Failure description
    pub message: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage, self.message)
    }
}

/// Result of one batch run
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    /// Batch run ID
    pub batch_id: Uuid,

    /// Date scope of the run
    pub range: DateRange,

    /// Client filter, if any
    pub client_filter: Option<String>,

    /// Whether recompute mode was set
    pub recompute: bool,

    /// Keys that reached the terminal stage (including no-op re-runs)
    pub succeeded: Vec<SettlementKey>,

    /// Keys that failed, with the stage and reason
    pub failed: Vec<(SettlementKey, Failure)>,

    /// Run start time
    pub started_at: DateTime<Utc>,

    /// Run end time
    pub finished_at: DateTime<Utc>,
}

impl BatchReport {
    /// Whether every key settled
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of Phase A for one key
enum KeyOutcome {
    /// Already inter-settled; nothing to do
    Complete,

    /// Stage 2 done; waiting for the group-level inter pass
    AwaitingInter,

    /// Failed a stage
    Failed(Failure),
}

impl KeyOutcome {
    fn failed(stage: PipelineStage, message: impl fmt::Display) -> Self {
        KeyOutcome::Failed(Failure {
            stage,
            message: message.to_string(),
        })
    }
}

/// Banking settlement orchestrator
pub struct BankingOrchestrator<A> {
    store: Arc<SettlementStore>,
    source: Arc<A>,
    config: OrchestratorConfig,
    metrics: Option<Metrics>,
    cancel: CancelToken,
}

impl<A: AggregationSource + 'static> BankingOrchestrator<A> {
    /// Create a new orchestrator
    pub fn new(store: Arc<SettlementStore>, source: Arc<A>, config: OrchestratorConfig) -> Self {
        Self {
            store,
            source,
            config,
            metrics: None,
            cancel: CancelToken::new(),
        }
    }

    /// Attach a metrics collector
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Token for cancelling in-flight batch runs
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Fetch the settlement record for a key, for reporting consumers
    pub fn get_record(&self, key: &SettlementKey) -> Result<Option<SettlementRecord>> {
        Ok(self.store.get(key)?)
    }

    /// Run the settlement pipeline for a batch scope
    ///
    /// Keys already inter-settled are no-op successes unless `recompute` is
    /// set, in which case the full pipeline re-executes from a fresh
    /// baseline. The returned report always covers every discovered key.
    pub async fn run_batch(
        &self,
        range: DateRange,
        client_filter: Option<String>,
        recompute: bool,
    ) -> Result<BatchReport> {
        if range.start > range.end {
            return Err(Error::InvalidInput(format!(
                "invalid date range {}..{}",
                range.start, range.end
            )));
        }

        let batch_id = Uuid::now_v7();
        let started_at = Utc::now();
        if let Some(metrics) = &self.metrics {
            metrics.batches_total.inc();
        }
        tracing::info!(
            %batch_id,
            range = %range,
            client = client_filter.as_deref().unwrap_or("*"),
            recompute,
            "Starting settlement batch"
        );

        let keys = keys_with_retry(
            self.source.as_ref(),
            &range,
            client_filter.as_deref(),
            &self.config.retry,
        )
        .await?;

        let mut seen = HashSet::new();
        let keys: Vec<SettlementKey> = keys.into_iter().filter(|k| seen.insert(k.clone())).collect();
        tracing::info!(%batch_id, key_count = keys.len(), "Discovered keys needing settlement");

        let mut outcomes: BTreeMap<SettlementKey, KeyOutcome> = BTreeMap::new();

        // Phase A: baseline + intra, parallel across keys
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_keys.max(1)));
        let mut join_set: JoinSet<(SettlementKey, KeyOutcome)> = JoinSet::new();

        for key in keys {
            if self.cancel.is_cancelled() {
                outcomes.insert(
                    key,
                    KeyOutcome::failed(PipelineStage::Baseline, "batch cancelled"),
                );
                continue;
            }

            let store = Arc::clone(&self.store);
            let source = Arc::clone(&self.source);
            let semaphore = Arc::clone(&semaphore);
            let retry = self.config.retry.clone();

            join_set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            key,
                            KeyOutcome::failed(
                                PipelineStage::Baseline,
                                "settlement semaphore closed",
                            ),
                        )
                    }
                };
                let outcome = settle_key_phase_a(
                    store.as_ref(),
                    source.as_ref(),
                    &key,
                    &range,
                    recompute,
                    &retry,
                )
                .await;
                (key, outcome)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((key, outcome)) => {
                    outcomes.insert(key, outcome);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Settlement task failed to join");
                }
            }
        }

        // Phase B: group-level inter settlement
        let awaiting: Vec<SettlementKey> = outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, KeyOutcome::AwaitingInter))
            .map(|(key, _)| key.clone())
            .collect();

        if !awaiting.is_empty() {
            if self.cancel.is_cancelled() {
                for key in awaiting {
                    outcomes.insert(
                        key,
                        KeyOutcome::failed(
                            PipelineStage::Inter,
                            "batch cancelled before inter settlement",
                        ),
                    );
                }
            } else {
                self.run_inter_phase(range, client_filter.as_deref(), recompute, awaiting, &mut outcomes);
            }
        }

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for (key, outcome) in outcomes {
            match outcome {
                KeyOutcome::Complete => succeeded.push(key),
                KeyOutcome::Failed(failure) => failed.push((key, failure)),
                KeyOutcome::AwaitingInter => failed.push((
                    key,
                    Failure {
                        stage: PipelineStage::Inter,
                        message: "inter settlement not reached".to_string(),
                    },
                )),
            }
        }

        let finished_at = Utc::now();
        if let Some(metrics) = &self.metrics {
            metrics.keys_settled_total.inc_by(succeeded.len() as u64);
            metrics.key_failures_total.inc_by(failed.len() as u64);
            metrics
                .batch_duration
                .observe((finished_at - started_at).num_milliseconds() as f64 / 1000.0);
        }

        tracing::info!(
            %batch_id,
            succeeded = succeeded.len(),
            failed = failed.len(),
            "Settlement batch complete"
        );

        Ok(BatchReport {
            batch_id,
            range,
            client_filter,
            recompute,
            succeeded,
            failed,
            started_at,
            finished_at,
        })
    }

    fn run_inter_phase(
        &self,
        range: DateRange,
        client_filter: Option<&str>,
        recompute: bool,
        awaiting: Vec<SettlementKey>,
        outcomes: &mut BTreeMap<SettlementKey, KeyOutcome>,
    ) {
        let records = match self.store.snapshot_scope(Some(range), client_filter) {
            Ok(records) => records,
            Err(e) => {
                let message = e.to_string();
                for key in awaiting {
                    outcomes.insert(
                        key,
                        KeyOutcome::failed(PipelineStage::Inter, &message),
                    );
                }
                return;
            }
        };

        let eligible: Vec<SettlementRecord> = records
            .into_iter()
            .filter(|r| r.has_intra && !r.has_inter)
            .collect();
        let groups = group_records(self.config.inter_scope, eligible);

        let mut awaiting: BTreeSet<SettlementKey> = awaiting.into_iter().collect();

        'groups: for (group_key, group) in groups {
            let mut positions: Vec<InterPosition> =
                group.iter().map(InterPosition::from_record).collect();
            positions.sort_by(|a, b| a.key.cmp(&b.key));

            let matched_total = allocate_inter_group(&mut positions);
            tracing::debug!(group = %group_key, %matched_total, "Inter settlement group allocated");

            for position in positions {
                if self.cancel.is_cancelled() {
                    break 'groups;
                }

                let after = StageAmounts {
                    generation: position.generation_left,
                    demand: position.demand_left,
                };
                match self
                    .store
                    .apply_inter(&position.key, &after, position.matched, recompute)
                {
                    Ok(()) => {
                        if awaiting.remove(&position.key) {
                            outcomes.insert(position.key, KeyOutcome::Complete);
                        }
                    }
                    Err(e) => {
                        if awaiting.remove(&position.key) {
                            outcomes.insert(
                                position.key.clone(),
                                KeyOutcome::failed(PipelineStage::Inter, e),
                            );
                        } else {
                            tracing::warn!(
                                key = %position.key,
                                error = %e,
                                "Inter settlement failed for out-of-batch record"
                            );
                        }
                    }
                }
            }
        }

        // Cancelled mid-phase, or records not visible in the scope snapshot
        for key in awaiting {
            let message = if self.cancel.is_cancelled() {
                "batch cancelled during inter settlement"
            } else {
                "record not visible in settlement scope"
            };
            outcomes.insert(key, KeyOutcome::failed(PipelineStage::Inter, message));
        }
    }
}

/// Stages 1-2 for a single key: aggregate, create (or resume/recompute),
/// intra-settle
async fn settle_key_phase_a<A: AggregationSource>(
    store: &SettlementStore,
    source: &A,
    key: &SettlementKey,
    range: &DateRange,
    recompute: bool,
    retry: &RetryConfig,
) -> KeyOutcome {
    let existing = match store.get(key) {
        Ok(existing) => existing,
        Err(e) => return KeyOutcome::failed(PipelineStage::Baseline, e),
    };

    let record = match existing {
        Some(record) if !recompute => match record.stage() {
            SettlementStage::InterSettled => {
                tracing::debug!(key = %key, "Key already inter-settled, skipping");
                return KeyOutcome::Complete;
            }
            // Resume from the stored stage markers
            _ => record,
        },
        Some(_) => {
            // Recompute: re-derive all stages from a fresh baseline
            let baseline = match surplus_with_retry(source, key, range, retry).await {
                Ok(baseline) => baseline,
                Err(e) => return KeyOutcome::failed(PipelineStage::Baseline, e),
            };
            if let Err(e) = store.reset_baseline(key, &baseline) {
                return KeyOutcome::failed(PipelineStage::Baseline, e);
            }
            match store.get(key) {
                Ok(Some(record)) => record,
                Ok(None) => {
                    return KeyOutcome::failed(
                        PipelineStage::Baseline,
                        "record vanished during recompute",
                    )
                }
                Err(e) => return KeyOutcome::failed(PipelineStage::Baseline, e),
            }
        }
        None => {
            let baseline = match surplus_with_retry(source, key, range, retry).await {
                Ok(baseline) => baseline,
                Err(e) => return KeyOutcome::failed(PipelineStage::Baseline, e),
            };
            if let Err(e) = store.create(key, &baseline) {
                return KeyOutcome::failed(PipelineStage::Baseline, e);
            }
            match store.get(key) {
                Ok(Some(record)) => record,
                Ok(None) => {
                    return KeyOutcome::failed(
                        PipelineStage::Baseline,
                        "record vanished after create",
                    )
                }
                Err(e) => return KeyOutcome::failed(PipelineStage::Baseline, e),
            }
        }
    };

    if !record.has_intra || recompute {
        let alloc = match compute_intra(record.surplus_generation_sum, record.surplus_demand_sum) {
            Ok(alloc) => alloc,
            Err(e) => return KeyOutcome::failed(PipelineStage::Intra, e),
        };
        let after = StageAmounts {
            generation: alloc.generation_after,
            demand: alloc.demand_after,
        };
        if let Err(e) = store.apply_intra(key, &after, alloc.settled, recompute) {
            return KeyOutcome::failed(PipelineStage::Intra, e);
        }
    }

    KeyOutcome::AwaitingInter
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::StaticAggregationSource;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use settlement_store::{BaselineAmounts, PlantType};
    use tempfile::TempDir;

    fn test_store() -> (Arc<SettlementStore>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = settlement_store::Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (Arc::new(SettlementStore::open(&config).unwrap()), temp_dir)
    }

    fn test_key(plant: &str, cons_unit: &str) -> SettlementKey {
        SettlementKey {
            client_name: "Acme Textiles".to_string(),
            plant_name: plant.to_string(),
            cons_unit: cons_unit.to_string(),
            slot_name: "Morning Peak".to_string(),
            slot_time: "06:00-09:00".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            plant_type: PlantType::Solar,
        }
    }

    fn baseline(gen: i64, dem: i64) -> BaselineAmounts {
        BaselineAmounts {
            surplus_generation_sum: Decimal::new(gen, 2),
            surplus_demand_sum: Decimal::new(dem, 2),
            matched_settled_sum: Decimal::ZERO,
        }
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let (store, _temp) = test_store();
        let source = Arc::new(StaticAggregationSource::new());
        let orchestrator =
            BankingOrchestrator::new(store, source, OrchestratorConfig::default());

        let range = DateRange::single(NaiveDate::from_ymd_opt(2024, 3, 15).unwrap());
        let report = orchestrator.run_batch(range, None, false).await.unwrap();

        assert!(report.succeeded.is_empty());
        assert!(report.failed.is_empty());
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_rerun_is_noop() {
        let (store, _temp) = test_store();
        let key = test_key("Acme Solar I", "HT-201");
        let mut source = StaticAggregationSource::new();
        source.insert(key.clone(), baseline(10000, 6000));
        let orchestrator = BankingOrchestrator::new(
            Arc::clone(&store),
            Arc::new(source),
            OrchestratorConfig::default(),
        );

        let range = DateRange::single(key.date);
        let first = orchestrator.run_batch(range, None, false).await.unwrap();
        assert_eq!(first.succeeded, vec![key.clone()]);

        let settled = store.get(&key).unwrap().unwrap();
        assert_eq!(settled.stage(), SettlementStage::InterSettled);
        let updated_at = settled.updated_at;

        // Second run is a no-op success
        let second = orchestrator.run_batch(range, None, false).await.unwrap();
        assert_eq!(second.succeeded, vec![key.clone()]);
        assert!(second.is_clean());
        let after = store.get(&key).unwrap().unwrap();
        assert_eq!(after.updated_at, updated_at);
    }

    #[tokio::test]
    async fn test_invalid_range_rejected() {
        let (store, _temp) = test_store();
        let source = Arc::new(StaticAggregationSource::new());
        let orchestrator =
            BankingOrchestrator::new(store, source, OrchestratorConfig::default());

        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 3, 20).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
        );
        let err = orchestrator.run_batch(range, None, false).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_cancelled_batch_fails_all_keys() {
        let (store, _temp) = test_store();
        let key = test_key("Acme Solar I", "HT-201");
        let mut source = StaticAggregationSource::new();
        source.insert(key.clone(), baseline(10000, 6000));
        let orchestrator = BankingOrchestrator::new(
            store,
            Arc::new(source),
            OrchestratorConfig::default(),
        );

        orchestrator.cancel_token().cancel();

        let range = DateRange::single(key.date);
        let report = orchestrator.run_batch(range, None, false).await.unwrap();
        assert!(report.succeeded.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].1.stage, PipelineStage::Baseline);
    }
}
