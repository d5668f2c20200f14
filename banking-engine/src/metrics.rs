//! Metrics collection for observability
//!
//! Prometheus metrics for monitoring settlement runs:
//!
//! - `banking_batches_total` - Settlement batch runs started
//! - `banking_keys_settled_total` - Keys that reached the terminal stage
//! - `banking_key_failures_total` - Keys that failed a pipeline stage
//! - `banking_batch_duration_seconds` - Histogram of batch run durations

use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Settlement batch runs started
    pub batches_total: IntCounter,

    /// Keys that reached the terminal stage
    pub keys_settled_total: IntCounter,

    /// Keys that failed a pipeline stage
    pub key_failures_total: IntCounter,

    /// Batch run duration histogram
    pub batch_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create a new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let batches_total = IntCounter::with_opts(Opts::new(
            "banking_batches_total",
            "Settlement batch runs started",
        ))?;
        registry.register(Box::new(batches_total.clone()))?;

        let keys_settled_total = IntCounter::with_opts(Opts::new(
            "banking_keys_settled_total",
            "Keys that reached the terminal settlement stage",
        ))?;
        registry.register(Box::new(keys_settled_total.clone()))?;

        let key_failures_total = IntCounter::with_opts(Opts::new(
            "banking_key_failures_total",
            "Keys that failed a pipeline stage",
        ))?;
        registry.register(Box::new(key_failures_total.clone()))?;

        let batch_duration = Histogram::with_opts(
            HistogramOpts::new(
                "banking_batch_duration_seconds",
                "Histogram of settlement batch durations",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        )?;
        registry.register(Box::new(batch_duration.clone()))?;

        Ok(Self {
            batches_total,
            keys_settled_total,
            key_failures_total,
            batch_duration,
            registry,
        })
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}
