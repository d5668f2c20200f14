//! Daily settlement run scheduler
//!
//! Triggers a batch run for the previous day at configured times of day
//! (UTC). Ad-hoc runs remain available through the orchestrator directly.

use crate::{
    aggregation::AggregationSource,
    orchestrator::BankingOrchestrator,
    Error, Result,
};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use settlement_store::DateRange;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Settlement run schedule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Times of day (UTC) when a settlement run starts,
    /// e.g. ["02:00", "14:00"]
    pub run_times: Vec<String>,

    /// Enable automatic runs
    pub auto_run: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            run_times: vec!["02:00".to_string()],
            auto_run: true,
        }
    }
}

impl ScheduleConfig {
    /// Parse run times into NaiveTime
    fn parse_times(&self) -> Result<Vec<NaiveTime>> {
        self.run_times
            .iter()
            .map(|time_str| {
                NaiveTime::parse_from_str(time_str, "%H:%M").map_err(|e| {
                    Error::Config(format!("Invalid time format '{}': {}", time_str, e))
                })
            })
            .collect()
    }

    /// Calculate the next run time from now
    pub fn next_run_time(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let times = self.parse_times()?;
        let current_time = now.time();

        for run_time in &times {
            if current_time < *run_time {
                let next = now
                    .date_naive()
                    .and_time(*run_time)
                    .and_local_timezone(Utc)
                    .single()
                    .ok_or_else(|| Error::Config("Invalid timezone conversion".to_string()))?;
                return Ok(next);
            }
        }

        // No more runs today, first run tomorrow
        let tomorrow = (now + Duration::days(1)).date_naive();
        let first = times
            .first()
            .ok_or_else(|| Error::Config("No run times configured".to_string()))?;

        tomorrow
            .and_time(*first)
            .and_local_timezone(Utc)
            .single()
            .ok_or_else(|| Error::Config("Invalid timezone conversion".to_string()))
    }

    /// Whether now matches a run time (within 1 minute tolerance)
    pub fn is_run_time(&self, now: DateTime<Utc>) -> Result<bool> {
        let times = self.parse_times()?;
        let current_time = now.time();

        for run_time in times {
            let diff_secs = (current_time.num_seconds_from_midnight() as i64
                - run_time.num_seconds_from_midnight() as i64)
                .abs();

            if diff_secs < 60 {
                return Ok(true);
            }
        }

        Ok(false)
    }
}

/// Scheduler driving daily settlement runs
pub struct RunScheduler<A> {
    orchestrator: Arc<BankingOrchestrator<A>>,
    config: ScheduleConfig,
    client_filter: Option<String>,
    last_run_date: RwLock<Option<NaiveDate>>,
}

impl<A: AggregationSource + 'static> RunScheduler<A> {
    /// Create a new scheduler
    pub fn new(
        orchestrator: Arc<BankingOrchestrator<A>>,
        config: ScheduleConfig,
        client_filter: Option<String>,
    ) -> Self {
        Self {
            orchestrator,
            config,
            client_filter,
            last_run_date: RwLock::new(None),
        }
    }

    /// Run the scheduler loop
    pub async fn start(self: Arc<Self>) {
        info!(run_times = ?self.config.run_times, "Starting settlement scheduler");

        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));

        loop {
            interval.tick().await;

            if let Err(e) = self.tick(Utc::now()).await {
                warn!("Scheduler tick failed: {}", e);
            }
        }
    }

    /// Check the schedule once and run a batch if due
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<()> {
        if !self.config.auto_run {
            return Ok(());
        }
        if !self.config.is_run_time(now)? {
            return Ok(());
        }

        // Settle the previous day, once per day
        let run_date = now
            .date_naive()
            .pred_opt()
            .ok_or_else(|| Error::Other("date underflow".to_string()))?;

        {
            let last = self.last_run_date.read().await;
            if *last == Some(run_date) {
                debug!(%run_date, "Settlement already ran for this date, skipping");
                return Ok(());
            }
        }
        *self.last_run_date.write().await = Some(run_date);

        info!(%run_date, "Scheduled settlement run starting");
        let report = self
            .orchestrator
            .run_batch(DateRange::single(run_date), self.client_filter.clone(), false)
            .await?;

        info!(
            batch_id = %report.batch_id,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Scheduled settlement run complete"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc::now()
            .date_naive()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
            .and_local_timezone(Utc)
            .unwrap()
    }

    #[test]
    fn test_default_schedule_parses() {
        let config = ScheduleConfig::default();
        assert_eq!(config.parse_times().unwrap().len(), 1);
    }

    #[test]
    fn test_next_run_time_same_day() {
        let config = ScheduleConfig {
            run_times: vec!["02:00".to_string(), "14:00".to_string()],
            auto_run: true,
        };

        let next = config.next_run_time(at(10, 0)).unwrap();
        assert_eq!(next.hour(), 14);
    }

    #[test]
    fn test_next_run_time_wraps_to_tomorrow() {
        let config = ScheduleConfig {
            run_times: vec!["02:00".to_string()],
            auto_run: true,
        };

        let now = at(10, 0);
        let next = config.next_run_time(now).unwrap();
        assert_eq!(next.hour(), 2);
        assert!(next > now);
    }

    #[test]
    fn test_is_run_time_tolerance() {
        let config = ScheduleConfig::default(); // 02:00

        assert!(config.is_run_time(at(2, 0)).unwrap());
        assert!(!config.is_run_time(at(2, 5)).unwrap());
        assert!(!config.is_run_time(at(13, 0)).unwrap());
    }

    #[test]
    fn test_invalid_time_rejected() {
        let config = ScheduleConfig {
            run_times: vec!["25:99".to_string()],
            auto_run: true,
        };
        assert!(matches!(
            config.next_run_time(Utc::now()),
            Err(Error::Config(_))
        ));
    }
}
