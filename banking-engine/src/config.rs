//! Configuration for the banking engine

use crate::{aggregation::RetryConfig, orchestrator::OrchestratorConfig, scheduler::ScheduleConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Banking engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Settlement record store configuration
    pub store: settlement_store::Config,

    /// Orchestrator configuration
    pub orchestrator: OrchestratorConfig,

    /// Scheduled run configuration
    pub schedule: ScheduleConfig,

    /// Aggregate export consumed by the batch runner, if any
    pub aggregates_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "banking-engine".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            store: settlement_store::Config::default(),
            orchestrator: OrchestratorConfig::default(),
            schedule: ScheduleConfig::default(),
            aggregates_file: None,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(dir) = std::env::var("BANKING_DATA_DIR") {
            config.store.data_dir = PathBuf::from(dir);
        }

        if let Ok(parallel) = std::env::var("BANKING_MAX_PARALLEL_KEYS") {
            config.orchestrator.max_parallel_keys = parallel.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid BANKING_MAX_PARALLEL_KEYS: {}", e))
            })?;
        }

        if let Ok(attempts) = std::env::var("BANKING_RETRY_ATTEMPTS") {
            let retry = RetryConfig {
                max_attempts: attempts.parse().map_err(|e| {
                    crate::Error::Config(format!("Invalid BANKING_RETRY_ATTEMPTS: {}", e))
                })?,
                ..config.orchestrator.retry
            };
            config.orchestrator.retry = retry;
        }

        if let Ok(path) = std::env::var("BANKING_AGGREGATES_FILE") {
            config.aggregates_file = Some(PathBuf::from(path));
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouping::InterScope;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "banking-engine");
        assert_eq!(config.orchestrator.max_parallel_keys, 8);
        assert_eq!(config.orchestrator.inter_scope, InterScope::ClientDateSlot);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml = r#"
            [orchestrator]
            max_parallel_keys = 2
            inter_scope = "client-date"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.orchestrator.max_parallel_keys, 2);
        assert_eq!(config.orchestrator.inter_scope, InterScope::ClientDate);
        assert_eq!(config.schedule.run_times, vec!["02:00".to_string()]);
    }
}
