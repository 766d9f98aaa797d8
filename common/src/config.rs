use serde::{Deserialize, Serialize};

use crate::error::Error;

/// How statements are grouped into batches.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchMode {
    /// Group by routing token, or routing key bytes when no token is known.
    Partition,
    /// Group by the set of replicas owning the statement's token.
    ReplicaSet,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    FailFast,
    FailSafe,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BatchConfig {
    pub mode: BatchMode,
    /// Negative means unbounded.
    pub max_batch_statements: i64,
    /// Negative means unbounded.
    pub max_size_in_bytes: i64,
}

impl BatchConfig {
    pub fn max_statements(&self) -> Option<usize> {
        bound(self.max_batch_statements)
    }

    pub fn max_bytes(&self) -> Option<usize> {
        bound(self.max_size_in_bytes)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            mode: BatchMode::Partition,
            max_batch_statements: 32,
            max_size_in_bytes: -1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecutorConfig {
    pub max_retries: u32,
    pub mode: ExecutionMode,
    /// Zero or negative means unbounded.
    pub max_in_flight: i64,
    pub continuous_paging: bool,
    pub page_size: i32,
}

impl ExecutorConfig {
    pub fn max_in_flight(&self) -> Option<usize> {
        if self.max_in_flight <= 0 {
            None
        } else {
            Some(self.max_in_flight as usize)
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            max_retries: 10,
            mode: ExecutionMode::FailFast,
            max_in_flight: 1024,
            continuous_paging: true,
            page_size: 5000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PartitionerConfig {
    /// Target number of token range splits for a full ring scan. Derived
    /// from the available parallelism when unset.
    pub split_count: Option<usize>,
    pub max_groups_per_replica: usize,
}

impl Default for PartitionerConfig {
    fn default() -> Self {
        PartitionerConfig {
            split_count: None,
            max_groups_per_replica: 1,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub batch: BatchConfig,
    pub executor: ExecutorConfig,
    pub partitioner: PartitionerConfig,
}

impl Config {
    pub fn from_json_str(json: &str) -> Result<Config, Error> {
        let config: Config =
            serde_json::from_str(json).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.executor.page_size <= 0 {
            return Err(Error::InvalidConfig(format!(
                "executor.pageSize must be positive, got {}",
                self.executor.page_size
            )));
        }
        if self.partitioner.max_groups_per_replica == 0 {
            return Err(Error::InvalidConfig(
                "partitioner.maxGroupsPerReplica must be at least 1".to_string(),
            ));
        }
        if self.partitioner.split_count == Some(0) {
            return Err(Error::InvalidConfig(
                "partitioner.splitCount must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn bound(value: i64) -> Option<usize> {
    if value < 0 {
        None
    } else {
        Some(value as usize)
    }
}
