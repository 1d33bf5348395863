// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

use std::{path::PathBuf, time::Duration};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Top-level configuration for an [`MvRouter`](crate::service::MvRouter).
///
/// Every field has a default, so a config file only needs to name what it overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Root directory holding `staging/`, `ready/` and the registry snapshots.
    pub state_dir: PathBuf,
    /// Name under which the raw event table is registered in the engine.
    pub base_table: String,
    /// Score increments used by the matching engine.
    pub scoring: ScoringWeights,
    /// When and how to fall back to sampling.
    pub sampling: SamplingPolicy,
    /// Limits for [`BatchExecutor`](crate::batch::BatchExecutor).
    pub batch: BatchLimits,
    /// Worker pool and queue sizing.
    pub pipeline: PipelineConfig,
    /// Spot-check parameters for the integrity checker.
    pub integrity: IntegrityConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("mv_state"),
            base_table: "events".to_string(),
            scoring: ScoringWeights::default(),
            sampling: SamplingPolicy::default(),
            batch: BatchLimits::default(),
            pipeline: PipelineConfig::default(),
            integrity: IntegrityConfig::default(),
        }
    }
}

impl RouterConfig {
    /// Load a config from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid router config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a JSON file on disk.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("couldn't read {}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    fn validate(&self) -> Result<()> {
        if self.batch.max_batch_size == 0 {
            return Err(Error::Config("batch.max_batch_size must be positive".into()));
        }
        if self.pipeline.workers == 0 {
            return Err(Error::Config("pipeline.workers must be positive".into()));
        }
        if !(self.sampling.rate > 0.0 && self.sampling.rate <= 1.0) {
            return Err(Error::Config(format!(
                "sampling.rate must be in (0, 1], got {}",
                self.sampling.rate
            )));
        }
        Ok(())
    }
}

/// Score increments for candidate views.
///
/// The defaults are empirical and carry no meaning beyond their relative order.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    /// Awarded when the view's dimensions equal the query's grouping.
    pub exact_dimensions: u32,
    /// Awarded when the view is finer than the query's grouping.
    pub partial_dimensions: u32,
    /// Awarded per requested aggregate the view can serve.
    pub measure: u32,
    /// Awarded per query filter already baked into the view.
    pub prefilter: u32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            exact_dimensions: 50,
            partial_dimensions: 30,
            measure: 20,
            prefilter: 10,
        }
    }
}

/// Decides when an unmatched query is answered approximately.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplingPolicy {
    /// Fraction of base rows read by a sampling plan.
    pub rate: f64,
    /// Grouping columns whose presence marks a query as high cardinality.
    pub high_cardinality_columns: Vec<String>,
    /// Columns that count as time filters.
    pub time_columns: Vec<String>,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            rate: 0.1,
            high_cardinality_columns: vec![
                "user_id".to_string(),
                "auction_id".to_string(),
                "minute".to_string(),
            ],
            time_columns: vec![
                "day".to_string(),
                "week".to_string(),
                "hour".to_string(),
                "ts".to_string(),
            ],
        }
    }
}

/// Limits applied to one call of `execute_batch`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchLimits {
    /// Largest batch accepted.
    pub max_batch_size: usize,
    /// Budget for buffered results, in megabytes.
    pub max_memory_mb: u64,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_batch_size: 20,
            max_memory_mb: 4096,
        }
    }
}

/// Sizing of the build worker pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of build workers.
    pub workers: usize,
    /// Maximum number of queued build tasks.
    pub queue_capacity: usize,
    /// Default bound for waiting on outstanding builds, in seconds.
    pub wait_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 64,
            wait_timeout_secs: 300,
        }
    }
}

impl PipelineConfig {
    /// [`Self::wait_timeout_secs`] as a [`Duration`].
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

/// Spot-check parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    /// Number of view keys sampled per check.
    pub sample_size: usize,
    /// Absolute tolerance when comparing measures.
    pub tolerance: f64,
    /// Mixed with the view name to order the sample; the same seed samples the same keys.
    pub seed: String,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            sample_size: 50,
            tolerance: 1e-6,
            seed: String::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::RouterConfig;

    #[test]
    fn partial_config_keeps_defaults() {
        let config = RouterConfig::from_json(
            r#"{ "base_table": "events_v", "batch": { "max_batch_size": 5 } }"#,
        )
        .unwrap();

        assert_eq!(config.base_table, "events_v");
        assert_eq!(config.batch.max_batch_size, 5);
        assert_eq!(config.batch.max_memory_mb, 4096);
        assert_eq!(config.scoring.exact_dimensions, 50);
        assert_eq!(config.sampling.rate, 0.1);
    }

    #[test]
    fn rejects_out_of_range_sample_rate() {
        let err = RouterConfig::from_json(r#"{ "sampling": { "rate": 1.5 } }"#).unwrap_err();
        assert!(err.to_string().contains("sampling.rate"));
    }
}
