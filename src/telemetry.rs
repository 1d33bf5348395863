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

use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    error::Result,
    query::fingerprint::Fingerprint,
    rewrite::{Candidate, FallbackReason, MatchTier, Plan},
    staging::StagingManager,
};

/// File name suffix of telemetry sidecars.
pub const SIDECAR_SUFFIX: &str = ".router.json";

/// Routing and timing record of one executed query, written next to its result.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingTelemetry {
    /// Identifier of the query within its batch, e.g. `batch_q03`.
    pub query_id: String,
    /// Fingerprint of the query.
    pub fingerprint: Fingerprint,
    /// View name, or `base_table`.
    pub selected_source: String,
    /// Match tier of the executed plan.
    pub match_tier: MatchTier,
    /// Why no view was used.
    pub fallback_reason: Option<FallbackReason>,
    /// Views evaluated while planning.
    pub candidates: Vec<Candidate>,
    /// Score of the chosen view.
    pub score: u32,
    /// Sample rate, for sampled plans.
    pub sample_rate: Option<f64>,
    /// Whether the result is an estimate.
    pub approximate: bool,
    /// Whether the result came from the result cache.
    pub cached: bool,
    /// Time spent planning.
    pub routing_ms: f64,
    /// Time spent in the engine, excluding writes.
    pub execution_ms: f64,
    /// Rows returned.
    pub rows: usize,
    /// Estimated memory held by the buffered result.
    pub memory_bytes: usize,
    /// When the query finished.
    pub recorded_at: DateTime<Utc>,
}

impl RoutingTelemetry {
    /// A record for `plan`, with zero timings and counts.
    pub fn new(query_id: impl Into<String>, fingerprint: Fingerprint, plan: &Plan) -> Self {
        Self {
            query_id: query_id.into(),
            fingerprint,
            selected_source: plan.source.to_string(),
            match_tier: plan.match_tier,
            fallback_reason: plan.fallback_reason,
            candidates: plan.candidates.clone(),
            score: plan.score,
            sample_rate: plan.sample_rate,
            approximate: plan.approximate,
            cached: false,
            routing_ms: 0.0,
            execution_ms: 0.0,
            rows: 0,
            memory_bytes: 0,
            recorded_at: Utc::now(),
        }
    }

    /// Whether the query was answered from a view.
    pub fn view_hit(&self) -> bool {
        matches!(self.match_tier, MatchTier::Exact | MatchTier::Partial)
    }

    /// Publish the record as `<query_id>.router.json` under `ready/`.
    pub fn write_sidecar(&self, staging: &StagingManager) -> Result<PathBuf> {
        let json = serde_json::to_vec_pretty(self)?;
        staging.publish_bytes(&format!("{}{SIDECAR_SUFFIX}", self.query_id), &json)
    }
}

/// Milliseconds in `duration`, with sub-millisecond precision.
pub fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Aggregate view of a set of [`RoutingTelemetry`] records.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetrySummary {
    /// Records summarized.
    pub total_queries: usize,
    /// Share answered from a view.
    pub view_hit_rate: f64,
    /// Share answered from the base table.
    pub fallback_rate: f64,
    /// Share answered from the result cache.
    pub cache_hit_rate: f64,
    /// Mean planning time.
    pub avg_routing_ms: f64,
    /// Mean engine time.
    pub avg_execution_ms: f64,
    /// Occurrences of each fallback reason.
    pub fallback_reasons: BTreeMap<String, usize>,
}

impl TelemetrySummary {
    /// Summarize `records`.
    pub fn of(records: &[RoutingTelemetry]) -> Self {
        if records.is_empty() {
            return Self::default();
        }

        let n = records.len() as f64;
        let share = |pred: &dyn Fn(&RoutingTelemetry) -> bool| {
            records.iter().filter(|r| pred(r)).count() as f64 / n
        };

        let mut fallback_reasons = BTreeMap::new();
        for reason in records.iter().filter_map(|r| r.fallback_reason) {
            let key = serde_json::to_value(reason)
                .ok()
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_else(|| format!("{reason:?}"));
            *fallback_reasons.entry(key).or_insert(0) += 1;
        }

        Self {
            total_queries: records.len(),
            view_hit_rate: share(&|r| r.view_hit()),
            fallback_rate: share(&|r| !r.view_hit()),
            cache_hit_rate: share(&|r| r.cached),
            avg_routing_ms: records.iter().map(|r| r.routing_ms).sum::<f64>() / n,
            avg_execution_ms: records.iter().map(|r| r.execution_ms).sum::<f64>() / n,
            fallback_reasons,
        }
    }
}
