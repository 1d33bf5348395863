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

use std::sync::Arc;

use arrow::{
    array::{Array, Int64Array},
    compute::cast,
    record_batch::RecordBatch,
};
use arrow_schema::DataType;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::Serialize;
use serde_json::Value;

use crate::{
    catalog::MvDescriptor,
    config::IntegrityConfig,
    engine::ExecutionEngine,
    error::{Error, Result},
    rewrite::sql::{self, quote_ident},
};

/// Classification of one spot check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckOutcome {
    /// Every sampled key matched.
    Ok,
    /// At least one sampled key mismatched.
    Stale,
    /// Nothing could be checked.
    Error,
}

/// Result of checking one view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrityReport {
    /// Checked view.
    pub mv_name: String,
    /// Classification.
    pub outcome: CheckOutcome,
    /// Keys sampled.
    pub total_checked: usize,
    /// Keys whose measures differ from a recomputation.
    pub mismatched: usize,
    /// Engine error, or why nothing was checked.
    pub error: Option<String>,
    /// When the check ran.
    pub checked_at: DateTime<Utc>,
}

impl IntegrityReport {
    /// Keys that matched.
    pub fn matched(&self) -> usize {
        self.total_checked.saturating_sub(self.mismatched)
    }

    fn error(mv_name: &str, error: impl ToString) -> Self {
        Self {
            mv_name: mv_name.to_string(),
            outcome: CheckOutcome::Error,
            total_checked: 0,
            mismatched: 0,
            error: Some(error.to_string()),
            checked_at: Utc::now(),
        }
    }
}

/// Compares a random sample of a view's rows with the same aggregates recomputed from the base table.
///
/// Only the sampled keys are recomputed: base rows are joined against the sampled dimension values
/// before aggregation.
#[derive(Debug, Clone)]
pub struct IntegrityChecker {
    engine: Arc<dyn ExecutionEngine>,
    base_table: String,
    config: IntegrityConfig,
}

impl IntegrityChecker {
    /// Create a checker.
    pub fn new(
        engine: Arc<dyn ExecutionEngine>,
        base_table: impl Into<String>,
        config: IntegrityConfig,
    ) -> Self {
        Self {
            engine,
            base_table: base_table.into(),
            config,
        }
    }

    /// Spot-check `view`. Engine failures are reported as [`CheckOutcome::Error`], never returned.
    pub async fn check(&self, view: &MvDescriptor) -> IntegrityReport {
        match self.try_check(view).await {
            Ok((0, _)) => IntegrityReport::error(view.name(), "no rows sampled"),
            Ok((total_checked, mismatched)) => IntegrityReport {
                mv_name: view.name().to_string(),
                outcome: if mismatched == 0 {
                    CheckOutcome::Ok
                } else {
                    CheckOutcome::Stale
                },
                total_checked,
                mismatched,
                error: None,
                checked_at: Utc::now(),
            },
            Err(e) => {
                log::warn!("integrity check of {} failed: {e}", view.name());
                IntegrityReport::error(view.name(), e)
            }
        }
    }

    async fn try_check(&self, view: &MvDescriptor) -> Result<(usize, usize)> {
        let ctx = self.engine.context().await?;
        let result = ctx.execute(&self.comparison_sql(view)).await?;
        let [total, mismatched] = first_row_counts(&result.batches)?;
        Ok((total as usize, mismatched as usize))
    }

    /// A single query returning `total` sampled keys and how many of them `mismatched`.
    fn comparison_sql(&self, view: &MvDescriptor) -> String {
        let dimensions = view.dimensions().iter().map(|d| quote_ident(d)).collect_vec();

        // the sample is referenced twice, so its order must be deterministic within the query
        let seed = sql::literal(&Value::String(format!(
            "{}:{}",
            self.config.seed,
            view.name()
        )));
        let order = if dimensions.is_empty() {
            String::new()
        } else {
            format!(
                " ORDER BY md5(concat_ws('|', {seed}, {}))",
                dimensions
                    .iter()
                    .map(|d| format!("CAST({d} AS VARCHAR)"))
                    .join(", ")
            )
        };
        let sample = format!(
            "SELECT * FROM {}{order} LIMIT {}",
            quote_ident(view.name()),
            self.config.sample_size
        );

        let recomputed = if dimensions.is_empty() || view.definition().is_some() {
            sql::definition(view, &self.base_table)
        } else {
            let keys = dimensions
                .iter()
                .map(|d| format!("(b.{d} IS NOT DISTINCT FROM k.{d})"))
                .join(" AND ");
            let fixed = view
                .fixed_filters()
                .iter()
                .map(|(col, val)| format!(" AND (b.{} = {})", quote_ident(col), sql::literal(val)))
                .join("");
            let measures = view
                .measures()
                .iter()
                .map(|m| {
                    let arg = m
                        .source_column()
                        .map_or("*".to_string(), |c| format!("b.{}", quote_ident(c)));
                    format!("{}({arg}) AS {}", m.function(), quote_ident(m.column_name()))
                })
                .join(", ");
            format!(
                "SELECT {}, {measures} FROM {} b JOIN (SELECT DISTINCT {} FROM sample) k ON {keys}{fixed} GROUP BY {}",
                dimensions.iter().map(|d| format!("b.{d} AS {d}")).join(", "),
                quote_ident(&self.base_table),
                dimensions.join(", "),
                dimensions.iter().map(|d| format!("b.{d}")).join(", "),
            )
        };

        let join = if dimensions.is_empty() {
            "TRUE".to_string()
        } else {
            dimensions
                .iter()
                .map(|d| format!("(s.{d} IS NOT DISTINCT FROM r.{d})"))
                .join(" AND ")
        };

        let tolerance = self.config.tolerance;
        let mismatch = view
            .measures()
            .iter()
            .map(|m| {
                let c = quote_ident(m.column_name());
                format!(
                    "(NOT (s.{c} IS NULL AND r.{c} IS NULL) AND \
                     (s.{c} IS NULL OR r.{c} IS NULL OR \
                     abs(CAST(s.{c} AS DOUBLE) - CAST(r.{c} AS DOUBLE)) > {tolerance:.15}))"
                )
            })
            .join(" OR ");

        format!(
            "WITH sample AS ({sample}), recomputed AS ({recomputed}) \
             SELECT COUNT(*) AS total, \
             COALESCE(SUM(CASE WHEN {mismatch} THEN 1 ELSE 0 END), 0) AS mismatched \
             FROM sample s LEFT JOIN recomputed r ON {join}"
        )
    }
}

fn first_row_counts(batches: &[RecordBatch]) -> Result<[i64; 2]> {
    let batch = batches
        .iter()
        .find(|b| b.num_rows() > 0)
        .ok_or_else(|| Error::InvalidQuery("integrity query returned no rows".into()))?;

    let value = |i: usize| -> Result<i64> {
        let column = cast(batch.column(i), &DataType::Int64)?;
        let values = column
            .as_any()
            .downcast_ref::<Int64Array>()
            .ok_or_else(|| Error::InvalidQuery("integrity counts are not integers".into()))?;
        Ok(if values.is_null(0) { 0 } else { values.value(0) })
    };

    Ok([value(0)?, value(1)?])
}
