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

/*!
Bounded execution of query batches.

A batch runs in two phases. The compute phase routes, renders and executes every query on its own
engine context and buffers the results in memory, tracking an estimate of the memory they hold.
The write phase, entered only once every query has been computed, publishes each result as CSV
together with a telemetry sidecar through the staging directory. Compute timings therefore never
include file I/O, and a batch that fails during compute leaves nothing behind under `ready/`.
*/

use std::{
    fs::File,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use arrow::{csv::WriterBuilder, record_batch::RecordBatch};

use crate::{
    catalog::{analyzer::WorkloadAnalyzer, MvCatalog},
    config::BatchLimits,
    engine::{ExecutionEngine, ResultSet},
    error::{Error, Result},
    health::HealthRegistry,
    query::{
        fingerprint::{Fingerprint, ResultCache},
        Query,
    },
    rewrite::{sql, FallbackReason, Plan, Planner},
    staging::StagingManager,
    telemetry::{millis, RoutingTelemetry, TelemetrySummary},
};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Result of one query of a batch.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    /// `<batch_id>_qNN`.
    pub query_id: String,
    /// Plan that produced the result, after any re-planning.
    pub plan: Plan,
    /// SQL sent to the engine; empty for cached results.
    pub sql: String,
    /// Buffered rows.
    pub result: ResultSet,
    /// Routing and timing record.
    pub telemetry: RoutingTelemetry,
    /// Published CSV.
    pub output_path: PathBuf,
    /// Published telemetry sidecar.
    pub sidecar_path: PathBuf,
}

/// Result of a whole batch.
#[derive(Debug, Clone)]
pub struct BatchResult {
    /// Batch identifier, the prefix of every output file.
    pub batch_id: String,
    /// One entry per query, in submission order.
    pub outcomes: Vec<QueryOutcome>,
    /// Wall time of the compute phase.
    pub compute_time: Duration,
    /// Wall time of the write phase.
    pub write_time: Duration,
    /// Estimated memory held by the buffered results.
    pub memory_bytes: usize,
    /// Summary of the batch's telemetry.
    pub summary: TelemetrySummary,
}

/// A computed query whose result is held in memory and not yet written.
#[derive(Debug, Clone)]
pub struct BufferedResult {
    /// `<batch_id>_qNN`.
    pub query_id: String,
    /// Plan that produced the result, after any re-planning.
    pub plan: Plan,
    /// SQL sent to the engine; empty for cached results.
    pub sql: String,
    /// Buffered rows.
    pub result: ResultSet,
    /// Routing and timing record.
    pub telemetry: RoutingTelemetry,
}

/// Runs batches of queries against views or the base table.
#[derive(Debug)]
pub struct BatchExecutor {
    base_table: String,
    limits: BatchLimits,
    planner: Planner,
    catalog: Arc<MvCatalog>,
    health: Arc<HealthRegistry>,
    engine: Arc<dyn ExecutionEngine>,
    staging: StagingManager,
    cache: Arc<ResultCache>,
    analyzer: Option<Arc<WorkloadAnalyzer>>,
}

impl BatchExecutor {
    /// Create an executor.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        base_table: impl Into<String>,
        limits: BatchLimits,
        planner: Planner,
        catalog: Arc<MvCatalog>,
        health: Arc<HealthRegistry>,
        engine: Arc<dyn ExecutionEngine>,
        staging: StagingManager,
        cache: Arc<ResultCache>,
    ) -> Self {
        Self {
            base_table: base_table.into(),
            limits,
            planner,
            catalog,
            health,
            engine,
            staging,
            cache,
            analyzer: None,
        }
    }

    /// Record every routed query in `analyzer`.
    pub fn with_analyzer(mut self, analyzer: Arc<WorkloadAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// Run `queries` and publish their results as `ready/<batch_id>_qNN.csv`.
    ///
    /// Batches larger than the configured limit are rejected before anything runs. If the
    /// buffered results outgrow the memory budget, the remaining queries are skipped, nothing is
    /// written and the results computed so far are handed back in
    /// [`Error::MemoryBudgetExceeded`]. A query that fails on a view is retried once against the
    /// base table; a failure against the base table aborts the batch.
    pub async fn execute(&self, batch_id: &str, queries: &[Query]) -> Result<BatchResult> {
        if queries.len() > self.limits.max_batch_size {
            return Err(Error::BatchTooLarge {
                size: queries.len(),
                limit: self.limits.max_batch_size,
            });
        }

        let compute_started = Instant::now();
        let mut computed = Vec::with_capacity(queries.len());
        let mut memory_bytes = 0;

        for (i, query) in queries.iter().enumerate() {
            let query_id = format!("{batch_id}_q{i:02}");
            let entry = self.compute(query_id, query).await?;

            memory_bytes += entry.telemetry.memory_bytes;
            computed.push(entry);
            let used_mb = memory_bytes as f64 / BYTES_PER_MB;
            if used_mb > self.limits.max_memory_mb as f64 {
                log::warn!(
                    "batch {batch_id} exceeded its memory budget after {} of {} queries",
                    i + 1,
                    queries.len()
                );
                return Err(Error::MemoryBudgetExceeded {
                    used_mb,
                    limit_mb: self.limits.max_memory_mb,
                    buffered: computed,
                });
            }
        }
        let compute_time = compute_started.elapsed();

        let write_started = Instant::now();
        let mut outcomes = Vec::with_capacity(computed.len());
        for entry in computed {
            let output_path = self.write_csv(&entry.query_id, &entry.result)?;
            let sidecar_path = entry.telemetry.write_sidecar(&self.staging)?;
            outcomes.push(QueryOutcome {
                query_id: entry.query_id,
                plan: entry.plan,
                sql: entry.sql,
                result: entry.result,
                telemetry: entry.telemetry,
                output_path,
                sidecar_path,
            });
        }
        let write_time = write_started.elapsed();

        let records = outcomes.iter().map(|o| o.telemetry.clone()).collect::<Vec<_>>();
        log::info!(
            "batch {batch_id}: {} queries, compute {compute_time:?}, write {write_time:?}, {:.1}MB buffered",
            outcomes.len(),
            memory_bytes as f64 / BYTES_PER_MB
        );

        Ok(BatchResult {
            batch_id: batch_id.to_string(),
            outcomes,
            compute_time,
            write_time,
            memory_bytes,
            summary: TelemetrySummary::of(&records),
        })
    }

    async fn compute(&self, query_id: String, query: &Query) -> Result<BufferedResult> {
        let fingerprint = Fingerprint::of(query);

        let routing_started = Instant::now();
        let mut plan = self.planner.plan(query, &self.catalog, &self.health, None);
        let routing_ms = millis(routing_started.elapsed());
        log::debug!(
            "{query_id} ({}) routed to {} as {:?}",
            fingerprint.short(),
            plan.source,
            plan.match_tier
        );
        if let Some(analyzer) = &self.analyzer {
            analyzer.record(query, plan.view_name().is_some());
        }

        if let Some(result) = self.cache.get(&fingerprint, query)? {
            log::debug!("{query_id} answered from the result cache");
            let mut telemetry = RoutingTelemetry::new(&query_id, fingerprint, &plan);
            telemetry.cached = true;
            telemetry.routing_ms = routing_ms;
            telemetry.rows = result.num_rows();
            telemetry.memory_bytes = result.memory_size();
            return Ok(BufferedResult {
                query_id,
                plan,
                sql: String::new(),
                result,
                telemetry,
            });
        }

        let execution_started = Instant::now();
        let (sql, result) = match self.run(query, &plan).await {
            Ok(done) => done,
            Err(e) if plan.view_name().is_some() => {
                log::warn!(
                    "{query_id} failed on {}, falling back to the base table: {e}",
                    plan.source
                );
                plan = Plan::full_scan(
                    query,
                    FallbackReason::ViewExecutionFailed,
                    std::mem::take(&mut plan.candidates),
                );
                self.run(query, &plan).await?
            }
            Err(e) => return Err(e),
        };
        let execution_ms = millis(execution_started.elapsed());

        if !plan.approximate {
            self.cache.insert(fingerprint.clone(), query, result.clone());
        }

        let mut telemetry = RoutingTelemetry::new(&query_id, fingerprint, &plan);
        telemetry.routing_ms = routing_ms;
        telemetry.execution_ms = execution_ms;
        telemetry.rows = result.num_rows();
        telemetry.memory_bytes = result.memory_size();

        Ok(BufferedResult {
            query_id,
            plan,
            sql,
            result,
            telemetry,
        })
    }

    async fn run(&self, query: &Query, plan: &Plan) -> Result<(String, ResultSet)> {
        let view = plan.view_name().and_then(|name| self.catalog.get(name));
        let sql = sql::render(query, plan, view.as_deref(), &self.base_table)?;
        let ctx = self.engine.context().await?;
        let result = ctx.execute(&sql).await?;
        Ok((sql, result))
    }

    fn write_csv(&self, query_id: &str, result: &ResultSet) -> Result<PathBuf> {
        let staged = self.staging.stage(&format!("{query_id}.csv"));
        let mut writer = WriterBuilder::new()
            .with_header(true)
            .build(File::create(staged.path())?);

        if result.batches.is_empty() {
            // still emit the header
            writer.write(&RecordBatch::new_empty(Arc::clone(&result.schema)))?;
        }
        for batch in &result.batches {
            writer.write(batch)?;
        }
        drop(writer);

        staged.promote()
    }
}

#[cfg(test)]
mod test {
    use std::{collections::HashSet, fs, sync::Arc};

    use arrow::{
        array::{Float64Array, StringArray},
        record_batch::RecordBatch,
    };
    use arrow_schema::{DataType, Field, Schema};
    use datafusion::datasource::MemTable;

    use super::BatchExecutor;
    use crate::{
        catalog::{analyzer::WorkloadAnalyzer, MvCatalog},
        config::BatchLimits,
        engine::{BaseTable, DataFusionEngine},
        error::Error,
        health::{HealthRegistry, MvStatus, StatusUpdate},
        query::{fingerprint::ResultCache, Query},
        rewrite::{FallbackReason, MatchTier, Planner},
        staging::StagingManager,
    };

    struct Fixture {
        _dir: tempfile::TempDir,
        staging: StagingManager,
        health: Arc<HealthRegistry>,
        executor: BatchExecutor,
        analyzer: Arc<WorkloadAnalyzer>,
    }

    fn fixture(limits: BatchLimits) -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();

        let batch = RecordBatch::try_new(
            Arc::new(Schema::new(vec![
                Field::new("day", DataType::Utf8, false),
                Field::new("type", DataType::Utf8, false),
                Field::new("bid_price", DataType::Float64, false),
            ])),
            vec![
                Arc::new(StringArray::from(vec!["d1", "d1", "d2"])),
                Arc::new(StringArray::from(vec!["impression", "click", "impression"])),
                Arc::new(Float64Array::from(vec![1.0, 2.0, 4.0])),
            ],
        )
        .unwrap();
        let table = MemTable::try_new(batch.schema(), vec![vec![batch]]).unwrap();

        let columns: HashSet<String> = ["day", "type", "bid_price"].map(String::from).into();
        let catalog = Arc::new(
            MvCatalog::from_json(
                r#"{"mv_day": {"dimensions": ["day"], "measures": ["sum_bid_price", "count"]}}"#,
                &columns,
            )
            .unwrap(),
        );

        let health = Arc::new(HealthRegistry::in_memory());
        let engine = Arc::new(DataFusionEngine::new(
            "events",
            BaseTable::Provider(Arc::new(table)),
            Arc::clone(&health),
        ));
        let staging = StagingManager::new(dir.path()).unwrap();
        let analyzer = Arc::new(WorkloadAnalyzer::new());
        let executor = BatchExecutor::new(
            "events",
            limits,
            Planner::default(),
            catalog,
            Arc::clone(&health),
            engine,
            staging.clone(),
            Arc::new(ResultCache::new(16)),
        )
        .with_analyzer(Arc::clone(&analyzer));

        Fixture {
            _dir: dir,
            staging,
            health,
            executor,
            analyzer,
        }
    }

    fn revenue_by_day() -> Query {
        Query::from_json(
            r#"{"select": ["day", {"SUM": "bid_price", "as": "revenue"}],
                "group_by": ["day"], "order_by": [{"col": "day"}]}"#,
        )
        .unwrap()
    }

    fn published(staging: &StagingManager) -> usize {
        fs::read_dir(staging.ready_dir()).unwrap().count()
            + fs::read_dir(staging.staging_dir()).unwrap().count()
    }

    #[tokio::test]
    async fn oversized_batches_are_rejected_without_output() {
        let f = fixture(BatchLimits {
            max_batch_size: 2,
            ..Default::default()
        });
        let queries = vec![revenue_by_day(); 3];

        let err = f.executor.execute("b0", &queries).await.unwrap_err();
        assert!(matches!(err, Error::BatchTooLarge { size: 3, limit: 2 }));
        assert_eq!(published(&f.staging), 0);
        assert_eq!(f.analyzer.observed(), 0);
    }

    #[tokio::test]
    async fn writes_csv_and_sidecars_after_compute() {
        let f = fixture(BatchLimits::default());
        let result = f
            .executor
            .execute("b1", &[revenue_by_day()])
            .await
            .unwrap();

        let outcome = &result.outcomes[0];
        assert_eq!(outcome.plan.match_tier, MatchTier::FullScan);
        assert_eq!(outcome.output_path, f.staging.ready_path("b1_q00.csv"));
        let csv = fs::read_to_string(&outcome.output_path).unwrap();
        assert!(csv.starts_with("day,revenue\nd1,3"), "{csv}");
        assert_eq!(csv.lines().count(), 3);
        let sidecar: serde_json::Value =
            serde_json::from_slice(&fs::read(&outcome.sidecar_path).unwrap()).unwrap();
        assert_eq!(sidecar["selected_source"], "base_table");
        assert_eq!(sidecar["fallback_reason"], "no_candidates");
        assert_eq!(sidecar["rows"], 2);
        assert_eq!(fs::read_dir(f.staging.staging_dir()).unwrap().count(), 0);

        // a repeat is served from the cache
        let again = f
            .executor
            .execute("b2", &[revenue_by_day()])
            .await
            .unwrap();
        assert!(again.outcomes[0].telemetry.cached);
        assert_eq!(again.outcomes[0].result.num_rows(), 2);
        assert_eq!(again.summary.cache_hit_rate, 1.0);
    }

    #[tokio::test]
    async fn memory_budget_keeps_buffered_results_unwritten() {
        let f = fixture(BatchLimits {
            max_batch_size: 20,
            max_memory_mb: 0,
        });
        let err = f
            .executor
            .execute("b3", &[revenue_by_day(), revenue_by_day()])
            .await
            .unwrap_err();

        let (limit_mb, buffered) = match err {
            Error::MemoryBudgetExceeded {
                limit_mb, buffered, ..
            } => (limit_mb, buffered),
            other => panic!("expected a memory breach, got {other}"),
        };
        assert_eq!(limit_mb, 0);
        // the first result already crosses a zero budget, the second query never runs
        assert_eq!(buffered.len(), 1);
        assert_eq!(buffered[0].query_id, "b3_q00");
        assert_eq!(buffered[0].result.num_rows(), 2);
        assert!(buffered[0].telemetry.memory_bytes > 0);
        assert_eq!(published(&f.staging), 0);
    }

    #[tokio::test]
    async fn failing_view_falls_back_to_base_table() {
        let f = fixture(BatchLimits::default());
        // READY without an artifact, so the view is never registered in the engine
        f.health
            .set_status("mv_day", MvStatus::Ready, StatusUpdate::default())
            .unwrap();

        let result = f
            .executor
            .execute("b4", &[revenue_by_day()])
            .await
            .unwrap();
        let outcome = &result.outcomes[0];
        assert_eq!(outcome.plan.match_tier, MatchTier::FullScan);
        assert_eq!(
            outcome.plan.fallback_reason,
            Some(FallbackReason::ViewExecutionFailed)
        );
        assert_eq!(outcome.result.num_rows(), 2);
        assert!(outcome.sql.contains("FROM \"events\""));
    }

    #[tokio::test]
    async fn base_table_failures_abort_the_batch() {
        let f = fixture(BatchLimits::default());
        let bad = Query::from_json(r#"{"select": ["missing"]}"#).unwrap();

        assert!(f
            .executor
            .execute("b5", &[revenue_by_day(), bad])
            .await
            .is_err());
        assert_eq!(published(&f.staging), 0);
    }
}
