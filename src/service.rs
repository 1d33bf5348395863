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

use std::{collections::HashSet, sync::Arc, time::Duration};

use uuid::Uuid;

use crate::{
    batch::{BatchExecutor, BatchResult},
    build::{BuildPipeline, BuildReport},
    catalog::{
        analyzer::{MvSuggestion, WorkloadAnalyzer},
        MvCatalog, MvDescriptor,
    },
    config::RouterConfig,
    engine::{BaseTable, DataFusionEngine, ExecutionEngine},
    error::{Error, Result},
    health::{
        freshness::FreshnessMonitor,
        integrity::{IntegrityChecker, IntegrityReport},
        HealthRegistry, MvHealthRecord,
    },
    query::{fingerprint::ResultCache, Query},
    rewrite::{Plan, Planner},
    schema::SchemaRegistry,
    staging::StagingManager,
};

/// File name of the health registry snapshot under the state directory.
pub const HEALTH_REGISTRY_FILE: &str = "mv_build_registry.json";
/// File name of the schema registry snapshot under the state directory.
pub const SCHEMA_REGISTRY_FILE: &str = "schema_registry.json";

const RESULT_CACHE_CAPACITY: usize = 256;

/// Routes queries to materialized views and keeps those views built and healthy.
///
/// All state lives under [`RouterConfig::state_dir`]:
///
/// ```text
/// mv_build_registry.json   health records
/// schema_registry.json     view schema signatures
/// staging/                 in-progress artifacts
/// ready/                   published views and batch outputs
/// ```
#[derive(Debug)]
pub struct MvRouter {
    config: RouterConfig,
    base_columns: HashSet<String>,
    catalog: Arc<MvCatalog>,
    health: Arc<HealthRegistry>,
    schemas: Arc<SchemaRegistry>,
    staging: StagingManager,
    planner: Planner,
    pipeline: BuildPipeline,
    batches: BatchExecutor,
    integrity: IntegrityChecker,
    freshness: Option<FreshnessMonitor>,
    analyzer: Arc<WorkloadAnalyzer>,
}

impl MvRouter {
    /// Open a router over `base_table` with the views of the JSON catalog `catalog_json`.
    ///
    /// The catalog is validated against the base table's columns.
    pub async fn open(config: RouterConfig, base_table: BaseTable, catalog_json: &str) -> Result<Self> {
        let columns = base_columns(&config, &base_table).await?;
        let catalog = MvCatalog::from_json(catalog_json, &columns)?;
        Self::with_catalog(config, base_table, catalog).await
    }

    /// Open a router with an already loaded catalog.
    ///
    /// Registries are restored from the state directory and the build workers are started.
    pub async fn with_catalog(
        config: RouterConfig,
        base_table: BaseTable,
        catalog: MvCatalog,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.state_dir)?;
        let health = Arc::new(HealthRegistry::open(
            config.state_dir.join(HEALTH_REGISTRY_FILE),
        )?);
        let schemas = Arc::new(SchemaRegistry::open(
            config.state_dir.join(SCHEMA_REGISTRY_FILE),
        )?);
        let staging = StagingManager::new(&config.state_dir)?;
        let catalog = Arc::new(catalog);

        let freshness = match &base_table {
            BaseTable::Lake(lake) => Some(FreshnessMonitor::new(lake.clone())),
            BaseTable::Provider(_) => None,
        };
        let base_columns = base_columns(&config, &base_table).await?;
        let engine: Arc<dyn ExecutionEngine> = Arc::new(DataFusionEngine::new(
            config.base_table.clone(),
            base_table,
            Arc::clone(&health),
        ));

        let planner = Planner::new(config.scoring.clone(), config.sampling.clone());
        let analyzer = Arc::new(WorkloadAnalyzer::new());

        let pipeline = BuildPipeline::new(
            &config.pipeline,
            config.base_table.clone(),
            Arc::clone(&catalog),
            Arc::clone(&health),
            Arc::clone(&schemas),
            staging.clone(),
            Arc::clone(&engine),
        );
        pipeline.start();

        let batches = BatchExecutor::new(
            config.base_table.clone(),
            config.batch.clone(),
            planner.clone(),
            Arc::clone(&catalog),
            Arc::clone(&health),
            Arc::clone(&engine),
            staging.clone(),
            Arc::new(ResultCache::new(RESULT_CACHE_CAPACITY)),
        )
        .with_analyzer(Arc::clone(&analyzer));

        let integrity = IntegrityChecker::new(
            Arc::clone(&engine),
            config.base_table.clone(),
            config.integrity.clone(),
        );

        log::info!(
            "router over {} opened at {} with {} views",
            config.base_table,
            config.state_dir.display(),
            catalog.names().len()
        );

        Ok(Self {
            config,
            base_columns,
            catalog,
            health,
            schemas,
            staging,
            planner,
            pipeline,
            batches,
            integrity,
            freshness,
            analyzer,
        })
    }

    /// Choose a plan for `query`. Never fails; without a usable view the plan scans the base table.
    pub fn route(&self, query: &Query) -> Plan {
        let plan = self
            .planner
            .plan(query, &self.catalog, &self.health, None);
        log::debug!("routed to {} as {:?}", plan.source, plan.match_tier);
        plan
    }

    /// Like [`Self::route`], considering only the views named in `views`.
    pub fn route_within(&self, query: &Query, views: &[String]) -> Plan {
        self.planner
            .plan(query, &self.catalog, &self.health, Some(views))
    }

    /// Queue a build of `mv_name`, returning its task id.
    pub fn submit_build(&self, mv_name: &str) -> Result<String> {
        self.pipeline.submit(mv_name)
    }

    /// Health record of `mv_name`. Views that were never built report `STALE`.
    pub fn status(&self, mv_name: &str) -> Result<MvHealthRecord> {
        if self.catalog.get(mv_name).is_none() {
            return Err(Error::UnknownView(mv_name.to_string()));
        }
        Ok(self
            .health
            .record(mv_name)
            .unwrap_or_else(|| MvHealthRecord::new(mv_name)))
    }

    /// Views that are `FAILED` or `STALE`, including catalog views never built.
    pub fn unhealthy(&self) -> Vec<String> {
        let mut names = self.health.list_unhealthy();
        names.extend(
            self.catalog
                .names()
                .into_iter()
                .filter(|n| self.health.record(n).is_none()),
        );
        names.sort();
        names
    }

    /// Validate and run a batch of queries, publishing each result under `ready/`.
    pub async fn execute_batch(&self, queries: &[Query]) -> Result<BatchResult> {
        let limit = self.config.batch.max_batch_size;
        if queries.len() > limit {
            return Err(Error::BatchTooLarge {
                size: queries.len(),
                limit,
            });
        }
        for query in queries {
            query.validate_columns(&self.base_columns)?;
        }

        let batch_id = format!("batch_{}", &Uuid::new_v4().simple().to_string()[..8]);
        self.batches.execute(&batch_id, queries).await
    }

    /// Wait for outstanding builds, up to the configured timeout.
    pub async fn wait_for_builds(&self) -> BuildReport {
        self.pipeline.wait(self.config.pipeline.wait_timeout()).await
    }

    /// Spot-check `mv_name` against the base table and record the outcome.
    pub async fn check_integrity(&self, mv_name: &str) -> Result<IntegrityReport> {
        let descriptor = self
            .catalog
            .get(mv_name)
            .ok_or_else(|| Error::UnknownView(mv_name.to_string()))?;
        let report = self.integrity.check(&descriptor).await;
        self.health.record_check(&report)?;
        Ok(report)
    }

    /// Mark views built before the latest base-data change as `STALE`, returning their names.
    ///
    /// Only base tables backed by a parquet lake carry modification times; for any other base
    /// table this is a no-op.
    pub async fn sweep_freshness(&self) -> Result<Vec<String>> {
        match &self.freshness {
            Some(monitor) => monitor.sweep(&self.health).await,
            None => Ok(vec![]),
        }
    }

    /// Views suggested by the workload seen so far.
    pub fn suggest_views(&self, min_frequency: usize) -> Vec<MvSuggestion> {
        self.analyzer.suggest(min_frequency)
    }

    /// Replace or add a view definition, returning the previous one.
    ///
    /// The published artifact no longer matches the definition, so the view is marked `STALE`
    /// and stops serving until it is rebuilt. Its registered schema is forgotten so the next
    /// build may change shape. Fails with [`Error::AlreadyBuilding`] while a build of the view
    /// is queued or running.
    pub fn replace_view(&self, descriptor: MvDescriptor) -> Result<Option<Arc<MvDescriptor>>> {
        descriptor.validate(&self.base_columns)?;
        let name = descriptor.name().to_string();
        self.pipeline.while_idle(&name, || {
            if self.health.mark_stale(&name, "definition replaced")? {
                log::info!("{name} marked stale until rebuilt with its new definition");
            }
            let previous = self.catalog.update(descriptor);
            self.schemas.reset(&name)?;
            Ok(previous)
        })
    }

    /// Remove staging artifacts older than `max_age`.
    pub fn cleanup_staging(&self, max_age: Duration) -> Result<usize> {
        self.staging.cleanup_staging(max_age)
    }

    /// Stop the build pipeline, waiting up to the configured timeout for running builds.
    pub async fn shutdown(&self) -> BuildReport {
        self.pipeline
            .shutdown(self.config.pipeline.wait_timeout())
            .await
    }

    /// The catalog.
    pub fn catalog(&self) -> &MvCatalog {
        &self.catalog
    }

    /// The health registry.
    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    /// The schema registry.
    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    /// The staging manager.
    pub fn staging(&self) -> &StagingManager {
        &self.staging
    }

    /// The configuration.
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }
}

async fn base_columns(config: &RouterConfig, base_table: &BaseTable) -> Result<HashSet<String>> {
    let health = Arc::new(HealthRegistry::in_memory());
    let engine = DataFusionEngine::new(config.base_table.clone(), base_table.clone(), health);
    let schema = engine
        .context()
        .await?
        .table_schema(&config.base_table)
        .await?;
    Ok(schema.fields().iter().map(|f| f.name().clone()).collect())
}
