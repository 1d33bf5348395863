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

/// Hive-partitioned parquet datasets on the local filesystem.
pub mod lake;

use std::{fmt::Debug, sync::Arc};

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use async_trait::async_trait;
use datafusion::{
    catalog::TableProvider,
    prelude::{ParquetReadOptions, SessionContext},
};

use crate::{
    error::Result,
    health::{HealthRegistry, MvStatus},
};
use lake::ParquetLake;

/// Collected output of one statement.
#[derive(Debug, Clone)]
pub struct ResultSet {
    /// Output schema, known even when no rows were produced.
    pub schema: SchemaRef,
    /// Output rows.
    pub batches: Vec<RecordBatch>,
}

impl ResultSet {
    /// Total rows across all batches.
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }

    /// In-memory size of the buffered batches, in bytes.
    pub fn memory_size(&self) -> usize {
        self.batches.iter().map(|b| b.get_array_memory_size()).sum()
    }
}

/// An isolated session of the execution engine.
///
/// One context serves one logical request and is dropped afterwards;
/// contexts are never shared between concurrent callers.
#[async_trait]
pub trait ExecutionContext: Send + Sync {
    /// Run `sql` and collect its result.
    async fn execute(&self, sql: &str) -> Result<ResultSet>;

    /// Schema of a registered table.
    async fn table_schema(&self, table: &str) -> Result<SchemaRef>;
}

/// Hands out fresh [`ExecutionContext`]s.
#[async_trait]
pub trait ExecutionEngine: Debug + Send + Sync {
    /// Create a new context with the base table and every `READY` view registered.
    async fn context(&self) -> Result<Box<dyn ExecutionContext>>;
}

/// Where the base table's rows come from.
#[derive(Debug, Clone)]
pub enum BaseTable {
    /// Any DataFusion table, e.g. a `MemTable`.
    Provider(Arc<dyn TableProvider>),
    /// A Hive-partitioned parquet dataset.
    Lake(ParquetLake),
}

/// [`ExecutionEngine`] backed by DataFusion.
///
/// Each context is a brand-new [`SessionContext`]. Published views are registered from the
/// health registry's `output_path`s at context creation, so a context sees exactly the views
/// that were `READY` when it was created. A view whose artifact cannot be read is left out of
/// the context and marked `FAILED`.
#[derive(Debug, Clone)]
pub struct DataFusionEngine {
    base_table_name: String,
    base_table: BaseTable,
    health: Arc<HealthRegistry>,
}

impl DataFusionEngine {
    /// Create an engine serving `base_table` under `base_table_name`.
    pub fn new(
        base_table_name: impl Into<String>,
        base_table: BaseTable,
        health: Arc<HealthRegistry>,
    ) -> Self {
        Self {
            base_table_name: base_table_name.into(),
            base_table,
            health,
        }
    }

    /// The base table source.
    pub fn base_table(&self) -> &BaseTable {
        &self.base_table
    }

    async fn session(&self) -> Result<SessionContext> {
        let ctx = SessionContext::new();

        match &self.base_table {
            BaseTable::Provider(provider) => {
                ctx.register_table(self.base_table_name.as_str(), Arc::clone(provider))?;
            }
            BaseTable::Lake(lake) => lake.register(&ctx, &self.base_table_name).await?,
        }

        for record in self.health.records() {
            if record.status != MvStatus::Ready {
                continue;
            }
            let Some(path) = record.output_path.as_ref().filter(|p| p.exists()) else {
                log::warn!("{} is READY but its artifact is missing", record.name);
                continue;
            };
            if let Err(e) = ctx
                .register_parquet(
                    record.name.as_str(),
                    &path.to_string_lossy(),
                    ParquetReadOptions::default(),
                )
                .await
            {
                log::warn!("skipping {}, its artifact is unreadable: {e}", record.name);
                if let Err(e) = self.health.mark_artifact_failed(
                    &record.name,
                    path,
                    format!("unreadable artifact: {e}"),
                ) {
                    log::error!("could not mark {} failed: {e}", record.name);
                }
            }
        }

        Ok(ctx)
    }
}

#[async_trait]
impl ExecutionEngine for DataFusionEngine {
    async fn context(&self) -> Result<Box<dyn ExecutionContext>> {
        Ok(Box::new(DataFusionContext {
            ctx: self.session().await?,
        }))
    }
}

struct DataFusionContext {
    ctx: SessionContext,
}

#[async_trait]
impl ExecutionContext for DataFusionContext {
    async fn execute(&self, sql: &str) -> Result<ResultSet> {
        log::trace!("executing {sql}");
        let df = self.ctx.sql(sql).await?;
        let schema = Arc::clone(df.schema().inner());
        let batches = df.collect().await?;
        Ok(ResultSet { schema, batches })
    }

    async fn table_schema(&self, table: &str) -> Result<SchemaRef> {
        let df = self.ctx.table(table).await?;
        Ok(Arc::clone(df.schema().inner()))
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use arrow::{
        array::{Float64Array, StringArray},
        record_batch::RecordBatch,
    };
    use arrow_schema::{DataType, Field, Schema};
    use datafusion::{datasource::MemTable, parquet::arrow::ArrowWriter};

    use super::{BaseTable, DataFusionEngine, ExecutionEngine};
    use crate::health::{HealthRegistry, MvStatus, StatusUpdate};

    fn events() -> RecordBatch {
        RecordBatch::try_new(
            Arc::new(Schema::new(vec![
                Field::new("type", DataType::Utf8, false),
                Field::new("bid_price", DataType::Float64, false),
            ])),
            vec![
                Arc::new(StringArray::from(vec!["impression", "click", "impression"])),
                Arc::new(Float64Array::from(vec![1.0, 2.0, 4.0])),
            ],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn contexts_see_only_ready_views() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();

        let batch = events();
        let table = MemTable::try_new(batch.schema(), vec![vec![batch.clone()]]).unwrap();
        let health = Arc::new(HealthRegistry::in_memory());
        let engine = DataFusionEngine::new(
            "events",
            BaseTable::Provider(Arc::new(table)),
            Arc::clone(&health),
        );

        let path = dir.path().join("mv_copy.parquet");
        let mut writer = ArrowWriter::try_new(
            std::fs::File::create(&path).unwrap(),
            batch.schema(),
            None,
        )
        .unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let ctx = engine.context().await.unwrap();
        let result = ctx
            .execute("SELECT * FROM \"events\" WHERE \"type\" = 'impression'")
            .await
            .unwrap();
        assert_eq!(result.num_rows(), 2);
        assert_eq!(result.schema.fields().len(), 2);
        assert!(ctx.execute("SELECT * FROM \"mv_copy\"").await.is_err());

        health
            .set_status(
                "mv_copy",
                MvStatus::Ready,
                StatusUpdate {
                    output_path: Some(path),
                    ..Default::default()
                },
            )
            .unwrap();

        // the earlier context is unaffected; a new one sees the view
        assert!(ctx.execute("SELECT * FROM \"mv_copy\"").await.is_err());
        let fresh = engine.context().await.unwrap();
        let schema = fresh.table_schema("mv_copy").await.unwrap();
        assert_eq!(schema.field(1).name(), "bid_price");
    }

    #[tokio::test]
    async fn unreadable_artifacts_fail_the_view_not_the_context() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();

        let batch = events();
        let table = MemTable::try_new(batch.schema(), vec![vec![batch]]).unwrap();
        let health = Arc::new(HealthRegistry::in_memory());
        let engine = DataFusionEngine::new(
            "events",
            BaseTable::Provider(Arc::new(table)),
            Arc::clone(&health),
        );

        let path = dir.path().join("mv_broken.parquet");
        std::fs::write(&path, b"not a parquet file").unwrap();
        health
            .set_status(
                "mv_broken",
                MvStatus::Ready,
                StatusUpdate {
                    output_path: Some(path),
                    ..Default::default()
                },
            )
            .unwrap();

        let ctx = engine.context().await.unwrap();
        let result = ctx
            .execute("SELECT MAX(\"bid_price\") AS m FROM \"events\" GROUP BY \"type\"")
            .await
            .unwrap();
        assert_eq!(result.num_rows(), 2);
        assert!(ctx.execute("SELECT * FROM \"mv_broken\"").await.is_err());

        let record = health.record("mv_broken").unwrap();
        assert_eq!(record.status, MvStatus::Failed);
        assert!(record.error.unwrap().contains("unreadable artifact"));
    }
}
