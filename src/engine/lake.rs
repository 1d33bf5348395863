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

use std::{path::PathBuf, sync::Arc};

use arrow_schema::DataType;
use chrono::{DateTime, Utc};
use datafusion::{
    datasource::{file_format::parquet::ParquetFormat, listing::ListingOptions},
    prelude::SessionContext,
};
use futures::TryStreamExt;
use itertools::Itertools;
use object_store::{local::LocalFileSystem, ObjectMeta, ObjectStore};

use crate::error::{Error, Result};

const PARQUET_EXTENSION: &str = ".parquet";

/// Iterate over the `column=value` segments of a Hive-partitioned path, in path order.
///
/// ```ignore
/// let parts = partition_values("events/day=2024-01-01/type=click/part-0.parquet").collect_vec();
/// assert_eq!(parts, [("day", "2024-01-01"), ("type", "click")]);
/// ```
pub fn partition_values(path: &str) -> impl Iterator<Item = (&str, &str)> {
    path.split('/')
        .filter(|part| !part.ends_with(PARQUET_EXTENSION))
        .filter_map(|part| part.split_once('='))
        .filter(|(name, _)| !name.is_empty())
}

/// The value of `column` in a Hive-partitioned path, if present.
pub fn partition_value<'a>(path: &'a str, column: &str) -> Option<&'a str> {
    partition_values(path).find_map(|(name, val)| (name == column).then_some(val))
}

/// A Hive-partitioned parquet dataset rooted in a local directory, e.g.
///
/// ```text
/// events/day=2024-01-01/type=impression/part-0.parquet
/// events/day=2024-01-01/type=click/part-0.parquet
/// ```
///
/// Partition columns are discovered from the directory names and exposed as `Utf8` columns.
#[derive(Debug, Clone)]
pub struct ParquetLake {
    root: PathBuf,
    store: Arc<LocalFileSystem>,
    partition_columns: Vec<String>,
}

impl ParquetLake {
    /// Open the dataset under `root` and discover its partition columns.
    ///
    /// Every file must carry the same partition columns in the same order.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = std::fs::canonicalize(root.into())?;
        let store = Arc::new(LocalFileSystem::new_with_prefix(&root)?);

        let files = list_parquet(store.as_ref()).await?;
        let layouts = files
            .iter()
            .map(|meta| {
                partition_values(meta.location.as_ref())
                    .map(|(name, _)| name.to_string())
                    .collect_vec()
            })
            .unique()
            .collect_vec();

        let partition_columns = match layouts.as_slice() {
            [] => vec![],
            [layout] => layout.clone(),
            _ => {
                return Err(Error::Config(format!(
                    "inconsistent partition layouts under {}: {layouts:?}",
                    root.display()
                )))
            }
        };

        log::debug!(
            "opened lake at {} with {} files, partitioned by {partition_columns:?}",
            root.display(),
            files.len()
        );

        Ok(Self {
            root,
            store,
            partition_columns,
        })
    }

    /// Root directory.
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    /// Partition columns, outermost first.
    pub fn partition_columns(&self) -> &[String] {
        &self.partition_columns
    }

    /// Register the dataset as a listing table called `name`.
    pub async fn register(&self, ctx: &SessionContext, name: &str) -> Result<()> {
        let options = ListingOptions::new(Arc::new(ParquetFormat::default()))
            .with_file_extension(PARQUET_EXTENSION)
            .with_table_partition_cols(
                self.partition_columns
                    .iter()
                    .map(|c| (c.clone(), DataType::Utf8))
                    .collect(),
            );

        let url = format!("{}/", self.root.to_string_lossy().trim_end_matches('/'));
        ctx.register_listing_table(name, url, options, None, None)
            .await?;
        Ok(())
    }

    /// Metadata of every parquet file in the dataset.
    pub async fn files(&self) -> Result<Vec<ObjectMeta>> {
        list_parquet(self.store.as_ref()).await
    }

    /// Most recent modification time of any file, `None` for an empty dataset.
    pub async fn last_modified(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.files().await?.iter().map(|f| f.last_modified).max())
    }
}

async fn list_parquet(store: &dyn ObjectStore) -> Result<Vec<ObjectMeta>> {
    Ok(store
        .list(None)
        .try_filter(|meta| {
            futures::future::ready(meta.location.as_ref().ends_with(PARQUET_EXTENSION))
        })
        .try_collect::<Vec<_>>()
        .await?)
}

#[cfg(test)]
mod test {
    use std::{fs, sync::Arc};

    use arrow::{array::Float64Array, record_batch::RecordBatch};
    use arrow_schema::{DataType, Field, Schema};
    use datafusion::{parquet::arrow::ArrowWriter, prelude::SessionContext};
    use itertools::Itertools;

    use super::{partition_value, partition_values, ParquetLake};

    #[test]
    fn parses_hive_segments() {
        let path = "sip/trades/year=2006/month=01/day=02/trades-2006-01-02.parquet";
        assert_eq!(
            partition_values(path).collect_vec(),
            vec![("year", "2006"), ("month", "01"), ("day", "02")]
        );
        assert_eq!(partition_value(path, "month"), Some("01"));
        assert_eq!(partition_value(path, "hour"), None);
        assert_eq!(partition_values("a=b.parquet").count(), 0);
    }

    fn write_partition(root: &std::path::Path, day: &str, kind: &str, prices: Vec<f64>) {
        let dir = root.join(format!("day={day}")).join(format!("type={kind}"));
        fs::create_dir_all(&dir).unwrap();
        let batch = RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("bid_price", DataType::Float64, false)])),
            vec![Arc::new(Float64Array::from(prices))],
        )
        .unwrap();
        let mut writer = ArrowWriter::try_new(
            fs::File::create(dir.join("part-0.parquet")).unwrap(),
            batch.schema(),
            None,
        )
        .unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
    }

    #[tokio::test]
    async fn registers_partitioned_dataset() {
        let dir = tempfile::tempdir().unwrap();
        write_partition(dir.path(), "2024-01-01", "impression", vec![1.0, 2.0]);
        write_partition(dir.path(), "2024-01-02", "click", vec![5.0]);

        let lake = ParquetLake::open(dir.path()).await.unwrap();
        assert_eq!(lake.partition_columns(), ["day", "type"]);
        assert_eq!(lake.files().await.unwrap().len(), 2);
        assert!(lake.last_modified().await.unwrap().is_some());

        let ctx = SessionContext::new();
        lake.register(&ctx, "events").await.unwrap();
        let batches = ctx
            .sql("SELECT SUM(bid_price) AS total FROM events WHERE \"type\" = 'impression'")
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        let total = batches[0]
            .column(0)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap()
            .value(0);
        assert_eq!(total, 3.0);
    }

    #[tokio::test]
    async fn rejects_inconsistent_layouts() {
        let dir = tempfile::tempdir().unwrap();
        write_partition(dir.path(), "2024-01-01", "impression", vec![1.0]);
        write_partition(&dir.path().join("day=2024-01-03"), "x", "y", vec![1.0]);

        assert!(ParquetLake::open(dir.path()).await.is_err());
    }
}
