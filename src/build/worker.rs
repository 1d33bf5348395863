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

use std::{fs::File, path::PathBuf, sync::Arc, time::Instant};

use chrono::{DateTime, Utc};
use datafusion::parquet::arrow::ArrowWriter;

use super::{BuildResult, BuildStatus, BuildTask, Shared};
use crate::{
    engine::ResultSet,
    error::{Error, Result},
    health::{MvStatus, StatusUpdate},
    schema::SchemaSignature,
    staging::StagedFile,
};

struct Published {
    rows: u64,
    path: PathBuf,
    built_at: DateTime<Utc>,
}

pub(super) async fn run(shared: Arc<Shared>, id: usize) {
    log::debug!("build worker {id} started");
    while let Some(task) = shared.queue.pop().await {
        log::info!("worker {id} building {}", task.task_id);
        let result = build(&shared, &task).await;
        match &result.error {
            None => log::info!(
                "built {} ({} rows in {:?})",
                task.mv_name,
                result.records_written,
                result.duration
            ),
            Some(e) => log::warn!("build {} {:?}: {e}", task.task_id, result.status),
        }
        shared.results.lock().push(result);
        shared.finish(&task);
    }
    log::debug!("build worker {id} stopped");
}

async fn build(shared: &Shared, task: &BuildTask) -> BuildResult {
    let started = Instant::now();
    let guard = shared.locks.acquire(&task.mv_name).await;

    let mut result = BuildResult {
        task_id: task.task_id.clone(),
        mv_name: task.mv_name.clone(),
        status: BuildStatus::Completed,
        records_written: 0,
        duration: Default::default(),
        error: None,
        output_path: None,
    };

    let was_ready = shared.health.get_status(&task.mv_name) == MvStatus::Ready;
    // someone outside the pipeline owns the BUILDING status; leave it to them
    if let Err(e) = shared.health.mark_building(&guard) {
        result.status = BuildStatus::Failed;
        result.error = Some(e.to_string());
        result.duration = started.elapsed();
        return result;
    }

    let outcome = materialize(shared, task).await;

    let recorded = match outcome {
        Ok(published) => {
            result.records_written = published.rows;
            result.output_path = Some(published.path.clone());
            shared.health.set_status(
                &task.mv_name,
                MvStatus::Ready,
                StatusUpdate {
                    total_rows: Some(published.rows),
                    output_path: Some(published.path),
                    built_at: Some(published.built_at),
                    error: None,
                },
            )
        }
        Err(e @ Error::SchemaDriftRejected { .. }) => {
            result.status = BuildStatus::DriftRejected;
            result.error = Some(e.to_string());
            // a published artifact that was serving before the build keeps serving
            let published = was_ready
                && shared
                    .health
                    .record(&task.mv_name)
                    .and_then(|r| r.output_path)
                    .is_some_and(|p| p.exists());
            let status = if published {
                MvStatus::Ready
            } else {
                MvStatus::Failed
            };
            shared
                .health
                .set_status(&task.mv_name, status, StatusUpdate::error(e))
        }
        Err(e) => {
            result.status = BuildStatus::Failed;
            result.error = Some(e.to_string());
            shared
                .health
                .set_status(&task.mv_name, MvStatus::Failed, StatusUpdate::error(e))
        }
    };

    if let Err(e) = recorded {
        log::error!("couldn't record status of {}: {e}", task.mv_name);
        result.status = BuildStatus::Failed;
        result.error.get_or_insert_with(|| e.to_string());
    }

    drop(guard);
    result.duration = started.elapsed();
    result
}

async fn materialize(shared: &Shared, task: &BuildTask) -> Result<Published> {
    // base data modified after this point is not reflected in the artifact
    let built_at = Utc::now();
    let ctx = shared.engine.context().await?;
    let output = ctx
        .execute(&task.definition)
        .await
        .map_err(|e| Error::build_failed(&task.mv_name, e))?;

    let staged = shared.staging.stage(&task.storage_locator);
    let rows = write_parquet(&staged, &output)
        .map_err(|e| Error::build_failed(&task.mv_name, e))?;

    let produced = SchemaSignature::of(&output.schema);
    if !shared.schemas.register(&task.mv_name, &produced)? {
        let registered = shared
            .schemas
            .get(&task.mv_name)
            .map(|s| s.to_string())
            .unwrap_or_default();
        return Err(Error::SchemaDriftRejected {
            table: task.mv_name.clone(),
            registered,
            produced: produced.to_string(),
        });
    }

    let path = staged.promote()?;
    Ok(Published {
        rows,
        path,
        built_at,
    })
}

fn write_parquet(staged: &StagedFile, output: &ResultSet) -> Result<u64> {
    let file = File::create(staged.path())?;
    let mut writer = ArrowWriter::try_new(file, Arc::clone(&output.schema), None)?;
    for batch in &output.batches {
        writer.write(batch)?;
    }
    writer.close()?;
    Ok(output.num_rows() as u64)
}
