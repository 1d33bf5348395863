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
Asynchronous materialization of views.

A [`BuildPipeline`] owns a bounded [`queue::TaskQueue`] and a fixed pool of workers. Submitting a
view enqueues a [`BuildTask`] carrying the view's defining SQL; a worker then

1. takes the view's [`locks::MvLocks`] lock and marks it `BUILDING`,
2. runs the definition on a fresh execution context,
3. writes the result to a staged parquet file,
4. checks the result schema against the [`SchemaRegistry`](crate::schema::SchemaRegistry),
5. promotes the file under `ready/` and marks the view `READY`.

A view has at most one task in flight: a second submission while one is queued or running is
rejected with [`Error::AlreadyBuilding`]. [`BuildPipeline::wait`] is bounded; tasks still running
when it returns are reported as incomplete rather than cancelled.
*/

/// Per-view build locks.
pub mod locks;
/// Bounded priority queue of build tasks.
pub mod queue;
mod worker;

use std::{
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use uuid::Uuid;

use crate::{
    catalog::MvCatalog,
    config::PipelineConfig,
    engine::ExecutionEngine,
    error::{Error, Result},
    health::{HealthRegistry, MvStatus},
    rewrite::sql,
    schema::SchemaRegistry,
    staging::StagingManager,
};
use locks::MvLocks;
use queue::TaskQueue;

/// One queued materialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTask {
    /// `<mv_name>_<8 hex>`.
    pub task_id: String,
    /// View to build.
    pub mv_name: String,
    /// Defining SQL, rendered at submission.
    pub definition: String,
    /// File name of the published artifact.
    pub storage_locator: String,
    /// Partition columns of the view.
    pub partition_columns: Vec<String>,
    /// Lower runs first.
    pub priority: u32,
    /// When the task was queued.
    pub submitted_at: DateTime<Utc>,
}

impl BuildTask {
    /// A task with a freshly generated id.
    pub fn new(
        mv_name: impl Into<String>,
        definition: impl Into<String>,
        storage_locator: impl Into<String>,
        partition_columns: Vec<String>,
        priority: u32,
    ) -> Self {
        let mv_name = mv_name.into();
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            task_id: format!("{mv_name}_{}", &suffix[..8]),
            mv_name,
            definition: definition.into(),
            storage_locator: storage_locator.into(),
            partition_columns,
            priority,
            submitted_at: Utc::now(),
        }
    }
}

/// How a build ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    /// The artifact was published and the view is `READY`.
    Completed,
    /// The engine or the writer failed; the view is `FAILED`.
    Failed,
    /// The result schema differed from the registered one; nothing was published.
    DriftRejected,
}

/// Outcome of one [`BuildTask`].
#[derive(Debug, Clone, Serialize)]
pub struct BuildResult {
    /// Task that produced this result.
    pub task_id: String,
    /// View that was built.
    pub mv_name: String,
    /// How the build ended.
    pub status: BuildStatus,
    /// Rows in the published artifact, 0 unless completed.
    pub records_written: u64,
    /// Wall time from dequeue to completion, including lock wait.
    pub duration: Duration,
    /// Rendered failure, if any.
    pub error: Option<String>,
    /// Published artifact, if completed.
    pub output_path: Option<PathBuf>,
}

/// What [`BuildPipeline::wait`] observed.
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    /// Tasks finished since the previous report.
    pub results: Vec<BuildResult>,
    /// Tasks still queued or running when the wait ended.
    pub incomplete: Vec<String>,
}

impl BuildReport {
    /// Whether every submitted task finished.
    pub fn is_complete(&self) -> bool {
        self.incomplete.is_empty()
    }
}

#[derive(Debug)]
struct Shared {
    base_table: String,
    catalog: Arc<MvCatalog>,
    health: Arc<HealthRegistry>,
    schemas: Arc<SchemaRegistry>,
    staging: StagingManager,
    engine: Arc<dyn ExecutionEngine>,
    locks: MvLocks,
    queue: TaskQueue,
    /// view name -> task id of its queued or running task, empty while the view is held idle
    in_flight: DashMap<String, String>,
    results: Mutex<Vec<BuildResult>>,
    outstanding: watch::Sender<usize>,
}

impl Shared {
    fn finish(&self, task: &BuildTask) {
        self.in_flight.remove(&task.mv_name);
        self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Bounded queue of build tasks drained by a fixed pool of workers.
#[derive(Debug)]
pub struct BuildPipeline {
    shared: Arc<Shared>,
    workers: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BuildPipeline {
    /// Create an idle pipeline. No task runs until [`Self::start`] is called.
    pub fn new(
        config: &PipelineConfig,
        base_table: impl Into<String>,
        catalog: Arc<MvCatalog>,
        health: Arc<HealthRegistry>,
        schemas: Arc<SchemaRegistry>,
        staging: StagingManager,
        engine: Arc<dyn ExecutionEngine>,
    ) -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                base_table: base_table.into(),
                catalog,
                health,
                schemas,
                staging,
                engine,
                locks: MvLocks::new(),
                queue: TaskQueue::new(config.queue_capacity),
                in_flight: DashMap::new(),
                results: Mutex::default(),
                outstanding,
            }),
            workers: config.workers.max(1),
            handles: Mutex::default(),
        }
    }

    /// Spawn the workers on the current tokio runtime. Calling it again is a no-op.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return;
        }
        for id in 0..self.workers {
            let shared = Arc::clone(&self.shared);
            handles.push(tokio::spawn(worker::run(shared, id)));
        }
        log::info!("started {} build workers", self.workers);
    }

    /// Queue a build of `mv_name`, returning its task id.
    ///
    /// Fails with [`Error::UnknownView`] for views missing from the catalog,
    /// [`Error::AlreadyBuilding`] if the view is queued or building, and [`Error::QueueFull`]
    /// when the queue is at capacity.
    pub fn submit(&self, mv_name: &str) -> Result<String> {
        let shared = &self.shared;
        let descriptor = shared
            .catalog
            .get(mv_name)
            .ok_or_else(|| Error::UnknownView(mv_name.to_string()))?;

        if shared.health.get_status(mv_name) == MvStatus::Building {
            return Err(Error::AlreadyBuilding(mv_name.to_string()));
        }

        let task = BuildTask::new(
            mv_name,
            sql::definition(&descriptor, &shared.base_table),
            descriptor.storage_locator(),
            descriptor.partition_columns().to_vec(),
            descriptor.priority(),
        );
        let task_id = task.task_id.clone();

        match shared.in_flight.entry(mv_name.to_string()) {
            Entry::Occupied(_) => return Err(Error::AlreadyBuilding(mv_name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(task_id.clone());
            }
        }

        shared.outstanding.send_modify(|n| *n += 1);
        if let Err(e) = shared.queue.push(task) {
            shared.in_flight.remove(mv_name);
            shared.outstanding.send_modify(|n| *n = n.saturating_sub(1));
            return Err(e);
        }

        log::info!("submitted build {task_id}");
        Ok(task_id)
    }

    /// Run `change` while no build of `mv_name` is queued or running.
    ///
    /// Fails with [`Error::AlreadyBuilding`] without running `change` if one is. Submissions of
    /// `mv_name` made while `change` runs are rejected the same way.
    pub fn while_idle<T>(&self, mv_name: &str, change: impl FnOnce() -> Result<T>) -> Result<T> {
        let shared = &self.shared;
        match shared.in_flight.entry(mv_name.to_string()) {
            Entry::Occupied(_) => return Err(Error::AlreadyBuilding(mv_name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(String::new());
            }
        }

        let out = match shared.locks.try_acquire(mv_name) {
            Some(_guard) => change(),
            None => Err(Error::AlreadyBuilding(mv_name.to_string())),
        };
        shared.in_flight.remove(mv_name);
        out
    }

    /// Task ids currently queued or running.
    pub fn in_flight(&self) -> Vec<String> {
        let mut ids = self
            .shared
            .in_flight
            .iter()
            .map(|e| e.value().clone())
            .filter(|id| !id.is_empty())
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    /// Number of tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    /// Wait up to `timeout` for every submitted task to finish.
    ///
    /// Returns the results collected since the previous call, plus the ids of tasks still
    /// outstanding if the timeout elapsed. Outstanding tasks keep running.
    pub async fn wait(&self, timeout: Duration) -> BuildReport {
        let mut outstanding = self.shared.outstanding.subscribe();
        if tokio::time::timeout(timeout, outstanding.wait_for(|n| *n == 0))
            .await
            .is_err()
        {
            log::warn!(
                "{} builds still outstanding after {timeout:?}",
                *outstanding.borrow()
            );
        }

        BuildReport {
            results: std::mem::take(&mut *self.shared.results.lock()),
            incomplete: self.in_flight(),
        }
    }

    /// Stop accepting tasks, drop the queued ones, and wait up to `timeout` for running builds
    /// and for the workers to exit.
    ///
    /// Dropped tasks are reported as incomplete alongside builds that outlive the timeout.
    pub async fn shutdown(&self, timeout: Duration) -> BuildReport {
        let deadline = Instant::now() + timeout;
        let dropped = self.shared.queue.close();
        for task in &dropped {
            log::info!("dropping queued build {}", task.task_id);
            self.shared.finish(task);
        }

        let mut report = self.wait(timeout).await;
        report
            .incomplete
            .extend(dropped.into_iter().map(|t| t.task_id));

        let handles = std::mem::take(&mut *self.handles.lock());
        let workers = handles.len();
        match tokio::time::timeout_at(deadline, join_all(handles)).await {
            Ok(joined) => {
                for e in joined.into_iter().filter_map(|r| r.err()) {
                    log::error!("build worker failed: {e}");
                }
                log::info!("stopped {workers} build workers");
            }
            Err(_) => log::warn!("build workers still running after {timeout:?}"),
        }
        report
    }
}
