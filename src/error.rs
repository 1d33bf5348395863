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

use arrow_schema::ArrowError;
use datafusion::parquet::errors::ParquetError;
use datafusion_common::DataFusionError;
use thiserror::Error;

use crate::batch::BufferedResult;

/// Result type used throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the router, the build pipeline and the batch executor.
///
/// Routing itself never fails: a query without a usable materialized view
/// degrades to sampling or a full scan instead of producing one of these.
#[derive(Debug, Error)]
pub enum Error {
    /// A build was requested for a view that is already queued or building.
    #[error("materialized view '{0}' is already building")]
    AlreadyBuilding(String),

    /// A build produced a schema that differs from the registered one.
    #[error("schema drift rejected for '{table}': registered {registered}, produced {produced}")]
    SchemaDriftRejected {
        /// Logical table (view) name.
        table: String,
        /// Signature registered first.
        registered: String,
        /// Signature produced by the rejected build.
        produced: String,
    },

    /// A build failed in the engine or while writing its output.
    #[error("build of '{mv_name}' failed: {reason}")]
    BuildFailed {
        /// View being built.
        mv_name: String,
        /// Rendered cause.
        reason: String,
    },

    /// A batch larger than the configured limit was submitted.
    #[error("batch of {size} queries exceeds limit of {limit}")]
    BatchTooLarge {
        /// Number of queries submitted.
        size: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// Buffered results of a batch outgrew the memory budget.
    #[error("memory budget exceeded: {used_mb:.1}MB > {limit_mb}MB")]
    MemoryBudgetExceeded {
        /// Estimated memory held by buffered results.
        used_mb: f64,
        /// Configured budget.
        limit_mb: u64,
        /// Results computed before the breach, including the one that crossed the budget.
        /// None of them were written.
        buffered: Vec<BufferedResult>,
    },

    /// No descriptor with this name is registered in the catalog.
    #[error("unknown materialized view '{0}'")]
    UnknownView(String),

    /// The build queue is at capacity.
    #[error("build queue is full ({0} tasks)")]
    QueueFull(usize),

    /// The build pipeline has been shut down.
    #[error("build pipeline is shut down")]
    PipelineClosed,

    /// A query could not be parsed or references unknown columns.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Configuration, catalog or registry snapshot could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    /// Error from the DataFusion engine.
    #[error(transparent)]
    DataFusion(#[from] DataFusionError),

    /// Error from Arrow.
    #[error(transparent)]
    Arrow(#[from] ArrowError),

    /// Error writing parquet output.
    #[error(transparent)]
    Parquet(#[from] ParquetError),

    /// Error listing files in object storage.
    #[error(transparent)]
    ObjectStore(#[from] object_store::Error),

    /// Filesystem error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wrap any displayable cause as a [`Error::BuildFailed`] for `mv_name`.
    pub fn build_failed(mv_name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::BuildFailed {
            mv_name: mv_name.into(),
            reason: reason.to_string(),
        }
    }
}
