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

#![deny(missing_docs)]

//! `datafusion-mv-router` answers structured aggregate queries from precomputed materialized views
//! when one can serve them, and from the base table otherwise.
//!
//! The [`MvRouter`] facade ties together three subsystems:
//!
//! * a matching engine ([`rewrite`]) that scores the views of the [`catalog`] against each query and
//!   degrades to sampling or a full scan when no view fits;
//! * a [`build`] pipeline that materializes views on a worker pool, one build per view at a time,
//!   publishing parquet output through the [`staging`] directory and guarding view schemas with the
//!   [`schema`] registry;
//! * [`health`] tracking that classifies every view as usable, stale or broken and feeds that back
//!   into routing.
//!
//! Queries run on DataFusion through the [`engine`] traits, one fresh session per request.

/// Bounded execution of query batches with CSV output.
pub mod batch;

/// Materialization of views on a worker pool.
pub mod build;

/// Materialized view descriptors and workload analysis.
pub mod catalog;

/// Router configuration.
pub mod config;

/// The execution engine seam and its DataFusion implementation.
pub mod engine;

/// Crate error type.
pub mod error;

/// Per-view status, integrity spot checks and freshness tracking.
pub mod health;

/// Structured queries, fingerprints and the result cache.
pub mod query;

/// Matching queries against materialized views and rendering them as SQL.
pub mod rewrite;

/// Schema signatures of materialized views.
pub mod schema;

/// The [`MvRouter`] facade.
pub mod service;

/// Atomic publication of artifacts through a staging directory.
pub mod staging;

/// Per-query routing telemetry.
pub mod telemetry;

pub use config::RouterConfig;
pub use engine::BaseTable;
pub use error::{Error, Result};
pub use health::MvStatus;
pub use query::Query;
pub use rewrite::{MatchTier, Plan};
pub use service::MvRouter;
