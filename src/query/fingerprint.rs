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

use std::{fmt, sync::Arc};

use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::{Query, SelectItem};
use crate::{engine::ResultSet, error::Result};

/// Rewrite a query into its canonical form.
///
/// Two queries that differ only in the order of their `select`, `where`, `group_by`
/// or `order_by` lists have equal canonical forms. Aggregate names are already
/// upper-cased when parsed into [`AggregateFunction`](super::AggregateFunction).
pub fn canonicalize(query: &Query) -> Query {
    let mut canonical = query.clone();

    canonical.select.sort_by_cached_key(select_sort_key);
    canonical
        .predicates
        .sort_by_cached_key(|p| (p.col.clone(), p.op.rank(), p.val.to_string()));
    canonical.group_by.sort();
    canonical
        .order_by
        .sort_by(|a, b| (&a.col, a.dir).cmp(&(&b.col, b.dir)));

    canonical
}

fn select_sort_key(item: &SelectItem) -> (u8, String, String, String) {
    match item {
        SelectItem::Column(c) => (0, c.clone(), String::new(), String::new()),
        SelectItem::Aggregate(agg) => (
            1,
            agg.column.clone(),
            agg.function.to_string(),
            agg.alias.clone().unwrap_or_default(),
        ),
    }
}

/// A SHA-256 digest of a canonicalized [`Query`], rendered as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a query.
    pub fn of(query: &Query) -> Self {
        // serde_json maps are ordered by key, so this encoding is deterministic
        let blob = serde_json::to_vec(&canonicalize(query))
            .expect("serializing a query to json cannot fail");
        let digest = Sha256::digest(&blob);
        Self(format!("{digest:x}"))
    }

    /// The hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex digits, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Results of executed queries, keyed by [`Fingerprint`].
///
/// Because fingerprints ignore select order, cached results are re-projected
/// into the requesting query's column order on lookup.
#[derive(Debug)]
pub struct ResultCache {
    entries: DashMap<Fingerprint, CachedResult>,
    capacity: usize,
}

#[derive(Debug, Clone)]
struct CachedResult {
    columns: Vec<String>,
    result: Arc<ResultSet>,
}

impl ResultCache {
    /// Create a cache holding at most `capacity` results.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
        }
    }

    /// Number of cached results.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store the result of `query`. Ignored once the cache is full.
    pub fn insert(&self, fingerprint: Fingerprint, query: &Query, result: ResultSet) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&fingerprint) {
            log::debug!("result cache full, not caching {}", fingerprint.short());
            return;
        }
        self.entries.insert(
            fingerprint,
            CachedResult {
                columns: query.output_names(),
                result: Arc::new(result),
            },
        );
    }

    /// Look up a result for `query`, projected into its output order.
    pub fn get(&self, fingerprint: &Fingerprint, query: &Query) -> Result<Option<ResultSet>> {
        let Some(cached) = self.entries.get(fingerprint).map(|e| e.value().clone()) else {
            return Ok(None);
        };

        let wanted = query.output_names();
        if wanted == cached.columns {
            return Ok(Some(cached.result.as_ref().clone()));
        }

        let Some(indices) = wanted
            .iter()
            .map(|name| cached.columns.iter().position(|c| c == name))
            .collect::<Option<Vec<_>>>()
        else {
            return Ok(None);
        };

        let batches = cached
            .result
            .batches
            .iter()
            .map(|batch| batch.project(&indices))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(ResultSet {
            schema: Arc::new(cached.result.schema.project(&indices)?),
            batches,
        }))
    }

    /// Drop every cached result.
    pub fn clear(&self) {
        self.entries.clear();
    }
}
