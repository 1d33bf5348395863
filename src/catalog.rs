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

/// Workload analysis that suggests new descriptors.
pub mod analyzer;

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fmt::Debug,
    sync::Arc,
};

use itertools::Itertools;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    error::{Error, Result},
    query::{Aggregate, AggregateFunction},
};

/// A precomputed aggregate column of a materialized view.
///
/// Measure ids name both the stored column and its meaning:
/// `count` is `COUNT(*)`, and `<func>_<column>` is `FUNC(column)`,
/// e.g. `sum_bid_price` or `max_total_price`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Measure {
    id: String,
    function: AggregateFunction,
    column: Option<String>,
}

impl Measure {
    /// Parse a measure id.
    pub fn parse(id: &str) -> Result<Self> {
        if id == "count" {
            return Ok(Self {
                id: id.to_string(),
                function: AggregateFunction::Count,
                column: None,
            });
        }

        let (function, column) = id
            .split_once('_')
            .and_then(|(prefix, column)| Some((AggregateFunction::parse(prefix)?, column)))
            .filter(|(_, column)| !column.is_empty())
            .ok_or_else(|| {
                Error::Config(format!(
                    "measure id '{id}' is neither 'count' nor '<func>_<column>'"
                ))
            })?;

        Ok(Self {
            id: id.to_string(),
            function,
            column: Some(column.to_string()),
        })
    }

    /// Measure id for `function` applied to `column` (`None` meaning `*`).
    pub fn id_for(function: AggregateFunction, column: Option<&str>) -> String {
        match column {
            None => "count".to_string(),
            Some(column) => format!("{}_{column}", function.as_str().to_lowercase()),
        }
    }

    /// Name of the column storing this measure in the view.
    pub fn column_name(&self) -> &str {
        &self.id
    }

    /// The aggregate function this measure precomputes.
    pub fn function(&self) -> AggregateFunction {
        self.function
    }

    /// Base-table column aggregated, `None` for `COUNT(*)`.
    pub fn source_column(&self) -> Option<&str> {
        self.column.as_deref()
    }

    fn serves(&self, function: AggregateFunction, column: &str) -> bool {
        self.function == function
            && match &self.column {
                None => column == "*",
                Some(c) => c == column,
            }
    }
}

/// How a requested aggregate is computed from a view's stored measures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeasureExpr {
    /// Read a stored column as is. Only valid when the view is at the query's grain.
    Column(String),
    /// Re-apply an aggregate over a stored column at a coarser grain.
    Reaggregate(AggregateFunction, String),
    /// Average from stored sum and count columns.
    Average {
        /// Stored `sum_<col>` column.
        sum: String,
        /// Stored `count_<col>` column.
        count: String,
        /// Whether the sum and count must themselves be re-aggregated.
        reaggregate: bool,
    },
}

/// Describes one materialized view.
#[derive(Debug, Clone, PartialEq)]
pub struct MvDescriptor {
    name: String,
    dimensions: BTreeSet<String>,
    fixed_filters: BTreeMap<String, Value>,
    measures: Vec<Measure>,
    partition_columns: Vec<String>,
    storage_locator: String,
    definition: Option<String>,
    priority: u32,
}

impl MvDescriptor {
    /// Create a descriptor. Stored as `<name>.parquet` under the ready directory.
    pub fn new(
        name: impl Into<String>,
        dimensions: impl IntoIterator<Item = impl Into<String>>,
        fixed_filters: impl IntoIterator<Item = (String, Value)>,
        measures: Vec<Measure>,
        partition_columns: Vec<String>,
    ) -> Self {
        let name = name.into();
        Self {
            storage_locator: format!("{name}.parquet"),
            name,
            dimensions: dimensions.into_iter().map(Into::into).collect(),
            fixed_filters: fixed_filters.into_iter().collect(),
            measures,
            partition_columns,
            definition: None,
            priority: 1,
        }
    }

    /// Use `sql` instead of the derived definition. `{base_table}` is substituted at build time.
    pub fn with_definition(mut self, sql: impl Into<String>) -> Self {
        self.definition = Some(sql.into());
        self
    }

    /// Build priority; lower runs first.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// View name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Grouping columns of the view.
    pub fn dimensions(&self) -> &BTreeSet<String> {
        &self.dimensions
    }

    /// Filters baked into the view.
    pub fn fixed_filters(&self) -> &BTreeMap<String, Value> {
        &self.fixed_filters
    }

    /// Stored measures.
    pub fn measures(&self) -> &[Measure] {
        &self.measures
    }

    /// Columns the view's output is ordered by.
    pub fn partition_columns(&self) -> &[String] {
        &self.partition_columns
    }

    /// File name of the published artifact, relative to the ready directory.
    pub fn storage_locator(&self) -> &str {
        &self.storage_locator
    }

    /// User-supplied definition, if any.
    pub fn definition(&self) -> Option<&str> {
        self.definition.as_deref()
    }

    /// Build priority.
    pub fn priority(&self) -> u32 {
        self.priority
    }

    fn measure(&self, function: AggregateFunction, column: &str) -> Option<&Measure> {
        self.measures.iter().find(|m| m.serves(function, column))
    }

    /// Work out how `aggregate` is computed from this view.
    ///
    /// With `reaggregate` set, the view is finer than the query and only measures whose
    /// partial results combine correctly may be used: sums and counts are summed, minima and
    /// maxima re-minimized and re-maximized, and averages rebuilt from sum and count.
    /// A stored `avg_<col>` is never re-aggregated. Averages fall back to `count` when no
    /// `count_<col>` is stored, which assumes the column has no nulls.
    pub fn serve(&self, aggregate: &Aggregate, reaggregate: bool) -> Option<MeasureExpr> {
        use AggregateFunction::*;

        let column = aggregate.column.as_str();
        let direct = self
            .measure(aggregate.function, column)
            .map(|m| m.column_name().to_string());

        let average = || {
            Some(MeasureExpr::Average {
                sum: self.measure(Sum, column)?.column_name().to_string(),
                count: self
                    .measure(Count, column)
                    .or_else(|| self.measure(Count, "*"))?
                    .column_name()
                    .to_string(),
                reaggregate,
            })
        };

        match (aggregate.function, reaggregate) {
            (Avg, false) => direct.map(MeasureExpr::Column).or_else(average),
            (Avg, true) => average(),
            (_, false) => direct.map(MeasureExpr::Column),
            (Sum | Count, true) => direct.map(|c| MeasureExpr::Reaggregate(Sum, c)),
            (Min, true) => direct.map(|c| MeasureExpr::Reaggregate(Min, c)),
            (Max, true) => direct.map(|c| MeasureExpr::Reaggregate(Max, c)),
        }
    }

    /// Every column this descriptor reads from the base table.
    pub fn source_columns(&self) -> BTreeSet<&str> {
        self.dimensions
            .iter()
            .map(String::as_str)
            .chain(self.fixed_filters.keys().map(String::as_str))
            .chain(self.measures.iter().filter_map(Measure::source_column))
            .chain(self.partition_columns.iter().map(String::as_str))
            .collect()
    }

    /// Check the descriptor against the base table's columns.
    pub fn validate(&self, base_columns: &HashSet<String>) -> Result<()> {
        if self.name.is_empty() || self.name.contains(['/', '\\', '.']) {
            return Err(Error::Config(format!(
                "invalid materialized view name '{}'",
                self.name
            )));
        }

        let unknown = self
            .source_columns()
            .into_iter()
            .filter(|c| !base_columns.contains(*c))
            .collect_vec();
        if !unknown.is_empty() {
            return Err(Error::Config(format!(
                "materialized view '{}' references unknown columns: {}",
                self.name,
                unknown.join(", ")
            )));
        }

        if let Some(c) = self
            .partition_columns
            .iter()
            .find(|c| !self.dimensions.contains(*c))
        {
            return Err(Error::Config(format!(
                "partition column '{c}' of '{}' is not a dimension",
                self.name
            )));
        }

        if self.measures.is_empty() {
            return Err(Error::Config(format!(
                "materialized view '{}' has no measures",
                self.name
            )));
        }

        Ok(())
    }
}

/// JSON shape of one catalog entry.
#[derive(Debug, Clone, Deserialize)]
struct DescriptorConfig {
    dimensions: Vec<String>,
    #[serde(default)]
    filters: BTreeMap<String, Value>,
    measures: Vec<String>,
    #[serde(default)]
    partition_by: Vec<String>,
    #[serde(default)]
    sql: Option<String>,
    #[serde(default)]
    priority: Option<u32>,
}

/// Registry of materialized view descriptors.
///
/// Descriptors are immutable once registered; [`MvCatalog::update`] swaps one out wholesale.
#[derive(Debug, Default)]
pub struct MvCatalog {
    descriptors: RwLock<BTreeMap<String, Arc<MvDescriptor>>>,
}

impl MvCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a catalog from its JSON config, validating it against `base_columns`.
    ///
    /// ```json
    /// { "mv_day_type_wide": { "dimensions": ["day", "type"], "filters": {},
    ///                         "measures": ["sum_bid_price", "count"], "partition_by": ["day"] } }
    /// ```
    pub fn from_json(json: &str, base_columns: &HashSet<String>) -> Result<Self> {
        let configs: BTreeMap<String, DescriptorConfig> = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid catalog config: {e}")))?;

        let catalog = Self::new();
        for (name, config) in configs {
            let measures = config
                .measures
                .iter()
                .map(|id| Measure::parse(id))
                .collect::<Result<Vec<_>>>()?;

            let mut descriptor = MvDescriptor::new(
                name,
                config.dimensions,
                config.filters,
                measures,
                config.partition_by,
            );
            if let Some(sql) = config.sql {
                descriptor = descriptor.with_definition(sql);
            }
            if let Some(priority) = config.priority {
                descriptor = descriptor.with_priority(priority);
            }

            descriptor.validate(base_columns)?;
            catalog.register(descriptor)?;
        }

        Ok(catalog)
    }

    /// Load a catalog from a JSON file.
    pub fn from_file(
        path: impl AsRef<std::path::Path>,
        base_columns: &HashSet<String>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("couldn't read {}: {e}", path.display())))?;
        Self::from_json(&json, base_columns)
    }

    /// Register a new descriptor. Names must be unique.
    pub fn register(&self, descriptor: MvDescriptor) -> Result<()> {
        let mut descriptors = self.descriptors.write();
        if descriptors.contains_key(descriptor.name()) {
            return Err(Error::Config(format!(
                "materialized view '{}' is already registered",
                descriptor.name()
            )));
        }
        log::debug!("registered materialized view {}", descriptor.name());
        descriptors.insert(descriptor.name().to_string(), Arc::new(descriptor));
        Ok(())
    }

    /// Replace (or add) a descriptor, returning the previous one.
    pub fn update(&self, descriptor: MvDescriptor) -> Option<Arc<MvDescriptor>> {
        log::info!("updating materialized view descriptor {}", descriptor.name());
        self.descriptors
            .write()
            .insert(descriptor.name().to_string(), Arc::new(descriptor))
    }

    /// Look up a descriptor by name.
    pub fn get(&self, name: &str) -> Option<Arc<MvDescriptor>> {
        self.descriptors.read().get(name).cloned()
    }

    /// Snapshot of every descriptor, ordered by name.
    pub fn descriptors(&self) -> Vec<Arc<MvDescriptor>> {
        self.descriptors.read().values().cloned().collect()
    }

    /// Registered names, ordered.
    pub fn names(&self) -> Vec<String> {
        self.descriptors.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use serde_json::json;

    use super::{Measure, MeasureExpr, MvCatalog};
    use crate::query::{Aggregate, AggregateFunction};

    fn base_columns() -> HashSet<String> {
        [
            "day", "hour", "type", "country", "advertiser_id", "publisher_id", "bid_price",
            "total_price", "user_id",
        ]
        .map(String::from)
        .into()
    }

    const CATALOG: &str = r#"{
        "mv_day_impr_revenue": {
            "dimensions": ["day"],
            "filters": {"type": "impression"},
            "measures": ["sum_bid_price", "count"]
        },
        "mv_day_country_type": {
            "dimensions": ["day", "country", "type"],
            "measures": ["sum_total_price", "count_total_price", "min_total_price", "avg_bid_price"],
            "partition_by": ["day"],
            "priority": 2
        }
    }"#;

    #[test]
    fn parses_measure_ids() {
        let m = Measure::parse("sum_bid_price").unwrap();
        assert_eq!(m.function(), AggregateFunction::Sum);
        assert_eq!(m.source_column(), Some("bid_price"));
        assert_eq!(m.column_name(), "sum_bid_price");

        let m = Measure::parse("count").unwrap();
        assert_eq!(m.function(), AggregateFunction::Count);
        assert_eq!(m.source_column(), None);

        assert!(Measure::parse("median_bid_price").is_err());
        assert!(Measure::parse("sum_").is_err());
        assert_eq!(
            Measure::id_for(AggregateFunction::Max, Some("total_price")),
            "max_total_price"
        );
    }

    #[test]
    fn loads_and_validates_catalog() {
        let catalog = MvCatalog::from_json(CATALOG, &base_columns()).unwrap();
        assert_eq!(catalog.names(), vec!["mv_day_country_type", "mv_day_impr_revenue"]);

        let mv = catalog.get("mv_day_impr_revenue").unwrap();
        assert_eq!(mv.fixed_filters().get("type"), Some(&json!("impression")));
        assert_eq!(mv.storage_locator(), "mv_day_impr_revenue.parquet");
        assert_eq!(catalog.get("mv_day_country_type").unwrap().priority(), 2);

        let bad = CATALOG.replace("\"country\", \"type\"", "\"country\", \"planet\"");
        let err = MvCatalog::from_json(&bad, &base_columns()).unwrap_err();
        assert!(err.to_string().contains("planet"), "{err}");

        let bad = CATALOG.replace("\"partition_by\": [\"day\"]", "\"partition_by\": [\"hour\"]");
        assert!(MvCatalog::from_json(&bad, &base_columns()).is_err());
    }

    #[test]
    fn serves_measures_per_function() {
        let catalog = MvCatalog::from_json(CATALOG, &base_columns()).unwrap();
        let mv = catalog.get("mv_day_country_type").unwrap();

        let sum = Aggregate::new(AggregateFunction::Sum, "total_price");
        assert_eq!(
            mv.serve(&sum, true),
            Some(MeasureExpr::Reaggregate(AggregateFunction::Sum, "sum_total_price".into()))
        );

        let count = Aggregate::new(AggregateFunction::Count, "total_price");
        assert_eq!(
            mv.serve(&count, true),
            Some(MeasureExpr::Reaggregate(AggregateFunction::Sum, "count_total_price".into()))
        );

        let min = Aggregate::new(AggregateFunction::Min, "total_price");
        assert_eq!(
            mv.serve(&min, false),
            Some(MeasureExpr::Column("min_total_price".into()))
        );

        let avg = Aggregate::new(AggregateFunction::Avg, "total_price");
        assert_eq!(
            mv.serve(&avg, true),
            Some(MeasureExpr::Average {
                sum: "sum_total_price".into(),
                count: "count_total_price".into(),
                reaggregate: true,
            })
        );

        // a stored average is only usable at its own grain
        let avg_bid = Aggregate::new(AggregateFunction::Avg, "bid_price");
        assert_eq!(
            mv.serve(&avg_bid, false),
            Some(MeasureExpr::Column("avg_bid_price".into()))
        );
        assert_eq!(mv.serve(&avg_bid, true), None);

        let max = Aggregate::new(AggregateFunction::Max, "total_price");
        assert_eq!(mv.serve(&max, true), None);
    }

    #[test]
    fn update_replaces_descriptor() {
        let catalog = MvCatalog::from_json(CATALOG, &base_columns()).unwrap();
        let mut replacement = (*catalog.get("mv_day_impr_revenue").unwrap()).clone();
        replacement = replacement.with_priority(9);

        assert!(catalog.register(replacement.clone()).is_err());
        let previous = catalog.update(replacement).unwrap();
        assert_eq!(previous.priority(), 1);
        assert_eq!(catalog.get("mv_day_impr_revenue").unwrap().priority(), 9);
    }
}
