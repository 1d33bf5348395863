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

use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;
use parking_lot::Mutex;
use serde_json::Value;

use super::{Measure, MvDescriptor};
use crate::query::{AggregateFunction, Op, Query};

/// Aggregated observations for one grouping-column set.
#[derive(Debug, Default, Clone)]
struct Pattern {
    frequency: usize,
    served_by_view: usize,
    /// Equality filters seen on every query so far, `None` before the first one.
    common_filters: Option<BTreeMap<String, Value>>,
    filtered_columns: BTreeSet<String>,
    measures: BTreeSet<String>,
}

/// A descriptor proposed from observed traffic.
#[derive(Debug, Clone)]
pub struct MvSuggestion {
    /// The proposed descriptor.
    pub descriptor: MvDescriptor,
    /// Number of observed queries it would have served.
    pub frequency: usize,
}

/// Records routed queries and proposes views for frequent patterns that no view serves.
#[derive(Debug, Default)]
pub struct WorkloadAnalyzer {
    patterns: Mutex<BTreeMap<BTreeSet<String>, Pattern>>,
}

impl WorkloadAnalyzer {
    /// An analyzer with no observations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one routed query and whether a view served it.
    pub fn record(&self, query: &Query, served_by_view: bool) {
        let key: BTreeSet<String> = query.group_by().iter().cloned().collect();

        let filters: BTreeMap<String, Value> = query
            .predicates()
            .iter()
            .filter(|p| p.op == Op::Eq)
            .map(|p| (p.col.clone(), p.val.clone()))
            .collect();

        let mut patterns = self.patterns.lock();
        let pattern = patterns.entry(key).or_default();
        pattern.frequency += 1;
        pattern.served_by_view += usize::from(served_by_view);

        pattern.common_filters = Some(match pattern.common_filters.take() {
            None => filters,
            Some(common) => common
                .into_iter()
                .filter(|(col, val)| filters.get(col) == Some(val))
                .collect(),
        });

        pattern
            .filtered_columns
            .extend(query.predicates().iter().map(|p| p.col.clone()));

        for aggregate in query.aggregates() {
            let column = (!aggregate.is_count_star()).then_some(aggregate.column.as_str());
            match aggregate.function {
                AggregateFunction::Avg => {
                    pattern
                        .measures
                        .insert(Measure::id_for(AggregateFunction::Sum, column));
                    pattern
                        .measures
                        .insert(Measure::id_for(AggregateFunction::Count, column));
                }
                function => {
                    pattern.measures.insert(Measure::id_for(function, column));
                }
            }
        }
    }

    /// Number of queries recorded.
    pub fn observed(&self) -> usize {
        self.patterns.lock().values().map(|p| p.frequency).sum()
    }

    /// Propose descriptors for grouping sets seen at least `min_frequency` times that
    /// were never served by a view, most frequent first.
    pub fn suggest(&self, min_frequency: usize) -> Vec<MvSuggestion> {
        let patterns = self.patterns.lock();
        patterns
            .iter()
            .filter(|(_, p)| p.frequency >= min_frequency && p.served_by_view == 0)
            .filter(|(_, p)| !p.measures.is_empty())
            .filter_map(|(group_by, p)| {
                let filters = p.common_filters.clone().unwrap_or_default();
                // filters not shared by every query must stay queryable
                let dimensions: BTreeSet<String> = group_by
                    .iter()
                    .chain(&p.filtered_columns)
                    .filter(|c| !filters.contains_key(*c))
                    .cloned()
                    .collect();

                let measures = p
                    .measures
                    .iter()
                    .map(|id| Measure::parse(id))
                    .collect::<crate::error::Result<Vec<_>>>()
                    .ok()?;

                let name = if dimensions.is_empty() {
                    "mv_suggested_total".to_string()
                } else {
                    format!("mv_suggested_{}", dimensions.iter().join("_"))
                };

                Some(MvSuggestion {
                    descriptor: MvDescriptor::new(name, dimensions, filters, measures, vec![]),
                    frequency: p.frequency,
                })
            })
            .sorted_by(|a, b| {
                b.frequency
                    .cmp(&a.frequency)
                    .then_with(|| a.descriptor.name().cmp(b.descriptor.name()))
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::WorkloadAnalyzer;
    use crate::query::Query;

    fn query(country: &str) -> Query {
        Query::from_json(&format!(
            r#"{{"select": ["publisher_id", {{"AVG": "bid_price"}}, {{"COUNT": "*"}}],
                "where": [
                    {{"col": "type", "op": "eq", "val": "impression"}},
                    {{"col": "country", "op": "eq", "val": "{country}"}},
                    {{"col": "day", "op": "between", "val": ["2024-01-01", "2024-01-31"]}}
                ],
                "group_by": ["publisher_id"]}}"#
        ))
        .unwrap()
    }

    #[test]
    fn suggests_view_for_frequent_uncovered_pattern() {
        let analyzer = WorkloadAnalyzer::new();
        analyzer.record(&query("US"), false);
        analyzer.record(&query("CA"), false);
        analyzer.record(&query("US"), false);

        let served = Query::from_json(r#"{"select": ["day", {"COUNT": "*"}], "group_by": ["day"]}"#)
            .unwrap();
        for _ in 0..5 {
            analyzer.record(&served, true);
        }
        assert_eq!(analyzer.observed(), 8);

        let suggestions = analyzer.suggest(3);
        assert_eq!(suggestions.len(), 1);

        let suggestion = &suggestions[0];
        assert_eq!(suggestion.frequency, 3);

        let mv = &suggestion.descriptor;
        assert_eq!(mv.name(), "mv_suggested_country_day_publisher_id");
        assert_eq!(
            mv.fixed_filters().get("type"),
            Some(&json!("impression"))
        );
        assert!(!mv.fixed_filters().contains_key("country"));
        let measures: Vec<_> = mv.measures().iter().map(|m| m.column_name()).collect();
        assert_eq!(measures, vec!["count", "count_bid_price", "sum_bid_price"]);

        assert!(analyzer.suggest(4).is_empty());
    }
}
