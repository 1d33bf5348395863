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

This module decides where a [`Query`] runs. The entry point is [`Planner::plan`], which scores every
materialized view in the catalog against the query and returns a [`Plan`].

A view can answer a query only if every row of the query's result can be computed from the view's rows.
The planner checks this as follows:
1. Discard views whose health status is not `READY`.
2. (Grain test) Check that the query's grouping columns are a subset of the view's dimensions.
   A view coarser than the query has already merged the groups the query wants to keep apart.
3. (Filter test) Check that every filter baked into the view is requested by the query with the same value,
   and that every query filter is either on a view dimension (it is retained) or is one of those baked-in filters (it is dropped).
4. (Measure test) Check that every requested aggregate can be computed from the view's measures.
   When the view is finer than the query, only measures that re-aggregate correctly may be used;
   see [`MvDescriptor::serve`].
5. Score the survivors and keep the best one.

# Scoring

A view whose dimensions equal the query's grouping scores [`ScoringWeights::exact_dimensions`] and yields an
[`MatchTier::Exact`] plan that reads view rows directly. A strictly finer view scores
[`ScoringWeights::partial_dimensions`] and yields a [`MatchTier::Partial`] plan that re-applies `GROUP BY`.
Every served aggregate adds [`ScoringWeights::measure`] and every query filter already baked into the view adds
[`ScoringWeights::prefilter`]. Ties go to the view with the fewest dimensions, then to the smaller name.

# Fallbacks

When no view is eligible, a query that aggregates, has no bounded time filter, and groups by a
high-cardinality column (see [`SamplingPolicy`]) is answered from a sample of the base table and flagged
approximate. Every other query becomes a full scan that keeps all of its filters.
Routing never fails.

*/

use std::{collections::BTreeSet, fmt, sync::Arc};

use itertools::Itertools;
use serde::Serialize;

use crate::{
    catalog::{MvCatalog, MvDescriptor},
    config::{SamplingPolicy, ScoringWeights},
    health::{HealthRegistry, MvStatus},
    query::{Op, Query, SelectItem},
};

/// Where a plan reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanSource {
    /// A materialized view, by name.
    View(String),
    /// The raw base table.
    BaseTable,
}

impl fmt::Display for PlanSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::View(name) => f.write_str(name),
            Self::BaseTable => f.write_str("base_table"),
        }
    }
}

/// How closely the chosen source matches the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    /// View dimensions equal the query's grouping.
    Exact,
    /// View is finer than the query and is re-aggregated.
    Partial,
    /// Approximate answer from a sample of the base table.
    Sampling,
    /// Full scan of the base table.
    FullScan,
}

/// Why a plan does not read from a materialized view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// No view is `READY`.
    NoCandidates,
    /// Views are `READY` but none can answer the query.
    NoEligibleView,
    /// The query was routed to sampling.
    Sampling,
    /// The chosen view failed at execution time and the query was re-planned.
    ViewExecutionFailed,
}

/// Outcome of scoring one view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    /// View name.
    pub name: String,
    /// Score; zero when ineligible.
    pub score: u32,
    /// Why the view was rejected, if it was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected: Option<String>,
}

/// An execution plan for one query. Produced per query and never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    /// Source to read from.
    pub source: PlanSource,
    /// Match tier.
    pub match_tier: MatchTier,
    /// Columns whose filters are evaluated by the plan.
    pub retained_predicates: Vec<String>,
    /// Whether `GROUP BY` must be re-applied over the source.
    pub needs_reaggregation: bool,
    /// Score of the chosen view, zero for base-table plans.
    pub score: u32,
    /// Sample rate, for [`MatchTier::Sampling`].
    pub sample_rate: Option<f64>,
    /// Whether results are estimates.
    pub approximate: bool,
    /// Why no view was used.
    pub fallback_reason: Option<FallbackReason>,
    /// Every view considered.
    pub candidates: Vec<Candidate>,
}

impl Plan {
    /// A full scan of the base table keeping every filter of `query`.
    pub fn full_scan(query: &Query, reason: FallbackReason, candidates: Vec<Candidate>) -> Self {
        Self {
            source: PlanSource::BaseTable,
            match_tier: MatchTier::FullScan,
            retained_predicates: predicate_columns(query),
            needs_reaggregation: false,
            score: 0,
            sample_rate: None,
            approximate: false,
            fallback_reason: Some(reason),
            candidates,
        }
    }

    /// Name of the view this plan reads, if any.
    pub fn view_name(&self) -> Option<&str> {
        match &self.source {
            PlanSource::View(name) => Some(name),
            PlanSource::BaseTable => None,
        }
    }
}

fn predicate_columns(query: &Query) -> Vec<String> {
    query.predicates().iter().map(|p| p.col.clone()).collect()
}

/// Chooses a [`Plan`] for each query.
#[derive(Debug, Clone, Default)]
pub struct Planner {
    scoring: ScoringWeights,
    sampling: SamplingPolicy,
}

struct Eligible {
    descriptor: Arc<MvDescriptor>,
    tier: MatchTier,
    score: u32,
    retained: Vec<String>,
}

impl Planner {
    /// Create a planner.
    pub fn new(scoring: ScoringWeights, sampling: SamplingPolicy) -> Self {
        Self { scoring, sampling }
    }

    /// Plan `query` against the catalog, optionally restricted to the views named in `only`.
    pub fn plan(
        &self,
        query: &Query,
        catalog: &MvCatalog,
        health: &HealthRegistry,
        only: Option<&[String]>,
    ) -> Plan {
        let descriptors = catalog
            .descriptors()
            .into_iter()
            .filter(|d| only.map_or(true, |names| names.iter().any(|n| n == d.name())));
        self.plan_with(query, descriptors, |name| health.get_status(name))
    }

    /// Plan `query` against `descriptors`, looking up each view's status with `status`.
    pub fn plan_with(
        &self,
        query: &Query,
        descriptors: impl IntoIterator<Item = Arc<MvDescriptor>>,
        status: impl Fn(&str) -> MvStatus,
    ) -> Plan {
        let mut candidates = vec![];
        let mut eligible = vec![];
        let mut any_ready = false;

        for descriptor in descriptors {
            let current = status(descriptor.name());
            if current != MvStatus::Ready {
                candidates.push(Candidate {
                    name: descriptor.name().to_string(),
                    score: 0,
                    rejected: Some(format!("status {current}")),
                });
                continue;
            }
            any_ready = true;

            match self.evaluate(query, &descriptor) {
                Ok((tier, score, retained)) => {
                    candidates.push(Candidate {
                        name: descriptor.name().to_string(),
                        score,
                        rejected: None,
                    });
                    eligible.push(Eligible {
                        descriptor,
                        tier,
                        score,
                        retained,
                    });
                }
                Err(reason) => {
                    log::trace!("{} ineligible: {reason}", descriptor.name());
                    candidates.push(Candidate {
                        name: descriptor.name().to_string(),
                        score: 0,
                        rejected: Some(reason),
                    });
                }
            }
        }

        let best = eligible.into_iter().min_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| {
                    a.descriptor
                        .dimensions()
                        .len()
                        .cmp(&b.descriptor.dimensions().len())
                })
                .then_with(|| a.descriptor.name().cmp(b.descriptor.name()))
        });

        if let Some(best) = best {
            log::debug!(
                "routing to {} ({:?}, score {})",
                best.descriptor.name(),
                best.tier,
                best.score
            );
            return Plan {
                source: PlanSource::View(best.descriptor.name().to_string()),
                match_tier: best.tier,
                retained_predicates: best.retained,
                needs_reaggregation: best.tier == MatchTier::Partial,
                score: best.score,
                sample_rate: None,
                approximate: false,
                fallback_reason: None,
                candidates,
            };
        }

        if self.should_sample(query) {
            log::debug!("no eligible view, sampling at {}", self.sampling.rate);
            return Plan {
                source: PlanSource::BaseTable,
                match_tier: MatchTier::Sampling,
                retained_predicates: predicate_columns(query),
                needs_reaggregation: false,
                score: 0,
                sample_rate: Some(self.sampling.rate),
                approximate: true,
                fallback_reason: Some(FallbackReason::Sampling),
                candidates,
            };
        }

        let reason = if any_ready {
            FallbackReason::NoEligibleView
        } else {
            FallbackReason::NoCandidates
        };
        log::debug!("no eligible view, full scan ({reason:?})");
        Plan::full_scan(query, reason, candidates)
    }

    /// Check eligibility of one `READY` view, returning its tier, score and retained filter columns.
    fn evaluate(
        &self,
        query: &Query,
        descriptor: &MvDescriptor,
    ) -> Result<(MatchTier, u32, Vec<String>), String> {
        let dimensions = descriptor.dimensions();

        if query.group_by().is_empty() && !query.has_aggregates() {
            return Err("query reads raw rows".into());
        }

        let group_by: BTreeSet<String> = query.group_by().iter().cloned().collect();
        if let Some(missing) = group_by.iter().find(|c| !dimensions.contains(*c)) {
            return Err(format!("grouping column '{missing}' is not a dimension"));
        }

        for (col, val) in descriptor.fixed_filters() {
            match query.eq_value(col) {
                Some(v) if v == val => {}
                Some(v) => return Err(format!("fixed filter {col} = {val} conflicts with {v}")),
                None => return Err(format!("query does not filter on fixed column '{col}'")),
            }
        }

        let mut retained = vec![];
        let mut prefiltered = 0;
        for predicate in query.predicates() {
            if dimensions.contains(&predicate.col) {
                retained.push(predicate.col.clone());
            } else if predicate.op == Op::Eq
                && descriptor.fixed_filters().get(&predicate.col) == Some(&predicate.val)
            {
                prefiltered += 1;
            } else {
                return Err(format!("filter on '{}' cannot be applied", predicate.col));
            }
        }

        let outputs = query.output_names();
        for item in query.select() {
            if let SelectItem::Column(c) = item {
                if !dimensions.contains(c) {
                    return Err(format!("selected column '{c}' is not a dimension"));
                }
            }
        }
        if let Some(o) = query
            .order_by()
            .iter()
            .find(|o| !outputs.contains(&o.col) && !dimensions.contains(&o.col))
        {
            return Err(format!("cannot order by '{}'", o.col));
        }

        let exact = *dimensions == group_by;
        if let Some(agg) = query
            .aggregates()
            .find(|agg| descriptor.serve(agg, !exact).is_none())
        {
            return Err(format!("cannot serve {}({})", agg.function, agg.column));
        }

        let (tier, dimension_score) = if exact {
            (MatchTier::Exact, self.scoring.exact_dimensions)
        } else {
            (MatchTier::Partial, self.scoring.partial_dimensions)
        };
        let score = dimension_score
            + self.scoring.measure * query.aggregates().count() as u32
            + self.scoring.prefilter * prefiltered;

        Ok((tier, score, retained.into_iter().unique().collect()))
    }

    fn should_sample(&self, query: &Query) -> bool {
        let high_cardinality = query
            .group_by()
            .iter()
            .any(|c| self.sampling.high_cardinality_columns.contains(c));

        query.has_aggregates() && high_cardinality && !self.has_bounded_time_filter(query)
    }

    fn has_bounded_time_filter(&self, query: &Query) -> bool {
        self.sampling.time_columns.iter().any(|col| {
            let ops = query
                .predicates()
                .iter()
                .filter(|p| &p.col == col)
                .map(|p| p.op)
                .collect_vec();

            let point = ops
                .iter()
                .any(|op| matches!(op, Op::Eq | Op::Between | Op::In));
            let lower = ops.iter().any(|op| matches!(op, Op::Gt | Op::Gte));
            let upper = ops.iter().any(|op| matches!(op, Op::Lt | Op::Lte));

            point || (lower && upper)
        })
    }
}

#[cfg(test)]
mod test {
    use std::{collections::HashSet, sync::Arc};

    use super::{FallbackReason, MatchTier, PlanSource, Planner};
    use crate::{
        catalog::{MvCatalog, MvDescriptor},
        health::MvStatus,
        query::Query,
    };

    const CATALOG: &str = r#"{
        "mv_day_type_wide": {
            "dimensions": ["day", "type"],
            "measures": ["sum_bid_price", "count", "min_bid_price", "max_bid_price"],
            "partition_by": ["day"]
        },
        "mv_day_country_type": {
            "dimensions": ["day", "country", "type"],
            "measures": ["sum_bid_price", "count"],
            "partition_by": ["day"]
        },
        "mv_day_impr_revenue": {
            "dimensions": ["day"],
            "filters": {"type": "impression"},
            "measures": ["sum_bid_price", "count"]
        },
        "mv_hour_publisher": {
            "dimensions": ["hour", "publisher_id"],
            "measures": ["avg_bid_price"]
        }
    }"#;

    fn catalog() -> MvCatalog {
        let columns: HashSet<String> = [
            "day", "hour", "type", "country", "publisher_id", "bid_price", "user_id",
        ]
        .map(String::from)
        .into();
        MvCatalog::from_json(CATALOG, &columns).unwrap()
    }

    fn descriptors() -> Vec<Arc<MvDescriptor>> {
        catalog().descriptors()
    }

    fn all_ready(_: &str) -> MvStatus {
        MvStatus::Ready
    }

    fn query(json: &str) -> Query {
        Query::from_json(json).unwrap()
    }

    #[test]
    fn exact_match_prefers_equal_dimensions() {
        let q = query(
            r#"{"select": ["day", "type", {"SUM": "bid_price"}],
                "where": [{"col": "type", "op": "eq", "val": "impression"}],
                "group_by": ["day", "type"]}"#,
        );
        let plan = Planner::default().plan_with(&q, descriptors(), all_ready);

        assert_eq!(plan.match_tier, MatchTier::Exact);
        assert_eq!(plan.source, PlanSource::View("mv_day_type_wide".into()));
        assert!(!plan.needs_reaggregation);
        assert_eq!(plan.score, 50 + 20);
        assert_eq!(plan.retained_predicates, vec!["type"]);
        assert_eq!(plan.fallback_reason, None);
    }

    #[test]
    fn prefiltered_view_wins_on_bonus() {
        let q = query(
            r#"{"select": ["day", {"SUM": "bid_price"}],
                "where": [{"col": "type", "op": "eq", "val": "impression"}],
                "group_by": ["day"]}"#,
        );
        let plan = Planner::default().plan_with(&q, descriptors(), all_ready);

        assert_eq!(plan.source, PlanSource::View("mv_day_impr_revenue".into()));
        assert_eq!(plan.match_tier, MatchTier::Exact);
        assert_eq!(plan.score, 50 + 20 + 10);
        assert!(plan.retained_predicates.is_empty());

        // a conflicting value on the baked-in filter rules the view out
        let q = query(
            r#"{"select": ["day", {"SUM": "bid_price"}],
                "where": [{"col": "type", "op": "eq", "val": "click"}],
                "group_by": ["day"]}"#,
        );
        let plan = Planner::default().plan_with(&q, descriptors(), all_ready);
        assert_eq!(plan.source, PlanSource::View("mv_day_type_wide".into()));
        assert_eq!(plan.match_tier, MatchTier::Partial);
        assert!(plan.needs_reaggregation);
        let rejected = plan
            .candidates
            .iter()
            .find(|c| c.name == "mv_day_impr_revenue")
            .unwrap();
        assert!(rejected.rejected.as_ref().unwrap().contains("conflicts"));
    }

    #[test]
    fn partial_match_tie_breaks_on_fewest_dimensions() {
        let q = query(r#"{"select": ["type", {"COUNT": "*"}], "group_by": ["type"]}"#);
        let plan = Planner::default().plan_with(&q, descriptors(), all_ready);

        assert_eq!(plan.match_tier, MatchTier::Partial);
        assert_eq!(plan.source, PlanSource::View("mv_day_type_wide".into()));
        assert_eq!(plan.score, 30 + 20);
    }

    #[test]
    fn unhealthy_views_are_skipped() {
        let q = query(
            r#"{"select": ["day", "type", {"SUM": "bid_price"}], "group_by": ["day", "type"]}"#,
        );
        let plan = Planner::default().plan_with(&q, descriptors(), |name| {
            if name == "mv_day_type_wide" {
                MvStatus::Failed
            } else {
                MvStatus::Ready
            }
        });
        assert_eq!(plan.source, PlanSource::View("mv_day_country_type".into()));
        assert_eq!(plan.match_tier, MatchTier::Partial);

        let plan = Planner::default().plan_with(&q, descriptors(), |_| MvStatus::Stale);
        assert_eq!(plan.match_tier, MatchTier::FullScan);
        assert_eq!(plan.fallback_reason, Some(FallbackReason::NoCandidates));
        assert_eq!(plan.candidates.len(), 4);
    }

    #[test]
    fn stored_average_needs_exact_grain() {
        let exact = query(
            r#"{"select": ["hour", "publisher_id", {"AVG": "bid_price"}],
                "group_by": ["hour", "publisher_id"]}"#,
        );
        let plan = Planner::default().plan_with(&exact, descriptors(), all_ready);
        assert_eq!(plan.source, PlanSource::View("mv_hour_publisher".into()));

        let coarser = query(r#"{"select": ["hour", {"AVG": "bid_price"}], "group_by": ["hour"]}"#);
        let plan = Planner::default().plan_with(&coarser, descriptors(), all_ready);
        assert_eq!(plan.match_tier, MatchTier::FullScan);
        assert_eq!(plan.fallback_reason, Some(FallbackReason::NoEligibleView));
    }

    #[test]
    fn high_cardinality_without_time_bound_samples() {
        let q = query(r#"{"select": ["user_id", {"COUNT": "*"}], "group_by": ["user_id"]}"#);
        let plan = Planner::default().plan_with(&q, descriptors(), all_ready);

        assert_eq!(plan.match_tier, MatchTier::Sampling);
        assert_eq!(plan.sample_rate, Some(0.1));
        assert!(plan.approximate);
        assert_eq!(plan.fallback_reason, Some(FallbackReason::Sampling));

        let bounded = query(
            r#"{"select": ["user_id", {"COUNT": "*"}],
                "where": [{"col": "day", "op": "gte", "val": "2024-01-01"},
                          {"col": "day", "op": "lt", "val": "2024-02-01"}],
                "group_by": ["user_id"]}"#,
        );
        let plan = Planner::default().plan_with(&bounded, descriptors(), all_ready);
        assert_eq!(plan.match_tier, MatchTier::FullScan);
        assert_eq!(plan.retained_predicates, vec!["day", "day"]);

        let half_open = query(
            r#"{"select": ["user_id", {"COUNT": "*"}],
                "where": [{"col": "day", "op": "gte", "val": "2024-01-01"}],
                "group_by": ["user_id"]}"#,
        );
        let plan = Planner::default().plan_with(&half_open, descriptors(), all_ready);
        assert_eq!(plan.match_tier, MatchTier::Sampling);
    }

    #[test]
    fn eligible_view_is_never_skipped_for_full_scan() {
        let q = query(
            r#"{"select": ["country", {"SUM": "bid_price"}],
                "where": [{"col": "day", "op": "between", "val": ["2024-01-01", "2024-01-07"]},
                          {"col": "country", "op": "in", "val": ["US", "CA"]}],
                "group_by": ["country"],
                "order_by": [{"col": "SUM(bid_price)", "dir": "desc"}]}"#,
        );
        let plan = Planner::default().plan_with(&q, descriptors(), all_ready);
        assert_eq!(plan.source, PlanSource::View("mv_day_country_type".into()));
        assert_eq!(plan.retained_predicates, vec!["day", "country"]);

        let raw = query(r#"{"select": ["country", "bid_price"]}"#);
        let plan = Planner::default().plan_with(&raw, descriptors(), all_ready);
        assert_eq!(plan.match_tier, MatchTier::FullScan);
    }
}
