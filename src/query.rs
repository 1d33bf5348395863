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

/// Canonical forms, fingerprints and the result cache keyed by them.
pub mod fingerprint;

use std::{collections::HashSet, fmt};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Aggregate functions understood by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AggregateFunction {
    /// `SUM(col)`
    Sum,
    /// `COUNT(col)` or `COUNT(*)`
    Count,
    /// `AVG(col)`
    Avg,
    /// `MIN(col)`
    Min,
    /// `MAX(col)`
    Max,
}

impl AggregateFunction {
    /// Every function, in declaration order.
    pub const ALL: [AggregateFunction; 5] = [Self::Sum, Self::Count, Self::Avg, Self::Min, Self::Max];

    /// Upper-case SQL name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sum => "SUM",
            Self::Count => "COUNT",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }

    /// Parse a function name, ignoring case.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An aggregate in a select list, e.g. `{"SUM": "bid_price", "as": "revenue"}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Aggregate {
    /// The aggregate function.
    pub function: AggregateFunction,
    /// Input column, `*` for `COUNT(*)`.
    pub column: String,
    /// Output alias, if any.
    pub alias: Option<String>,
}

impl Aggregate {
    /// Create an aggregate without an alias.
    pub fn new(function: AggregateFunction, column: impl Into<String>) -> Self {
        Self {
            function,
            column: column.into(),
            alias: None,
        }
    }

    /// Whether this is `COUNT(*)`.
    pub fn is_count_star(&self) -> bool {
        self.function == AggregateFunction::Count && self.column == "*"
    }

    /// Name of the output column: the alias, or `FUNC(col)`.
    pub fn output_name(&self) -> String {
        self.alias
            .clone()
            .unwrap_or_else(|| format!("{}({})", self.function, self.column))
    }
}

/// One entry of a select list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum SelectItem {
    /// A plain (grouping) column.
    Column(String),
    /// An aggregate.
    Aggregate(Aggregate),
}

impl SelectItem {
    /// Name of the output column this item produces.
    pub fn output_name(&self) -> String {
        match self {
            Self::Column(c) => c.clone(),
            Self::Aggregate(agg) => agg.output_name(),
        }
    }
}

impl TryFrom<Value> for SelectItem {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::String(column) => Ok(Self::Column(column)),
            Value::Object(map) => {
                let mut alias = None;
                let mut aggregate = None;
                for (key, val) in map {
                    if key == "as" {
                        alias = Some(
                            val.as_str()
                                .ok_or_else(|| Error::InvalidQuery("alias must be a string".into()))?
                                .to_string(),
                        );
                        continue;
                    }
                    let function = AggregateFunction::parse(&key).ok_or_else(|| {
                        Error::InvalidQuery(format!("unknown aggregate function '{key}'"))
                    })?;
                    let column = val.as_str().ok_or_else(|| {
                        Error::InvalidQuery(format!("argument of {function} must be a column name"))
                    })?;
                    if aggregate.replace((function, column.to_string())).is_some() {
                        return Err(Error::InvalidQuery(
                            "select item holds more than one aggregate".into(),
                        ));
                    }
                }
                let (function, column) = aggregate
                    .ok_or_else(|| Error::InvalidQuery("select item has no aggregate".into()))?;
                Ok(Self::Aggregate(Aggregate {
                    function,
                    column,
                    alias,
                }))
            }
            other => Err(Error::InvalidQuery(format!(
                "select item must be a string or an object, got {other}"
            ))),
        }
    }
}

impl From<SelectItem> for Value {
    fn from(item: SelectItem) -> Self {
        match item {
            SelectItem::Column(c) => Value::String(c),
            SelectItem::Aggregate(agg) => {
                let mut map = Map::new();
                map.insert(agg.function.as_str().to_string(), Value::String(agg.column));
                if let Some(alias) = agg.alias {
                    map.insert("as".to_string(), Value::String(alias));
                }
                Value::Object(map)
            }
        }
    }
}

/// Comparison operators of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    /// `=`
    Eq,
    /// `!=`
    Neq,
    /// `<`
    Lt,
    /// `<=`
    Lte,
    /// `>`
    Gt,
    /// `>=`
    Gte,
    /// `BETWEEN lo AND hi`, inclusive
    Between,
    /// `IN (...)`
    In,
}

impl Op {
    /// Fixed total order over operators, used when canonicalizing.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Eq => 0,
            Self::Neq => 1,
            Self::Lt => 2,
            Self::Lte => 3,
            Self::Gt => 4,
            Self::Gte => 5,
            Self::Between => 6,
            Self::In => 7,
        }
    }
}

/// A single `where` filter: `{"col": ..., "op": ..., "val": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predicate {
    /// Filtered column.
    pub col: String,
    /// Operator.
    pub op: Op,
    /// Operand; an array for `between` and `in`.
    pub val: Value,
}

impl Predicate {
    /// Create a predicate.
    pub fn new(col: impl Into<String>, op: Op, val: impl Into<Value>) -> Self {
        Self {
            col: col.into(),
            op,
            val: val.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        match (self.op, &self.val) {
            (Op::Between, Value::Array(bounds)) if bounds.len() == 2 => Ok(()),
            (Op::Between, _) => Err(Error::InvalidQuery(format!(
                "between on '{}' needs a two element array",
                self.col
            ))),
            (Op::In, Value::Array(values)) if !values.is_empty() => Ok(()),
            (Op::In, _) => Err(Error::InvalidQuery(format!(
                "in on '{}' needs a non-empty array",
                self.col
            ))),
            (_, Value::Array(_) | Value::Object(_)) => Err(Error::InvalidQuery(format!(
                "{:?} on '{}' needs a scalar operand",
                self.op, self.col
            ))),
            _ => Ok(()),
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Ascending
    #[default]
    #[serde(alias = "ASC")]
    Asc,
    /// Descending
    #[serde(alias = "DESC")]
    Desc,
}

/// One `order_by` entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    /// Column or output alias.
    pub col: String,
    /// Direction, ascending when omitted.
    #[serde(default)]
    pub dir: Direction,
}

/// A structured aggregate query.
///
/// Queries are immutable once constructed; canonicalization produces a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default)]
    select: Vec<SelectItem>,
    #[serde(default, rename = "where")]
    predicates: Vec<Predicate>,
    #[serde(default)]
    group_by: Vec<String>,
    #[serde(default)]
    order_by: Vec<OrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    limit: Option<u64>,
}

impl Query {
    /// Build a query from its parts, checking operand shapes.
    pub fn try_new(
        select: Vec<SelectItem>,
        predicates: Vec<Predicate>,
        group_by: Vec<String>,
        order_by: Vec<OrderBy>,
        limit: Option<u64>,
    ) -> Result<Self> {
        let query = Self {
            select,
            predicates,
            group_by,
            order_by,
            limit,
        };
        query.check_operands()?;
        Ok(query)
    }

    /// Parse a query from its JSON form.
    pub fn from_json(json: &str) -> Result<Self> {
        let query: Self = serde_json::from_str(json)
            .map_err(|e| Error::InvalidQuery(format!("malformed query json: {e}")))?;
        query.check_operands()?;
        Ok(query)
    }

    /// Parse a query from an already decoded JSON value.
    pub fn from_value(value: Value) -> Result<Self> {
        let query: Self = serde_json::from_value(value)
            .map_err(|e| Error::InvalidQuery(format!("malformed query json: {e}")))?;
        query.check_operands()?;
        Ok(query)
    }

    fn check_operands(&self) -> Result<()> {
        if self.select.is_empty() {
            return Err(Error::InvalidQuery("select list is empty".into()));
        }
        self.predicates.iter().try_for_each(Predicate::validate)
    }

    /// Check that every referenced column exists in `columns`.
    pub fn validate_columns(&self, columns: &HashSet<String>) -> Result<()> {
        let unknown = self
            .referenced_columns()
            .into_iter()
            .filter(|c| !columns.contains(*c))
            .sorted()
            .collect_vec();

        if unknown.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidQuery(format!(
                "unknown columns: {}",
                unknown.join(", ")
            )))
        }
    }

    /// Columns read from the source table (not output aliases, not `*`).
    pub fn referenced_columns(&self) -> HashSet<&str> {
        let aliases: HashSet<String> = self.output_names().into_iter().collect();
        let mut columns = HashSet::new();
        for item in &self.select {
            match item {
                SelectItem::Column(c) => {
                    columns.insert(c.as_str());
                }
                SelectItem::Aggregate(agg) if agg.column != "*" => {
                    columns.insert(agg.column.as_str());
                }
                SelectItem::Aggregate(_) => {}
            }
        }
        columns.extend(self.predicates.iter().map(|p| p.col.as_str()));
        columns.extend(self.group_by.iter().map(String::as_str));
        columns.extend(
            self.order_by
                .iter()
                .map(|o| o.col.as_str())
                .filter(|c| !aliases.contains(*c)),
        );
        columns
    }

    /// Select list.
    pub fn select(&self) -> &[SelectItem] {
        &self.select
    }

    /// Filters, implicitly AND-ed.
    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// Grouping columns.
    pub fn group_by(&self) -> &[String] {
        &self.group_by
    }

    /// Sort keys.
    pub fn order_by(&self) -> &[OrderBy] {
        &self.order_by
    }

    /// Row limit.
    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Aggregates in the select list, in order.
    pub fn aggregates(&self) -> impl Iterator<Item = &Aggregate> {
        self.select.iter().filter_map(|item| match item {
            SelectItem::Aggregate(agg) => Some(agg),
            SelectItem::Column(_) => None,
        })
    }

    /// Whether the select list has any aggregate.
    pub fn has_aggregates(&self) -> bool {
        self.aggregates().next().is_some()
    }

    /// Value of the first equality filter on `col`.
    pub fn eq_value(&self, col: &str) -> Option<&Value> {
        self.predicates
            .iter()
            .find(|p| p.col == col && p.op == Op::Eq)
            .map(|p| &p.val)
    }

    /// Output column names, in select order.
    pub fn output_names(&self) -> Vec<String> {
        self.select.iter().map(SelectItem::output_name).collect()
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use serde_json::json;

    use super::{Aggregate, AggregateFunction, Direction, Op, Query, SelectItem};

    #[test]
    fn parses_json_query() {
        let query = Query::from_json(
            r#"{
                "select": ["day", {"sum": "bid_price", "as": "revenue"}, {"COUNT": "*"}],
                "where": [
                    {"col": "type", "op": "eq", "val": "impression"},
                    {"col": "day", "op": "between", "val": ["2024-01-01", "2024-01-31"]}
                ],
                "group_by": ["day"],
                "order_by": [{"col": "revenue", "dir": "desc"}],
                "limit": 10
            }"#,
        )
        .unwrap();

        assert_eq!(query.select()[0], SelectItem::Column("day".into()));
        assert_eq!(
            query.select()[1],
            SelectItem::Aggregate(Aggregate {
                function: AggregateFunction::Sum,
                column: "bid_price".into(),
                alias: Some("revenue".into()),
            })
        );
        assert!(query.aggregates().nth(1).unwrap().is_count_star());
        assert_eq!(query.predicates()[1].op, Op::Between);
        assert_eq!(query.order_by()[0].dir, Direction::Desc);
        assert_eq!(query.limit(), Some(10));
        assert_eq!(query.eq_value("type"), Some(&json!("impression")));
        assert_eq!(query.output_names(), vec!["day", "revenue", "COUNT(*)"]);
    }

    #[test]
    fn rejects_malformed_queries() {
        let cases = [
            r#"{"select": [{"MEDIAN": "bid_price"}]}"#,
            r#"{"select": ["day"], "where": [{"col": "day", "op": "between", "val": "2024-01-01"}]}"#,
            r#"{"select": ["day"], "where": [{"col": "day", "op": "in", "val": []}]}"#,
            r#"{"select": ["day"], "where": [{"col": "day", "op": "like", "val": "x"}]}"#,
            r#"{"select": []}"#,
        ];
        for case in cases {
            assert!(Query::from_json(case).is_err(), "accepted {case}");
        }
    }

    #[test]
    fn validates_referenced_columns() {
        let query = Query::from_json(
            r#"{"select": ["country", {"AVG": "total_price", "as": "avg_price"}],
                "group_by": ["country"],
                "order_by": [{"col": "avg_price"}]}"#,
        )
        .unwrap();

        let columns: HashSet<String> = ["country", "total_price"].map(String::from).into();
        query.validate_columns(&columns).unwrap();

        let columns: HashSet<String> = ["country"].map(String::from).into();
        let err = query.validate_columns(&columns).unwrap_err();
        assert!(err.to_string().contains("total_price"));
    }

    #[test]
    fn select_items_serialize_back_to_json_shape() {
        let item = SelectItem::Aggregate(Aggregate {
            function: AggregateFunction::Max,
            column: "total_price".into(),
            alias: Some("top".into()),
        });
        assert_eq!(
            serde_json::to_value(&item).unwrap(),
            json!({"MAX": "total_price", "as": "top"})
        );
    }
}
