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

use itertools::Itertools;
use serde_json::Value;

use super::matching::{MatchTier, Plan, PlanSource};
use crate::{
    catalog::{MeasureExpr, MvDescriptor},
    error::{Error, Result},
    query::{Aggregate, AggregateFunction, Direction, Op, Predicate, Query, SelectItem},
};

/// Quote an identifier for DataFusion, preserving case.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Render a JSON scalar as a SQL literal.
pub fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        // operand shapes are checked when the query is parsed
        Value::Array(_) | Value::Object(_) => format!("'{}'", value.to_string().replace('\'', "''")),
    }
}

/// Render one filter.
pub fn predicate(p: &Predicate) -> String {
    let col = quote_ident(&p.col);
    let list = |v: &Value| match v {
        Value::Array(values) => values.iter().map(literal).collect_vec(),
        other => vec![literal(other)],
    };

    match (p.op, &p.val) {
        (Op::Eq, Value::Null) => format!("{col} IS NULL"),
        (Op::Neq, Value::Null) => format!("{col} IS NOT NULL"),
        (Op::Eq, v) => format!("{col} = {}", literal(v)),
        (Op::Neq, v) => format!("{col} <> {}", literal(v)),
        (Op::Lt, v) => format!("{col} < {}", literal(v)),
        (Op::Lte, v) => format!("{col} <= {}", literal(v)),
        (Op::Gt, v) => format!("{col} > {}", literal(v)),
        (Op::Gte, v) => format!("{col} >= {}", literal(v)),
        (Op::Between, v) => {
            let bounds = list(v);
            format!("{col} BETWEEN {} AND {}", bounds[0], bounds[bounds.len() - 1])
        }
        (Op::In, v) => format!("{col} IN ({})", list(v).join(", ")),
    }
}

fn base_aggregate(function: AggregateFunction, column: &str) -> String {
    if column == "*" {
        format!("{function}(*)")
    } else {
        format!("{function}({})", quote_ident(column))
    }
}

fn view_aggregate(expr: &MeasureExpr) -> String {
    match expr {
        MeasureExpr::Column(c) => quote_ident(c),
        MeasureExpr::Reaggregate(function, c) => format!("{function}({})", quote_ident(c)),
        MeasureExpr::Average {
            sum,
            count,
            reaggregate: false,
        } => format!(
            "CAST({} AS DOUBLE) / {}",
            quote_ident(sum),
            quote_ident(count)
        ),
        MeasureExpr::Average {
            sum,
            count,
            reaggregate: true,
        } => format!(
            "CAST(SUM({}) AS DOUBLE) / SUM({})",
            quote_ident(sum),
            quote_ident(count)
        ),
    }
}

fn sampled_aggregate(aggregate: &Aggregate, rate: f64) -> String {
    let expr = base_aggregate(aggregate.function, &aggregate.column);
    match aggregate.function {
        AggregateFunction::Sum | AggregateFunction::Count => format!("{expr} / {rate:?}"),
        _ => expr,
    }
}

/// Render `query` as DataFusion SQL for `plan`.
///
/// `view` must be the descriptor named by the plan when it reads a view. Filters baked into the view
/// are dropped, measures are read or re-aggregated per [`MvDescriptor::serve`], and sampling plans
/// scale sums and counts by the inverse of the sample rate.
pub fn render(
    query: &Query,
    plan: &Plan,
    view: Option<&MvDescriptor>,
    base_table: &str,
) -> Result<String> {
    let view = match (&plan.source, view) {
        (PlanSource::View(name), Some(view)) if view.name() == name => Some(view),
        (PlanSource::View(name), _) => return Err(Error::UnknownView(name.clone())),
        (PlanSource::BaseTable, _) => None,
    };
    let reaggregate = plan.match_tier == MatchTier::Partial;

    let select = query
        .select()
        .iter()
        .map(|item| -> Result<String> {
            let aggregate = match item {
                SelectItem::Column(c) => return Ok(quote_ident(c)),
                SelectItem::Aggregate(aggregate) => aggregate,
            };
            let expr = match (view, plan.sample_rate) {
                (Some(view), _) => view_aggregate(&view.serve(aggregate, reaggregate).ok_or_else(
                    || {
                        Error::InvalidQuery(format!(
                            "{} cannot serve {}({})",
                            view.name(),
                            aggregate.function,
                            aggregate.column
                        ))
                    },
                )?),
                (None, Some(rate)) => sampled_aggregate(aggregate, rate),
                (None, None) => base_aggregate(aggregate.function, &aggregate.column),
            };
            Ok(format!("{expr} AS {}", quote_ident(&aggregate.output_name())))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut sql = format!("SELECT {}", select.join(", "));

    let from = match view {
        Some(view) => quote_ident(view.name()),
        None => quote_ident(base_table),
    };
    sql.push_str(&format!(" FROM {from}"));

    let mut filters = query
        .predicates()
        .iter()
        .filter(|p| view.map_or(true, |v| v.dimensions().contains(&p.col)))
        .map(predicate)
        .collect_vec();
    if let Some(rate) = plan.sample_rate {
        filters.push(format!("random() < {rate:?}"));
    }
    if !filters.is_empty() {
        sql.push_str(&format!(" WHERE {}", filters.join(" AND ")));
    }

    let group = view.is_none() || reaggregate;
    if group && !query.group_by().is_empty() {
        sql.push_str(&format!(
            " GROUP BY {}",
            query.group_by().iter().map(|c| quote_ident(c)).join(", ")
        ));
    }

    if !query.order_by().is_empty() {
        let keys = query
            .order_by()
            .iter()
            .map(|o| {
                let dir = match o.dir {
                    Direction::Asc => "ASC",
                    Direction::Desc => "DESC",
                };
                format!("{} {dir}", quote_ident(&o.col))
            })
            .join(", ");
        sql.push_str(&format!(" ORDER BY {keys}"));
    }

    if let Some(limit) = query.limit() {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    Ok(sql)
}

/// The query that builds `view` from `base_table`.
///
/// A user-supplied definition has `{base_table}` substituted. Otherwise the definition groups the base
/// table by the view's dimensions under its fixed filters and orders by its partition columns.
pub fn definition(view: &MvDescriptor, base_table: &str) -> String {
    if let Some(sql) = view.definition() {
        return sql.replace("{base_table}", &quote_ident(base_table));
    }

    let columns = view
        .dimensions()
        .iter()
        .map(|d| quote_ident(d))
        .chain(view.measures().iter().map(|m| {
            format!(
                "{} AS {}",
                base_aggregate(m.function(), m.source_column().unwrap_or("*")),
                quote_ident(m.column_name())
            )
        }))
        .join(", ");

    let mut sql = format!("SELECT {columns} FROM {}", quote_ident(base_table));

    if !view.fixed_filters().is_empty() {
        let filters = view
            .fixed_filters()
            .iter()
            .map(|(col, val)| predicate(&Predicate::new(col.clone(), Op::Eq, val.clone())))
            .join(" AND ");
        sql.push_str(&format!(" WHERE {filters}"));
    }

    if !view.dimensions().is_empty() {
        sql.push_str(&format!(
            " GROUP BY {}",
            view.dimensions().iter().map(|d| quote_ident(d)).join(", ")
        ));
    }

    if !view.partition_columns().is_empty() {
        sql.push_str(&format!(
            " ORDER BY {}",
            view.partition_columns()
                .iter()
                .map(|c| quote_ident(c))
                .join(", ")
        ));
    }

    sql
}
