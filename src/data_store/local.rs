use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::aggregate::{
    AggregateFilter, AggregateResult, DateRange, FilterOp, JsonRow, ProcedureCall,
};
use crate::data_store::{AggregateBackend, DataStoreError};
use crate::semantic_model::local_store::LocalSemanticModelStore;
use crate::semantic_model::metric::{Aggregation, MetricDef};
use crate::semantic_model::{SemanticModel, SemanticModelStore};

/// In-process reference implementation of the `run_board_aggregate`
/// procedure: resolves the board's model, compiles the query text from the
/// closed metric expressions, then evaluates filters, grouping, aggregates
/// and the limit over seeded rows.
#[derive(Clone)]
pub struct LocalAggregateBackend<S> {
    store: S,
    tables: Arc<HashMap<i64, Vec<JsonRow>>>,
}

impl<S> LocalAggregateBackend<S>
where
    S: SemanticModelStore,
{
    pub fn new(store: S, tables: HashMap<i64, Vec<JsonRow>>) -> Self {
        Self {
            store,
            tables: Arc::new(tables),
        }
    }
}

impl LocalAggregateBackend<LocalSemanticModelStore> {
    pub fn mock() -> Self {
        Self::mock_with_store(LocalSemanticModelStore::mock())
    }

    /// Seeded order rows for the mock Sales board, shared with a caller
    /// that also needs a handle on the model store.
    pub fn mock_with_store(store: LocalSemanticModelStore) -> Self {
        let mut tables = HashMap::new();
        tables.insert(1, sales_rows());
        Self::new(store, tables)
    }
}

fn sales_rows() -> Vec<JsonRow> {
    let rows = json!([
        {"id": 1, "customer_id": 10, "region": "EMEA", "channel": "web",    "amount": 120.0, "order_date": "2024-01-05"},
        {"id": 2, "customer_id": 11, "region": "EMEA", "channel": "retail", "amount": 80.0,  "order_date": "2024-01-19"},
        {"id": 3, "customer_id": 10, "region": "AMER", "channel": "web",    "amount": 300.0, "order_date": "2024-02-02"},
        {"id": 4, "customer_id": 12, "region": "AMER", "channel": "web",    "amount": 50.0,  "order_date": "2024-02-14"},
        {"id": 5, "customer_id": 13, "region": "APAC", "channel": "retail", "amount": 210.0, "order_date": "2024-03-01"},
        {"id": 6, "customer_id": 11, "region": "APAC", "channel": "web",    "amount": 90.0,  "order_date": "2024-03-20"}
    ]);
    match rows {
        Value::Array(rows) => rows
            .into_iter()
            .filter_map(|row| match row {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
        _ => unreachable!(),
    }
}

#[async_trait]
impl<S> AggregateBackend for LocalAggregateBackend<S>
where
    S: SemanticModelStore,
{
    async fn run_aggregate(
        &self,
        call: &ProcedureCall,
    ) -> Result<AggregateResult, DataStoreError> {
        let stored = self
            .store
            .get(call.board_id)
            .await
            .map_err(|e| DataStoreError::Query(e.to_string()))?
            .ok_or(DataStoreError::UnknownBoard(call.board_id))?;
        let model = stored.model;

        let metrics: Vec<&MetricDef> = call
            .metrics
            .iter()
            .map(|key| {
                model
                    .metric(key)
                    .ok_or_else(|| DataStoreError::UnknownMetric(key.clone()))
            })
            .collect::<Result<_, _>>()?;

        let sql = compile_sql(&model, &metrics, call);

        let empty = Vec::new();
        let table = self.tables.get(&call.board_id).unwrap_or(&empty);
        let rows = evaluate(table, &model, &metrics, call);

        Ok(AggregateResult { rows, sql })
    }
}

// ---------------------------------------------------------------------------
// Query compilation (the `sql` transparency output)
// ---------------------------------------------------------------------------

fn compile_sql(model: &SemanticModel, metrics: &[&MetricDef], call: &ProcedureCall) -> String {
    let mut select: Vec<String> = call.dimensions.clone();
    select.extend(metrics.iter().map(|m| m.render_with_alias()));

    let mut sql = format!("SELECT {} FROM board_{}", select.join(", "), call.board_id);

    let mut clauses: Vec<String> = call.filters.iter().map(render_filter).collect();
    if let Some(range) = &call.date_range {
        if let Some(clause) = render_date_range(range, model.date_column.as_deref()) {
            clauses.push(clause);
        }
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    if !call.dimensions.is_empty() {
        sql.push_str(" GROUP BY ");
        sql.push_str(&call.dimensions.join(", "));
    }
    sql.push_str(&format!(" LIMIT {}", call.limit));
    sql
}

fn render_filter(filter: &AggregateFilter) -> String {
    match filter.op {
        FilterOp::Eq => format!("{} = {}", filter.field, render_literal(&filter.value)),
        FilterOp::Ne => format!("{} != {}", filter.field, render_literal(&filter.value)),
        FilterOp::Like => format!("{} LIKE {}", filter.field, render_literal(&filter.value)),
        FilterOp::In => {
            let items = match &filter.value {
                Value::Array(items) => items.iter().map(render_literal).collect::<Vec<_>>(),
                other => vec![render_literal(other)],
            };
            format!("{} IN ({})", filter.field, items.join(", "))
        }
        FilterOp::Between => match &filter.value {
            Value::Array(range) if range.len() == 2 => format!(
                "{} BETWEEN {} AND {}",
                filter.field,
                render_literal(&range[0]),
                render_literal(&range[1])
            ),
            other => format!("{} BETWEEN {}", filter.field, render_literal(other)),
        },
    }
}

fn render_date_range(range: &DateRange, date_column: Option<&str>) -> Option<String> {
    let field = range.field.as_deref().or(date_column)?;
    match (&range.from, &range.to) {
        (Some(from), Some(to)) => Some(format!("{} BETWEEN '{}' AND '{}'", field, from, to)),
        (Some(from), None) => Some(format!("{} >= '{}'", field, from)),
        (None, Some(to)) => Some(format!("{} <= '{}'", field, to)),
        (None, None) => None,
    }
}

fn render_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn evaluate(
    table: &[JsonRow],
    model: &SemanticModel,
    metrics: &[&MetricDef],
    call: &ProcedureCall,
) -> Vec<JsonRow> {
    let filtered: Vec<&JsonRow> = table
        .iter()
        .filter(|row| matches_all(row, model, call))
        .collect();

    // Groups keep first-seen order, matching the seeded row order.
    let mut groups: Vec<(Vec<Value>, Vec<&JsonRow>)> = Vec::new();
    for row in filtered {
        let key: Vec<Value> = call
            .dimensions
            .iter()
            .map(|dim| row.get(dim).cloned().unwrap_or(Value::Null))
            .collect();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(row),
            None => groups.push((key, vec![row])),
        }
    }

    let mut out = Vec::new();
    for (key, members) in groups {
        let mut row = JsonRow::new();
        for (dim, value) in call.dimensions.iter().zip(key) {
            row.insert(dim.clone(), value);
        }
        for metric in metrics {
            row.insert(metric.key.clone(), apply_aggregate(metric, &members));
        }
        out.push(row);
    }

    out.truncate(call.limit.max(0) as usize);
    out
}

fn matches_all(row: &JsonRow, model: &SemanticModel, call: &ProcedureCall) -> bool {
    if !call.filters.iter().all(|f| matches_filter(row, f)) {
        return false;
    }
    match &call.date_range {
        Some(range) => matches_date_range(row, range, model.date_column.as_deref()),
        None => true,
    }
}

fn matches_filter(row: &JsonRow, filter: &AggregateFilter) -> bool {
    let actual = row.get(&filter.field).unwrap_or(&Value::Null);
    match filter.op {
        FilterOp::Eq => json_eq(actual, &filter.value),
        FilterOp::Ne => !json_eq(actual, &filter.value),
        FilterOp::In => match &filter.value {
            Value::Array(items) => items.iter().any(|item| json_eq(actual, item)),
            other => json_eq(actual, other),
        },
        FilterOp::Between => match &filter.value {
            Value::Array(range) if range.len() == 2 => {
                cmp(actual, &range[0]) >= 0 && cmp(actual, &range[1]) <= 0
            }
            _ => false,
        },
        FilterOp::Like => match (actual, &filter.value) {
            (Value::String(text), Value::String(pattern)) => like_match(pattern, text),
            _ => false,
        },
    }
}

fn matches_date_range(row: &JsonRow, range: &DateRange, date_column: Option<&str>) -> bool {
    let field = match range.field.as_deref().or(date_column) {
        Some(field) => field,
        // No usable date column; the bound cannot apply.
        None => return true,
    };
    let actual = match row.get(field).and_then(Value::as_str) {
        Some(actual) => actual,
        None => return false,
    };
    if let Some(from) = &range.from {
        if actual < from.as_str() {
            return false;
        }
    }
    if let Some(to) = &range.to {
        if actual > to.as_str() {
            return false;
        }
    }
    true
}

/// Loose equality: numbers compare numerically so `1` matches `1.0`.
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}

/// Three-way compare: numeric when both sides are numbers, lexical on the
/// string forms otherwise (ISO dates order correctly this way).
fn cmp(a: &Value, b: &Value) -> i32 {
    if let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) {
        return match a.partial_cmp(&b) {
            Some(std::cmp::Ordering::Less) => -1,
            Some(std::cmp::Ordering::Greater) => 1,
            _ => 0,
        };
    }
    let a = value_text(a);
    let b = value_text(b);
    match a.cmp(&b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn apply_aggregate(metric: &MetricDef, rows: &[&JsonRow]) -> Value {
    let column = metric.sql.column.as_str();
    let values: Vec<&Value> = rows
        .iter()
        .filter_map(|row| row.get(column))
        .filter(|v| !v.is_null())
        .collect();

    match metric.sql.agg {
        Aggregation::Count => {
            if column == "*" {
                json!(rows.len() as i64)
            } else {
                json!(values.len() as i64)
            }
        }
        Aggregation::CountDistinct => {
            let distinct: HashSet<String> = values.iter().map(|v| value_text(v)).collect();
            json!(distinct.len() as i64)
        }
        Aggregation::Sum => number(numerics(&values).iter().sum()),
        Aggregation::Avg => {
            let numerics = numerics(&values);
            if numerics.is_empty() {
                Value::Null
            } else {
                number(numerics.iter().sum::<f64>() / numerics.len() as f64)
            }
        }
        Aggregation::Median => {
            let mut numerics = numerics(&values);
            if numerics.is_empty() {
                return Value::Null;
            }
            numerics.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let mid = numerics.len() / 2;
            if numerics.len() % 2 == 0 {
                number((numerics[mid - 1] + numerics[mid]) / 2.0)
            } else {
                number(numerics[mid])
            }
        }
        Aggregation::Min => extremum(&values, -1),
        Aggregation::Max => extremum(&values, 1),
    }
}

fn numerics(values: &[&Value]) -> Vec<f64> {
    values.iter().filter_map(|v| v.as_f64()).collect()
}

fn number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn extremum(values: &[&Value], direction: i32) -> Value {
    values
        .iter()
        .copied()
        .reduce(|best, candidate| {
            if cmp(candidate, best) * direction > 0 {
                candidate
            } else {
                best
            }
        })
        .cloned()
        .unwrap_or(Value::Null)
}

/// SQL LIKE with `%` and `_`, case sensitive. Two-pointer scan with
/// backtracking to the last `%`.
fn like_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '_' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '%' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '%' {
        pi += 1;
    }
    pi == p.len()
}
