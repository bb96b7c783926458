//! Query compilation: a structured filter builder, template substitution,
//! display-safe SQL rendering, and result reconciliation for grouped metrics.

use crate::catalog::{MetricCatalog, MetricDef, MetricKind, MONTH_COLUMN};
use crate::chart::ChartSpec;
use crate::datastore::{DataStore, Row, RowSet, SqlValue};
use crate::error::{AssistantError, Result};
use crate::state::{ConversationState, TimeRangeKind};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use tracing::debug;

/// Row cap applied to detail listings.
pub const DETAIL_ROW_CAP: usize = 50;

lazy_static! {
    static ref WHERE_STUB_AND: Regex = Regex::new(r"(?i)\bWHERE\s+1=1\s+AND\s+").unwrap();
    static ref WHERE_STUB: Regex = Regex::new(r"(?i)\bWHERE\s+1=1\b\s*").unwrap();
}

/// Accumulates predicates and their bound parameters, rendering once at the
/// end. The always-true stub keeps the templates' trailing `AND` clauses valid.
#[derive(Debug, Default)]
pub struct WhereClause {
    predicates: Vec<String>,
    params: Vec<SqlValue>,
}

impl WhereClause {
    pub fn new() -> Self {
        WhereClause::default()
    }

    pub fn and(&mut self, predicate: impl Into<String>, params: impl IntoIterator<Item = SqlValue>) {
        self.predicates.push(predicate.into());
        self.params.extend(params);
    }

    pub fn render(&self) -> String {
        let mut text = String::from("WHERE 1=1");
        for predicate in &self.predicates {
            text.push_str(" AND ");
            text.push_str(predicate);
        }
        text
    }

    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }

    pub fn into_params(self) -> Vec<SqlValue> {
        self.params
    }
}

/// Build the filter clause for a metric from the conversation's slots:
/// a time predicate keyed on the time-range kind, then a dimension `IN`
/// predicate resolved through the metric's column overrides.
pub fn build_where(
    catalog: &MetricCatalog,
    metric: &MetricDef,
    state: &ConversationState,
) -> Result<WhereClause> {
    let mut clause = WhereClause::new();

    if let Some(range) = &state.time_range {
        match (range.kind, range.value.as_deref()) {
            (TimeRangeKind::Month, Some(value)) | (TimeRangeKind::Custom, Some(value)) => {
                clause.and(
                    format!("{} = ?", MONTH_COLUMN),
                    [SqlValue::text(value)],
                );
            }
            (TimeRangeKind::HalfFy, Some(value)) => {
                let year = value.get(..4).ok_or_else(|| {
                    AssistantError::Time(format!("malformed half-year token '{}'", value))
                })?;
                let (min_month, max_month) = match value.get(4..) {
                    Some("H1") => (1, 6),
                    Some("H2") => (7, 12),
                    _ => (1, 12),
                };
                clause.and(
                    format!(
                        "substr({col}, 1, 4) = ? AND CAST(substr({col}, 5, 2) AS INTEGER) BETWEEN ? AND ?",
                        col = MONTH_COLUMN
                    ),
                    [
                        SqlValue::text(year),
                        SqlValue::Integer(min_month),
                        SqlValue::Integer(max_month),
                    ],
                );
            }
            (TimeRangeKind::Fy, Some(value)) => {
                let year = value.get(..4).ok_or_else(|| {
                    AssistantError::Time(format!("malformed year token '{}'", value))
                })?;
                clause.and(
                    format!("substr({}, 1, 4) = ?", MONTH_COLUMN),
                    [SqlValue::text(year)],
                );
            }
            _ => {}
        }
    }

    if let Some(dim_id) = &state.filter_dimension {
        if !state.filter_values.is_empty() {
            let dim = catalog.require_dimension(dim_id)?;
            let column = metric.dimension_column(dim);
            let placeholders = vec!["?"; state.filter_values.len()].join(",");
            clause.and(
                format!("{} IN ({})", column, placeholders),
                state.filter_values.iter().cloned().map(SqlValue::Text),
            );
        }
    }

    Ok(clause)
}

#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
    pub display_sql: String,
}

/// Resolve the metric's single `{where}` site and cap detail listings.
pub fn compile(
    catalog: &MetricCatalog,
    metric: &MetricDef,
    state: &ConversationState,
) -> Result<CompiledQuery> {
    let clause = build_where(catalog, metric, state)?;
    let mut sql = metric.sql.replacen("{where}", &clause.render(), 1);
    if metric.kind == MetricKind::Detail {
        sql.push_str(&format!(" LIMIT {}", DETAIL_ROW_CAP));
    }
    let params = clause.into_params();
    let display_sql = format_sql_for_display(&sql, &params);
    Ok(CompiledQuery {
        sql,
        params,
        display_sql,
    })
}

/// Substitute bound parameters back into the placeholder positions and strip
/// the always-true stub. Display only, never executed.
pub fn format_sql_for_display(sql: &str, params: &[SqlValue]) -> String {
    let mut formatted = sql.to_string();
    for param in params {
        formatted = formatted.replacen('?', &param.display(), 1);
    }
    strip_where_stub(&formatted)
}

fn strip_where_stub(sql: &str) -> String {
    let stripped = WHERE_STUB_AND.replace(sql, "WHERE ");
    WHERE_STUB.replace(&stripped, "").into_owned()
}

fn value_as_key(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Re-shape a grouped result so every explicitly requested filter value
/// appears exactly once, in request order, zero-filled when the query
/// returned no row for it.
pub fn reconcile_grouped(result: &RowSet, key: &str, requested: &[String]) -> RowSet {
    let existing: HashMap<String, serde_json::Value> = result
        .rows
        .iter()
        .filter_map(|row| {
            let k = row.get(key).and_then(value_as_key)?;
            Some((k, row.get("value").cloned().unwrap_or(serde_json::json!(0))))
        })
        .collect();

    let rows = requested
        .iter()
        .map(|value| {
            let mut row = Row::new();
            row.insert(key.to_string(), serde_json::json!(value));
            row.insert(
                "value".to_string(),
                existing.get(value).cloned().unwrap_or(serde_json::json!(0)),
            );
            row
        })
        .collect();

    RowSet {
        columns: vec![key.to_string(), "value".to_string()],
        rows,
    }
}

/// Derive the grouped variant of a plain aggregate template: the projection
/// must be exactly `SELECT COUNT(*) AS value`, which is swapped for the
/// grouping column plus the count. Templates with any other projection are
/// rejected rather than rewritten.
pub fn grouped_chart_sql(metric: &MetricDef, column: &str) -> Result<String> {
    let upper = metric.sql.to_uppercase();
    let from_idx = upper.find(" FROM ").ok_or_else(|| {
        AssistantError::Config(format!("metric '{}' has no FROM clause", metric.id))
    })?;
    let head = metric.sql[..from_idx]
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase();
    if head != "SELECT COUNT(*) AS VALUE" {
        return Err(AssistantError::Config(format!(
            "metric '{}' does not support a grouped chart",
            metric.id
        )));
    }
    let tail = &metric.sql[from_idx..];
    Ok(format!(
        "SELECT {col} AS product, COUNT(*) AS value{tail} GROUP BY {col}",
        col = column,
        tail = tail
    ))
}

#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub reply: String,
    pub rows: RowSet,
    pub display_sql: String,
    pub chart: Option<ChartSpec>,
}

/// Compile and run the query for a fully (or sufficiently) specified state,
/// formatting the reply per metric kind.
pub fn execute_for_state(
    catalog: &MetricCatalog,
    store: &dyn DataStore,
    state: &ConversationState,
) -> Result<QueryOutcome> {
    let metric_id = state
        .metric_id
        .as_deref()
        .ok_or_else(|| AssistantError::Dialogue("no metric selected".to_string()))?;
    let metric = catalog.require_metric(state.category_id.as_deref(), metric_id)?;
    let compiled = compile(catalog, metric, state)?;
    debug!(metric = %metric.id, sql = %compiled.display_sql, "executing query");

    match metric.kind {
        MetricKind::Aggregate => {
            let result = store.query(&compiled.sql, &compiled.params)?;
            let value = result
                .rows
                .first()
                .and_then(|row| row.get("value"))
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            Ok(QueryOutcome {
                reply: format!("查询结果：{}为 {} 。", metric.label, value),
                rows: result,
                display_sql: compiled.display_sql,
                chart: None,
            })
        }
        MetricKind::AggregateGroup => {
            let result = store.query(&compiled.sql, &compiled.params)?;
            let key = metric.group_by.as_deref().unwrap_or("item");

            let mut rows = result;
            if let Some(dim_id) = &state.filter_dimension {
                if !state.filter_values.is_empty() {
                    let dim = catalog.require_dimension(dim_id)?;
                    if metric.dimension_column(dim) == key {
                        rows = reconcile_grouped(&rows, key, &state.filter_values);
                    }
                }
            }

            if rows.is_empty() {
                return Ok(QueryOutcome {
                    reply: "未查询到符合条件的数据。".to_string(),
                    rows,
                    display_sql: compiled.display_sql,
                    chart: None,
                });
            }

            let lines: Vec<String> = rows
                .rows
                .iter()
                .map(|row| {
                    let label = row
                        .get(key)
                        .and_then(value_as_key)
                        .unwrap_or_else(|| "未知".to_string());
                    let value = row.get("value").and_then(|v| v.as_i64()).unwrap_or(0);
                    format!("{}：{} 人", label, value)
                })
                .collect();
            let chart = ChartSpec::from_rows(&rows, key);
            Ok(QueryOutcome {
                reply: format!("{}如下：\n{}", metric.label, lines.join("\n")),
                rows,
                display_sql: compiled.display_sql,
                chart: Some(chart),
            })
        }
        MetricKind::Detail => {
            let result = store.query(&compiled.sql, &compiled.params)?;
            if result.is_empty() {
                return Ok(QueryOutcome {
                    reply: "未查询到符合条件的明细。".to_string(),
                    rows: result,
                    display_sql: compiled.display_sql,
                    chart: None,
                });
            }
            let lines: Vec<String> = result
                .rows
                .iter()
                .map(|row| {
                    result
                        .columns
                        .iter()
                        .filter_map(|col| row.get(col))
                        .map(|v| match v {
                            serde_json::Value::String(s) => s.clone(),
                            serde_json::Value::Null => String::new(),
                            other => other.to_string(),
                        })
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .collect();
            Ok(QueryOutcome {
                reply: format!(
                    "查询到以下明细（最多显示 {} 条）：\n{}",
                    DETAIL_ROW_CAP,
                    lines.join("\n")
                ),
                rows: result,
                display_sql: compiled.display_sql,
                chart: None,
            })
        }
    }
}

/// Chart for a plain aggregate metric: run the grouped variant over the same
/// filter clause, zero-filling explicitly requested products. Returns `None`
/// when there is nothing to draw.
pub fn chart_for_aggregate(
    catalog: &MetricCatalog,
    store: &dyn DataStore,
    metric: &MetricDef,
    state: &ConversationState,
) -> Result<Option<(ChartSpec, String)>> {
    let product = catalog.require_dimension("product")?;
    let column = metric.dimension_column(product);

    let clause = build_where(catalog, metric, state)?;
    let sql = grouped_chart_sql(metric, column)?.replacen("{where}", &clause.render(), 1);
    let params = clause.into_params();
    let display_sql = format_sql_for_display(&sql, &params);

    let result = store.query(&sql, &params)?;
    let rows = if state.filter_dimension.as_deref() == Some("product")
        && !state.filter_values.is_empty()
    {
        reconcile_grouped(&result, "product", &state.filter_values)
    } else {
        result
    };

    if rows.is_empty() && state.filter_values.is_empty() {
        return Ok(None);
    }
    Ok(Some((ChartSpec::from_rows(&rows, "product"), display_sql)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TimeRange;

    fn catalog() -> MetricCatalog {
        MetricCatalog::builtin().unwrap()
    }

    fn state_with(
        metric: &str,
        category: &str,
        time: Option<TimeRange>,
        dim: Option<&str>,
        values: &[&str],
    ) -> ConversationState {
        let mut state = ConversationState::new();
        state.category_id = Some(category.to_string());
        state.metric_id = Some(metric.to_string());
        state.time_range = time;
        state.filter_dimension = dim.map(|d| d.to_string());
        state.filter_values = values.iter().map(|v| v.to_string()).collect();
        state
    }

    #[test]
    fn compiled_params_match_placeholders() {
        let catalog = catalog();
        let metric = catalog.find_metric("personnel", "engineer_count").unwrap();
        let state = state_with(
            "engineer_count",
            "personnel",
            Some(TimeRange {
                kind: TimeRangeKind::HalfFy,
                value: Some("2025H2".to_string()),
                label: "2025 下半年".to_string(),
            }),
            Some("product"),
            &["CT", "SPS"],
        );

        let compiled = compile(&catalog, metric, &state).unwrap();
        assert!(!compiled.sql.contains("{where}"));
        assert_eq!(
            compiled.sql.matches('?').count(),
            compiled.params.len(),
            "placeholder count must equal param count"
        );
        assert_eq!(compiled.params.len(), 5);
        assert!(compiled.sql.contains("st_DeptName IN (?,?)"));
    }

    #[test]
    fn month_filter_binds_the_month_column() {
        let catalog = catalog();
        let metric = catalog.find_metric("personnel", "engineer_count").unwrap();
        let state = state_with(
            "engineer_count",
            "personnel",
            Some(TimeRange::month("202510")),
            None,
            &[],
        );
        let compiled = compile(&catalog, metric, &state).unwrap();
        assert!(compiled.sql.contains("st_WrMonth = ?"));
        assert_eq!(compiled.params, vec![SqlValue::text("202510")]);
    }

    #[test]
    fn dimension_override_resolves_machine_product_column() {
        let catalog = catalog();
        let metric = catalog.find_metric("machine", "machine_count").unwrap();
        let state = state_with("machine_count", "machine", None, Some("product"), &["CT"]);
        let compiled = compile(&catalog, metric, &state).unwrap();
        assert!(compiled.sql.contains("st_ProductLine IN (?)"));
    }

    #[test]
    fn display_sql_inlines_params_and_strips_stub() {
        let sql = "SELECT COUNT(*) AS value FROM t WHERE 1=1 AND st_WrMonth = ? AND x IN (?,?)";
        let params = vec![
            SqlValue::text("202510"),
            SqlValue::text("CT"),
            SqlValue::Integer(3),
        ];
        let display = format_sql_for_display(sql, &params);
        assert_eq!(
            display,
            "SELECT COUNT(*) AS value FROM t WHERE st_WrMonth = '202510' AND x IN ('CT',3)"
        );

        let bare = format_sql_for_display("SELECT * FROM t WHERE 1=1", &[]);
        assert_eq!(bare, "SELECT * FROM t ");
    }

    #[test]
    fn detail_queries_are_capped() {
        let catalog = catalog();
        let metric = catalog.find_metric("personnel", "engineer_detail").unwrap();
        let state = state_with(
            "engineer_detail",
            "personnel",
            Some(TimeRange::month("202510")),
            None,
            &[],
        );
        let compiled = compile(&catalog, metric, &state).unwrap();
        assert!(compiled.sql.ends_with("LIMIT 50"));
    }

    #[test]
    fn reconcile_fills_missing_requested_values_in_order() {
        let result = RowSet {
            columns: vec!["product".to_string(), "value".to_string()],
            rows: vec![{
                let mut row = Row::new();
                row.insert("product".to_string(), serde_json::json!("CT"));
                row.insert("value".to_string(), serde_json::json!(5));
                row
            }],
        };
        let reconciled = reconcile_grouped(
            &result,
            "product",
            &["CT".to_string(), "SPS".to_string()],
        );
        assert_eq!(reconciled.rows.len(), 2);
        assert_eq!(reconciled.rows[0]["product"], serde_json::json!("CT"));
        assert_eq!(reconciled.rows[0]["value"], serde_json::json!(5));
        assert_eq!(reconciled.rows[1]["product"], serde_json::json!("SPS"));
        assert_eq!(reconciled.rows[1]["value"], serde_json::json!(0));
    }

    #[test]
    fn grouped_chart_sql_rewrites_only_plain_counts() {
        let catalog = catalog();
        let metric = catalog.find_metric("machine", "machine_count").unwrap();
        let sql = grouped_chart_sql(metric, "st_ProductLine").unwrap();
        assert!(sql.starts_with("SELECT st_ProductLine AS product, COUNT(*) AS value FROM"));
        assert!(sql.ends_with("GROUP BY st_ProductLine"));
        assert!(sql.contains("{where}"));

        let detail = catalog.find_metric("machine", "machine_detail").unwrap();
        assert!(grouped_chart_sql(detail, "st_ProductLine").is_err());
    }
}
