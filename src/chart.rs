//! Renderer-agnostic chart payload. The engine decides whether a chart can
//! be produced and on which rows; drawing it is the caller's concern.

use crate::datastore::RowSet;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChartSpec {
    /// Category axis labels, one per row.
    pub axis: Vec<String>,
    /// Numeric series aligned with `axis`.
    pub values: Vec<f64>,
}

impl ChartSpec {
    /// One bar per row: the `key` column labels the axis, the `value` column
    /// carries the series. Unlabelled rows render as 未知.
    pub fn from_rows(rows: &RowSet, key: &str) -> ChartSpec {
        let mut axis = Vec::with_capacity(rows.len());
        let mut values = Vec::with_capacity(rows.len());
        for row in &rows.rows {
            let label = match row.get(key) {
                Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
                Some(serde_json::Value::Number(n)) => n.to_string(),
                _ => "未知".to_string(),
            };
            let value = row
                .get("value")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            axis.push(label);
            values.push(value);
        }
        ChartSpec { axis, values }
    }
}
