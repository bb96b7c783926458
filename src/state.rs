//! Per-conversation mutable state and the dialogue stage machine's positions.

use crate::catalog::TimeType;
use crate::datastore::RowSet;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Forward slot-filling order of the dialogue. `ExecutingQuery` is transient:
/// it is entered and left within a single turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    #[serde(rename = "KPI_CATEGORY_SELECT")]
    CategorySelect,
    #[serde(rename = "KPI_METRIC_SELECT")]
    MetricSelect,
    #[serde(rename = "TIME_TYPE_SELECT")]
    TimeTypeSelect,
    #[serde(rename = "TIME_VALUE_SELECT")]
    TimeValueSelect,
    #[serde(rename = "FILTER_DIMENSION_SELECT")]
    FilterDimensionSelect,
    #[serde(rename = "FILTER_VALUE_SELECT")]
    FilterValueSelect,
    #[serde(rename = "SUMMARY_CONFIRM")]
    SummaryConfirm,
    #[serde(rename = "EXECUTING_QUERY")]
    ExecutingQuery,
    #[serde(rename = "SHOW_RESULT")]
    ShowResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeRangeKind {
    Month,
    HalfFy,
    Fy,
    /// Free-typed value accepted at TimeValueSelect; compiled like a month.
    Custom,
    /// The metric takes no time filter at all.
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(rename = "type")]
    pub kind: TimeRangeKind,
    pub value: Option<String>,
    pub label: String,
}

impl TimeRange {
    pub fn month(value: impl Into<String>) -> Self {
        let value = value.into();
        TimeRange {
            kind: TimeRangeKind::Month,
            label: value.clone(),
            value: Some(value),
        }
    }

    pub fn unbounded() -> Self {
        TimeRange {
            kind: TimeRangeKind::None,
            value: None,
            label: "不限".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationState {
    pub stage: Stage,
    pub category_id: Option<String>,
    pub metric_id: Option<String>,
    pub time_type: Option<TimeType>,
    pub time_range: Option<TimeRange>,
    /// `None` means no dimension chosen (or explicitly "no filter").
    pub filter_dimension: Option<String>,
    /// Ordered, duplicate-free. Never populated while `filter_dimension` is unset.
    pub filter_values: Vec<String>,
    #[serde(skip_serializing)]
    pub last_result: Option<RowSet>,
    pub last_display_sql: Option<String>,
    #[serde(skip_serializing)]
    pub last_active: Instant,
}

impl ConversationState {
    pub fn new() -> Self {
        ConversationState {
            stage: Stage::CategorySelect,
            category_id: None,
            metric_id: None,
            time_type: None,
            time_range: None,
            filter_dimension: None,
            filter_values: Vec::new(),
            last_result: None,
            last_display_sql: None,
            last_active: Instant::now(),
        }
    }

    /// "modify" and "new query" both clear every slot and return to the start.
    pub fn reset(&mut self) {
        *self = ConversationState::new();
    }

    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    pub fn push_filter_value(&mut self, value: impl Into<String>) {
        let value = value.into();
        if !self.filter_values.contains(&value) {
            self.filter_values.push(value);
        }
    }
}

impl Default for ConversationState {
    fn default() -> Self {
        ConversationState::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_all_slots() {
        let mut state = ConversationState::new();
        state.stage = Stage::ShowResult;
        state.metric_id = Some("engineer_count".to_string());
        state.filter_dimension = Some("product".to_string());
        state.push_filter_value("CT");
        state.reset();
        assert_eq!(state.stage, Stage::CategorySelect);
        assert!(state.metric_id.is_none());
        assert!(state.filter_dimension.is_none());
        assert!(state.filter_values.is_empty());
    }

    #[test]
    fn filter_values_stay_duplicate_free() {
        let mut state = ConversationState::new();
        state.filter_dimension = Some("product".to_string());
        state.push_filter_value("CT");
        state.push_filter_value("SPS");
        state.push_filter_value("CT");
        assert_eq!(state.filter_values, vec!["CT", "SPS"]);
    }

    #[test]
    fn stage_serializes_to_wire_names() {
        let json = serde_json::to_string(&Stage::CategorySelect).unwrap();
        assert_eq!(json, "\"KPI_CATEGORY_SELECT\"");
    }
}
