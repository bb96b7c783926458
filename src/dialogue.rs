//! The dialogue engine: a finite-state controller that walks a conversation
//! through metric, time and filter selection, short-circuiting stages with
//! whatever the slot extractor already mined from free text.
//!
//! Every failure is recovered at the turn boundary; nothing in here is fatal
//! to the process.

use crate::catalog::{MetricCatalog, MetricDef, MetricKind, TimeType};
use crate::chart::ChartSpec;
use crate::datastore::{list_time_options, DataStore, RowSet};
use crate::error::AssistantError;
use crate::llm::IntentClassifier;
use crate::nlu::{self, PartialSlots};
use crate::query;
use crate::state::{ConversationState, Stage, TimeRange, TimeRangeKind};
use crate::store::ConversationStore;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

lazy_static! {
    static ref MONTH_SHAPE: Regex = Regex::new(r"^\d{6}$").unwrap();
    static ref HALF_FY_SHAPE: Regex = Regex::new(r"^\d{4}H[12]$").unwrap();
    static ref FY_SHAPE: Regex = Regex::new(r"^\d{4}$").unwrap();
}

/// Explicit button payloads. The wire names match the chat frontend's
/// `{"type": "...", ...}` envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ButtonPayload {
    KpiCategory {
        id: String,
    },
    KpiMetric {
        id: String,
    },
    TimeType {
        value: TimeType,
    },
    TimeValue {
        value: String,
        label: String,
        #[serde(default, rename = "timeType")]
        time_type: Option<TimeType>,
    },
    FilterDimension {
        value: String,
    },
    FilterValue {
        value: String,
    },
    ConfirmFilterValues {
        #[serde(default)]
        values: Vec<String>,
    },
    ConfirmStart,
    Modify,
    NewQuery,
    Chart,
    DownloadDetail,
}

/// Sentinel used by the filter-dimension buttons for "no filter".
pub const NO_FILTER: &str = "NONE";

#[derive(Debug, Clone, Serialize)]
pub struct OptionItem {
    pub label: String,
    pub payload: ButtonPayload,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnResponse {
    pub reply: String,
    pub summary: String,
    pub stage: Stage,
    pub options: Vec<OptionItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart: Option<ChartSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<RowSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_sql: Option<String>,
    pub done: bool,
}

/// What one turn produced before options and summary are attached.
#[derive(Debug, Default)]
struct TurnParts {
    reply: String,
    chart: Option<ChartSpec>,
    rows: Option<RowSet>,
    display_sql: Option<String>,
    done: bool,
}

impl TurnParts {
    fn reply(text: impl Into<String>) -> Self {
        TurnParts {
            reply: text.into(),
            ..TurnParts::default()
        }
    }
}

pub struct DialogEngine {
    catalog: Arc<MetricCatalog>,
    store: Arc<dyn DataStore>,
    classifier: Arc<dyn IntentClassifier>,
    sessions: ConversationStore,
}

impl DialogEngine {
    pub fn new(
        catalog: Arc<MetricCatalog>,
        store: Arc<dyn DataStore>,
        classifier: Arc<dyn IntentClassifier>,
    ) -> Self {
        DialogEngine {
            catalog,
            store,
            classifier,
            sessions: ConversationStore::new(),
        }
    }

    pub fn sessions(&self) -> &ConversationStore {
        &self.sessions
    }

    pub fn catalog(&self) -> &MetricCatalog {
        &self.catalog
    }

    /// Selectable time values derived from the data store.
    pub fn time_options(&self) -> crate::error::Result<crate::datastore::TimeOptionGroups> {
        list_time_options(self.store.as_ref())
    }

    /// Process one inbound turn. Free-text extraction (the only await, and
    /// the only cancellation point via the classifier timeout) runs before
    /// the per-conversation entry is locked; everything that touches state
    /// is synchronous.
    pub async fn handle_turn(
        &self,
        conversation_id: &str,
        message: Option<&str>,
        payload: Option<ButtonPayload>,
        time_override: Option<TimeRange>,
    ) -> TurnResponse {
        let text = message.map(str::trim).filter(|t| !t.is_empty());
        let slots = match text {
            Some(text) => {
                nlu::extract_slots(&self.catalog, self.classifier.as_ref(), text).await
            }
            None => None,
        };

        info!(
            conversation = conversation_id,
            has_text = text.is_some(),
            has_payload = payload.is_some(),
            "handling turn"
        );

        self.sessions.with_state(conversation_id, |state| {
            let parts = self.process_turn(state, text, slots, payload, time_override);
            self.respond(state, parts)
        })
    }

    fn process_turn(
        &self,
        state: &mut ConversationState,
        text: Option<&str>,
        slots: Option<PartialSlots>,
        payload: Option<ButtonPayload>,
        time_override: Option<TimeRange>,
    ) -> TurnParts {
        if let Some(slots) = slots {
            self.apply_slots(state, slots, time_override.as_ref());
            return TurnParts::reply(self.advance(state));
        }

        if let (Some(text), None) = (text, payload.as_ref()) {
            if state.stage == Stage::CategorySelect {
                return match self.catalog.find_category_by_label(text) {
                    Some(category) => {
                        state.category_id = Some(category.id.clone());
                        state.stage = Stage::MetricSelect;
                        TurnParts::reply(format!(
                            "已选择：{}。\n请选择二级指标：",
                            category.label
                        ))
                    }
                    None => TurnParts::reply(
                        "很抱歉，您咨询的问题已经超纲了。\n目前仅支持查询人员信息、工程师数量等指标。",
                    ),
                };
            }
        }

        if payload.is_none() {
            if let Some(range) = time_override {
                state.time_range = Some(range);
                return TurnParts::reply(self.advance(state));
            }
        }

        match payload {
            Some(payload) => self.handle_payload(state, payload),
            None => self.handle_plain_text(state, text),
        }
    }

    fn apply_slots(
        &self,
        state: &mut ConversationState,
        slots: PartialSlots,
        time_override: Option<&TimeRange>,
    ) {
        if slots.metric_id.is_some() {
            state.category_id = slots.category_id;
            state.metric_id = slots.metric_id;
        }
        if let Some(range) = time_override {
            state.time_range = Some(range.clone());
        } else if let Some(range) = slots.time_range {
            state.time_range = Some(range);
        }
        if let Some(dimension) = slots.filter_dimension {
            state.filter_dimension = Some(dimension);
            state.filter_values = slots.filter_values;
        }
    }

    /// Free text with no extractable slots at a stage that expects typed
    /// input: time type and time value accept text, everything else
    /// re-prompts for a button.
    fn handle_plain_text(&self, state: &mut ConversationState, text: Option<&str>) -> TurnParts {
        let Some(text) = text else {
            return TurnParts::reply("请使用下方按钮继续选择，或输入更完整的问题。");
        };
        match state.stage {
            Stage::TimeTypeSelect => match TimeType::parse(text) {
                Some(time_type) => {
                    state.time_type = Some(time_type);
                    state.stage = Stage::TimeValueSelect;
                    TurnParts::reply("请选择具体时间：")
                }
                None => TurnParts::reply(
                    "输入无效。请点击按钮选择时间类型（Month, HalfFY, FY）。",
                ),
            },
            Stage::TimeValueSelect => {
                let value = text.trim();
                if !time_value_matches_type(state.time_type, value) {
                    let current = state
                        .time_type
                        .map(|t| t.label())
                        .unwrap_or("未知");
                    return TurnParts::reply(format!(
                        "时间格式无效。请重新输入（当前类型: {}）。\n示例：202506 (Month), 2025H1 (HalfFY), 2025 (FY)。",
                        current
                    ));
                }
                state.time_range = Some(TimeRange {
                    kind: TimeRangeKind::Custom,
                    value: Some(value.to_string()),
                    label: value.to_string(),
                });
                state.stage = Stage::FilterDimensionSelect;
                TurnParts::reply("请选择筛选维度：")
            }
            _ => TurnParts::reply("请使用下方按钮继续选择，或输入更完整的问题。"),
        }
    }

    fn handle_payload(&self, state: &mut ConversationState, payload: ButtonPayload) -> TurnParts {
        match (state.stage, payload) {
            (Stage::CategorySelect, ButtonPayload::KpiCategory { id }) => {
                state.category_id = Some(id);
                TurnParts::reply(self.advance(state))
            }
            (Stage::MetricSelect, ButtonPayload::KpiMetric { id }) => {
                state.metric_id = Some(id);
                TurnParts::reply(self.advance(state))
            }
            (Stage::TimeTypeSelect, ButtonPayload::TimeType { value }) => {
                state.time_type = Some(value);
                state.stage = Stage::TimeValueSelect;
                TurnParts::reply("请选择具体时间：")
            }
            (
                Stage::TimeTypeSelect | Stage::TimeValueSelect,
                ButtonPayload::TimeValue {
                    value,
                    label,
                    time_type,
                },
            ) => {
                let kind = match time_type.or(state.time_type) {
                    Some(TimeType::Month) => TimeRangeKind::Month,
                    Some(TimeType::HalfFy) => TimeRangeKind::HalfFy,
                    Some(TimeType::Fy) => TimeRangeKind::Fy,
                    None => TimeRangeKind::Custom,
                };
                state.time_range = Some(TimeRange {
                    kind,
                    value: Some(value),
                    label,
                });
                TurnParts::reply(self.advance(state))
            }
            (Stage::FilterDimensionSelect, ButtonPayload::FilterDimension { value }) => {
                if value == NO_FILTER {
                    state.filter_dimension = None;
                    state.filter_values.clear();
                    return self.execute_query(state);
                }
                if self.catalog.find_dimension(&value).is_none() {
                    return TurnParts::reply("未找到对应的筛选维度配置。");
                }
                state.filter_dimension = Some(value);
                state.filter_values.clear();
                TurnParts::reply(self.advance(state))
            }
            (Stage::FilterValueSelect, ButtonPayload::ConfirmFilterValues { values }) => {
                state.filter_values.clear();
                for value in values {
                    state.push_filter_value(value);
                }
                self.execute_query(state)
            }
            (Stage::FilterValueSelect, ButtonPayload::FilterValue { value }) => {
                state.push_filter_value(value);
                state.stage = Stage::SummaryConfirm;
                TurnParts::reply(self.summarize(state))
            }
            (Stage::SummaryConfirm, ButtonPayload::ConfirmStart) => self.execute_query(state),
            (Stage::SummaryConfirm, ButtonPayload::Modify) => {
                state.reset();
                TurnParts::reply("请重新选择KPI大类：")
            }
            (Stage::ShowResult, ButtonPayload::NewQuery) => {
                state.reset();
                TurnParts::reply("开始新的查询，请选择KPI大类：")
            }
            (Stage::ShowResult, ButtonPayload::Chart) => self.handle_chart(state),
            (Stage::ShowResult, ButtonPayload::DownloadDetail) => {
                TurnParts::reply("已准备好明细数据，请点击下载按钮。")
            }
            _ => TurnParts::reply("未能理解你的选择，请使用提供的按钮继续操作。"),
        }
    }

    /// Move the stage to the earliest unfilled slot and return the prompt for
    /// it. Applying this twice with no new input never advances further.
    fn advance(&self, state: &mut ConversationState) -> String {
        let metric = match state.metric_id.as_deref() {
            None => {
                if state.category_id.is_some() {
                    state.stage = Stage::MetricSelect;
                    return "请选择二级指标：".to_string();
                }
                state.stage = Stage::CategorySelect;
                return "请先选择KPI大类：".to_string();
            }
            Some(metric_id) => {
                let found = match state.category_id.as_deref() {
                    Some(category_id) => self.catalog.find_metric(category_id, metric_id),
                    None => self
                        .catalog
                        .find_metric_anywhere(metric_id)
                        .map(|(_, m)| m),
                };
                match found {
                    Some(metric) => metric,
                    // Stage intentionally left unchanged on a config hole.
                    None => return "未找到对应的指标配置。".to_string(),
                }
            }
        };

        if state.time_range.is_none() {
            if metric.has_time_config() {
                state.stage = Stage::TimeTypeSelect;
                return "已识别指标，请继续选择时间类型：".to_string();
            }
            state.time_range = Some(TimeRange::unbounded());
        }

        if state.filter_dimension.is_none() {
            state.stage = Stage::FilterDimensionSelect;
            return "已识别指标和时间，请选择筛选维度：".to_string();
        }

        if state.filter_values.is_empty() {
            state.stage = Stage::FilterValueSelect;
            return "请选择具体值：".to_string();
        }

        state.stage = Stage::SummaryConfirm;
        format!(
            "{}\n如无问题，请点击“开始查询”，或选择“修改”。",
            self.summarize(state)
        )
    }

    /// `ExecutingQuery` is entered and left within this call: `ShowResult` on
    /// success, back to `SummaryConfirm` on query failure so the user can
    /// retry, and the prior stage on a configuration hole.
    fn execute_query(&self, state: &mut ConversationState) -> TurnParts {
        let prior_stage = state.stage;
        state.stage = Stage::ExecutingQuery;
        match query::execute_for_state(&self.catalog, self.store.as_ref(), state) {
            Ok(outcome) => {
                state.last_result = Some(outcome.rows.clone());
                state.last_display_sql = Some(outcome.display_sql.clone());
                state.stage = Stage::ShowResult;
                TurnParts {
                    reply: outcome.reply,
                    chart: outcome.chart,
                    rows: Some(outcome.rows),
                    display_sql: Some(outcome.display_sql),
                    done: true,
                }
            }
            Err(AssistantError::Config(msg)) => {
                warn!("query blocked by configuration hole: {}", msg);
                state.stage = prior_stage;
                TurnParts::reply("未找到对应的指标配置。")
            }
            Err(e) => {
                warn!("query execution failed: {}", e);
                state.stage = Stage::SummaryConfirm;
                TurnParts::reply(format!("执行数据库查询时出错：{}", e))
            }
        }
    }

    /// Chart request on the result stage. Grouped results chart directly from
    /// the cached rows; plain aggregates run the grouped variant of their own
    /// query. Anything else is unsupported. The stage never moves.
    fn handle_chart(&self, state: &mut ConversationState) -> TurnParts {
        let unsupported = || TurnParts::reply("当前指标或数据不支持生成图表。");

        let metric = match self.resolve_metric(state) {
            Some(metric) => metric,
            None => return unsupported(),
        };

        match metric.kind {
            MetricKind::AggregateGroup => match &state.last_result {
                Some(rows) if !rows.is_empty() => {
                    let key = metric.group_by.as_deref().unwrap_or("item");
                    TurnParts {
                        reply: "已为您生成图表：".to_string(),
                        chart: Some(ChartSpec::from_rows(rows, key)),
                        ..TurnParts::default()
                    }
                }
                _ => unsupported(),
            },
            MetricKind::Aggregate => {
                match query::chart_for_aggregate(&self.catalog, self.store.as_ref(), metric, state)
                {
                    Ok(Some((chart, display_sql))) => {
                        state.last_display_sql = Some(display_sql.clone());
                        TurnParts {
                            reply: "已按产品为您生成图表：".to_string(),
                            chart: Some(chart),
                            display_sql: Some(display_sql),
                            ..TurnParts::default()
                        }
                    }
                    Ok(None) => unsupported(),
                    Err(e) => {
                        warn!("chart derivation failed: {}", e);
                        unsupported()
                    }
                }
            }
            MetricKind::Detail => unsupported(),
        }
    }

    fn resolve_metric(&self, state: &ConversationState) -> Option<&MetricDef> {
        let metric_id = state.metric_id.as_deref()?;
        match state.category_id.as_deref() {
            Some(category_id) => self.catalog.find_metric(category_id, metric_id),
            None => self
                .catalog
                .find_metric_anywhere(metric_id)
                .map(|(_, m)| m),
        }
    }

    fn summarize(&self, state: &ConversationState) -> String {
        let category = state
            .category_id
            .as_deref()
            .and_then(|id| self.catalog.find_category(id));
        let metric = self.resolve_metric(state);

        let mut parts = Vec::new();
        if let Some(category) = category {
            parts.push(category.label.clone());
        }
        if let Some(metric) = metric {
            parts.push(metric.label.clone());
        }
        let kpi_text = if parts.is_empty() {
            "未选择".to_string()
        } else {
            parts.join(" / ")
        };

        let time_text = state
            .time_range
            .as_ref()
            .map(|t| t.label.clone())
            .unwrap_or_else(|| "未选择".to_string());

        let mut filter_text = "不筛选".to_string();
        if let Some(dim_id) = &state.filter_dimension {
            if !state.filter_values.is_empty() {
                if let Some(dim) = self.catalog.find_dimension(dim_id) {
                    let labels: Vec<&str> = dim
                        .values
                        .iter()
                        .filter(|v| state.filter_values.contains(&v.id))
                        .map(|v| v.label.as_str())
                        .collect();
                    filter_text = format!("{}：{}", dim.label, labels.join("、"));
                }
            }
        }

        let mut summary = format!(
            "已选择指标：{}\n时间范围：{}\n筛选条件：{}",
            kpi_text, time_text, filter_text
        );
        if let Some(sql) = &state.last_display_sql {
            summary.push_str(&format!("\nSQL: {}", sql));
        }
        summary
    }

    fn respond(&self, state: &mut ConversationState, parts: TurnParts) -> TurnResponse {
        let (options, reply) = match self.options_for_stage(state) {
            Ok(options) => (options, parts.reply),
            Err(e) => {
                warn!("failed to build options: {}", e);
                (
                    Vec::new(),
                    format!(
                        "{}\n\n(系统提示：加载选项失败，数据库连接异常。请联系管理员检查配置。)",
                        parts.reply
                    ),
                )
            }
        };
        TurnResponse {
            reply,
            summary: self.summarize(state),
            stage: state.stage,
            options,
            chart: parts.chart,
            rows: parts.rows,
            display_sql: parts.display_sql,
            done: parts.done,
        }
    }

    fn options_for_stage(&self, state: &ConversationState) -> crate::error::Result<Vec<OptionItem>> {
        let metric = self.resolve_metric(state);
        Ok(match state.stage {
            Stage::CategorySelect => self
                .catalog
                .categories
                .iter()
                .map(|c| OptionItem {
                    label: c.label.clone(),
                    payload: ButtonPayload::KpiCategory { id: c.id.clone() },
                })
                .collect(),
            Stage::MetricSelect => state
                .category_id
                .as_deref()
                .and_then(|id| self.catalog.find_category(id))
                .map(|category| {
                    category
                        .metrics
                        .iter()
                        .map(|m| OptionItem {
                            label: m.label.clone(),
                            payload: ButtonPayload::KpiMetric { id: m.id.clone() },
                        })
                        .collect()
                })
                .unwrap_or_default(),
            Stage::TimeTypeSelect => {
                let allowed = metric
                    .map(|m| m.allowed_time_types.clone())
                    .filter(|types| !types.is_empty())
                    .unwrap_or_else(|| vec![TimeType::Month, TimeType::HalfFy, TimeType::Fy]);
                allowed
                    .into_iter()
                    .map(|t| OptionItem {
                        label: t.label().to_string(),
                        payload: ButtonPayload::TimeType { value: t },
                    })
                    .collect()
            }
            Stage::TimeValueSelect => {
                let groups = list_time_options(self.store.as_ref())?;
                let time_type = state.time_type.unwrap_or(TimeType::Month);
                let options = match time_type {
                    TimeType::Month => groups.month,
                    TimeType::HalfFy => groups.half_fy,
                    TimeType::Fy => groups.fy,
                };
                options
                    .into_iter()
                    .map(|opt| OptionItem {
                        label: opt.label.clone(),
                        payload: ButtonPayload::TimeValue {
                            value: opt.value,
                            label: opt.label,
                            time_type: Some(time_type),
                        },
                    })
                    .collect()
            }
            Stage::FilterDimensionSelect => {
                let allowed = metric.map(|m| m.allowed_filter_dimensions.clone());
                let mut options: Vec<OptionItem> = self
                    .catalog
                    .filter_dimensions
                    .iter()
                    .filter(|d| {
                        allowed
                            .as_ref()
                            .map(|ids| ids.is_empty() || ids.contains(&d.id))
                            .unwrap_or(true)
                    })
                    .map(|d| OptionItem {
                        label: d.label.clone(),
                        payload: ButtonPayload::FilterDimension {
                            value: d.id.clone(),
                        },
                    })
                    .collect();
                options.push(OptionItem {
                    label: "不筛选".to_string(),
                    payload: ButtonPayload::FilterDimension {
                        value: NO_FILTER.to_string(),
                    },
                });
                options
            }
            Stage::FilterValueSelect => state
                .filter_dimension
                .as_deref()
                .and_then(|id| self.catalog.find_dimension(id))
                .map(|dim| {
                    dim.values
                        .iter()
                        .map(|v| OptionItem {
                            label: v.label.clone(),
                            payload: ButtonPayload::FilterValue { value: v.id.clone() },
                        })
                        .collect()
                })
                .unwrap_or_default(),
            Stage::SummaryConfirm => vec![
                OptionItem {
                    label: "开始查询".to_string(),
                    payload: ButtonPayload::ConfirmStart,
                },
                OptionItem {
                    label: "修改".to_string(),
                    payload: ButtonPayload::Modify,
                },
            ],
            Stage::ShowResult => vec![
                OptionItem {
                    label: "生成图表".to_string(),
                    payload: ButtonPayload::Chart,
                },
                OptionItem {
                    label: "下载明细".to_string(),
                    payload: ButtonPayload::DownloadDetail,
                },
                OptionItem {
                    label: "新查询".to_string(),
                    payload: ButtonPayload::NewQuery,
                },
            ],
            Stage::ExecutingQuery => Vec::new(),
        })
    }
}

/// Shape check for raw time input when the dialogue explicitly asked for a
/// time value. With no type selected yet, any of the three shapes passes.
fn time_value_matches_type(time_type: Option<TimeType>, value: &str) -> bool {
    match time_type {
        Some(TimeType::Month) => MONTH_SHAPE.is_match(value),
        Some(TimeType::HalfFy) => HALF_FY_SHAPE.is_match(value),
        Some(TimeType::Fy) => FY_SHAPE.is_match(value),
        None => {
            MONTH_SHAPE.is_match(value)
                || HALF_FY_SHAPE.is_match(value)
                || FY_SHAPE.is_match(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_value_shapes_follow_the_selected_type() {
        assert!(time_value_matches_type(Some(TimeType::Month), "202506"));
        assert!(!time_value_matches_type(Some(TimeType::Month), "2025H1"));
        assert!(time_value_matches_type(Some(TimeType::HalfFy), "2025H1"));
        assert!(!time_value_matches_type(Some(TimeType::HalfFy), "2025"));
        assert!(time_value_matches_type(Some(TimeType::Fy), "2025"));
        assert!(time_value_matches_type(None, "2025H2"));
        assert!(!time_value_matches_type(None, "H2"));
    }

    #[test]
    fn button_payloads_use_the_wire_envelope() {
        let payload: ButtonPayload =
            serde_json::from_str(r#"{"type":"kpi_category","id":"personnel"}"#).unwrap();
        assert_eq!(
            payload,
            ButtonPayload::KpiCategory {
                id: "personnel".to_string()
            }
        );

        let payload: ButtonPayload = serde_json::from_str(
            r#"{"type":"time_value","value":"202510","label":"202510","timeType":"month"}"#,
        )
        .unwrap();
        assert_eq!(
            payload,
            ButtonPayload::TimeValue {
                value: "202510".to_string(),
                label: "202510".to_string(),
                time_type: Some(TimeType::Month),
            }
        );

        let payload: ButtonPayload = serde_json::from_str(r#"{"type":"confirm_start"}"#).unwrap();
        assert_eq!(payload, ButtonPayload::ConfirmStart);
    }
}
