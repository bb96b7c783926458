//! Metric catalog: the declarative description of everything the assistant
//! can be asked about. Loaded once at startup, validated, then only read.

use crate::error::{AssistantError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Month/version column of the roster table, also used for time bucketing.
pub const MONTH_COLUMN: &str = "st_WrMonth";

/// Roster table scanned for the available time options.
pub const ROSTER_TABLE: &str = "dws_tas_roster";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeType {
    Month,
    HalfFy,
    Fy,
}

impl TimeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeType::Month => "month",
            TimeType::HalfFy => "half_fy",
            TimeType::Fy => "fy",
        }
    }

    /// Button label shown to the user.
    pub fn label(&self) -> &'static str {
        match self {
            TimeType::Month => "Month",
            TimeType::HalfFy => "HalfFY",
            TimeType::Fy => "FY",
        }
    }

    pub fn parse(s: &str) -> Option<TimeType> {
        match s.trim().to_lowercase().as_str() {
            "month" => Some(TimeType::Month),
            "half_fy" | "halffy" => Some(TimeType::HalfFy),
            "fy" => Some(TimeType::Fy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Aggregate,
    AggregateGroup,
    Detail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionValue {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterDimensionDef {
    pub id: String,
    pub label: String,
    /// Default column the dimension filters on; metrics may override it.
    pub column: String,
    pub values: Vec<DimensionValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDef {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub description: String,
    /// Keyword phrases for free-text matching. A phrase may be a conjunction
    /// of parts joined by '+'; all parts must occur in the text.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Explicit keyword-match priority; lower wins. Metrics without one rank
    /// by declaration order, which also breaks ties.
    #[serde(default)]
    pub keyword_priority: Option<i32>,
    pub kind: MetricKind,
    /// SQL template with a single `{where}` placeholder.
    pub sql: String,
    #[serde(default)]
    pub group_by: Option<String>,
    #[serde(default)]
    pub allowed_time_types: Vec<TimeType>,
    #[serde(default)]
    pub allowed_filter_dimensions: Vec<String>,
    /// Per-metric dimension column overrides, e.g. product -> st_ProductLine.
    #[serde(default)]
    pub dimension_columns: HashMap<String, String>,
}

impl MetricDef {
    /// Column a filter dimension resolves to for this metric.
    pub fn dimension_column<'a>(&'a self, dim: &'a FilterDimensionDef) -> &'a str {
        self.dimension_columns
            .get(&dim.id)
            .map(|c| c.as_str())
            .unwrap_or(&dim.column)
    }

    pub fn has_time_config(&self) -> bool {
        !self.allowed_time_types.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricCategory {
    pub id: String,
    pub label: String,
    pub metrics: Vec<MetricDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricCatalog {
    pub categories: Vec<MetricCategory>,
    pub filter_dimensions: Vec<FilterDimensionDef>,
}

impl MetricCatalog {
    /// Catalog shipped with the binary.
    pub fn builtin() -> Result<Self> {
        Self::from_json_str(include_str!("../config/metrics.json"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let catalog: MetricCatalog = serde_json::from_str(raw)?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Load-time validation; the catalog is immutable afterwards.
    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        let dimension_ids: HashSet<&str> = self
            .filter_dimensions
            .iter()
            .map(|d| d.id.as_str())
            .collect();

        for category in &self.categories {
            for metric in &category.metrics {
                if !seen.insert(metric.id.clone()) {
                    return Err(AssistantError::Config(format!(
                        "duplicate metric id '{}'",
                        metric.id
                    )));
                }
                if metric.sql.matches("{where}").count() != 1 {
                    return Err(AssistantError::Config(format!(
                        "metric '{}' must contain exactly one {{where}} placeholder",
                        metric.id
                    )));
                }
                if metric.kind == MetricKind::AggregateGroup {
                    let group_by = metric.group_by.as_deref().ok_or_else(|| {
                        AssistantError::Config(format!(
                            "grouped metric '{}' is missing group_by",
                            metric.id
                        ))
                    })?;
                    let select = metric
                        .sql
                        .to_uppercase()
                        .find(" FROM ")
                        .map(|idx| metric.sql[..idx].to_string())
                        .unwrap_or_default();
                    if !select.contains(group_by) {
                        return Err(AssistantError::Config(format!(
                            "metric '{}' group_by column '{}' is not selected by its SQL",
                            metric.id, group_by
                        )));
                    }
                }
                for dim_id in metric
                    .allowed_filter_dimensions
                    .iter()
                    .chain(metric.dimension_columns.keys())
                {
                    if !dimension_ids.contains(dim_id.as_str()) {
                        return Err(AssistantError::Config(format!(
                            "metric '{}' references unknown filter dimension '{}'",
                            metric.id, dim_id
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn find_category(&self, id: &str) -> Option<&MetricCategory> {
        self.categories.iter().find(|c| c.id == id)
    }

    /// Category matched by id or by its display label (free-text input).
    pub fn find_category_by_label(&self, label: &str) -> Option<&MetricCategory> {
        self.categories
            .iter()
            .find(|c| c.id == label || c.label == label)
    }

    pub fn find_metric(&self, category_id: &str, metric_id: &str) -> Option<&MetricDef> {
        self.find_category(category_id)
            .and_then(|c| c.metrics.iter().find(|m| m.id == metric_id))
    }

    pub fn find_metric_anywhere(&self, metric_id: &str) -> Option<(&MetricCategory, &MetricDef)> {
        for category in &self.categories {
            if let Some(metric) = category.metrics.iter().find(|m| m.id == metric_id) {
                return Some((category, metric));
            }
        }
        None
    }

    /// All metrics in declaration order, paired with their category.
    pub fn all_metrics(&self) -> impl Iterator<Item = (&MetricCategory, &MetricDef)> {
        self.categories
            .iter()
            .flat_map(|c| c.metrics.iter().map(move |m| (c, m)))
    }

    pub fn find_dimension(&self, id: &str) -> Option<&FilterDimensionDef> {
        self.filter_dimensions.iter().find(|d| d.id == id)
    }

    pub fn require_metric(&self, category_id: Option<&str>, metric_id: &str) -> Result<&MetricDef> {
        let found = match category_id {
            Some(cid) => self.find_metric(cid, metric_id),
            None => self.find_metric_anywhere(metric_id).map(|(_, m)| m),
        };
        found.ok_or_else(|| {
            AssistantError::Config(format!("metric '{}' not found in catalog", metric_id))
        })
    }

    pub fn require_dimension(&self, id: &str) -> Result<&FilterDimensionDef> {
        self.find_dimension(id).ok_or_else(|| {
            AssistantError::Config(format!("filter dimension '{}' not found in catalog", id))
        })
    }
}
