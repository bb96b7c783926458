//! Deterministic slot extraction from free text.
//!
//! Time, filter and metric slots are mined independently; the external
//! classifier is only consulted when keyword matching finds no metric, and it
//! never overrides a slot the deterministic pass already filled.

use crate::catalog::{FilterDimensionDef, MetricCatalog};
use crate::llm::IntentClassifier;
use crate::state::{TimeRange, TimeRangeKind};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

lazy_static! {
    static ref MONTH_TOKEN: Regex = Regex::new(r"20\d{4}").unwrap();
    static ref CHINESE_MONTH: Regex = Regex::new(r"(\d{1,2})月").unwrap();
}

/// Slots mined from one message. Each field is independently optional.
#[derive(Debug, Clone, Default)]
pub struct PartialSlots {
    pub category_id: Option<String>,
    pub metric_id: Option<String>,
    pub time_range: Option<TimeRange>,
    pub filter_dimension: Option<String>,
    pub filter_values: Vec<String>,
}

impl PartialSlots {
    pub fn is_empty(&self) -> bool {
        self.metric_id.is_none() && self.time_range.is_none() && self.filter_dimension.is_none()
    }
}

/// Lowercase with all whitespace removed, for loose token comparison.
pub fn normalize_loose_token(s: &str) -> String {
    s.to_lowercase().split_whitespace().collect()
}

/// Whole-token match for ASCII codes: the token must not be embedded in a
/// longer alphanumeric run, so "ct" does not fire inside "direct".
pub fn contains_ascii_token(text: &str, token: &str) -> bool {
    let pattern = format!(r"(?i)(^|[^a-z0-9]){}([^a-z0-9]|$)", regex::escape(token));
    match Regex::new(&pattern) {
        Ok(re) => re.is_match(text),
        Err(_) => false,
    }
}

/// Map raw user-supplied values onto the dimension's declared value ids,
/// case- and whitespace-insensitively, dropping what does not match and
/// deduplicating in first-seen order.
pub fn canonicalize_filter_values(dim: &FilterDimensionDef, raw: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for value in raw {
        let key = normalize_loose_token(value);
        let canonical = dim
            .values
            .iter()
            .find(|v| normalize_loose_token(&v.id) == key || normalize_loose_token(&v.label) == key)
            .map(|v| v.id.clone());
        if let Some(canonical) = canonical {
            if !out.contains(&canonical) {
                out.push(canonical);
            }
        }
    }
    out
}

/// Explicit 6-digit month token, else a Chinese "N月" mention restricted to
/// the months present in the demo window.
pub fn extract_month(text: &str) -> Option<String> {
    if let Some(m) = MONTH_TOKEN.find(text) {
        return Some(m.as_str().to_string());
    }
    let captures = CHINESE_MONTH.captures(text)?;
    match captures[1].parse::<u32>().ok()? {
        10 => Some("202510".to_string()),
        11 => Some("202511".to_string()),
        12 => Some("202512".to_string()),
        _ => None,
    }
}

/// At most one filter dimension per message; product codes win over org
/// mentions, and the negative org form (非psm/nonpsm/notpsm) wins over a
/// bare "psm".
pub fn extract_filters(catalog: &MetricCatalog, text: &str) -> Option<(String, Vec<String>)> {
    if let Some(product) = catalog.find_dimension("product") {
        let mut hits = Vec::new();
        for value in &product.values {
            if contains_ascii_token(text, &value.id.to_lowercase()) {
                hits.push(value.id.clone());
            }
        }
        if !hits.is_empty() {
            return Some(("product".to_string(), canonicalize_filter_values(product, &hits)));
        }
    }

    if let Some(org) = catalog.find_dimension("org") {
        let loose = normalize_loose_token(text);
        let is_non_psm =
            loose.contains("非psm") || loose.contains("nonpsm") || loose.contains("notpsm");
        let raw = if is_non_psm {
            Some("非PSM".to_string())
        } else if contains_ascii_token(text, "psm") {
            Some("PSM".to_string())
        } else {
            None
        };
        if let Some(raw) = raw {
            return Some(("org".to_string(), canonicalize_filter_values(org, &[raw])));
        }
    }

    None
}

/// First metric whose keyword phrase is satisfied, ranked by effective
/// priority: the explicit `keyword_priority` when set, else the metric's
/// declaration index; declaration order breaks ties.
pub fn extract_metric<'a>(
    catalog: &'a MetricCatalog,
    text: &str,
) -> Option<(&'a str, &'a str)> {
    let mut best: Option<(i64, usize, &str, &str)> = None;
    for (index, (category, metric)) in catalog.all_metrics().enumerate() {
        let matched = metric.keywords.iter().any(|phrase| {
            !phrase.is_empty() && phrase.split('+').all(|part| text.contains(part))
        });
        if !matched {
            continue;
        }
        let priority = metric
            .keyword_priority
            .map(i64::from)
            .unwrap_or(index as i64);
        let candidate = (priority, index, category.id.as_str(), metric.id.as_str());
        if best.map_or(true, |b| (candidate.0, candidate.1) < (b.0, b.1)) {
            best = Some(candidate);
        }
    }
    best.map(|(_, _, category_id, metric_id)| (category_id, metric_id))
}

/// Full extraction pass over one message. Deterministic steps first; the
/// classifier only runs when they found no metric, and only fills slots that
/// are still empty. Returns `None` when nothing at all was found.
pub async fn extract_slots(
    catalog: &MetricCatalog,
    classifier: &dyn IntentClassifier,
    text: &str,
) -> Option<PartialSlots> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut slots = PartialSlots::default();

    if let Some(month) = extract_month(trimmed) {
        slots.time_range = Some(TimeRange::month(month));
    }
    if let Some((dimension, values)) = extract_filters(catalog, trimmed) {
        if !values.is_empty() {
            slots.filter_dimension = Some(dimension);
            slots.filter_values = values;
        }
    }
    if let Some((category_id, metric_id)) = extract_metric(catalog, trimmed) {
        slots.category_id = Some(category_id.to_string());
        slots.metric_id = Some(metric_id.to_string());
    }

    if slots.metric_id.is_none() {
        if let Some(intent) = classifier.infer(trimmed, catalog).await {
            debug!(metric = %intent.metric_id, "classifier fallback produced a metric");
            if let Some((category, _)) = catalog.find_metric_anywhere(&intent.metric_id) {
                slots.category_id = Some(category.id.clone());
                slots.metric_id = Some(intent.metric_id.clone());

                if slots.time_range.is_none() {
                    if let Some(month) = intent.month.as_deref().filter(|m| MONTH_TOKEN.is_match(m))
                    {
                        slots.time_range = Some(TimeRange {
                            kind: TimeRangeKind::Month,
                            value: Some(month.to_string()),
                            label: month.to_string(),
                        });
                    }
                }
                if slots.filter_dimension.is_none() {
                    if let Some(dim_id) = intent.filter_dimension.as_deref() {
                        if let Some(dim) = catalog.find_dimension(dim_id) {
                            let values =
                                canonicalize_filter_values(dim, &intent.filter_values);
                            if !values.is_empty() {
                                slots.filter_dimension = Some(dim.id.clone());
                                slots.filter_values = values;
                            }
                        }
                    }
                }
            }
        }
    }

    if slots.is_empty() {
        None
    } else {
        Some(slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ClassifiedIntent;
    use async_trait::async_trait;

    struct NoClassifier;

    #[async_trait]
    impl IntentClassifier for NoClassifier {
        async fn infer(&self, _text: &str, _catalog: &MetricCatalog) -> Option<ClassifiedIntent> {
            None
        }
    }

    struct FixedClassifier(ClassifiedIntent);

    #[async_trait]
    impl IntentClassifier for FixedClassifier {
        async fn infer(&self, _text: &str, _catalog: &MetricCatalog) -> Option<ClassifiedIntent> {
            Some(self.0.clone())
        }
    }

    fn catalog() -> MetricCatalog {
        MetricCatalog::builtin().unwrap()
    }

    #[test]
    fn month_tokens_are_extracted() {
        assert_eq!(extract_month("202510工程师数量"), Some("202510".to_string()));
        assert_eq!(extract_month("看下10月的数据"), Some("202510".to_string()));
        assert_eq!(extract_month("看下3月的数据"), None);
        assert_eq!(extract_month("工程师数量"), None);
    }

    #[test]
    fn product_codes_match_as_whole_tokens() {
        let catalog = catalog();
        let (dim, values) = extract_filters(&catalog, "查询CT的工程师数量").unwrap();
        assert_eq!(dim, "product");
        assert_eq!(values, vec!["CT"]);

        let (dim, values) = extract_filters(&catalog, "看下 10月 cT 的工程师数量").unwrap();
        assert_eq!(dim, "product");
        assert_eq!(values, vec!["CT"]);

        // embedded runs are not tokens
        assert!(!contains_ascii_token("direct结果", "ct"));
        let (_, values) = extract_filters(&catalog, "certas 设备数量").unwrap();
        assert_eq!(values, vec!["CERTAS"]);
    }

    #[test]
    fn negative_org_form_beats_bare_psm() {
        let catalog = catalog();
        let (dim, values) = extract_filters(&catalog, "查询非psm的工程师数量").unwrap();
        assert_eq!(dim, "org");
        assert_eq!(values, vec!["非PSM"]);

        let (dim, values) = extract_filters(&catalog, "查询psm的工程师数量").unwrap();
        assert_eq!(dim, "org");
        assert_eq!(values, vec!["PSM"]);
    }

    #[test]
    fn canonicalization_is_idempotent_and_loose() {
        let catalog = catalog();
        let product = catalog.find_dimension("product").unwrap();
        let raw = vec!["ct".to_string(), "CT".to_string(), " Ct ".to_string()];
        let once = canonicalize_filter_values(product, &raw);
        assert_eq!(once, vec!["CT"]);
        assert_eq!(canonicalize_filter_values(product, &once), once);
    }

    #[test]
    fn conjunctive_keywords_match_in_any_order() {
        let catalog = catalog();
        let (category, metric) = extract_metric(&catalog, "按月统计工程师的数量").unwrap();
        assert_eq!(category, "personnel");
        assert_eq!(metric, "engineer_count");
        assert!(extract_metric(&catalog, "工程师").is_none());
    }

    #[test]
    fn declaration_order_wins_between_matching_metrics() {
        // 工程师明细 matches both "工程师+明细" and the broader "人员+明细" test;
        // "明细的工程师数量" satisfies engineer_count first by declaration order.
        let catalog = catalog();
        let (_, metric) = extract_metric(&catalog, "明细的工程师数量").unwrap();
        assert_eq!(metric, "engineer_count");
    }

    #[tokio::test]
    async fn deterministic_slots_win_over_classifier() {
        let catalog = catalog();
        let classifier = FixedClassifier(ClassifiedIntent {
            metric_id: "machine_count".to_string(),
            month: Some("202511".to_string()),
            filter_dimension: Some("org".to_string()),
            filter_values: vec!["PSM".to_string()],
        });
        // No metric keyword, but a month and a product are already present.
        let slots = extract_slots(&catalog, &classifier, "202510 CT 情况怎么样")
            .await
            .unwrap();
        assert_eq!(slots.metric_id.as_deref(), Some("machine_count"));
        assert_eq!(
            slots.time_range.as_ref().unwrap().value.as_deref(),
            Some("202510")
        );
        assert_eq!(slots.filter_dimension.as_deref(), Some("product"));
        assert_eq!(slots.filter_values, vec!["CT"]);
    }

    #[tokio::test]
    async fn nothing_found_returns_none() {
        let catalog = catalog();
        let slots = extract_slots(&catalog, &NoClassifier, "今天天气怎么样").await;
        assert!(slots.is_none());
    }
}
