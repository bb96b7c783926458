//! External intent classifier port and its LLM-backed implementation.
//!
//! The classifier is strictly best-effort: a hard timeout bounds the call and
//! every failure mode (network, HTTP status, malformed JSON, unknown metric
//! id) collapses to "found nothing". No error ever reaches the user.

use crate::catalog::MetricCatalog;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

lazy_static! {
    static ref JSON_OBJECT: Regex = Regex::new(r"(?s)\{.*\}").unwrap();
}

/// Structured slots reported by the classifier. `metric_id` is always a valid
/// catalog id by the time this struct is handed out.
#[derive(Debug, Clone)]
pub struct ClassifiedIntent {
    pub metric_id: String,
    pub month: Option<String>,
    pub filter_dimension: Option<String>,
    pub filter_values: Vec<String>,
}

#[async_trait]
pub trait IntentClassifier: Send + Sync {
    /// Fail-open by contract: `None` covers "nothing found" and every
    /// failure alike.
    async fn infer(&self, text: &str, catalog: &MetricCatalog) -> Option<ClassifiedIntent>;
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: Option<ChatResponseMessage>,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

/// Raw JSON the model is prompted to emit.
#[derive(Deserialize)]
struct RawIntent {
    #[serde(default)]
    metric: Option<String>,
    #[serde(default)]
    month: Option<String>,
    #[serde(default)]
    filter_dimension: Option<String>,
    #[serde(default)]
    filter_values: Option<Vec<String>>,
}

/// Classifier backed by an Ollama-style `/api/chat` endpoint.
pub struct LlmClassifier {
    api_url: String,
    model: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl LlmClassifier {
    pub fn new(api_url: impl Into<String>, model: impl Into<String>) -> Self {
        LlmClassifier {
            api_url: api_url.into(),
            model: model.into(),
            timeout: Duration::from_secs(3),
            client: reqwest::Client::new(),
        }
    }

    /// LLM_API_URL / LLM_MODEL / LLM_TIMEOUT_SECS, with the original
    /// deployment's defaults.
    pub fn from_env() -> Self {
        let api_url = std::env::var("LLM_API_URL")
            .unwrap_or_else(|_| "http://localhost:11434/api/chat".to_string());
        let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| "deepseek-r1:32b".to_string());
        let timeout = std::env::var("LLM_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);
        LlmClassifier {
            api_url,
            model,
            timeout: Duration::from_secs(timeout),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn system_prompt(catalog: &MetricCatalog) -> String {
        let metric_descriptions = catalog
            .all_metrics()
            .map(|(_, m)| {
                let description = if m.description.is_empty() {
                    m.label.as_str()
                } else {
                    m.description.as_str()
                };
                format!("- {}: {}", m.id, description)
            })
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "你是一个KPI查询意图解析器，只输出JSON。JSON字段: \
             metric (从下方指标列表中选择一个id), \
             month (如 '202510' 表示 2025年10月), \
             filter_dimension ('product' 或 'org' 或 null), \
             filter_values (字符串数组，如 ['CT'] 或 ['PSM'])。\n\n\
             可选指标列表：\n{}\n\n\
             用户可能会说类似“看下10月ct的工程师数量”这样的中文自然语言，\
             请你解析出对应的字段。注意：请根据用户的描述匹配最合适的指标ID。",
            metric_descriptions
        )
    }

    async fn call(&self, text: &str, catalog: &MetricCatalog) -> Option<String> {
        let body = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: Self::system_prompt(catalog),
                },
                ChatMessage {
                    role: "user",
                    content: text.to_string(),
                },
            ],
            stream: false,
        };

        let request = self.client.post(&self.api_url).json(&body).send();
        let response = match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                debug!("classifier request failed: {}", e);
                return None;
            }
            Err(_) => {
                warn!("classifier timed out after {:?}", self.timeout);
                return None;
            }
        };

        if !response.status().is_success() {
            debug!("classifier returned status {}", response.status());
            return None;
        }

        let parsed: ChatResponse = match tokio::time::timeout(self.timeout, response.json()).await {
            Ok(Ok(parsed)) => parsed,
            Ok(Err(e)) => {
                debug!("classifier response body unreadable: {}", e);
                return None;
            }
            Err(_) => {
                warn!("classifier body read timed out");
                return None;
            }
        };

        parsed.message.and_then(|m| m.content)
    }
}

/// Pull the first JSON object out of a model reply that may wrap it in prose
/// or a markdown fence.
fn extract_json_object(content: &str) -> Option<&str> {
    JSON_OBJECT.find(content.trim()).map(|m| m.as_str())
}

#[async_trait]
impl IntentClassifier for LlmClassifier {
    async fn infer(&self, text: &str, catalog: &MetricCatalog) -> Option<ClassifiedIntent> {
        let content = self.call(text, catalog).await?;
        let json_text = extract_json_object(&content)?;
        let raw: RawIntent = match serde_json::from_str(json_text) {
            Ok(raw) => raw,
            Err(e) => {
                debug!("classifier emitted unparseable JSON: {}", e);
                return None;
            }
        };

        let metric_id = raw.metric?;
        if catalog.find_metric_anywhere(&metric_id).is_none() {
            debug!("classifier returned unknown metric id '{}'", metric_id);
            return None;
        }

        Some(ClassifiedIntent {
            metric_id,
            month: raw.month,
            filter_dimension: raw.filter_dimension,
            filter_values: raw.filter_values.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_object_is_extracted_from_noise() {
        let content = "好的，结果如下：\n```json\n{\"metric\": \"engineer_count\"}\n```";
        let json = extract_json_object(content).unwrap();
        assert!(json.starts_with('{') && json.ends_with('}'));
        let raw: RawIntent = serde_json::from_str(json).unwrap();
        assert_eq!(raw.metric.as_deref(), Some("engineer_count"));
    }

    #[test]
    fn plain_text_yields_nothing() {
        assert!(extract_json_object("抱歉，我不明白").is_none());
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_open() {
        let catalog = MetricCatalog::builtin().unwrap();
        let classifier = LlmClassifier::new("http://127.0.0.1:1/api/chat", "test")
            .with_timeout(Duration::from_millis(200));
        assert!(classifier.infer("工程师数量", &catalog).await.is_none());
    }
}
