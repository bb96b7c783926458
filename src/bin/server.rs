//! HTTP server for the KPI assistant.
//! Plain tokio TCP handling, no web framework.

use kpi_assistant::catalog::MetricCatalog;
use kpi_assistant::datastore::SqliteStore;
use kpi_assistant::dialogue::{ButtonPayload, DialogEngine};
use kpi_assistant::llm::LlmClassifier;
use kpi_assistant::state::{TimeRange, TimeRangeKind};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    conversation_id: Option<String>,
    message: Option<String>,
    payload: Option<ButtonPayload>,
    time_range: Option<RawTimeRange>,
}

/// Loose time-range override as the frontend sends it.
#[derive(Deserialize)]
struct RawTimeRange {
    #[serde(rename = "type")]
    kind: Option<String>,
    value: Option<serde_json::Value>,
    label: Option<String>,
}

impl RawTimeRange {
    fn into_override(self) -> Option<TimeRange> {
        let value = self.value.and_then(|v| match v {
            serde_json::Value::String(s) if !s.is_empty() => Some(s),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        let label = self.label.filter(|l| !l.is_empty());
        if value.is_none() && label.is_none() {
            return None;
        }
        let kind = match self.kind.as_deref() {
            Some("month") => TimeRangeKind::Month,
            Some("half_fy") => TimeRangeKind::HalfFy,
            Some("fy") => TimeRangeKind::Fy,
            Some("none") => TimeRangeKind::None,
            _ => TimeRangeKind::Custom,
        };
        let label = label.or_else(|| value.clone()).unwrap_or_default();
        Some(TimeRange { kind, value, label })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let catalog = match std::env::var("METRICS_CONFIG") {
        Ok(path) => {
            println!("[OK] Loading metric catalog from {}", path);
            MetricCatalog::load(&PathBuf::from(path))?
        }
        Err(_) => MetricCatalog::builtin()?,
    };

    let db_path = std::env::var("DB_PATH").unwrap_or_else(|_| "kpi_assistant.db".to_string());
    let store = SqliteStore::open(&PathBuf::from(&db_path))?;
    store.init_schema()?;
    store.seed_demo_data()?;
    println!("[OK] Data store ready at {}", db_path);

    if std::env::var("LLM_API_URL").is_ok() {
        println!("[OK] Intent classifier endpoint configured");
    } else {
        println!("[WARN] LLM_API_URL not set - classifier falls back to localhost Ollama");
    }

    let engine = Arc::new(DialogEngine::new(
        Arc::new(catalog),
        Arc::new(store),
        Arc::new(LlmClassifier::from_env()),
    ));

    let ttl_secs: u64 = std::env::var("SESSION_TTL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1800);
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                engine.sessions().evict_idle(Duration::from_secs(ttl_secs));
            }
        });
    }

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    println!("[OK] Server listening on http://localhost:{}", port);

    loop {
        let (stream, addr) = listener.accept().await?;
        info!("connection from {}", addr);
        let engine = engine.clone();
        tokio::spawn(async move {
            handle_connection(stream, engine).await;
        });
    }
}

async fn handle_connection(mut stream: TcpStream, engine: Arc<DialogEngine>) {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 8192];

    let read_result = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    buffer.extend_from_slice(&chunk[..n]);
                    if let Ok(text) = std::str::from_utf8(&buffer) {
                        if let Some(headers_end) = text.find("\r\n\r\n") {
                            match extract_content_length(text) {
                                Some(len) => {
                                    if buffer.len() >= headers_end + 4 + len {
                                        break;
                                    }
                                }
                                None => break,
                            }
                        }
                    }
                    if buffer.len() > 1_000_000 {
                        break;
                    }
                }
                Err(e) => {
                    error!("failed to read from stream: {}", e);
                    break;
                }
            }
        }
    })
    .await;

    if read_result.is_err() {
        warn!("request read timeout");
        return;
    }
    if buffer.is_empty() {
        return;
    }

    let request = String::from_utf8_lossy(&buffer).to_string();
    let response = handle_request(&request, &engine).await;
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        error!("failed to write response: {}", e);
    }
}

fn extract_content_length(request: &str) -> Option<usize> {
    for line in request.lines() {
        if line.to_lowercase().starts_with("content-length:") {
            if let Some(value) = line.split(':').nth(1) {
                return value.trim().parse().ok();
            }
        }
    }
    None
}

async fn handle_request(request: &str, engine: &DialogEngine) -> String {
    let request_line = request.lines().next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let (method, path) = match (parts.next(), parts.next()) {
        (Some(method), Some(path)) => (method, path.trim_end_matches('/')),
        _ => return create_response(400, "Bad Request", r#"{"error":"bad request"}"#),
    };
    let path = if path.is_empty() { "/" } else { path };

    match (method, path) {
        ("GET", "/health") | ("GET", "/api/health") => {
            let body = serde_json::json!({
                "status": "ok",
                "service": "kpi-assistant",
                "time": chrono::Utc::now().to_rfc3339(),
            });
            create_response(200, "OK", &body.to_string())
        }
        ("GET", "/api/time-options") => match list_time_options_json(engine) {
            Ok(body) => create_response(200, "OK", &body),
            Err(e) => create_response(
                500,
                "Internal Server Error",
                &serde_json::json!({ "error": e }).to_string(),
            ),
        },
        ("POST", "/api/chat") => {
            let body_start = request.find("\r\n\r\n").map(|i| i + 4).unwrap_or(request.len());
            let body = request[body_start..].trim();
            handle_chat(body, engine).await
        }
        _ => create_response(404, "Not Found", r#"{"error":"not found"}"#),
    }
}

fn list_time_options_json(engine: &DialogEngine) -> Result<String, String> {
    // Route kept on the original API shape: months / halfFy / fy.
    let groups = engine
        .time_options()
        .map_err(|e| e.to_string())?;
    let body = serde_json::json!({
        "months": groups.month,
        "halfFy": groups.half_fy,
        "fy": groups.fy,
    });
    Ok(body.to_string())
}

async fn handle_chat(body: &str, engine: &DialogEngine) -> String {
    let parsed: ChatRequest = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(e) => {
            return create_response(
                400,
                "Bad Request",
                &serde_json::json!({ "error": format!("invalid request body: {}", e) }).to_string(),
            )
        }
    };

    let Some(conversation_id) = parsed.conversation_id.filter(|id| !id.is_empty()) else {
        return create_response(
            400,
            "Bad Request",
            &serde_json::json!({ "error": "conversationId 必填" }).to_string(),
        );
    };

    let time_override = parsed.time_range.and_then(RawTimeRange::into_override);
    let response = engine
        .handle_turn(
            &conversation_id,
            parsed.message.as_deref(),
            parsed.payload,
            time_override,
        )
        .await;

    let mut body = match serde_json::to_value(&response) {
        Ok(value) => value,
        Err(e) => {
            error!("failed to serialize turn response: {}", e);
            return create_response(
                500,
                "Internal Server Error",
                r#"{"error":"serialization failure"}"#,
            );
        }
    };
    if let Some(state) = engine.sessions().snapshot(&conversation_id) {
        if let (serde_json::Value::Object(map), Ok(state_value)) =
            (&mut body, serde_json::to_value(&state))
        {
            map.insert("state".to_string(), state_value);
        }
    }
    create_response(200, "OK", &body.to_string())
}

fn create_response(status: u16, status_text: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        status_text,
        body.len(),
        body
    )
}
