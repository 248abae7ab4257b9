use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, SentinelError};

use super::settings::AiEndpointSettings;

/// Consecutive failures before AI calls pause.
const FAILURE_PAUSE_THRESHOLD: u32 = 3;
/// How long a pause lasts.
const PAUSE_DURATION: Duration = Duration::from_secs(600);

/// Injected chat dependency so the pipeline is testable offline.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Returns the assistant message text.
    async fn chat(&self, system: &str, user: &str) -> Result<String>;
}

// -- OpenAI-compatible wire types ---

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

/// Chat client for any OpenAI-compatible `/v1/chat/completions`
/// endpoint.
pub struct OpenAiChat {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiChat {
    pub fn new(base_url: &str, api_key: &str, model: &str, timeout_secs: u64) -> Result<Self> {
        if base_url.is_empty() {
            return Err(SentinelError::Config("AI base_url is not configured".into()));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(if timeout_secs > 0 { timeout_secs } else { 30 }))
            .build()
            .map_err(|e| SentinelError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    pub fn from_settings(settings: &AiEndpointSettings) -> Result<Self> {
        Self::new(&settings.base_url, &settings.api_key, &settings.model, settings.timeout_secs)
    }
}

#[async_trait]
impl ChatApi for OpenAiChat {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage { role: "system".to_string(), content: system.to_string() },
                ChatMessage { role: "user".to_string(), content: user.to_string() },
            ],
            temperature: 0.0,
        };

        debug!(model = %self.model, prompt_len = user.len(), "invoking verdict endpoint");

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| SentinelError::Verdict(format!("request failed: {e}")))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            let wait = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            return Err(SentinelError::Upstream {
                error_type: "rate_limit".to_string(),
                message: "verdict endpoint rate limited".to_string(),
                wait_seconds: wait,
            });
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %text, "verdict endpoint error");
            return Err(SentinelError::Verdict(format!("endpoint returned {status}: {text}")));
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| SentinelError::Verdict(format!("unparseable response: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(SentinelError::Verdict("empty assistant message".into()));
        }
        Ok(content)
    }
}

/// List models offered by an OpenAI-compatible endpoint.
pub async fn list_models(base_url: &str, api_key: &str) -> Result<Vec<String>> {
    let url = format!("{}/v1/models", base_url.trim_end_matches('/'));
    let client = Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .map_err(|e| SentinelError::Config(format!("failed to build HTTP client: {e}")))?;
    let resp = client
        .get(&url)
        .header("Authorization", format!("Bearer {api_key}"))
        .send()
        .await
        .map_err(|e| SentinelError::Verdict(format!("request failed: {e}")))?;
    if !resp.status().is_success() {
        return Err(SentinelError::Verdict(format!("endpoint returned {}", resp.status())));
    }
    let parsed: ModelsResponse = resp
        .json()
        .await
        .map_err(|e| SentinelError::Verdict(format!("unparseable response: {e}")))?;
    Ok(parsed.data.into_iter().map(|m| m.id).collect())
}

// -- verdict parsing -----------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub decision: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reason: String,
}

impl Verdict {
    pub fn is_ban(&self) -> bool {
        self.decision.eq_ignore_ascii_case("ban")
    }
}

/// Extract the JSON verdict from an assistant message, tolerating code
/// fences and surrounding prose.
pub fn parse_verdict(text: &str) -> Result<Verdict> {
    let trimmed = text.trim();

    if let Ok(v) = serde_json::from_str::<Verdict>(trimmed) {
        return Ok(v);
    }

    // Strip ```json fences.
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.rsplit_once("```").map(|(body, _)| body))
        .map(str::trim);
    if let Some(body) = unfenced {
        if let Ok(v) = serde_json::from_str::<Verdict>(body) {
            return Ok(v);
        }
    }

    // Last resort: the first balanced JSON object in the text.
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            if let Ok(v) = serde_json::from_str::<Verdict>(&trimmed[start..=end]) {
                return Ok(v);
            }
        }
    }

    Err(SentinelError::Verdict(format!(
        "no JSON verdict found in assistant message: {}",
        trimmed.chars().take(200).collect::<String>()
    )))
}

// -- API health ----------------------------------------------------------

/// Tracks consecutive verdict failures and pauses AI calls for a
/// cooldown once the threshold is hit.
pub struct ApiHealth {
    consecutive_failures: AtomicU32,
    paused_until: Mutex<Option<Instant>>,
}

impl Default for ApiHealth {
    fn default() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            paused_until: Mutex::new(None),
        }
    }
}

impl ApiHealth {
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        *self.paused_until.lock().unwrap() = None;
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= FAILURE_PAUSE_THRESHOLD {
            warn!(failures, "verdict endpoint unhealthy; pausing AI calls");
            *self.paused_until.lock().unwrap() = Some(Instant::now() + PAUSE_DURATION);
        }
    }

    pub fn is_paused(&self) -> bool {
        let mut guard = self.paused_until.lock().unwrap();
        match *guard {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                *guard = None;
                false
            }
            None => false,
        }
    }

    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        *self.paused_until.lock().unwrap() = None;
    }

    pub fn failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_json() {
        let v = parse_verdict("{\"decision\": \"ban\", \"confidence\": 0.92, \"reason\": \"abuse\"}")
            .unwrap();
        assert!(v.is_ban());
        assert_eq!(v.confidence, 0.92);
    }

    #[test]
    fn parses_fenced_json() {
        let text = "```json\n{\"decision\": \"keep\", \"confidence\": 0.4, \"reason\": \"benign\"}\n```";
        let v = parse_verdict(text).unwrap();
        assert!(!v.is_ban());
    }

    #[test]
    fn parses_json_inside_prose() {
        let text = "Based on the features I conclude:\n{\"decision\":\"ban\",\"confidence\":1.0,\"reason\":\"rotation\"}\nRegards.";
        let v = parse_verdict(text).unwrap();
        assert!(v.is_ban());
    }

    #[test]
    fn decision_casing_is_tolerated() {
        let v = parse_verdict("{\"decision\": \"BAN\", \"confidence\": 1.0}").unwrap();
        assert!(v.is_ban());
    }

    #[test]
    fn missing_fields_default() {
        let v = parse_verdict("{\"decision\": \"keep\"}").unwrap();
        assert_eq!(v.confidence, 0.0);
        assert_eq!(v.reason, "");
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse_verdict("I think this user is fine.").is_err());
        assert!(parse_verdict("").is_err());
    }

    #[test]
    fn health_pauses_after_three_failures() {
        let health = ApiHealth::default();
        assert!(!health.is_paused());
        health.record_failure();
        health.record_failure();
        assert!(!health.is_paused());
        health.record_failure();
        assert!(health.is_paused());
        assert_eq!(health.failures(), 3);

        health.reset();
        assert!(!health.is_paused());
        assert_eq!(health.failures(), 0);
    }

    #[test]
    fn success_clears_the_streak() {
        let health = ApiHealth::default();
        health.record_failure();
        health.record_failure();
        health.record_success();
        health.record_failure();
        assert!(!health.is_paused());
    }

    #[test]
    fn empty_base_url_is_a_config_error() {
        assert!(OpenAiChat::new("", "key", "model", 30).is_err());
        assert!(OpenAiChat::new("https://api.example.com", "key", "model", 30).is_ok());
    }
}
