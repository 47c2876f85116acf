use crate::core::config::LlmStageConfig;
use crate::core::error::{ConvertError, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Wall-clock limit per chat call. Hitting it is not fatal, the caller's
/// retry policy takes over.
const LLM_TIMEOUT: Duration = Duration::from_secs(180);

/// Backoff ladder for unbounded stage retries, capped at the last rung.
pub const BACKOFF_LADDER_SECS: [u64; 9] = [1, 3, 5, 10, 30, 60, 120, 300, 600];

pub fn backoff_delay(attempt: usize) -> Duration {
    let idx = attempt.min(BACKOFF_LADDER_SECS.len() - 1);
    Duration::from_secs(BACKOFF_LADDER_SECS[idx])
}

/// A named JSON schema the response must conform to.
#[derive(Debug, Clone)]
pub struct SchemaSpec {
    pub name: &'static str,
    pub schema: Value,
}

#[derive(Debug, Clone)]
pub struct ChatRequest<'a> {
    pub system: &'a str,
    pub user: &'a str,
    /// Overrides the stage temperature when set (voting runs).
    pub temperature: Option<f32>,
    pub schema: Option<&'a SchemaSpec>,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(&self, request: ChatRequest<'_>) -> Result<String>;
}

/// Chat-completions client for any OpenAI-compatible endpoint. Structured
/// output is requested through `response_format: json_schema`; provider
/// differences beyond that belong here, not in the pipeline.
pub struct OpenAiClient {
    stage: &'static str,
    config: LlmStageConfig,
    client: reqwest::Client,
    endpoint: String,
    /// First request/response of this stage are dumped here for debugging.
    debug_dir: Option<PathBuf>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Option<Vec<ChatChoice>>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    refusal: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    message: String,
}

impl OpenAiClient {
    pub fn new(stage: &'static str, config: &LlmStageConfig) -> Result<Self> {
        if !config.is_configured() {
            return Err(ConvertError::LlmNotConfigured);
        }
        let base = Url::parse(config.api_url.trim())
            .map_err(|e| ConvertError::Other(anyhow::anyhow!("invalid LLM api_url: {}", e)))?;
        let endpoint = if base.path().ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!(
                "{}/chat/completions",
                base.to_string().trim_end_matches('/')
            )
        };
        let client = reqwest::Client::builder()
            .timeout(LLM_TIMEOUT)
            .build()
            .map_err(|e| ConvertError::Other(e.into()))?;
        Ok(Self {
            stage,
            config: config.clone(),
            client,
            endpoint,
            debug_dir: None,
        })
    }

    pub fn with_debug_dir(mut self, dir: PathBuf) -> Self {
        self.debug_dir = Some(dir);
        self
    }

    fn build_body(&self, request: &ChatRequest<'_>) -> Value {
        let mut body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                ChatMessage { role: "system", content: request.system },
                ChatMessage { role: "user", content: request.user },
            ],
            "temperature": request.temperature.unwrap_or(self.config.temperature),
            "top_p": self.config.top_p,
            "stream": self.config.streaming,
        });
        if let Some(schema) = request.schema {
            body["response_format"] = serde_json::json!({
                "type": "json_schema",
                "json_schema": {
                    "name": schema.name,
                    "strict": true,
                    "schema": schema.schema,
                }
            });
        }
        if !self.config.reasoning {
            body["reasoning"] = serde_json::json!({ "enabled": false });
        }
        body
    }

    async fn dump_debug(&self, suffix: &str, payload: &str) {
        let Some(dir) = &self.debug_dir else { return };
        let path = dir.join(format!("{}_{}.json", self.stage, suffix));
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return;
        }
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            log::warn!("cannot create log dir {:?}: {}", dir, e);
            return;
        }
        if let Err(e) = tokio::fs::write(&path, payload).await {
            log::warn!("cannot write debug log {:?}: {}", path, e);
        }
    }

    fn classify_status(&self, status: StatusCode, body: String) -> ConvertError {
        if status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
        {
            ConvertError::Retriable(format!("{} HTTP {}: {}", self.stage, status, body))
        } else {
            ConvertError::Other(anyhow::anyhow!(
                "{} HTTP {}: {}",
                self.stage,
                status,
                body
            ))
        }
    }

    async fn collect_stream(&self, response: reqwest::Response) -> Result<String> {
        let mut stream = response.bytes_stream();
        let mut content = String::new();
        let mut refusal = String::new();
        let mut pending = String::new();

        while let Some(item) = stream.next().await {
            let bytes =
                item.map_err(|e| ConvertError::Retriable(format!("{} stream: {}", self.stage, e)))?;
            pending.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(pos) = pending.find('\n') {
                let line = pending[..pos].trim().to_string();
                pending.drain(..=pos);
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    continue;
                }
                let Ok(event) = serde_json::from_str::<Value>(data) else {
                    continue;
                };
                let delta = &event["choices"][0]["delta"];
                if let Some(part) = delta["content"].as_str() {
                    content.push_str(part);
                }
                if let Some(part) = delta["refusal"].as_str() {
                    refusal.push_str(part);
                }
            }
        }

        if !refusal.is_empty() {
            return Err(ConvertError::Refused {
                stage: self.stage,
                message: refusal,
            });
        }
        if content.is_empty() {
            return Err(ConvertError::Retriable(format!(
                "{}: empty streamed response",
                self.stage
            )));
        }
        Ok(content)
    }

    fn extract_content(&self, response: ChatResponse) -> Result<String> {
        if let Some(err) = response.error {
            return Err(ConvertError::Retriable(format!(
                "{} API error: {}",
                self.stage, err.message
            )));
        }
        let choice = response
            .choices
            .and_then(|mut c| if c.is_empty() { None } else { Some(c.remove(0)) })
            .ok_or_else(|| {
                ConvertError::Retriable(format!("{}: response has no choices", self.stage))
            })?;

        if let Some(message) = &choice.message {
            if let Some(refusal) = &message.refusal {
                if !refusal.is_empty() {
                    return Err(ConvertError::Refused {
                        stage: self.stage,
                        message: refusal.clone(),
                    });
                }
            }
        }
        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(ConvertError::Refused {
                stage: self.stage,
                message: "response stopped by content filter".to_string(),
            });
        }

        choice
            .message
            .and_then(|m| m.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                ConvertError::Retriable(format!("{}: response content empty", self.stage))
            })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn chat(&self, request: ChatRequest<'_>) -> Result<String> {
        let body = self.build_body(&request);
        self.dump_debug("request", &serde_json::to_string_pretty(&body).unwrap_or_default())
            .await;

        let mut builder = self.client.post(&self.endpoint).json(&body);
        if !self.config.api_key.trim().is_empty() {
            builder = builder.bearer_auth(self.config.api_key.trim());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() || e.is_request() {
                ConvertError::Retriable(format!("{} transport: {}", self.stage, e))
            } else {
                ConvertError::Other(e.into())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.classify_status(status, body));
        }

        let content = if self.config.streaming {
            self.collect_stream(response).await?
        } else {
            let parsed: ChatResponse = response.json().await.map_err(|e| {
                ConvertError::Retriable(format!("{} body parse: {}", self.stage, e))
            })?;
            self.extract_content(parsed)?
        };

        self.dump_debug("response", &content).await;
        Ok(content)
    }
}

/// Retries `attempt_fn` until success or a non-retriable error. The previous
/// failure is handed back so prompts can include the validation context.
/// Delays follow the backoff ladder; both the delay and the attempt race
/// against the cancellation token.
pub async fn retry_unbounded<T, F, Fut>(
    stage: &'static str,
    cancel: &CancellationToken,
    attempt_fn: F,
) -> Result<T>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with_limit(stage, cancel, usize::MAX, attempt_fn).await
}

/// Bounded variant used for individual voting calls, where a failed vote is
/// absorbed by the consensus instead of retried forever.
pub async fn retry_with_limit<T, F, Fut>(
    stage: &'static str,
    cancel: &CancellationToken,
    max_attempts: usize,
    mut attempt_fn: F,
) -> Result<T>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error: Option<String> = None;
    let mut attempt = 0usize;
    loop {
        if cancel.is_cancelled() {
            return Err(ConvertError::Cancelled);
        }
        let result = tokio::select! {
            r = attempt_fn(last_error.clone()) => r,
            _ = cancel.cancelled() => Err(ConvertError::Cancelled),
        };
        match result {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retriable() => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(e);
                }
                let delay = backoff_delay(attempt - 1);
                log::warn!(
                    "{} attempt {} failed ({}), retrying in {:?}",
                    stage,
                    attempt,
                    e,
                    delay
                );
                last_error = Some(e.to_string());
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(ConvertError::Cancelled),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn stage_config() -> LlmStageConfig {
        LlmStageConfig {
            api_url: "http://localhost:9999/v1".into(),
            model: "test-model".into(),
            ..Default::default()
        }
    }

    #[test]
    fn endpoint_join_handles_trailing_slash() {
        let mut cfg = stage_config();
        cfg.api_url = "http://host/v1/".into();
        let client = OpenAiClient::new("extract", &cfg).unwrap();
        assert_eq!(client.endpoint, "http://host/v1/chat/completions");

        cfg.api_url = "http://host/v1/chat/completions".into();
        let client = OpenAiClient::new("extract", &cfg).unwrap();
        assert_eq!(client.endpoint, "http://host/v1/chat/completions");
    }

    #[test]
    fn unconfigured_stage_is_rejected() {
        let cfg = LlmStageConfig::default();
        assert!(matches!(
            OpenAiClient::new("merge", &cfg),
            Err(ConvertError::LlmNotConfigured)
        ));
    }

    #[test]
    fn body_includes_schema_and_reasoning_switch() {
        let mut cfg = stage_config();
        cfg.reasoning = false;
        let client = OpenAiClient::new("assign", &cfg).unwrap();
        let schema = SchemaSpec {
            name: "speaker_map",
            schema: serde_json::json!({"type": "object"}),
        };
        let body = client.build_body(&ChatRequest {
            system: "s",
            user: "u",
            temperature: Some(0.4),
            schema: Some(&schema),
        });
        assert!((body["temperature"].as_f64().unwrap() - 0.4).abs() < 1e-6);
        assert_eq!(body["response_format"]["json_schema"]["name"], "speaker_map");
        assert_eq!(body["reasoning"]["enabled"], false);
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn refusal_is_detected() {
        let cfg = stage_config();
        let client = OpenAiClient::new("extract", &cfg).unwrap();
        let resp: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"refusal":"cannot help"},"finish_reason":"stop"}]}"#,
        )
        .unwrap();
        assert!(matches!(
            client.extract_content(resp),
            Err(ConvertError::Refused { .. })
        ));
    }

    #[test]
    fn backoff_ladder_caps_at_last_rung() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(4), Duration::from_secs(30));
        assert_eq!(backoff_delay(100), Duration::from_secs(600));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_passes_error_context_and_succeeds() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result = retry_unbounded("test", &cancel, move |last| {
            let calls = calls2.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    assert!(last.is_none());
                    Err(ConvertError::ValidationFailed {
                        stage: "test",
                        details: "bad field".into(),
                    })
                } else {
                    assert!(last.unwrap().contains("bad field"));
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_stops_on_refusal() {
        let cancel = CancellationToken::new();
        let result: Result<()> = retry_unbounded("test", &cancel, |_| async {
            Err(ConvertError::Refused {
                stage: "test",
                message: "no".into(),
            })
        })
        .await;
        assert!(matches!(result, Err(ConvertError::Refused { .. })));
    }

    #[tokio::test]
    async fn retry_respects_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> =
            retry_unbounded("test", &cancel, |_| async { Ok(()) }).await;
        assert!(matches!(result, Err(ConvertError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_retry_gives_up() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result: Result<()> = retry_with_limit("test", &cancel, 2, move |_| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ConvertError::Retriable("boom".into()))
            }
        })
        .await;
        assert!(matches!(result, Err(ConvertError::Retriable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
