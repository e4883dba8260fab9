use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use weft_core::config::GenerativeConfig;
use weft_core::{GenerativeRequest, GenerativeTransformer, Result, WeftError};

const SYSTEM_PROMPT: &str = "You convert data between two services. \
Reply with one JSON object that satisfies the target schema. \
Use only information present in the input. Do not add commentary.";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Generative transformer backed by an OpenAI-compatible chat completions API.
///
/// Works with OpenAI, Ollama, vLLM, Groq and anything else speaking the same
/// `/chat/completions` dialect. The model's reply is parsed but not trusted;
/// the resolver validates it against the target schema.
pub struct OpenAiTransformer {
    http: Client,
    base_url: String,
    model_id: String,
    api_key: Option<String>,
    timeout: Duration,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    response_format: Value,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiTransformer {
    pub fn new(base_url: impl Into<String>, model_id: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            model_id: model_id.into(),
            api_key,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn from_config(config: &GenerativeConfig) -> Self {
        Self::new(&config.base_url, &config.model_id, config.api_key.clone())
            .with_timeout(Duration::from_secs(config.timeout_secs))
    }

    /// Bound every completion request.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn messages(request: &GenerativeRequest) -> Vec<ChatMessage> {
        let mut system = format!(
            "{}\n\nTarget schema:\n{}",
            SYSTEM_PROMPT,
            request.target_schema.to_json()
        );
        if let Some(ref template) = request.template {
            system.push_str("\n\nInstructions:\n");
            system.push_str(template);
        }
        vec![
            ChatMessage {
                role: "system",
                content: system,
            },
            ChatMessage {
                role: "user",
                content: Value::Object(request.upstream.clone()).to_string(),
            },
        ]
    }
}

impl GenerativeTransformer for OpenAiTransformer {
    fn generate(&self, request: GenerativeRequest) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let body = ChatRequest {
                model: &self.model_id,
                messages: Self::messages(&request),
                max_tokens: request.max_tokens,
                temperature: 0.0,
                response_format: json!({"type": "json_object"}),
            };

            let mut req = self
                .http
                .post(self.endpoint())
                .timeout(self.timeout)
                .json(&body);
            if let Some(ref api_key) = self.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            let response = req.send().await.map_err(|e| {
                if e.is_timeout() {
                    WeftError::Generative(format!(
                        "completion timed out after {}s",
                        self.timeout.as_secs()
                    ))
                } else {
                    WeftError::Generative(e.to_string())
                }
            })?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(WeftError::Generative(format!("HTTP {}: {}", status, body)));
            }

            let parsed: ChatResponse = response
                .json()
                .await
                .map_err(|e| WeftError::Generative(format!("unreadable completion: {}", e)))?;
            let content = parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| WeftError::Generative("completion had no content".into()))?;

            if content.len() > request.max_output_bytes {
                warn!(
                    bytes = content.len(),
                    limit = request.max_output_bytes,
                    "Generative output over limit"
                );
                return Err(WeftError::Generative(format!(
                    "output of {} bytes exceeds limit of {}",
                    content.len(),
                    request.max_output_bytes
                )));
            }

            let cleaned = strip_code_fences(&content);
            let value: Value = serde_json::from_str(&cleaned)
                .map_err(|e| WeftError::Generative(format!("output is not JSON: {}", e)))?;
            if !value.is_object() {
                return Err(WeftError::Generative("output is not a JSON object".into()));
            }

            debug!(model = %self.model_id, bytes = content.len(), "Generative transform produced output");
            Ok(value)
        })
    }
}

/// Pull the body out of a fenced block if the model wrapped its answer in one.
fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let content_start = after.find('\n').map_or(0, |p| p + 1);
        let after = &after[content_start..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::Map;
    use weft_core::{FieldType, SchemaDescriptor};

    fn request(max_output_bytes: usize) -> GenerativeRequest {
        let mut upstream = Map::new();
        upstream.insert("sentiment".into(), json!("positive"));
        GenerativeRequest {
            template: Some("Write the sentiment as text.".into()),
            upstream,
            target_schema: SchemaDescriptor::new().required("text", FieldType::String),
            max_tokens: 256,
            max_output_bytes,
        }
    }

    fn completion(content: &str) -> String {
        json!({"choices": [{"message": {"role": "assistant", "content": content}}]}).to_string()
    }

    #[test]
    fn timeout_comes_from_config() {
        let config = GenerativeConfig {
            timeout_secs: 7,
            ..Default::default()
        };
        assert_eq!(OpenAiTransformer::from_config(&config).timeout, Duration::from_secs(7));
        assert_eq!(OpenAiTransformer::new("http://x", "m", None).timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn strips_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1} "), "{\"a\":1}");
    }

    #[tokio::test]
    async fn sends_deterministic_json_request() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer test-key")
            .match_body(Matcher::PartialJson(json!({
                "model": "gpt-4o-mini",
                "temperature": 0.0,
                "max_tokens": 256,
                "response_format": {"type": "json_object"}
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(completion("```json\n{\"text\": \"positive\"}\n```"))
            .create_async()
            .await;

        let transformer = OpenAiTransformer::new(server.url(), "gpt-4o-mini", Some("test-key".into()));
        let value = transformer.generate(request(4096)).await.unwrap();

        mock.assert_async().await;
        assert_eq!(value, json!({"text": "positive"}));
    }

    #[tokio::test]
    async fn http_error_is_reported() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(401)
            .with_body("bad key")
            .create_async()
            .await;

        let err = OpenAiTransformer::new(server.url(), "m", None)
            .generate(request(4096))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("401"));
    }

    #[tokio::test]
    async fn rejects_non_object_and_oversized_output() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(completion("[1, 2, 3]"))
            .create_async()
            .await;
        let transformer = OpenAiTransformer::new(server.url(), "m", None);

        let err = transformer.generate(request(4096)).await.unwrap_err();
        assert!(err.to_string().contains("not a JSON object"));

        let err = transformer.generate(request(4)).await.unwrap_err();
        assert!(err.to_string().contains("exceeds limit"));
    }
}
