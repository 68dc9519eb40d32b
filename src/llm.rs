//! Client for the hosted text-generation service (Gemini `generateContent`).
//!
//! Calls are single-shot: no retries and no timeout beyond the HTTP client
//! default. Callers decide what a failure turns into.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash-8b";

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: GEMINI_API_KEY environment variable not set")]
    MissingApiKey,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Response contained no text")]
    EmptyResponse,
}

impl LlmError {
    /// True for errors reported by the service itself (quota, rejected
    /// request, server failure), as opposed to transport or decoding problems.
    pub fn is_service_error(&self) -> bool {
        matches!(self, LlmError::RateLimited(_) | LlmError::ApiError { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GenerationRequest {
    pub messages: Vec<Message>,
    pub temperature: Option<f64>,
    pub max_output_tokens: Option<u32>,
}

impl GenerationRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self::new(vec![Message::user(prompt)])
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = Some(max_output_tokens);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub usage: Option<Usage>,
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation, LlmError>;
}

pub struct GeminiClient {
    api_base: String,
    api_key: String,
    model: String,
    http_client: Client,
}

impl GeminiClient {
    pub fn new(api_base: String, api_key: String, model: String) -> Result<Self, LlmError> {
        if api_key.trim().is_empty() {
            return Err(LlmError::MissingApiKey);
        }
        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
            model,
            http_client: Client::new(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.api_base, self.model)
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation, LlmError> {
        let body = ApiRequest::from_request(&request);
        tracing::debug!(model = %self.model, messages = request.messages.len(), "sending generateContent");

        let response = self
            .http_client
            .post(self.endpoint())
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        if !status.is_success() {
            return Err(status_error(status.as_u16(), &text));
        }

        parse_generation(&text)
    }
}

fn status_error(code: u16, body: &str) -> LlmError {
    let message = serde_json::from_str::<ApiErrorResponse>(body)
        .map(|parsed| parsed.error.message)
        .unwrap_or_else(|_| body.to_string());
    if code == 429 {
        LlmError::RateLimited(message)
    } else {
        LlmError::ApiError { code, message }
    }
}

fn parse_generation(body: &str) -> Result<Generation, LlmError> {
    let parsed: ApiResponse = serde_json::from_str(body)
        .map_err(|e| LlmError::ParseError(format!("{e}. Full response: {body}")))?;

    let text: String = parsed
        .candidates
        .first()
        .and_then(|candidate| candidate.content.as_ref())
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|part| part.text.as_deref())
                .collect()
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(LlmError::EmptyResponse);
    }

    Ok(Generation {
        text,
        usage: parsed.usage_metadata.map(|usage| Usage {
            prompt_tokens: usage.prompt_token_count,
            completion_tokens: usage.candidates_token_count,
        }),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiRequest {
    contents: Vec<ApiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<ApiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<ApiGenerationConfig>,
}

impl ApiRequest {
    fn from_request(request: &GenerationRequest) -> Self {
        let system: Vec<ApiPart> = request
            .messages
            .iter()
            .filter(|message| message.role == Role::System)
            .map(|message| ApiPart {
                text: message.content.clone(),
            })
            .collect();

        let contents = request
            .messages
            .iter()
            .filter(|message| message.role != Role::System)
            .map(|message| ApiContent {
                role: Some(
                    match message.role {
                        Role::Assistant => "model",
                        _ => "user",
                    }
                    .to_string(),
                ),
                parts: vec![ApiPart {
                    text: message.content.clone(),
                }],
            })
            .collect();

        let generation_config = if request.temperature.is_some() || request.max_output_tokens.is_some() {
            Some(ApiGenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_output_tokens,
            })
        } else {
            None
        };

        Self {
            contents,
            system_instruction: (!system.is_empty()).then_some(ApiContent {
                role: None,
                parts: system,
            }),
            generation_config,
        }
    }
}

#[derive(Debug, Serialize)]
struct ApiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<ApiPart>,
}

#[derive(Debug, Serialize)]
struct ApiPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiResponse {
    #[serde(default)]
    candidates: Vec<ApiCandidate>,
    usage_metadata: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiCandidate {
    content: Option<ApiResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ApiResponseContent {
    #[serde(default)]
    parts: Vec<ApiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ApiResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_key_is_rejected() {
        let result = GeminiClient::new(DEFAULT_API_BASE.into(), "  ".into(), DEFAULT_MODEL.into());
        assert!(matches!(result, Err(LlmError::MissingApiKey)));
    }

    #[test]
    fn endpoint_includes_model() {
        let client = GeminiClient::new(
            "https://example.test/v1beta/".into(),
            "key".into(),
            "gemini-test".into(),
        )
        .unwrap();
        assert_eq!(
            client.endpoint(),
            "https://example.test/v1beta/models/gemini-test:generateContent"
        );
    }

    #[test]
    fn request_maps_roles_and_system_instruction() {
        let request = GenerationRequest::new(vec![
            Message::system("be brief"),
            Message::user("hello"),
            Message::assistant("hi"),
        ]);
        let json = serde_json::to_value(ApiRequest::from_request(&request)).unwrap();

        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][1]["role"], "model");
        assert!(json.get("generationConfig").is_none());
    }

    #[test]
    fn generation_config_is_sent_when_set() {
        let request = GenerationRequest::prompt("hello")
            .with_temperature(0.0)
            .with_max_output_tokens(256);
        let json = serde_json::to_value(ApiRequest::from_request(&request)).unwrap();

        assert_eq!(json["generationConfig"]["temperature"], 0.0);
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 256);

        let capped = GenerationRequest::prompt("hello").with_max_output_tokens(64);
        let json = serde_json::to_value(ApiRequest::from_request(&capped)).unwrap();
        assert!(json["generationConfig"].get("temperature").is_none());
    }

    #[test]
    fn parses_text_and_usage() {
        let body = r#"{
            "candidates": [{"content": {"parts": [{"text": "Practise "}, {"text": "daily."}]}}],
            "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 3}
        }"#;
        let generation = parse_generation(body).unwrap();
        assert_eq!(generation.text, "Practise daily.");
        assert_eq!(
            generation.usage,
            Some(Usage {
                prompt_tokens: 12,
                completion_tokens: 3
            })
        );
    }

    #[test]
    fn blank_candidates_are_empty_responses() {
        assert!(matches!(
            parse_generation(r#"{"candidates": []}"#),
            Err(LlmError::EmptyResponse)
        ));
        assert!(matches!(
            parse_generation("not json"),
            Err(LlmError::ParseError(_))
        ));
    }

    #[test]
    fn status_errors_are_classified() {
        let quota = status_error(429, r#"{"error": {"message": "Resource exhausted"}}"#);
        assert!(matches!(quota, LlmError::RateLimited(ref m) if m == "Resource exhausted"));
        assert!(quota.is_service_error());

        let server = status_error(503, "upstream down");
        assert!(matches!(server, LlmError::ApiError { code: 503, .. }));
        assert!(server.is_service_error());

        assert!(!LlmError::RequestFailed("refused".into()).is_service_error());
    }

    #[tokio::test]
    async fn unreachable_service_is_a_request_failure() {
        let client = GeminiClient::new(
            "http://127.0.0.1:9".into(),
            "key".into(),
            DEFAULT_MODEL.into(),
        )
        .unwrap();
        let result = client.generate(GenerationRequest::prompt("hello")).await;
        assert!(matches!(result, Err(LlmError::RequestFailed(_))));
    }
}
