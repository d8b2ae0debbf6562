pub mod generator;
pub mod prompts;

use crate::config::Config;
use crate::error::ReportError;
use anyhow::{Context, Result, anyhow, bail};
use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
}

/// One round trip to a chat-completions style model.
pub trait ChatCompletion: Send + Sync {
    fn complete(&self, request: &ChatRequest) -> Result<ChatResponse>;
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// OpenAI-compatible `/chat/completions` client.
pub struct HttpChatClient {
    client: Client,
    endpoint: String,
}

impl HttpChatClient {
    pub fn new(base_url: &str, api_key: &str, timeout_seconds: u64) -> Result<Self> {
        if api_key.trim().is_empty() {
            bail!("AI API key is empty");
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
                .context("Failed to build Authorization header")?,
        );

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds.max(5)))
            .default_headers(headers)
            .build()
            .context("Failed to create AI HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let api_key = config.ai_api_key.as_deref().unwrap_or_default();
        if api_key.trim().is_empty() {
            bail!(
                "AI API key is missing. Set `mandalart-report config set ai.api_key <KEY>` or `MANDALART_AI_API_KEY`."
            );
        }

        Self::new(&config.ai_api_base_url, api_key, config.ai_timeout_seconds)
    }
}

impl ChatCompletion for HttpChatClient {
    fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let request_body = json!({
            "model": request.model,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.user}
            ]
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request_body)
            .send()
            .map_err(|error| ReportError::ExternalService(format!("AI API request failed: {error}")))?;

        let status = response.status();
        let body = response.text().context("Failed to read AI response body")?;

        if !status.is_success() {
            let snippet = body.chars().take(200).collect::<String>();
            return Err(ReportError::ExternalService(format!("AI API error {status}: {snippet}")).into());
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|error| ReportError::ExternalService(format!("Failed to parse AI response: {error}")))?;

        let content = parsed
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| anyhow!(ReportError::ExternalService(
                "AI response did not include message.content".to_string()
            )))?;

        Ok(ChatResponse {
            content,
            model: parsed.model.unwrap_or_else(|| request.model.clone()),
            usage: parsed.usage.unwrap_or_default(),
        })
    }
}

/// Used when no API key is configured so the service can still start.
pub struct MissingCredentials;

impl ChatCompletion for MissingCredentials {
    fn complete(&self, _request: &ChatRequest) -> Result<ChatResponse> {
        Err(ReportError::ExternalService("AI API key is not configured".to_string()).into())
    }
}

pub fn test_connection(client: &dyn ChatCompletion, model: &str) -> Result<String> {
    let request = ChatRequest {
        model: model.to_string(),
        system: "Return exactly one short sentence in Korean indicating AI API connectivity is healthy."
            .to_string(),
        user: "Health check for the mandalart report service.".to_string(),
        max_tokens: 64,
        temperature: 0.1,
    };

    client.complete(&request).map(|response| response.content)
}
