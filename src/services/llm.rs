use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use crate::models::usage::TokenUsage;

/// Raw completion plus the provider's usage metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    pub text: String,
    pub usage: TokenUsage,
}

/// Text completion service used for extraction and classification.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Model identifier reported in token-usage rows.
    fn model(&self) -> &str;

    async fn invoke(&self, prompt: &str) -> Result<LlmResponse, LlmError>;
}

const SYSTEM_PROMPT: &str =
    "You extract accounting data from supplier invoices. You answer with one JSON object and nothing else.";

/// Client for a Cloudflare Workers AI text-generation model.
pub struct WorkersAiLlm {
    http: Client,
    account_id: String,
    api_token: String,
    model: String,
}

#[derive(Deserialize)]
struct RunResponse {
    #[serde(default)]
    success: bool,
    result: Option<RunResult>,
    #[serde(default)]
    errors: Vec<ProviderMessage>,
}

#[derive(Deserialize)]
struct RunResult {
    #[serde(default)]
    response: Option<serde_json::Value>,
    #[serde(default)]
    usage: Option<RunUsage>,
}

#[derive(Deserialize)]
struct RunUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
}

#[derive(Deserialize)]
struct ProviderMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// Workers AI error codes meaning "daily neurons / rate limit exhausted".
const QUOTA_ERROR_CODES: [i64; 2] = [3036, 3040];

impl WorkersAiLlm {
    pub fn new(account_id: &str, api_token: &str, model: &str) -> Result<Self, LlmError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(LlmError::Http)?;

        Ok(Self {
            http,
            account_id: account_id.to_string(),
            api_token: api_token.to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl LlmClient for WorkersAiLlm {
    fn model(&self) -> &str {
        &self.model
    }

    async fn invoke(&self, prompt: &str) -> Result<LlmResponse, LlmError> {
        let url = format!(
            "https://api.cloudflare.com/client/v4/accounts/{}/ai/run/{}",
            self.account_id, self.model
        );

        let request_body = serde_json::json!({
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": prompt }
            ],
            "max_tokens": 4096,
            "temperature": 0
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&request_body)
            .send()
            .await
            .map_err(LlmError::Http)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::QuotaExceeded(format!("provider returned {}", status)));
        }

        let body: RunResponse = response.json().await.map_err(LlmError::Http)?;
        if !body.success || !status.is_success() {
            if let Some(err) = body
                .errors
                .iter()
                .find(|e| QUOTA_ERROR_CODES.contains(&e.code) || is_quota_message(&e.message))
            {
                return Err(LlmError::QuotaExceeded(err.message.clone()));
            }
            let messages: Vec<String> = body.errors.into_iter().map(|e| e.message).collect();
            return Err(LlmError::Provider(format!(
                "HTTP {}: {}",
                status,
                messages.join("; ")
            )));
        }

        let result = body.result.ok_or_else(|| LlmError::Provider("empty result".to_string()))?;
        // Some models return the JSON answer already parsed.
        let text = match result.response {
            Some(serde_json::Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let usage = result
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(LlmResponse { text, usage })
    }
}

/// Provider messages that signal exhausted quota rather than a broken request.
pub fn is_quota_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("quota")
        || lower.contains("rate limit")
        || lower.contains("too many requests")
        || lower.contains("resource_exhausted")
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("LLM quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("LLM provider error: {0}")]
    Provider(String),
}
