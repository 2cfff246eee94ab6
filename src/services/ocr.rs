use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

/// Turns a page image into text. Implementations must not rotate the image:
/// orientation is searched by the caller.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(&self, image_png: &[u8]) -> Result<String, OcrError>;
}

const TRANSCRIBE_PROMPT: &str = concat!(
    "Transcribe every piece of text visible in this scanned document page, ",
    "line by line, exactly as printed. Keep numbers, dates and punctuation. ",
    "Do not summarize, translate or comment. Output only the transcription."
);

/// OCR engine backed by a Cloudflare Workers AI vision model.
pub struct WorkersAiOcr {
    http: Client,
    account_id: String,
    api_token: String,
    model: String,
}

#[derive(Deserialize)]
struct VisionResponse {
    result: VisionResult,
}

#[derive(Deserialize)]
struct VisionResult {
    description: String,
}

impl WorkersAiOcr {
    pub fn new(account_id: &str, api_token: &str, model: &str) -> Result<Self, OcrError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(90))
            .build()
            .map_err(OcrError::Http)?;

        Ok(Self {
            http,
            account_id: account_id.to_string(),
            api_token: api_token.to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl OcrEngine for WorkersAiOcr {
    async fn recognize(&self, image_png: &[u8]) -> Result<String, OcrError> {
        let url = format!(
            "https://api.cloudflare.com/client/v4/accounts/{}/ai/run/{}",
            self.account_id, self.model
        );

        let request_body = serde_json::json!({
            "image": base64::engine::general_purpose::STANDARD.encode(image_png),
            "prompt": TRANSCRIBE_PROMPT,
            "max_tokens": 2048
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&request_body)
            .send()
            .await
            .map_err(OcrError::Http)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(OcrError::RateLimited(format!("OCR provider returned {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OcrError::Provider(format!("HTTP {}: {}", status, body)));
        }

        let vision: VisionResponse = response.json().await.map_err(OcrError::Http)?;
        Ok(vision.result.description)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("OCR quota exceeded: {0}")]
    RateLimited(String),

    #[error("OCR provider error: {0}")]
    Provider(String),

    #[error("Image preprocessing failed: {0}")]
    Image(#[from] image::ImageError),
}
