//! Shared REST client for the Gemini `generateContent` API.
//!
//! The streaming voice connection lives in [`crate::live`]; this module
//! covers the one-shot calls (vision analysis, preview images, session
//! summaries) that share a URL scheme and response envelope.

pub mod preview;
pub mod summary;
pub mod vision;

use std::time::Duration;

use anyhow::{bail, Context};
use serde_json::Value;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Thin wrapper over `POST /models/{model}:generateContent`.
#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(http: reqwest::Client, api_key: String) -> Self {
        Self {
            http,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Send a request body and return the raw response envelope.
    pub async fn generate_content(&self, model: &str, payload: &Value) -> anyhow::Result<Value> {
        let url = format!(
            "{}/models/{model}:generateContent?key={}",
            self.base_url, self.api_key
        );

        let resp = self
            .http
            .post(&url)
            .json(payload)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("Gemini request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("Gemini API error {status}: {body}");
        }

        resp.json::<Value>()
            .await
            .context("unparseable Gemini response")
    }
}

/// Pull the first text part out of a `generateContent` envelope.
pub(crate) fn first_text(envelope: &Value) -> Option<&str> {
    envelope["candidates"][0]["content"]["parts"]
        .as_array()?
        .iter()
        .find_map(|part| part["text"].as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_text_skips_non_text_parts() {
        let envelope = json!({"candidates": [{"content": {"parts": [
            {"inlineData": {"mimeType": "image/png", "data": "AAAA"}},
            {"text": "a caption"},
        ]}}]});
        assert_eq!(first_text(&envelope), Some("a caption"));
    }

    #[test]
    fn first_text_handles_empty_envelope() {
        assert_eq!(first_text(&json!({})), None);
        assert_eq!(first_text(&json!({"candidates": []})), None);
    }
}
