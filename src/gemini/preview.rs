//! Style preview image generation.
//!
//! Takes the most recent body crop as the source image and an edit prompt
//! (optionally shaped by a category template) and asks the image model for
//! an edited photo plus an optional text description.

use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::gemini::GeminiClient;
use crate::prompts::build_edit_prompt;
use crate::protocol::PreviewCategory;

const IMAGE_MODEL: &str = "gemini-2.5-flash-image";

/// One preview request: base64 JPEG source plus the edit to apply.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub source_image: String,
    pub prompt: String,
    pub category: Option<PreviewCategory>,
}

#[derive(Debug, Clone)]
pub struct GenerationResult {
    /// Base64-encoded image payload.
    pub image: String,
    pub mime_type: String,
    pub description: Option<String>,
    pub processing_time_ms: u64,
}

#[async_trait]
pub trait PreviewGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> anyhow::Result<GenerationResult>;
}

pub struct GeminiPreview {
    client: GeminiClient,
}

impl GeminiPreview {
    pub fn new(client: GeminiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PreviewGenerator for GeminiPreview {
    async fn generate(&self, request: GenerationRequest) -> anyhow::Result<GenerationResult> {
        let started = Instant::now();
        let full_prompt = match request.category {
            Some(category) => build_edit_prompt(&request.prompt, Some(category)),
            None => request.prompt.clone(),
        };

        info!(
            prompt_len = full_prompt.len(),
            category = ?request.category,
            "starting preview generation"
        );

        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": full_prompt },
                    { "inlineData": { "mimeType": "image/jpeg", "data": request.source_image } },
                ],
            }],
            "generationConfig": { "responseModalities": ["IMAGE", "TEXT"] },
        });

        let envelope = self.client.generate_content(IMAGE_MODEL, &payload).await?;

        let mut image = None;
        let mut mime_type = "image/jpeg".to_string();
        let mut description = None;
        if let Some(parts) = envelope["candidates"][0]["content"]["parts"].as_array() {
            for part in parts {
                if let Some(data) = part["inlineData"]["data"].as_str() {
                    image = Some(data.to_string());
                    if let Some(mime) = part["inlineData"]["mimeType"].as_str() {
                        mime_type = mime.to_string();
                    }
                }
                if let Some(text) = part["text"].as_str() {
                    description = Some(text.to_string());
                }
            }
        }

        let image = image.ok_or_else(|| anyhow::anyhow!("no image returned from image generation"))?;
        let processing_time_ms = started.elapsed().as_millis() as u64;
        info!(
            processing_time_ms,
            has_description = description.is_some(),
            "preview generation completed"
        );

        Ok(GenerationResult {
            image,
            mime_type,
            description,
            processing_time_ms,
        })
    }
}
