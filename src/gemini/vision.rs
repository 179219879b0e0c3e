//! Parallel vision analysis over the three camera crops.
//!
//! Each crop gets its own specialist prompt and a dedicated
//! `generateContent` call with a JSON response type; the three calls run
//! concurrently and the combined result is formatted into a single context
//! block for injection into the live conversation.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::gemini::{first_text, GeminiClient};
use crate::prompts::{BODY_INSTRUCTION, EYE_INSTRUCTION, MOUTH_INSTRUCTION};

const VISION_MODEL: &str = "gemini-2.5-flash";

/// Structured output of one full vision pass.
#[derive(Debug, Clone)]
pub struct VisionResults {
    pub eye: Value,
    pub mouth: Value,
    pub body: Value,
}

/// Runs one analysis pass over three base64 JPEG crops.
#[async_trait]
pub trait VisionPipeline: Send + Sync {
    async fn analyze(&self, eye: &str, mouth: &str, body: &str) -> anyhow::Result<VisionResults>;
}

pub struct GeminiVision {
    client: GeminiClient,
}

impl GeminiVision {
    pub fn new(client: GeminiClient) -> Self {
        Self { client }
    }

    async fn analyze_crop(&self, instruction: &str, suffix: &str, crop: &str) -> anyhow::Result<Value> {
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": format!("{instruction}\n\n{suffix}") },
                    { "inlineData": { "mimeType": "image/jpeg", "data": crop } },
                ],
            }],
            "generationConfig": { "responseMimeType": "application/json" },
        });

        let envelope = self.client.generate_content(VISION_MODEL, &payload).await?;
        let text = first_text(&envelope).unwrap_or("{}");
        Ok(serde_json::from_str(text).unwrap_or_else(|_| json!({})))
    }
}

#[async_trait]
impl VisionPipeline for GeminiVision {
    async fn analyze(&self, eye: &str, mouth: &str, body: &str) -> anyhow::Result<VisionResults> {
        let (eye, mouth, body) = tokio::try_join!(
            self.analyze_crop(EYE_INSTRUCTION, "Analyze this eye region image. Return JSON only.", eye),
            self.analyze_crop(MOUTH_INSTRUCTION, "Analyze this mouth region image. Return JSON only.", mouth),
            self.analyze_crop(
                BODY_INSTRUCTION,
                "Analyze this face and upper body image. Return JSON only.",
                body,
            ),
        )?;

        debug!("vision pipeline completed all 3 analyses");
        Ok(VisionResults { eye, mouth, body })
    }
}

/// Render a vision pass as a context block the stylist can draw on without
/// reading it aloud.
pub fn format_vision_results(results: &VisionResults) -> String {
    format!(
        "[Vision update — do not read this aloud, use it to inform your next response]\n\n\
         Eye analysis:\n{}\n\n\
         Mouth analysis:\n{}\n\n\
         Face/body analysis:\n{}",
        serde_json::to_string_pretty(&results.eye).unwrap_or_default(),
        serde_json::to_string_pretty(&results.mouth).unwrap_or_default(),
        serde_json::to_string_pretty(&results.body).unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formatted_results_carry_all_three_sections() {
        let results = VisionResults {
            eye: json!({"shape": "almond"}),
            mouth: json!({"lip_color": "coral"}),
            body: json!({"hair": "curly"}),
        };

        let text = format_vision_results(&results);
        assert!(text.starts_with("[Vision update"));
        assert!(text.contains("Eye analysis:"));
        assert!(text.contains("\"shape\": \"almond\""));
        assert!(text.contains("Mouth analysis:"));
        assert!(text.contains("Face/body analysis:"));
        assert!(text.contains("\"hair\": \"curly\""));
    }
}
