//! Post-session summary generation.
//!
//! After a connection tears down, the speaker-tagged session log is handed
//! to a fast text model which returns a short summary and 2-3 actionable
//! tips as JSON. The result feeds the continuity context of the user's next
//! session.

use async_trait::async_trait;
use serde_json::json;

use crate::gemini::{first_text, GeminiClient};

const SUMMARY_MODEL: &str = "gemini-2.0-flash";

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub summary: String,
    pub tips: Vec<String>,
}

#[async_trait]
pub trait SummaryGenerator: Send + Sync {
    /// `language` is the user's two-letter code; non-English sessions are
    /// summarized in the session language.
    async fn summarize(
        &self,
        transcript: &str,
        language: Option<&str>,
    ) -> anyhow::Result<SessionSummary>;
}

pub struct GeminiSummary {
    client: GeminiClient,
}

impl GeminiSummary {
    pub fn new(client: GeminiClient) -> Self {
        Self { client }
    }
}

fn build_summary_prompt(transcript: &str, language: Option<&str>) -> String {
    let lang_instruction = match language {
        Some(lang) if lang != "en" => {
            "\n\nIMPORTANT: Write the summary and tips in the SAME LANGUAGE as the session \
             transcript. The session was conducted in a non-English language — your output MUST \
             be in that same language."
        }
        _ => "",
    };

    format!(
        "Analyze this beauty/style consultation session and return a JSON object with exactly \
         this format:\n{{\n  \"summary\": \"...\",\n  \"tips\": [\"tip 1\", \"tip 2\", \"tip 3\"]\n}}\n\n\
         For the summary: Include ONLY new information from THIS session — do NOT repeat or \
         rephrase anything the stylist recalled from previous sessions. Focus on: what the user \
         was wearing, new observations about their appearance, new recommendations given, and \
         any new preferences or requests the user expressed. Keep it concise (100-150 words). \
         Write in past tense, third person.\n\n\
         For tips: Extract 2-3 specific, actionable style tips that were discussed or \
         recommended during the session. Each tip should be a short, practical sentence the user \
         can reference later.\n\n\
         Return ONLY the JSON object, no markdown formatting or code blocks.{lang_instruction}\n\n\
         Session transcript:\n{transcript}"
    )
}

/// Strip a leading/trailing markdown code fence, tolerating a `json` tag.
fn strip_code_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        let rest = rest.strip_prefix("json").or_else(|| rest.strip_prefix("JSON")).unwrap_or(rest);
        text = rest.trim_start();
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest.trim_end();
    }
    text
}

fn parse_summary(raw: &str) -> Option<SessionSummary> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let cleaned = strip_code_fences(raw);
    match serde_json::from_str::<serde_json::Value>(cleaned) {
        Ok(parsed) => {
            let summary = parsed["summary"]
                .as_str()
                .filter(|s| !s.is_empty())
                .unwrap_or(raw)
                .to_string();
            let tips = parsed["tips"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|tip| tip.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            Some(SessionSummary { summary, tips })
        }
        // Model ignored the JSON instruction: keep the raw text as summary.
        Err(_) => Some(SessionSummary {
            summary: raw.to_string(),
            tips: Vec::new(),
        }),
    }
}

#[async_trait]
impl SummaryGenerator for GeminiSummary {
    async fn summarize(
        &self,
        transcript: &str,
        language: Option<&str>,
    ) -> anyhow::Result<SessionSummary> {
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": build_summary_prompt(transcript, language) }],
            }],
        });

        let envelope = self.client.generate_content(SUMMARY_MODEL, &payload).await?;
        let raw = first_text(&envelope).unwrap_or_default();
        parse_summary(raw).ok_or_else(|| anyhow::anyhow!("empty summary generated"))
    }
}
