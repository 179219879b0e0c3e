//! Trigger-phrase detection over streamed stylist transcripts.
//!
//! Output transcript fragments arrive mid-sentence, so a scanner buffers
//! them and only inspects complete sentences. When the stylist says
//! something like "let me show you a soft pink lip look", the sentence is
//! stripped down to the style description and handed to the preview
//! generator.

use regex::Regex;
use std::sync::OnceLock;

/// Minimum length for an extracted style description; anything shorter is
/// too vague to edit an image with.
const MIN_DESCRIPTION_LEN: usize = 10;

/// Phrases (English and German) that signal the stylist wants to show a
/// preview.
fn trigger_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // English
            r"(?i)let me show you",
            r"(?i)here'?s a preview",
            r"(?i)let me generate",
            r"(?i)take a look at this",
            r"(?i)how about something like this",
            r"(?i)picture this",
            r"(?i)imagine this look",
            // German
            r"(?i)lass mich dir zeigen",
            r"(?i)ich zeig dir",
            r"(?i)hier ist eine vorschau",
            r"(?i)schau dir das an",
            r"(?i)stell dir vor",
            r"(?i)wie w[äa]re es mit",
            r"(?i)so k[öo]nnte das aussehen",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

/// Strip the trigger phrase and surrounding punctuation from a matched
/// sentence; returns the wrapped edit prompt, or `None` when what remains
/// is too short to act on.
pub fn extract_style_description(sentence: &str) -> Option<String> {
    let mut description = sentence.to_string();
    for pattern in trigger_patterns() {
        description = pattern.replace_all(&description, "").into_owned();
    }

    static LEADING: OnceLock<Regex> = OnceLock::new();
    static TRAILING: OnceLock<Regex> = OnceLock::new();
    let leading = LEADING.get_or_init(|| Regex::new(r"^[\s,.:—-]+").unwrap());
    let trailing = TRAILING.get_or_init(|| Regex::new(r"[.!?]+$").unwrap());
    let description = leading.replace(&description, "");
    let description = trailing.replace(&description, "");
    let description = description.trim();

    if description.chars().count() < MIN_DESCRIPTION_LEN {
        return None;
    }

    Some(format!(
        "Apply this style change to the person in the photo: {description}. Keep the person's \
         face and identity clearly recognizable. Make the change look natural and realistic."
    ))
}

/// Buffers transcript fragments and scans each complete sentence for a
/// trigger phrase.
#[derive(Default)]
pub struct TriggerScanner {
    buffer: String,
}

impl TriggerScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a transcript fragment, scan any now-complete sentences, and
    /// return at most one extracted edit prompt. Incomplete trailing text
    /// stays buffered for the next fragment.
    pub fn feed(&mut self, fragment: &str) -> Option<String> {
        self.buffer.push_str(fragment);

        static SENTENCE: OnceLock<Regex> = OnceLock::new();
        let sentence = SENTENCE.get_or_init(|| Regex::new(r"[^.!?]*[.!?]+").unwrap());

        let mut sentences = Vec::new();
        let mut consumed = 0;
        for found in sentence.find_iter(&self.buffer) {
            sentences.push(found.as_str().to_string());
            consumed = found.end();
        }

        if sentences.is_empty() {
            return None;
        }
        self.buffer.drain(..consumed);

        for candidate in sentences {
            let trimmed = candidate.trim();
            if trimmed.is_empty() {
                continue;
            }
            if !trigger_patterns().iter().any(|p| p.is_match(trimmed)) {
                continue;
            }
            if let Some(description) = extract_style_description(trimmed) {
                // One launch per scan pass
                return Some(description);
            }
        }
        None
    }

    /// Scan whatever is left in the buffer when the model finishes its
    /// turn. Clears the buffer either way.
    pub fn flush(&mut self) -> Option<String> {
        let remaining = std::mem::take(&mut self.buffer);
        let remaining = remaining.trim();
        if remaining.is_empty() {
            return None;
        }
        if !trigger_patterns().iter().any(|p| p.is_match(remaining)) {
            return None;
        }
        extract_style_description(remaining)
    }
}
