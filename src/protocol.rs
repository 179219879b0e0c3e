//! Wire protocol for the client relay WebSocket.
//!
//! Defines the JSON message types exchanged between the mobile client and
//! the server during a live styling session, plus the shared enums (tier,
//! occasion, AI state) used across the HTTP surface.
//!
//! ## Protocol
//!
//! ```text
//! Mobile client ──WebSocket──▸ LiveStylist server ──WebSocket──▸ Gemini Live API
//!       ◂── events ────────────────◂── audio/text ────────────────◂
//! ```
//!
//! All messages are JSON text frames, discriminated by a `type` field.
//! Audio and image payloads are base64-encoded within JSON. A message that
//! fails to parse is logged and dropped by the relay — never fatal.

use serde::{Deserialize, Serialize};

/// Maximum length of a client-supplied preview prompt.
pub const MAX_PREVIEW_PROMPT_LEN: usize = 500;

// ── Client → Server messages ──────────────────────────────────────

/// Messages sent from the mobile client to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Microphone audio chunk (base64 PCM16 mono 16kHz).
    Audio { data: String },

    /// Camera frame, pre-cropped into the three analysis regions
    /// (base64 JPEG each).
    Frame {
        eye_crop: String,
        mouth_crop: String,
        body_crop: String,
    },

    /// Stop forwarding microphone audio upstream.
    Mute,

    /// Resume forwarding microphone audio upstream.
    Unmute,

    /// End the session (same effect as POST /end-session).
    EndSession,

    /// Request a style preview image from the latest reference frame.
    GeneratePreview {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        category: Option<PreviewCategory>,
    },

    /// Liveness check; the relay replies with `pong` immediately.
    Ping,
}

/// Style category for preview generation prompt templating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewCategory {
    Hairstyle,
    Makeup,
    Accessory,
    Clothing,
    FullLook,
}

/// Parse and validate a raw client frame.
///
/// Validation beyond shape: preview prompts must be 1..=500 characters.
pub fn parse_client_message(raw: &str) -> Result<ClientMessage, ProtocolError> {
    let msg: ClientMessage =
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    if let ClientMessage::GeneratePreview { prompt, .. } = &msg {
        if prompt.is_empty() || prompt.chars().count() > MAX_PREVIEW_PROMPT_LEN {
            return Err(ProtocolError::InvalidPrompt(prompt.chars().count()));
        }
    }

    Ok(msg)
}

/// A client frame the relay refuses to dispatch.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed client message: {0}")]
    Malformed(String),
    #[error("preview prompt length {0} outside 1..=500")]
    InvalidPrompt(usize),
}

// ── Server → Client messages ──────────────────────────────────────

/// Conversational state of the stylist, mirrored to the client UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiState {
    Idle,
    Listening,
    Thinking,
    Speaking,
    Analyzing,
}

/// Which end initiated a preview generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewTrigger {
    /// The stylist spoke a trigger phrase.
    Agent,
    /// The client sent `generate_preview`.
    Client,
}

/// Events sent from the relay to the mobile client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Transport attached; session timers are running.
    SessionStarted {
        session_id: String,
        /// Epoch milliseconds when the session will expire.
        expires_at: i64,
    },

    /// Conversational state change.
    State { ai_state: AiState },

    /// Which vision regions are currently being analyzed (empty = done).
    VisionActive { agents: Vec<String> },

    /// Partial or final transcript line.
    Transcript {
        direction: TranscriptDirection,
        text: String,
        finished: bool,
    },

    /// Stylist speech chunk (base64 PCM16 mono 24kHz).
    Audio { data: String },

    /// Preview generation started.
    PreviewGenerating { prompt: String },

    /// Preview generation finished.
    PreviewImage {
        image: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
        prompt: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        trigger: PreviewTrigger,
    },

    /// Preview generation failed or was refused.
    PreviewError { message: String, prompt: String },

    /// Warning timer fired; the session ends shortly.
    SessionEndingSoon { seconds_remaining: u64 },

    /// Expiry timer fired; a `session_ended` follows immediately.
    SessionExpired,

    /// Authoritative termination signal.
    SessionEnded {
        duration_seconds: u64,
        reason: String,
    },

    /// Advisory error; the session stays alive.
    Error { message: String },

    /// Reply to a client `ping`.
    Pong,
}

/// Who spoke a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptDirection {
    Input,
    Output,
}

// ── Shared domain enums ───────────────────────────────────────────

/// Subscription tier, decided by the entitlement check at session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Free,
    Premium,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Premium => "premium",
        }
    }
}

/// What the user is getting styled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Occasion {
    Casual,
    Work,
    DateNight,
    Event,
    GoingOut,
    Selfcare,
}

impl Occasion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Casual => "casual",
            Self::Work => "work",
            Self::DateNight => "date_night",
            Self::Event => "event",
            Self::GoingOut => "going_out",
            Self::Selfcare => "selfcare",
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
