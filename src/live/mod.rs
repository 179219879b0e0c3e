//! Live conversation upstream.
//!
//! The relay talks to the streaming stylist model through the
//! [`LiveSession`] trait so orchestration logic can be tested against a
//! scripted fake. The real implementation ([`gemini::GeminiLiveConnector`])
//! speaks the Gemini Live BidiGenerateContent protocol.

pub mod gemini;

use async_trait::async_trait;

/// One event from the upstream model.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// Handshake finished, audio can flow.
    SetupComplete,
    /// Raw PCM audio of the model speaking (24kHz mono).
    Audio { data: Vec<u8> },
    /// Partial transcript of the user's speech.
    InputTranscript { text: String },
    /// Partial transcript of the model's speech.
    OutputTranscript { text: String },
    /// The model finished its turn.
    TurnComplete,
    /// The user spoke over the model; playback should stop.
    Interrupted,
    Error { message: String },
}

/// An established bidirectional conversation with the stylist model.
#[async_trait]
pub trait LiveSession: Send + Sync {
    /// Stream a chunk of user microphone audio (16kHz PCM).
    async fn send_audio(&self, pcm: &[u8]) -> anyhow::Result<()>;

    /// Inject a text turn. `complete_turn` asks the model to respond now;
    /// `false` just adds context for its next turn.
    async fn send_text(&self, text: &str, complete_turn: bool) -> anyhow::Result<()>;

    /// Next upstream event; `None` once the connection is gone.
    async fn next_event(&self) -> Option<LiveEvent>;

    async fn close(&self);
}

/// Opens [`LiveSession`]s. Injected so the relay never constructs its
/// upstream directly.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    async fn connect(
        &self,
        session_id: &str,
        system_instruction: &str,
    ) -> anyhow::Result<Box<dyn LiveSession>>;
}
