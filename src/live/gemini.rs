//! Gemini Live WebSocket client (BidiGenerateContent).
//!
//! ## Protocol
//!
//! 1. **Connect** — open the WebSocket to the Live endpoint
//! 2. **Setup** — send model, voice, system instruction, transcription
//!    config; wait for `setupComplete`
//! 3. **Stream** — user audio goes up as `realtimeInput`, text injections
//!    as `clientContent`; model audio/transcripts come back as
//!    `serverContent`
//! 4. **Close** — graceful WebSocket close
//!
//! ## Binary frame quirk
//!
//! The server sends **all** messages as Binary frames, JSON control
//! messages included. Binary payloads starting with `{` are parsed as
//! server messages; anything else is logged and skipped.

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use super::{LiveConnector, LiveEvent, LiveSession};

const GEMINI_LIVE_WS_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Input audio MIME type (16kHz PCM mono).
const INPUT_AUDIO_MIME: &str = "audio/pcm;rate=16000";

/// How long to wait for `setupComplete` before failing the connect.
const SETUP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

// ── Setup message (JSON sent as first frame) ───────────────────────

#[derive(Debug, Serialize)]
struct SetupMessage {
    setup: SetupPayload,
}

#[derive(Debug, Serialize)]
struct SetupPayload {
    model: String,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
    #[serde(rename = "systemInstruction")]
    system_instruction: SystemInstruction,
    /// `{}` enables transcription of the user's speech.
    #[serde(rename = "inputAudioTranscription")]
    input_audio_transcription: serde_json::Value,
    /// `{}` enables transcription of the model's speech.
    #[serde(rename = "outputAudioTranscription")]
    output_audio_transcription: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    #[serde(rename = "responseModalities")]
    response_modalities: Vec<String>,
    #[serde(rename = "speechConfig")]
    speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
struct SpeechConfig {
    #[serde(rename = "voiceConfig")]
    voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
struct VoiceConfig {
    #[serde(rename = "prebuiltVoiceConfig")]
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
struct PrebuiltVoiceConfig {
    #[serde(rename = "voiceName")]
    voice_name: String,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

fn build_setup_message(model: &str, system_instruction: &str) -> SetupMessage {
    SetupMessage {
        setup: SetupPayload {
            model: format!("models/{model}"),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: "Aoede".to_string(),
                        },
                    },
                },
            },
            system_instruction: SystemInstruction {
                parts: vec![TextPart {
                    text: system_instruction.to_string(),
                }],
            },
            input_audio_transcription: serde_json::json!({}),
            output_audio_transcription: serde_json::json!({}),
        },
    }
}

// ── Outbound messages ──────────────────────────────────────────────

/// Wire format: `{"realtimeInput": {"mediaChunks": [{"mimeType": ..., "data": "<base64>"}]}}`
///
/// API docs mark `mediaChunks` as deprecated in favor of `audio`, but the
/// official SDKs still emit `mediaChunks` on the wire and the server does
/// not reliably process `audio` yet.
fn build_audio_message(pcm: &[u8]) -> serde_json::Value {
    let b64 = base64::engine::general_purpose::STANDARD.encode(pcm);
    serde_json::json!({
        "realtimeInput": {
            "mediaChunks": [{ "mimeType": INPUT_AUDIO_MIME, "data": b64 }]
        }
    })
}

fn build_text_message(text: &str, complete_turn: bool) -> serde_json::Value {
    serde_json::json!({
        "clientContent": {
            "turns": [{ "role": "user", "parts": [{ "text": text }] }],
            "turnComplete": complete_turn,
        }
    })
}

#[derive(Debug)]
enum Outbound {
    Audio(Vec<u8>),
    Text { text: String, complete_turn: bool },
    Close,
}

// ── Server message parsing ─────────────────────────────────────────

/// Parse one JSON frame into a list of events. A single server message can
/// carry several events (audio chunks plus a transcript in one frame).
fn parse_server_message(json_text: &str) -> Vec<LiveEvent> {
    let mut events = Vec::new();

    let value: serde_json::Value = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(e) => {
            events.push(LiveEvent::Error {
                message: format!("Failed to parse server message: {e}"),
            });
            return events;
        }
    };

    if value.get("setupComplete").is_some() {
        events.push(LiveEvent::SetupComplete);
    }

    if let Some(content) = value.get("serverContent") {
        if content.get("turnComplete").and_then(|v| v.as_bool()) == Some(true) {
            events.push(LiveEvent::TurnComplete);
        }
        if content.get("interrupted").and_then(|v| v.as_bool()) == Some(true) {
            events.push(LiveEvent::Interrupted);
        }
        if let Some(parts) = content
            .pointer("/modelTurn/parts")
            .and_then(|v| v.as_array())
        {
            for part in parts {
                if let Some(data_b64) = part.pointer("/inlineData/data").and_then(|v| v.as_str()) {
                    if let Ok(audio) = base64::engine::general_purpose::STANDARD.decode(data_b64) {
                        events.push(LiveEvent::Audio { data: audio });
                    }
                }
                // Text parts surface as non-final stylist transcript lines.
                if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                    if !text.is_empty() {
                        events.push(LiveEvent::OutputTranscript {
                            text: text.to_string(),
                        });
                    }
                }
            }
        }

        // Live transcription arrives under serverContent on current API
        // versions; tolerate the older top-level placement below as well.
        push_transcripts(content, &mut events);
    }

    push_transcripts(&value, &mut events);

    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown server error");
        events.push(LiveEvent::Error {
            message: message.to_string(),
        });
    }

    events
}

fn push_transcripts(value: &serde_json::Value, events: &mut Vec<LiveEvent>) {
    if let Some(text) = value
        .pointer("/inputTranscription/text")
        .and_then(|v| v.as_str())
    {
        if !text.is_empty() {
            events.push(LiveEvent::InputTranscript {
                text: text.to_string(),
            });
        }
    }
    if let Some(text) = value
        .pointer("/outputTranscription/text")
        .and_then(|v| v.as_str())
    {
        if !text.is_empty() {
            events.push(LiveEvent::OutputTranscript {
                text: text.to_string(),
            });
        }
    }
}

// ── Session ────────────────────────────────────────────────────────

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;
type WsSource = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

/// Live connection handle. Outbound traffic goes through a channel into a
/// spawned writer task; inbound frames are parsed by a reader task and
/// surface through [`LiveSession::next_event`].
pub struct GeminiLiveSession {
    outbound_tx: mpsc::Sender<Outbound>,
    event_rx: Mutex<mpsc::Receiver<LiveEvent>>,
}

impl GeminiLiveSession {
    async fn connect(
        session_id: &str,
        api_key: &str,
        model: &str,
        system_instruction: &str,
    ) -> anyhow::Result<Self> {
        let url = format!("{GEMINI_LIVE_WS_URL}?key={api_key}");

        info!(session_id = %session_id, model = %model, "Connecting to Gemini Live");

        let (mut ws_stream, _response) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to Gemini Live: {e}"))?;

        // Send setup on the unsplit stream
        let setup = build_setup_message(model, system_instruction);
        let setup_json = serde_json::to_string(&setup)?;
        ws_stream
            .send(WsMessage::Text(setup_json.into()))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to send setup message: {e}"))?;

        // Wait for setupComplete before splitting. The server sends JSON in
        // Binary frames, so check both frame types.
        let handshake = tokio::time::timeout(SETUP_TIMEOUT, async {
            while let Some(msg_result) = ws_stream.next().await {
                match msg_result {
                    Ok(WsMessage::Binary(data)) if data.first() == Some(&b'{') => {
                        if let Ok(text) = std::str::from_utf8(&data) {
                            if text.contains("setupComplete") {
                                return Ok(());
                            }
                        }
                    }
                    Ok(WsMessage::Text(text)) if text.contains("setupComplete") => {
                        return Ok(());
                    }
                    Ok(WsMessage::Close(frame)) => {
                        anyhow::bail!("Connection closed before setupComplete: {frame:?}");
                    }
                    Err(e) => {
                        anyhow::bail!("WebSocket error before setupComplete: {e}");
                    }
                    other => {
                        debug!(session_id = %session_id, msg = ?other, "setup phase: skipping frame");
                    }
                }
            }
            anyhow::bail!("Stream ended before setupComplete")
        })
        .await;

        match handshake {
            Ok(Ok(())) => {
                info!(session_id = %session_id, "Gemini Live setup complete — ready to stream");
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => anyhow::bail!("Gemini Live setupComplete timeout (15s)"),
        }

        let (ws_sink, ws_source) = ws_stream.split();

        let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(256);
        let (event_tx, event_rx) = mpsc::channel::<LiveEvent>(256);

        let sid = session_id.to_string();
        tokio::spawn(Self::writer_loop(outbound_rx, ws_sink, sid.clone()));
        tokio::spawn(Self::reader_loop(ws_source, event_tx, sid));

        Ok(Self {
            outbound_tx,
            event_rx: Mutex::new(event_rx),
        })
    }

    async fn writer_loop(mut rx: mpsc::Receiver<Outbound>, mut sink: WsSink, session_id: String) {
        let mut audio_chunks: u64 = 0;

        while let Some(msg) = rx.recv().await {
            let payload = match msg {
                Outbound::Audio(pcm) => {
                    audio_chunks += 1;
                    if audio_chunks == 1 || audio_chunks % 50 == 0 {
                        debug!(
                            session_id = %session_id,
                            chunk = audio_chunks,
                            pcm_bytes = pcm.len(),
                            "Sending audio chunk to Gemini"
                        );
                    }
                    build_audio_message(&pcm)
                }
                Outbound::Text {
                    text,
                    complete_turn,
                } => {
                    debug!(
                        session_id = %session_id,
                        complete_turn,
                        len = text.len(),
                        "Injecting text turn"
                    );
                    build_text_message(&text, complete_turn)
                }
                Outbound::Close => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            };

            match serde_json::to_string(&payload) {
                Ok(json) => {
                    if sink.send(WsMessage::Text(json.into())).await.is_err() {
                        warn!(session_id = %session_id, "WebSocket send failed, closing writer loop");
                        break;
                    }
                }
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "Failed to serialize outbound message");
                }
            }
        }

        debug!(session_id = %session_id, "Writer loop terminated");
    }

    async fn reader_loop(
        mut source: WsSource,
        event_tx: mpsc::Sender<LiveEvent>,
        session_id: String,
    ) {
        while let Some(msg_result) = source.next().await {
            let frame_text = match &msg_result {
                Ok(WsMessage::Text(text)) => Some(text.to_string()),
                Ok(WsMessage::Binary(data)) if data.first() == Some(&b'{') => {
                    std::str::from_utf8(data).ok().map(str::to_string)
                }
                Ok(WsMessage::Binary(data)) => {
                    if !data.is_empty() {
                        warn!(
                            session_id = %session_id,
                            len = data.len(),
                            "Unexpected non-JSON binary frame from Gemini Live, skipping"
                        );
                    }
                    None
                }
                Ok(WsMessage::Close(frame)) => {
                    info!(session_id = %session_id, close_frame = ?frame, "Gemini Live connection closed");
                    break;
                }
                Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => None,
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "Gemini Live WebSocket error");
                    let _ = event_tx
                        .send(LiveEvent::Error {
                            message: format!("WebSocket error: {e}"),
                        })
                        .await;
                    break;
                }
            };

            let Some(text) = frame_text else { continue };
            for event in parse_server_message(&text) {
                if let LiveEvent::OutputTranscript { text } = &event {
                    debug!(session_id = %session_id, text = %text, "output transcript fragment");
                }
                if event_tx.send(event).await.is_err() {
                    debug!(session_id = %session_id, "Event receiver dropped, closing reader loop");
                    return;
                }
            }
        }

        debug!(session_id = %session_id, "Reader loop terminated");
    }
}

#[async_trait::async_trait]
impl LiveSession for GeminiLiveSession {
    async fn send_audio(&self, pcm: &[u8]) -> anyhow::Result<()> {
        if pcm.is_empty() {
            return Ok(());
        }
        self.outbound_tx
            .send(Outbound::Audio(pcm.to_vec()))
            .await
            .map_err(|_| anyhow::anyhow!("Live session channel closed"))
    }

    async fn send_text(&self, text: &str, complete_turn: bool) -> anyhow::Result<()> {
        self.outbound_tx
            .send(Outbound::Text {
                text: text.to_string(),
                complete_turn,
            })
            .await
            .map_err(|_| anyhow::anyhow!("Live session channel closed"))
    }

    async fn next_event(&self) -> Option<LiveEvent> {
        self.event_rx.lock().await.recv().await
    }

    async fn close(&self) {
        let _ = self.outbound_tx.send(Outbound::Close).await;
    }
}

/// Opens real Gemini Live sessions.
pub struct GeminiLiveConnector {
    api_key: Arc<str>,
    model: Arc<str>,
}

impl GeminiLiveConnector {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait::async_trait]
impl LiveConnector for GeminiLiveConnector {
    async fn connect(
        &self,
        session_id: &str,
        system_instruction: &str,
    ) -> anyhow::Result<Box<dyn LiveSession>> {
        let session =
            GeminiLiveSession::connect(session_id, &self.api_key, &self.model, system_instruction)
                .await?;
        Ok(Box::new(session))
    }
}

// ── Tests ──────────────────────────────────────────────────────────
