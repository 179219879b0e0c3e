//! Relay WebSocket endpoint.
//!
//! Protocol: the client calls POST /start-session, then connects to
//! `/ws?session_id=...&device_id=...`. Validation happens after the
//! upgrade so failures can carry an application close code:
//!
//! - 4000 missing query parameters
//! - 4001 unknown or ended session
//! - 4003 session belongs to another device
//! - 4004 user not registered
//! - 4005 profile load failure
//! - 4006 upstream AI connection failure
//!
//! Once validated, the socket is bridged to a live Gemini session via
//! [`RelaySession`]; when it closes, a conversation summary is persisted
//! in the background.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::prompts::{build_coordinator_instruction, GREETING_PROMPT};
use crate::protocol::{AiState, ServerEvent};
use crate::relay::{RelayConfig, RelaySession};
use crate::session::Session;
use crate::store::{SessionMemory, UserProfile};

use super::AppState;

const CLOSE_MISSING_PARAMS: u16 = 4000;
const CLOSE_UNKNOWN_SESSION: u16 = 4001;
const CLOSE_DEVICE_MISMATCH: u16 = 4003;
const CLOSE_NOT_REGISTERED: u16 = 4004;
const CLOSE_PROFILE_FAILURE: u16 = 4005;
const CLOSE_UPSTREAM_FAILURE: u16 = 4006;

/// How many past-session memories feed the system instruction.
const MEMORY_CONTEXT_LIMIT: usize = 3;

pub async fn handle_relay_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

async fn handle_socket(socket: WebSocket, state: AppState, params: HashMap<String, String>) {
    let (Some(session_id), Some(device_id)) = (
        params.get("session_id").cloned(),
        params.get("device_id").cloned(),
    ) else {
        close_with(socket, CLOSE_MISSING_PARAMS, "session_id and device_id required").await;
        return;
    };

    let Some(session) = state.registry.get_session(&session_id) else {
        close_with(socket, CLOSE_UNKNOWN_SESSION, "Unknown session").await;
        return;
    };
    if session.device_id != device_id {
        close_with(socket, CLOSE_DEVICE_MISMATCH, "Session belongs to another device").await;
        return;
    }

    let profile = match state.store.get_user(&device_id) {
        Ok(Some(profile)) => profile,
        Ok(None) => {
            close_with(socket, CLOSE_NOT_REGISTERED, "User not registered").await;
            return;
        }
        Err(err) => {
            warn!(session_id = %session_id, error = %err, "profile load failed");
            close_with(socket, CLOSE_PROFILE_FAILURE, "Profile load failed").await;
            return;
        }
    };

    // Memories are context, not a requirement
    let memories = state
        .store
        .recent_memories(&device_id, MEMORY_CONTEXT_LIMIT)
        .unwrap_or_else(|err| {
            warn!(device_id = %device_id, error = %err, "memory load failed");
            Vec::new()
        });

    let instruction = build_coordinator_instruction(&profile, &memories, session.occasion);

    let upstream: Arc<dyn crate::live::LiveSession> =
        match state.connector.connect(&session_id, &instruction).await {
            Ok(live) => Arc::from(live),
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "upstream connect failed");
                close_with(socket, CLOSE_UPSTREAM_FAILURE, "AI session unavailable").await;
                return;
            }
        };

    info!(session_id = %session_id, device_id = %device_id, "relay socket connected");

    let (events_tx, events_rx) = mpsc::channel::<ServerEvent>(64);
    if !state.registry.attach_transport(&session_id, events_tx.clone()) {
        // Session expired between get_session and here
        upstream.close().await;
        close_with(socket, CLOSE_UNKNOWN_SESSION, "Session already ended").await;
        return;
    }

    let relay = RelaySession::new(
        session_id.clone(),
        events_tx.clone(),
        Arc::clone(&upstream),
        Arc::clone(&state.vision),
        Arc::clone(&state.previewer),
        Arc::clone(&state.registry),
        RelayConfig {
            side_effect_timeout: std::time::Duration::from_secs(
                state.config.side_effect_timeout_secs,
            ),
            ..RelayConfig::default()
        },
    );

    let (ws_sink, mut ws_stream) = socket.split();

    // Server events -> socket. Warning events also nudge the AI to wrap up;
    // the end event closes the socket from our side.
    let forward_task = {
        let relay = relay.clone();
        let mut rx = events_rx;
        let mut sink = ws_sink;
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if matches!(event, ServerEvent::SessionEndingSoon { .. }) {
                    relay.on_warning().await;
                }
                let ended = matches!(event, ServerEvent::SessionEnded { .. });
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if sink.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(error = %err, "failed to serialize server event"),
                }
                if ended {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: 1000,
                            reason: "Session ended".into(),
                        })))
                        .await;
                    break;
                }
            }
        })
    };

    // Upstream AI events -> relay
    let upstream_task = {
        let relay = relay.clone();
        let upstream = Arc::clone(&upstream);
        tokio::spawn(async move {
            while let Some(event) = upstream.next_event().await {
                relay.handle_upstream_event(event).await;
            }
            debug!("upstream event stream ended");
        })
    };

    let _ = events_tx
        .send(ServerEvent::State {
            ai_state: AiState::Listening,
        })
        .await;
    if let Err(err) = upstream.send_text(GREETING_PROMPT, true).await {
        warn!(session_id = %session_id, error = %err, "failed to send greeting prompt");
    }

    while let Some(Ok(message)) = ws_stream.next().await {
        match message {
            Message::Text(text) => relay.handle_client_text(&text).await,
            Message::Close(_) => break,
            // Binary frames are not part of the client protocol
            _ => {}
        }
    }

    info!(session_id = %session_id, "relay socket disconnected");

    upstream.close().await;
    upstream_task.abort();
    forward_task.abort();

    if relay.has_transcript() {
        let transcript = relay.take_transcript();
        spawn_summary(state, session, profile, transcript);
    }
}

/// Summarize the conversation and persist it as a memory for the next
/// session. Fire and forget: failures only lose the memory.
fn spawn_summary(state: AppState, session: Session, profile: UserProfile, transcript: String) {
    tokio::spawn(async move {
        let summary = match state
            .summarizer
            .summarize(&transcript, profile.language.as_deref())
            .await
        {
            Ok(summary) => summary,
            Err(err) => {
                warn!(session_id = %session.id, error = %err, "summary generation failed");
                return;
            }
        };

        let now = chrono::Utc::now();
        let duration_seconds = ((now.timestamp_millis() - session.started_at_ms) / 1000).max(0);
        let memory = SessionMemory {
            session_id: session.id.clone(),
            summary: summary.summary,
            tips: summary.tips,
            duration_seconds: Some(duration_seconds as u64),
            occasion: session.occasion,
            created_at: now.timestamp(),
        };

        let store = Arc::clone(&state.store);
        let device_id = session.device_id.clone();
        let result =
            tokio::task::spawn_blocking(move || store.save_session_memory(&device_id, &memory))
                .await;
        match result {
            Ok(Ok(())) => {
                info!(session_id = %session.id, "session memory saved");
            }
            Ok(Err(err)) => {
                warn!(session_id = %session.id, error = %err, "failed to save session memory");
            }
            Err(err) => {
                warn!(session_id = %session.id, error = %err, "summary task panicked");
            }
        }
    });
}
