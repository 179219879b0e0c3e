//! LiveStylist backend: a real-time AI styling companion.
//!
//! Bridges a mobile client to a streaming conversational AI session over
//! WebSocket, enriched by a background vision pipeline (camera crops are
//! analyzed and injected into the conversation) and on-demand style
//! preview image generation. Sessions are time-boxed, quota-limited per
//! device, and summarized into per-user memories for continuity across
//! sessions.
//!
//! Module map:
//! - [`config`] — environment-driven configuration
//! - [`protocol`] — client/server WebSocket message types
//! - [`prompts`] — system instructions and injected prompt text
//! - [`store`] — SQLite persistence (users, sessions, memories)
//! - [`entitlement`] — RevenueCat subscription tier lookup
//! - [`gemini`] — REST calls: vision analysis, preview images, summaries
//! - [`live`] — streaming Gemini Live WebSocket client
//! - [`session`] — session registry with warning/expiry timers
//! - [`relay`] — per-connection bridge between client and AI session
//! - [`gateway`] — axum HTTP surface and relay WebSocket endpoint

pub mod config;
pub mod entitlement;
pub mod gateway;
pub mod gemini;
pub mod live;
pub mod prompts;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod store;
