//! Axum-based HTTP gateway.
//!
//! Hosts the device-facing REST surface (registration, profile, session
//! start/end) and the relay WebSocket, with body limits, request timeouts,
//! CORS, and sliding-window rate limiting. Device identity travels in the
//! `X-Device-Id` header; the relay socket authenticates via query
//! parameters instead since browsers and mobile WebSocket clients cannot
//! set headers.

pub mod ws;

use anyhow::Result;
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, patch, post},
    Router,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::config::Config;
use crate::entitlement::EntitlementChecker;
use crate::gemini::preview::PreviewGenerator;
use crate::gemini::summary::SummaryGenerator;
use crate::gemini::vision::VisionPipeline;
use crate::live::LiveConnector;
use crate::protocol::Occasion;
use crate::session::SessionRegistry;
use crate::store::{ProfileUpdate, RegisterUser, StoreError, StylistStore};

/// Maximum request body size (64KB) — camera crops ride the WebSocket, so
/// REST bodies only need headroom for profile JSON.
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout for the REST surface.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Sliding window used by gateway rate limiting.
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;
/// Per-device session starts per window.
const START_SESSION_LIMIT_PER_WINDOW: u32 = 10;
/// General requests per device per window.
const GENERAL_LIMIT_PER_WINDOW: u32 = 120;

/// How often the rate limiter sweeps stale entries from its map.
const RATE_LIMITER_SWEEP_INTERVAL_SECS: u64 = 300; // 5 minutes

#[derive(Debug)]
struct SlidingWindowRateLimiter {
    limit_per_window: u32,
    window: Duration,
    requests: Mutex<(HashMap<String, Vec<Instant>>, Instant)>,
}

impl SlidingWindowRateLimiter {
    fn new(limit_per_window: u32, window: Duration) -> Self {
        Self {
            limit_per_window,
            window,
            requests: Mutex::new((HashMap::new(), Instant::now())),
        }
    }

    fn allow(&self, key: &str) -> bool {
        if self.limit_per_window == 0 {
            return true;
        }

        let now = Instant::now();
        let cutoff = now.checked_sub(self.window).unwrap_or_else(Instant::now);

        let mut guard = self.requests.lock();
        let (requests, last_sweep) = &mut *guard;

        // Periodic sweep: remove keys with no recent requests
        if last_sweep.elapsed() >= Duration::from_secs(RATE_LIMITER_SWEEP_INTERVAL_SECS) {
            requests.retain(|_, timestamps| {
                timestamps.retain(|t| *t > cutoff);
                !timestamps.is_empty()
            });
            *last_sweep = now;
        }

        let entry = requests.entry(key.to_owned()).or_default();
        entry.retain(|instant| *instant > cutoff);

        if entry.len() >= self.limit_per_window as usize {
            return false;
        }

        entry.push(now);
        true
    }
}

#[derive(Debug)]
pub struct GatewayRateLimiter {
    start_session: SlidingWindowRateLimiter,
    general: SlidingWindowRateLimiter,
}

impl GatewayRateLimiter {
    pub fn new() -> Self {
        let window = Duration::from_secs(RATE_LIMIT_WINDOW_SECS);
        Self {
            start_session: SlidingWindowRateLimiter::new(START_SESSION_LIMIT_PER_WINDOW, window),
            general: SlidingWindowRateLimiter::new(GENERAL_LIMIT_PER_WINDOW, window),
        }
    }

    fn allow_start_session(&self, key: &str) -> bool {
        self.start_session.allow(key)
    }

    fn allow_general(&self, key: &str) -> bool {
        self.general.allow(key)
    }
}

impl Default for GatewayRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state for all axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub store: Arc<dyn StylistStore>,
    pub entitlement: Arc<dyn EntitlementChecker>,
    pub connector: Arc<dyn LiveConnector>,
    pub vision: Arc<dyn VisionPipeline>,
    pub previewer: Arc<dyn PreviewGenerator>,
    pub summarizer: Arc<dyn SummaryGenerator>,
    pub rate_limiter: Arc<GatewayRateLimiter>,
}

/// Build the router with all middleware layers.
pub fn build_router(state: AppState) -> Router {
    // CORS — the mobile web view and dev tooling connect cross-origin
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PATCH,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::HeaderName::from_static("x-device-id"),
        ])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(handle_health))
        .route("/register", post(handle_register))
        .route("/profile", get(handle_get_profile))
        .route("/profile", patch(handle_patch_profile))
        .route("/start-session", post(handle_start_session))
        .route("/end-session", post(handle_end_session))
        .route("/ws", get(ws::handle_relay_ws))
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

/// Run the HTTP gateway. Blocks until SIGINT/SIGTERM, then ends all active
/// sessions before returning.
pub async fn run_server(host: &str, state: AppState) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{}", state.config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let display_addr = listener.local_addr()?;

    let registry = Arc::clone(&state.registry);
    let app = build_router(state);

    tracing::info!("LiveStylist server listening on http://{display_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down, ending active sessions");
    registry.shutdown_all().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

// ══════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════

type ApiResponse = (StatusCode, Json<serde_json::Value>);

fn error_response(status: StatusCode, message: &str) -> ApiResponse {
    (status, Json(serde_json::json!({"error": message})))
}

/// Extract the device id from `X-Device-Id`. 400 when missing or not a
/// plausible identifier.
fn device_id_from_headers(headers: &HeaderMap) -> Result<String, ApiResponse> {
    let raw = headers
        .get("X-Device-Id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or("");

    let valid = !raw.is_empty()
        && raw.len() <= 128
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "Missing or invalid X-Device-Id header",
        ));
    }
    Ok(raw.to_string())
}

fn validate_registration(reg: &RegisterUser) -> Result<(), String> {
    fn name_ok(s: &str, max: usize) -> bool {
        !s.trim().is_empty()
            && s.chars().count() <= max
            && s.chars()
                .all(|c| c.is_alphabetic() || c == ' ' || c == '\'' || c == '-')
    }

    if !name_ok(&reg.name, 50) {
        return Err("name must be 1-50 letters, spaces, apostrophes or hyphens".into());
    }
    if !name_ok(&reg.favorite_color, 30) {
        return Err("favorite_color must be 1-30 letters or spaces".into());
    }
    if let Some(stylist) = &reg.stylist_name {
        if !name_ok(stylist, 50) {
            return Err("stylist_name must be 1-50 letters, spaces, apostrophes or hyphens".into());
        }
    }
    if let Some(lang) = &reg.language {
        let ok = lang.len() == 2 && lang.chars().all(|c| c.is_ascii_lowercase());
        if !ok {
            return Err("language must be a 2-letter lowercase code".into());
        }
    }
    Ok(())
}

/// GET /health — always public.
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "active_sessions": state.registry.active_count(),
    }))
}

/// POST /register — create the profile for this device.
async fn handle_register(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<RegisterUser>, axum::extract::rejection::JsonRejection>,
) -> ApiResponse {
    let device_id = match device_id_from_headers(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    if !state.rate_limiter.allow_general(&device_id) {
        return error_response(StatusCode::TOO_MANY_REQUESTS, "Too many requests");
    }

    let Json(reg) = match body {
        Ok(b) => b,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, &format!("Invalid request: {e}"));
        }
    };
    if let Err(msg) = validate_registration(&reg) {
        return error_response(StatusCode::BAD_REQUEST, &msg);
    }

    match state.store.create_user(&device_id, &reg) {
        Ok(profile) => {
            tracing::info!(device_id = %device_id, "user registered");
            (
                StatusCode::CREATED,
                Json(serde_json::to_value(profile).unwrap_or_default()),
            )
        }
        Err(StoreError::Conflict) => {
            error_response(StatusCode::CONFLICT, "Device is already registered")
        }
        Err(e) => {
            tracing::error!(device_id = %device_id, error = %e, "registration failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Registration failed")
        }
    }
}

/// GET /profile
async fn handle_get_profile(State(state): State<AppState>, headers: HeaderMap) -> ApiResponse {
    let device_id = match device_id_from_headers(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.store.get_user(&device_id) {
        Ok(Some(profile)) => (
            StatusCode::OK,
            Json(serde_json::to_value(profile).unwrap_or_default()),
        ),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "User not registered"),
        Err(e) => {
            tracing::error!(device_id = %device_id, error = %e, "profile lookup failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Profile lookup failed")
        }
    }
}

/// PATCH /profile — partial update, at least one field required.
async fn handle_patch_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ProfileUpdate>, axum::extract::rejection::JsonRejection>,
) -> ApiResponse {
    let device_id = match device_id_from_headers(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let Json(update) = match body {
        Ok(b) => b,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, &format!("Invalid request: {e}"));
        }
    };
    if update.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "No fields to update");
    }

    // Reuse the registration rules for whichever fields are present
    let candidate = RegisterUser {
        name: update.name.clone().unwrap_or_else(|| "x".into()),
        favorite_color: update.favorite_color.clone().unwrap_or_else(|| "x".into()),
        stylist_name: update.stylist_name.clone(),
        language: update.language.clone(),
    };
    if let Err(msg) = validate_registration(&candidate) {
        return error_response(StatusCode::BAD_REQUEST, &msg);
    }

    match state.store.update_user(&device_id, &update) {
        Ok(profile) => (
            StatusCode::OK,
            Json(serde_json::to_value(profile).unwrap_or_default()),
        ),
        Err(StoreError::NotFound) => error_response(StatusCode::NOT_FOUND, "User not registered"),
        Err(e) => {
            tracing::error!(device_id = %device_id, error = %e, "profile update failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Profile update failed")
        }
    }
}

/// A device gets one session at a time; a new start ends the old one
/// with reason `replaced` before creating its successor.
async fn replace_existing_session(registry: &Arc<SessionRegistry>, device_id: &str) {
    if let Some(existing) = registry.get_session_by_device(device_id) {
        tracing::info!(
            session_id = %existing.id,
            device_id = %device_id,
            "replacing existing session"
        );
        registry.end_session(&existing.id, "replaced").await;
    }
}

#[derive(Debug, Default, serde::Deserialize)]
struct StartSessionBody {
    #[serde(default)]
    occasion: Option<Occasion>,
}

/// POST /start-session — quota-checked session creation.
async fn handle_start_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<StartSessionBody>, axum::extract::rejection::JsonRejection>,
) -> ApiResponse {
    let device_id = match device_id_from_headers(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    if !state.rate_limiter.allow_start_session(&device_id) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "error": "Too many session requests. Please retry later.",
                "retry_after": RATE_LIMIT_WINDOW_SECS,
            })),
        );
    }

    let occasion = body.map(|Json(b)| b).unwrap_or_default().occasion;

    // Registered users only
    match state.store.get_user(&device_id) {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "User not registered"),
        Err(e) => {
            tracing::error!(device_id = %device_id, error = %e, "user lookup failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "User lookup failed");
        }
    }

    replace_existing_session(&state.registry, &device_id).await;

    let tier = state.entitlement.check(&device_id).await;

    let quota = match state.store.increment_session_count(
        &device_id,
        tier,
        state.config.free_sessions_per_day,
        state.config.premium_sessions_per_day,
    ) {
        Ok(q) => q,
        Err(StoreError::NotFound) => {
            return error_response(StatusCode::NOT_FOUND, "User not registered");
        }
        Err(e) => {
            tracing::error!(device_id = %device_id, error = %e, "quota check failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Quota check failed");
        }
    };
    if !quota.allowed {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "error": "session_limit_exceeded",
                "sessions_used_today": quota.sessions_used_today,
                "remaining_sessions_today": 0,
            })),
        );
    }

    let session = state.registry.start_session(&device_id, tier, occasion);

    // Best effort: the in-memory registry stays authoritative
    if let Err(e) = state
        .store
        .create_session_record(&session.id, &device_id, tier)
    {
        tracing::warn!(session_id = %session.id, error = %e, "failed to persist session record");
    }

    (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "session_id": session.id,
            "session_expiry_time": session.expires_at_ms,
            "remaining_sessions_today": quota.remaining,
            "ws_url": format!("/ws?session_id={}&device_id={}", session.id, device_id),
        })),
    )
}

#[derive(Debug, serde::Deserialize)]
struct EndSessionBody {
    session_id: String,
}

/// POST /end-session
async fn handle_end_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<EndSessionBody>, axum::extract::rejection::JsonRejection>,
) -> ApiResponse {
    let device_id = match device_id_from_headers(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let Json(req) = match body {
        Ok(b) => b,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, &format!("Invalid request: {e}"));
        }
    };

    let Some(session) = state.registry.get_session(&req.session_id) else {
        return error_response(StatusCode::NOT_FOUND, "Session not found or already ended");
    };
    if session.device_id != device_id {
        return error_response(
            StatusCode::FORBIDDEN,
            "Session does not belong to this device",
        );
    }

    match state.registry.end_session(&req.session_id, "manual").await {
        Some(duration_seconds) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "session_id": req.session_id,
                "duration_seconds": duration_seconds,
                "reason": "manual",
            })),
        ),
        // Lost a race with a timer or another end call
        None => error_response(StatusCode::NOT_FOUND, "Session not found or already ended"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ServerEvent, Tier};
    use crate::store::{QuotaCheck, SessionMemory, SessionStatus, UserProfile};

    struct NullStore;

    impl StylistStore for NullStore {
        fn create_user(&self, _: &str, _: &RegisterUser) -> Result<UserProfile, StoreError> {
            Err(StoreError::Conflict)
        }
        fn get_user(&self, _: &str) -> Result<Option<UserProfile>, StoreError> {
            Ok(None)
        }
        fn update_user(&self, _: &str, _: &ProfileUpdate) -> Result<UserProfile, StoreError> {
            Err(StoreError::NotFound)
        }
        fn increment_session_count(
            &self,
            _: &str,
            _: Tier,
            _: u32,
            _: u32,
        ) -> Result<QuotaCheck, StoreError> {
            Ok(QuotaCheck {
                allowed: true,
                sessions_used_today: 1,
                remaining: 0,
            })
        }
        fn create_session_record(&self, _: &str, _: &str, _: Tier) -> Result<(), StoreError> {
            Ok(())
        }
        fn complete_session_record(
            &self,
            _: &str,
            _: u64,
            _: SessionStatus,
        ) -> Result<(), StoreError> {
            Ok(())
        }
        fn save_session_memory(&self, _: &str, _: &SessionMemory) -> Result<(), StoreError> {
            Ok(())
        }
        fn recent_memories(&self, _: &str, _: usize) -> Result<Vec<SessionMemory>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn new_start_replaces_existing_device_session() {
        let registry = SessionRegistry::new(Arc::new(NullStore), 300, 270);
        let first = registry.start_session("dev-1", Tier::Free, None);
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        assert!(registry.attach_transport(&first.id, tx));
        assert!(matches!(
            rx.recv().await,
            Some(ServerEvent::SessionStarted { .. })
        ));

        replace_existing_session(&registry, "dev-1").await;
        match rx.recv().await {
            Some(ServerEvent::SessionEnded { reason, .. }) => assert_eq!(reason, "replaced"),
            other => panic!("expected session_ended, got {other:?}"),
        }
        assert!(registry.get_session(&first.id).is_none());

        // The device never holds two sessions
        let second = registry.start_session("dev-1", Tier::Free, None);
        assert_ne!(first.id, second.id);
        assert_eq!(
            registry.get_session_by_device("dev-1").unwrap().id,
            second.id
        );
        assert_eq!(registry.active_count(), 1);
    }

    #[tokio::test]
    async fn replace_without_existing_session_is_noop() {
        let registry = SessionRegistry::new(Arc::new(NullStore), 300, 270);
        replace_existing_session(&registry, "dev-1").await;
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn rate_limiter_enforces_window() {
        let limiter = SlidingWindowRateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.allow("dev-1"));
        assert!(limiter.allow("dev-1"));
        assert!(!limiter.allow("dev-1"));
        // Other keys unaffected
        assert!(limiter.allow("dev-2"));
    }

    #[test]
    fn rate_limiter_zero_limit_disables() {
        let limiter = SlidingWindowRateLimiter::new(0, Duration::from_secs(60));
        for _ in 0..100 {
            assert!(limiter.allow("dev-1"));
        }
    }

    #[test]
    fn device_id_validation() {
        let mut headers = HeaderMap::new();
        assert!(device_id_from_headers(&headers).is_err());

        headers.insert("X-Device-Id", "abc-123_DEF".parse().unwrap());
        assert_eq!(device_id_from_headers(&headers).unwrap(), "abc-123_DEF");

        headers.insert("X-Device-Id", "has space".parse().unwrap());
        assert!(device_id_from_headers(&headers).is_err());
    }

    #[test]
    fn registration_validation_rules() {
        let mut reg = RegisterUser {
            name: "Mia O'Neil".into(),
            favorite_color: "dusty rose".into(),
            stylist_name: Some("Coco".into()),
            language: Some("de".into()),
        };
        assert!(validate_registration(&reg).is_ok());

        reg.name = String::new();
        assert!(validate_registration(&reg).is_err());
        reg.name = "Mia".into();

        reg.favorite_color = "red1".into();
        assert!(validate_registration(&reg).is_err());
        reg.favorite_color = "red".into();

        reg.language = Some("DEU".into());
        assert!(validate_registration(&reg).is_err());
        reg.language = None;
        assert!(validate_registration(&reg).is_ok());
    }
}
