//! Session registry and lifecycle timers.
//!
//! The registry is the single source of truth for which sessions are live.
//! Each session carries two spawned timers: a warning at
//! `SESSION_WARNING_SECONDS` and a hard expiry at
//! `SESSION_DURATION_SECONDS`. Timer callbacks re-check the registry
//! before acting, so a manual end racing a fired timer is a no-op.
//!
//! Persistence of the terminal session record is best effort: failures are
//! logged and never keep a session pinned in memory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{Occasion, ServerEvent, Tier};
use crate::store::{SessionStatus, StylistStore};

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Created via HTTP, no relay transport yet.
    Pending,
    /// Relay transport attached, conversation running.
    Active,
    /// Warning timer fired, wrap-up announced.
    Warned,
}

/// A live session. Cheap to clone; the registry holds the original.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub device_id: String,
    pub tier: Tier,
    pub occasion: Option<Occasion>,
    /// Unix millis, for clients.
    pub started_at_ms: i64,
    pub expires_at_ms: i64,
    /// Monotonic start, for duration math.
    pub started_at: Instant,
    pub phase: SessionPhase,
}

struct SessionEntry {
    session: Session,
    /// Events flow to the relay's client-facing sender once attached.
    transport: Option<mpsc::Sender<ServerEvent>>,
    warning_timer: JoinHandle<()>,
    expiry_timer: JoinHandle<()>,
}

struct RegistryInner {
    sessions: HashMap<String, SessionEntry>,
    by_device: HashMap<String, String>,
}

/// In-memory registry of active sessions, at most one per device.
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
    store: Arc<dyn StylistStore>,
    duration: Duration,
    warning: Duration,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn StylistStore>, duration_secs: u64, warning_secs: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RegistryInner {
                sessions: HashMap::new(),
                by_device: HashMap::new(),
            }),
            store,
            duration: Duration::from_secs(duration_secs),
            warning: Duration::from_secs(warning_secs),
        })
    }

    /// Start a session for a device. Idempotent: if the device already has
    /// one, that session is returned untouched (timers keep their original
    /// deadlines).
    pub fn start_session(
        self: &Arc<Self>,
        device_id: &str,
        tier: Tier,
        occasion: Option<Occasion>,
    ) -> Session {
        let mut inner = self.inner.lock();

        if let Some(existing_id) = inner.by_device.get(device_id) {
            if let Some(entry) = inner.sessions.get(existing_id) {
                debug!(
                    session_id = %entry.session.id,
                    device_id = %device_id,
                    "start_session: returning existing session"
                );
                return entry.session.clone();
            }
        }

        let id = Uuid::new_v4().to_string();
        let now_ms = chrono::Utc::now().timestamp_millis();
        let session = Session {
            id: id.clone(),
            device_id: device_id.to_string(),
            tier,
            occasion,
            started_at_ms: now_ms,
            expires_at_ms: now_ms + self.duration.as_millis() as i64,
            started_at: Instant::now(),
            phase: SessionPhase::Pending,
        };

        let warning_timer = {
            let registry = Arc::clone(self);
            let session_id = id.clone();
            let delay = self.warning;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                registry.fire_warning(&session_id);
            })
        };
        let expiry_timer = {
            let registry = Arc::clone(self);
            let session_id = id.clone();
            let delay = self.duration;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                registry.fire_expiry(&session_id).await;
            })
        };

        info!(
            session_id = %id,
            device_id = %device_id,
            tier = tier.as_str(),
            "session started"
        );

        inner.by_device.insert(device_id.to_string(), id.clone());
        inner.sessions.insert(
            id,
            SessionEntry {
                session: session.clone(),
                transport: None,
                warning_timer,
                expiry_timer,
            },
        );
        session
    }

    /// Attach (or replace) the client-facing event channel and emit
    /// `session_started`. Returns false when the session is unknown.
    pub fn attach_transport(&self, session_id: &str, tx: mpsc::Sender<ServerEvent>) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.sessions.get_mut(session_id) else {
            return false;
        };

        if entry.session.phase == SessionPhase::Pending {
            entry.session.phase = SessionPhase::Active;
        }
        let started = ServerEvent::SessionStarted {
            session_id: entry.session.id.clone(),
            expires_at: entry.session.expires_at_ms,
        };
        let _ = tx.try_send(started);
        entry.transport = Some(tx);
        true
    }

    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.inner
            .lock()
            .sessions
            .get(session_id)
            .map(|e| e.session.clone())
    }

    pub fn get_session_by_device(&self, device_id: &str) -> Option<Session> {
        let inner = self.inner.lock();
        let id = inner.by_device.get(device_id)?;
        inner.sessions.get(id).map(|e| e.session.clone())
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// End a session: cancel timers, emit `session_ended`, persist the
    /// terminal record, remove from both maps. Returns the session
    /// duration, or `None` when the session was already gone.
    pub async fn end_session(&self, session_id: &str, reason: &str) -> Option<u64> {
        let (entry, duration_seconds) = {
            let mut inner = self.inner.lock();
            let entry = inner.sessions.remove(session_id)?;
            inner.by_device.remove(&entry.session.device_id);
            let duration = entry.session.started_at.elapsed().as_secs();
            (entry, duration)
        };

        entry.warning_timer.abort();
        entry.expiry_timer.abort();

        info!(
            session_id = %session_id,
            reason = %reason,
            duration_seconds,
            "session ended"
        );

        if let Some(tx) = &entry.transport {
            let _ = tx
                .send(ServerEvent::SessionEnded {
                    duration_seconds,
                    reason: reason.to_string(),
                })
                .await;
        }

        let status = if reason == "expired" {
            SessionStatus::Expired
        } else {
            SessionStatus::Completed
        };
        let store = Arc::clone(&self.store);
        let id = session_id.to_string();
        let persisted = tokio::task::spawn_blocking(move || {
            store.complete_session_record(&id, duration_seconds, status)
        })
        .await;
        match persisted {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(session_id = %session_id, error = %err, "failed to persist session record");
            }
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "session record task failed");
            }
        }

        Some(duration_seconds)
    }

    /// End every active session with reason `server_shutdown`.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.inner.lock().sessions.keys().cloned().collect();
        for id in ids {
            self.end_session(&id, "server_shutdown").await;
        }
    }

    fn fire_warning(&self, session_id: &str) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.sessions.get_mut(session_id) else {
            // Ended before the timer fired
            return;
        };

        entry.session.phase = SessionPhase::Warned;
        let seconds_remaining = (self.duration - self.warning).as_secs();
        info!(session_id = %session_id, seconds_remaining, "session ending soon");
        if let Some(tx) = &entry.transport {
            let _ = tx.try_send(ServerEvent::SessionEndingSoon { seconds_remaining });
        }
    }

    async fn fire_expiry(&self, session_id: &str) {
        let transport = {
            let inner = self.inner.lock();
            let Some(entry) = inner.sessions.get(session_id) else {
                return;
            };
            entry.transport.clone()
        };

        if let Some(tx) = transport {
            let _ = tx.send(ServerEvent::SessionExpired).await;
        }
        self.end_session(session_id, "expired").await;
    }
}
