//! SQLite-backed persistence for user profiles, session records, and
//! session memories.
//!
//! Tables:
//! - `users`: device_id, name, favorite_color, stylist_name, language,
//!   created_at, sessions_used_today, last_session_date
//! - `sessions`: session_id, device_id, start_time, end_time,
//!   duration_seconds, subscription_tier, status
//! - `memories`: session_id, device_id, summary, tips (JSON),
//!   duration_seconds, occasion, created_at
//!
//! The in-memory session registry stays the source of truth for "is this
//! session active" — writes here are best effort and never block teardown.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::protocol::{Occasion, Tier};

/// A registered device owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: String,
    pub favorite_color: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stylist_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Unix timestamp (seconds).
    pub created_at: i64,
    pub sessions_used_today: u32,
    /// `YYYY-MM-DD`, used for the lazy daily quota reset.
    pub last_session_date: String,
}

/// Registration payload, validated at the HTTP boundary.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterUser {
    pub name: String,
    pub favorite_color: String,
    #[serde(default)]
    pub stylist_name: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

/// Partial profile update; at least one field must be present.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub favorite_color: Option<String>,
    #[serde(default)]
    pub stylist_name: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.favorite_color.is_none()
            && self.stylist_name.is_none()
            && self.language.is_none()
    }
}

/// Outcome of a quota check-and-increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaCheck {
    pub allowed: bool,
    pub sessions_used_today: u32,
    pub remaining: u32,
}

/// Terminal status of a persisted session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Completed,
    Expired,
}

impl SessionStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Expired => "expired",
        }
    }
}

/// One saved session summary, read back for continuity context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMemory {
    pub session_id: String,
    pub summary: String,
    #[serde(default)]
    pub tips: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occasion: Option<Occasion>,
    /// Unix timestamp (seconds).
    pub created_at: i64,
}

/// Store failures surfaced to HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    Conflict,
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Persistence operations the rest of the server depends on.
///
/// Methods are synchronous; async callers that must not block teardown wrap
/// them in a spawned task.
pub trait StylistStore: Send + Sync {
    fn create_user(&self, device_id: &str, reg: &RegisterUser) -> Result<UserProfile, StoreError>;
    fn get_user(&self, device_id: &str) -> Result<Option<UserProfile>, StoreError>;
    fn update_user(&self, device_id: &str, upd: &ProfileUpdate)
        -> Result<UserProfile, StoreError>;

    /// Check the daily quota and increment the counter in one transaction.
    ///
    /// A stored `last_session_date` before today resets the counter first
    /// (lazy reset).
    fn increment_session_count(
        &self,
        device_id: &str,
        tier: Tier,
        free_limit: u32,
        premium_limit: u32,
    ) -> Result<QuotaCheck, StoreError>;

    fn create_session_record(
        &self,
        session_id: &str,
        device_id: &str,
        tier: Tier,
    ) -> Result<(), StoreError>;

    fn complete_session_record(
        &self,
        session_id: &str,
        duration_seconds: u64,
        status: SessionStatus,
    ) -> Result<(), StoreError>;

    fn save_session_memory(&self, device_id: &str, memory: &SessionMemory)
        -> Result<(), StoreError>;

    /// Most recent memories first.
    fn recent_memories(&self, device_id: &str, limit: usize)
        -> Result<Vec<SessionMemory>, StoreError>;
}

fn today_date_string() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// SQLite implementation of [`StylistStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open a throwaway in-memory database (tests).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                device_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                favorite_color TEXT NOT NULL,
                stylist_name TEXT,
                language TEXT,
                created_at INTEGER NOT NULL,
                sessions_used_today INTEGER NOT NULL DEFAULT 0,
                last_session_date TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                device_id TEXT NOT NULL,
                start_time INTEGER NOT NULL,
                end_time INTEGER,
                duration_seconds INTEGER,
                subscription_tier TEXT NOT NULL,
                status TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS memories (
                session_id TEXT PRIMARY KEY,
                device_id TEXT NOT NULL,
                summary TEXT NOT NULL,
                tips TEXT NOT NULL DEFAULT '[]',
                duration_seconds INTEGER,
                occasion TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_memories_device
                ON memories(device_id, created_at DESC);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserProfile> {
        Ok(UserProfile {
            name: row.get("name")?,
            favorite_color: row.get("favorite_color")?,
            stylist_name: row.get("stylist_name")?,
            language: row.get("language")?,
            created_at: row.get("created_at")?,
            sessions_used_today: row.get("sessions_used_today")?,
            last_session_date: row.get("last_session_date")?,
        })
    }

    /// Quota check with an explicit "today" — lets tests drive the lazy
    /// daily reset without clock games.
    fn increment_session_count_on(
        &self,
        device_id: &str,
        tier: Tier,
        free_limit: u32,
        premium_limit: u32,
        today: &str,
    ) -> Result<QuotaCheck, StoreError> {
        let limit = match tier {
            Tier::Premium => premium_limit,
            Tier::Free => free_limit,
        };

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let row: Option<(u32, String)> = tx
            .query_row(
                "SELECT sessions_used_today, last_session_date FROM users WHERE device_id = ?1",
                params![device_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (used, last_date) = row.ok_or(StoreError::NotFound)?;

        // Lazy daily reset
        let used = if last_date != today { 0 } else { used };

        if used >= limit {
            return Ok(QuotaCheck {
                allowed: false,
                sessions_used_today: used,
                remaining: 0,
            });
        }

        let new_count = used + 1;
        tx.execute(
            "UPDATE users SET sessions_used_today = ?1, last_session_date = ?2
             WHERE device_id = ?3",
            params![new_count, today, device_id],
        )?;
        tx.commit()?;

        Ok(QuotaCheck {
            allowed: true,
            sessions_used_today: new_count,
            remaining: limit - new_count,
        })
    }
}

impl StylistStore for SqliteStore {
    fn create_user(&self, device_id: &str, reg: &RegisterUser) -> Result<UserProfile, StoreError> {
        let conn = self.conn.lock();

        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM users WHERE device_id = ?1",
                params![device_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::Conflict);
        }

        let user = UserProfile {
            name: reg.name.clone(),
            favorite_color: reg.favorite_color.clone(),
            stylist_name: reg.stylist_name.clone(),
            language: reg.language.clone(),
            created_at: now_secs(),
            sessions_used_today: 0,
            last_session_date: today_date_string(),
        };

        conn.execute(
            "INSERT INTO users (device_id, name, favorite_color, stylist_name, language,
                                created_at, sessions_used_today, last_session_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
            params![
                device_id,
                user.name,
                user.favorite_color,
                user.stylist_name,
                user.language,
                user.created_at,
                user.last_session_date,
            ],
        )?;

        Ok(user)
    }

    fn get_user(&self, device_id: &str) -> Result<Option<UserProfile>, StoreError> {
        let conn = self.conn.lock();
        let user = conn
            .query_row(
                "SELECT * FROM users WHERE device_id = ?1",
                params![device_id],
                Self::row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    fn update_user(
        &self,
        device_id: &str,
        upd: &ProfileUpdate,
    ) -> Result<UserProfile, StoreError> {
        {
            let conn = self.conn.lock();
            let changed = conn.execute(
                "UPDATE users SET
                    name = COALESCE(?1, name),
                    favorite_color = COALESCE(?2, favorite_color),
                    stylist_name = COALESCE(?3, stylist_name),
                    language = COALESCE(?4, language)
                 WHERE device_id = ?5",
                params![upd.name, upd.favorite_color, upd.stylist_name, upd.language, device_id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound);
            }
        }
        self.get_user(device_id)?.ok_or(StoreError::NotFound)
    }

    fn increment_session_count(
        &self,
        device_id: &str,
        tier: Tier,
        free_limit: u32,
        premium_limit: u32,
    ) -> Result<QuotaCheck, StoreError> {
        self.increment_session_count_on(
            device_id,
            tier,
            free_limit,
            premium_limit,
            &today_date_string(),
        )
    }

    fn create_session_record(
        &self,
        session_id: &str,
        device_id: &str,
        tier: Tier,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (session_id, device_id, start_time, subscription_tier, status)
             VALUES (?1, ?2, ?3, ?4, 'active')",
            params![session_id, device_id, now_secs(), tier.as_str()],
        )?;
        Ok(())
    }

    fn complete_session_record(
        &self,
        session_id: &str,
        duration_seconds: u64,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE sessions SET end_time = ?1, duration_seconds = ?2, status = ?3
             WHERE session_id = ?4",
            params![now_secs(), duration_seconds, status.as_str(), session_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn save_session_memory(
        &self,
        device_id: &str,
        memory: &SessionMemory,
    ) -> Result<(), StoreError> {
        let tips_json = serde_json::to_string(&memory.tips).unwrap_or_else(|_| "[]".into());
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO memories
                (session_id, device_id, summary, tips, duration_seconds, occasion, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                memory.session_id,
                device_id,
                memory.summary,
                tips_json,
                memory.duration_seconds,
                memory.occasion.map(Occasion::as_str),
                memory.created_at,
            ],
        )?;
        Ok(())
    }

    fn recent_memories(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<SessionMemory>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, summary, tips, duration_seconds, occasion, created_at
             FROM memories WHERE device_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![device_id, limit as i64], |row| {
            let tips_json: String = row.get(2)?;
            let occasion: Option<String> = row.get(4)?;
            Ok(SessionMemory {
                session_id: row.get(0)?,
                summary: row.get(1)?,
                tips: serde_json::from_str(&tips_json).unwrap_or_default(),
                duration_seconds: row.get(3)?,
                occasion: occasion
                    .as_deref()
                    .and_then(|o| serde_json::from_value(serde_json::Value::String(o.into())).ok()),
                created_at: row.get(5)?,
            })
        })?;

        let mut memories = Vec::new();
        for row in rows {
            memories.push(row?);
        }
        Ok(memories)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    fn register(store: &SqliteStore, device: &str) -> UserProfile {
        store
            .create_user(
                device,
                &RegisterUser {
                    name: "Mia".into(),
                    favorite_color: "teal".into(),
                    stylist_name: None,
                    language: None,
                },
            )
            .unwrap()
    }

    #[test]
    fn register_and_fetch_user() {
        let store = store();
        register(&store, "dev-1");

        let user = store.get_user("dev-1").unwrap().unwrap();
        assert_eq!(user.name, "Mia");
        assert_eq!(user.sessions_used_today, 0);

        assert!(store.get_user("dev-2").unwrap().is_none());
    }

    #[test]
    fn duplicate_registration_conflicts() {
        let store = store();
        register(&store, "dev-1");
        let err = store
            .create_user(
                "dev-1",
                &RegisterUser {
                    name: "Other".into(),
                    favorite_color: "red".into(),
                    stylist_name: None,
                    language: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict));
    }

    #[test]
    fn partial_profile_update() {
        let store = store();
        register(&store, "dev-1");

        let updated = store
            .update_user(
                "dev-1",
                &ProfileUpdate {
                    favorite_color: Some("mauve".into()),
                    stylist_name: Some("Coco".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.name, "Mia");
        assert_eq!(updated.favorite_color, "mauve");
        assert_eq!(updated.stylist_name.as_deref(), Some("Coco"));

        let err = store.update_user("ghost", &ProfileUpdate::default()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[test]
    fn quota_enforced_within_day() {
        let store = store();
        register(&store, "dev-1");

        let first = store
            .increment_session_count_on("dev-1", Tier::Free, 1, 5, "2026-08-30")
            .unwrap();
        assert!(first.allowed);
        assert_eq!(first.sessions_used_today, 1);
        assert_eq!(first.remaining, 0);

        let second = store
            .increment_session_count_on("dev-1", Tier::Free, 1, 5, "2026-08-30")
            .unwrap();
        assert!(!second.allowed);
        assert_eq!(second.sessions_used_today, 1);
    }

    #[test]
    fn quota_resets_lazily_on_new_day() {
        let store = store();
        register(&store, "dev-1");

        // Exhaust yesterday's quota
        let used = store
            .increment_session_count_on("dev-1", Tier::Free, 1, 5, "2026-08-29")
            .unwrap();
        assert!(used.allowed);
        assert!(!store
            .increment_session_count_on("dev-1", Tier::Free, 1, 5, "2026-08-29")
            .unwrap()
            .allowed);

        // New day: allowed again, count resets to 1 (not limit+1)
        let today = store
            .increment_session_count_on("dev-1", Tier::Free, 1, 5, "2026-08-30")
            .unwrap();
        assert!(today.allowed);
        assert_eq!(today.sessions_used_today, 1);
    }

    #[test]
    fn premium_uses_premium_limit() {
        let store = store();
        register(&store, "dev-1");

        for n in 1..=5 {
            let check = store
                .increment_session_count_on("dev-1", Tier::Premium, 1, 5, "2026-08-30")
                .unwrap();
            assert!(check.allowed, "session {n} should be allowed");
        }
        assert!(!store
            .increment_session_count_on("dev-1", Tier::Premium, 1, 5, "2026-08-30")
            .unwrap()
            .allowed);
    }

    #[test]
    fn quota_for_unknown_user_is_not_found() {
        let store = store();
        let err = store
            .increment_session_count("ghost", Tier::Free, 1, 5)
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[test]
    fn session_record_lifecycle() {
        let store = store();
        store
            .create_session_record("sess-1", "dev-1", Tier::Premium)
            .unwrap();
        store
            .complete_session_record("sess-1", 120, SessionStatus::Expired)
            .unwrap();

        let err = store
            .complete_session_record("ghost", 1, SessionStatus::Completed)
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[test]
    fn memories_ordered_most_recent_first() {
        let store = store();
        for (i, id) in ["s1", "s2", "s3", "s4"].iter().enumerate() {
            store
                .save_session_memory(
                    "dev-1",
                    &SessionMemory {
                        session_id: (*id).into(),
                        summary: format!("summary {id}"),
                        tips: vec!["tip".into()],
                        duration_seconds: Some(60),
                        occasion: Some(Occasion::Work),
                        created_at: 1000 + i as i64,
                    },
                )
                .unwrap();
        }

        let recent = store.recent_memories("dev-1", 3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].session_id, "s4");
        assert_eq!(recent[2].session_id, "s2");
        assert_eq!(recent[0].tips, vec!["tip".to_string()]);
        assert_eq!(recent[0].occasion, Some(Occasion::Work));

        assert!(store.recent_memories("dev-2", 3).unwrap().is_empty());
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stylist.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            register(&store, "dev-1");
        }

        let store = SqliteStore::open(&path).unwrap();
        let profile = store.get_user("dev-1").unwrap().unwrap();
        assert_eq!(profile.name, "Mia");
    }
}
