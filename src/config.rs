//! Environment-driven configuration.
//!
//! Every knob the server reads at startup lives here. Required keys fail
//! fast with a clear message; everything else has a production default.

use anyhow::{bail, Context, Result};

/// Server configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the gateway binds to.
    pub port: u16,
    /// Gemini API key (Live WebSocket + REST calls).
    pub gemini_api_key: String,
    /// Gemini Live model for the conversational session.
    pub gemini_model: String,
    /// RevenueCat secret key. `None` disables entitlement checks (everyone free).
    pub revenuecat_api_key: Option<String>,
    /// Daily session quota for free-tier devices.
    pub free_sessions_per_day: u32,
    /// Daily session quota for premium-tier devices.
    pub premium_sessions_per_day: u32,
    /// Fixed length of a live session.
    pub session_duration_secs: u64,
    /// When the "ending soon" warning fires, measured from session start.
    pub session_warning_secs: u64,
    /// Path of the SQLite database file.
    pub database_path: String,
    /// Upper bound on a single vision-analysis or preview-generation call.
    pub side_effect_timeout_secs: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let config = Self {
            port: env_parse("PORT", 8080)?,
            gemini_api_key: std::env::var("GEMINI_API_KEY")
                .context("GEMINI_API_KEY is required")?,
            gemini_model: env_or(
                "GEMINI_MODEL",
                "gemini-2.5-flash-native-audio-latest",
            ),
            revenuecat_api_key: std::env::var("REVENUECAT_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
            free_sessions_per_day: env_parse("FREE_SESSIONS_PER_DAY", 1)?,
            premium_sessions_per_day: env_parse("PREMIUM_SESSIONS_PER_DAY", 5)?,
            session_duration_secs: env_parse("SESSION_DURATION_SECONDS", 300)?,
            session_warning_secs: env_parse("SESSION_WARNING_SECONDS", 270)?,
            database_path: env_or("DATABASE_PATH", "stylist.db"),
            side_effect_timeout_secs: env_parse("SIDE_EFFECT_TIMEOUT_SECONDS", 30)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.session_warning_secs >= self.session_duration_secs {
            bail!(
                "SESSION_WARNING_SECONDS ({}) must be less than SESSION_DURATION_SECONDS ({})",
                self.session_warning_secs,
                self.session_duration_secs
            );
        }
        if self.gemini_api_key.trim().is_empty() {
            bail!("GEMINI_API_KEY must not be empty");
        }
        Ok(())
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {key}={raw}: {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            port: 8080,
            gemini_api_key: "test-key".into(),
            gemini_model: "gemini-2.5-flash-native-audio-latest".into(),
            revenuecat_api_key: None,
            free_sessions_per_day: 1,
            premium_sessions_per_day: 5,
            session_duration_secs: 300,
            session_warning_secs: 270,
            database_path: "stylist.db".into(),
            side_effect_timeout_secs: 30,
        }
    }

    #[test]
    fn warning_must_precede_expiry() {
        let mut config = base_config();
        config.session_warning_secs = 300;
        assert!(config.validate().is_err());

        config.session_warning_secs = 270;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_api_key_rejected() {
        let mut config = base_config();
        config.gemini_api_key = "  ".into();
        assert!(config.validate().is_err());
    }
}
