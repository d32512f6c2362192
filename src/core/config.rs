//! Startup configuration.
//!
//! Process-level settings come from environment variables with the `OCTOPUS_`
//! prefix; everything tunable at runtime lives in the settings table instead
//! (see [`crate::services::settings`]).

/// Application name; used for the API-key prefix (`sk-octopus-...`) and as
/// the environment variable namespace.
pub const APP_NAME: &str = "octopus";

/// Default cap on a single upstream SSE event (32 MiB). Image-generation
/// models can return multi-megabyte base64 payloads in one event.
pub const DEFAULT_MAX_SSE_EVENT_SIZE: usize = 32 * 1024 * 1024;

/// Process startup configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address, e.g. "0.0.0.0:8080"
    pub listen: String,
    /// SQLite database path or URL
    pub database_url: String,
    /// Debug mode: verbose logging
    pub debug: bool,
    /// Maximum size of a single upstream SSE event in bytes
    pub max_sse_event_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            database_url: "sqlite://octopus.db?mode=rwc".to_string(),
            debug: false,
            max_sse_event_size: DEFAULT_MAX_SSE_EVENT_SIZE,
        }
    }
}

impl Config {
    /// Read configuration from `OCTOPUS_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(listen) = std::env::var(env_key("LISTEN")) {
            if !listen.trim().is_empty() {
                config.listen = listen;
            }
        }
        if let Ok(db) = std::env::var(env_key("DB_URL")) {
            if !db.trim().is_empty() {
                config.database_url = db;
            }
        }
        config.debug = std::env::var(env_key("DEBUG"))
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        if let Ok(raw) = std::env::var(env_key("RELAY_MAX_SSE_EVENT_SIZE")) {
            if let Ok(v) = raw.trim().parse::<usize>() {
                if v > 0 {
                    config.max_sse_event_size = v;
                }
            }
        }

        config
    }
}

fn env_key(suffix: &str) -> String {
    format!("{}_{}", APP_NAME.to_uppercase(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen, "0.0.0.0:8080");
        assert!(!config.debug);
        assert_eq!(config.max_sse_event_size, 32 * 1024 * 1024);
    }

    #[test]
    fn test_env_key() {
        assert_eq!(env_key("DEBUG"), "OCTOPUS_DEBUG");
        assert_eq!(
            env_key("RELAY_MAX_SSE_EVENT_SIZE"),
            "OCTOPUS_RELAY_MAX_SSE_EVENT_SIZE"
        );
    }
}
