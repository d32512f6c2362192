//! Settings cache with typed accessors.
//!
//! Recognized keys are bootstrapped with defaults on refresh; mutations are
//! synchronous write-through (store update, then cache set).

use crate::core::cache::ShardedCache;
use crate::core::error::{AppError, Result};
use crate::store::entities::Setting;
use crate::store::Store;

// Recognized setting keys.
pub const PROXY_URL: &str = "proxy_url";
pub const STATS_SAVE_INTERVAL: &str = "stats_save_interval";
pub const MODEL_INFO_UPDATE_INTERVAL: &str = "model_info_update_interval";
pub const SYNC_LLM_INTERVAL: &str = "sync_llm_interval";
pub const RELAY_LOG_KEEP_PERIOD: &str = "relay_log_keep_period";
pub const RELAY_LOG_KEEP_ENABLED: &str = "relay_log_keep_enabled";
pub const CORS_ALLOW_ORIGINS: &str = "cors_allow_origins";

/// Keys and defaults inserted when missing.
fn default_settings() -> Vec<Setting> {
    let defaults = [
        (PROXY_URL, ""),
        // Minutes between aggregate-metrics flushes
        (STATS_SAVE_INTERVAL, "10"),
        // Empty = deny cross-origin; "*" = allow all
        (CORS_ALLOW_ORIGINS, ""),
        // Hours between price-table refreshes
        (MODEL_INFO_UPDATE_INTERVAL, "24"),
        // Hours between provider model-list reconciliations
        (SYNC_LLM_INTERVAL, "24"),
        // Days of relay-log retention
        (RELAY_LOG_KEEP_PERIOD, "7"),
        (RELAY_LOG_KEEP_ENABLED, "true"),
    ];
    defaults
        .iter()
        .map(|(key, value)| Setting {
            key: key.to_string(),
            value: value.to_string(),
        })
        .collect()
}

/// Validate a value for a recognized key.
pub fn validate_setting(key: &str, value: &str) -> Result<()> {
    match key {
        MODEL_INFO_UPDATE_INTERVAL | SYNC_LLM_INTERVAL | RELAY_LOG_KEEP_PERIOD
        | STATS_SAVE_INTERVAL => {
            value.parse::<i64>().map_err(|_| {
                AppError::InvalidRequest(format!("{key} must be an integer"))
            })?;
            Ok(())
        }
        RELAY_LOG_KEEP_ENABLED => {
            if value != "true" && value != "false" {
                return Err(AppError::InvalidRequest(format!(
                    "{key} must be true or false"
                )));
            }
            Ok(())
        }
        PROXY_URL => {
            if value.is_empty() {
                return Ok(());
            }
            let (scheme, rest) = value.split_once("://").ok_or_else(|| {
                AppError::InvalidRequest("proxy URL is invalid".to_string())
            })?;
            if !matches!(scheme, "http" | "https" | "socks" | "socks5") {
                return Err(AppError::InvalidRequest(
                    "proxy URL scheme must be http, https, or socks".to_string(),
                ));
            }
            if rest.is_empty() {
                return Err(AppError::InvalidRequest(
                    "proxy URL must have a host".to_string(),
                ));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

pub struct SettingsService {
    store: Store,
    cache: ShardedCache<String, String>,
}

impl SettingsService {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            cache: ShardedCache::new(16),
        }
    }

    /// Load all settings, inserting defaults for missing recognized keys.
    pub async fn refresh(&self) -> Result<()> {
        let existing = self.store.list_settings().await?;
        let missing: Vec<Setting> = default_settings()
            .into_iter()
            .filter(|d| !existing.iter().any(|s| s.key == d.key))
            .collect();
        if !missing.is_empty() {
            self.store.insert_settings(&missing).await?;
        }
        for setting in existing.into_iter().chain(missing) {
            self.cache.set(setting.key, setting.value);
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<Setting> {
        self.cache
            .get_all()
            .into_iter()
            .map(|(key, value)| Setting { key, value })
            .collect()
    }

    pub fn get_string(&self, key: &str) -> Result<String> {
        self.cache
            .get(&key.to_string())
            .ok_or_else(|| AppError::Internal(format!("setting not found: {key}")))
    }

    pub fn get_int(&self, key: &str) -> Result<i64> {
        let raw = self.get_string(key)?;
        raw.parse::<i64>()
            .map_err(|_| AppError::Internal(format!("setting {key} is not an integer")))
    }

    pub fn get_bool(&self, key: &str) -> Result<bool> {
        let raw = self.get_string(key)?;
        raw.parse::<bool>()
            .map_err(|_| AppError::Internal(format!("setting {key} is not a boolean")))
    }

    /// Write-through set. Unknown keys are rejected by the store (no row).
    pub async fn set_string(&self, key: &str, value: &str) -> Result<()> {
        let current = self.get_string(key)?;
        if current == value {
            return Ok(());
        }
        validate_setting(key, value)?;
        if !self.store.update_setting(key, value).await? {
            return Err(AppError::Internal(format!("setting not found: {key}")));
        }
        self.cache.set(key.to_string(), value.to_string());
        Ok(())
    }
}
