//! API-key caches and quota-reset arithmetic.

use chrono::{TimeZone, Utc};

use crate::core::cache::ShardedCache;
use crate::core::error::{AppError, Result};
use crate::store::entities::ApiKey;
use crate::store::Store;

pub struct ApiKeysService {
    store: Store,
    by_id: ShardedCache<i64, ApiKey>,
    id_by_secret: ShardedCache<String, i64>,
}

impl ApiKeysService {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            by_id: ShardedCache::new(16),
            id_by_secret: ShardedCache::new(16),
        }
    }

    pub async fn refresh(&self) -> Result<()> {
        let keys = self.store.list_api_keys().await?;
        self.by_id.clear();
        self.id_by_secret.clear();
        for key in keys {
            self.id_by_secret.set(key.api_key.clone(), key.id);
            self.by_id.set(key.id, key);
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<ApiKey> {
        self.by_id.get_all().into_values().collect()
    }

    pub fn get(&self, id: i64) -> Option<ApiKey> {
        self.by_id.get(&id)
    }

    pub fn get_by_secret(&self, secret: &str) -> Option<ApiKey> {
        let id = self.id_by_secret.get(&secret.to_string())?;
        self.get(id)
    }

    /// Persist a key's mutable fields. The secret never changes on update.
    pub async fn update(&self, key: &ApiKey) -> Result<()> {
        let existing = self
            .by_id
            .get(&key.id)
            .ok_or_else(|| AppError::Internal("API key not found".to_string()))?;
        self.store.update_api_key(key).await?;
        let mut updated = key.clone();
        updated.api_key = existing.api_key;
        self.by_id.set(updated.id, updated);
        Ok(())
    }
}

/// Next quota-reset moment after `now` (unix seconds).
///
/// Unit `day` aligns to UTC midnight: the next midnight that is a whole
/// multiple of `duration/86400` days away (minimum one day), advanced until
/// strictly after `now`. Other units are relative.
pub fn compute_next_reset(now: i64, duration: i64, unit: &str) -> i64 {
    if unit == "day" {
        let days = (duration / 86_400).max(1);
        let now_utc = Utc.timestamp_opt(now, 0).unwrap();
        let midnight = now_utc.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc();
        let mut next = midnight + chrono::Duration::days(days);
        while next.timestamp() <= now {
            next += chrono::Duration::days(days);
        }
        return next.timestamp();
    }
    now + duration
}

/// Whether a timestamp sits exactly on a UTC midnight. Zero counts as
/// aligned (uninitialized).
pub fn is_aligned_to_midnight(timestamp: i64) -> bool {
    if timestamp == 0 {
        return true;
    }
    timestamp % 86_400 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_by_secret() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        sqlx::query("INSERT INTO api_keys (name, api_key) VALUES ('k', 'sk-octopus-abc')")
            .execute(store.pool())
            .await
            .unwrap();
        let service = ApiKeysService::new(store);
        service.refresh().await.unwrap();

        let key = service.get_by_secret("sk-octopus-abc").unwrap();
        assert_eq!(key.name, "k");
        assert!(service.get_by_secret("sk-octopus-missing").is_none());
    }

    #[tokio::test]
    async fn test_update_keeps_secret() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        sqlx::query("INSERT INTO api_keys (name, api_key) VALUES ('k', 'sk-octopus-abc')")
            .execute(store.pool())
            .await
            .unwrap();
        let service = ApiKeysService::new(store);
        service.refresh().await.unwrap();

        let mut key = service.get(1).unwrap();
        key.api_key = "sk-octopus-tampered".into();
        key.next_reset_time = 12345;
        service.update(&key).await.unwrap();

        let reloaded = service.get(1).unwrap();
        assert_eq!(reloaded.api_key, "sk-octopus-abc");
        assert_eq!(reloaded.next_reset_time, 12345);
    }

    // 2025-01-01T10:00:00Z
    const JAN1_10AM: i64 = 1_735_725_600;
    // 2025-01-02T00:00:00Z
    const JAN2_MIDNIGHT: i64 = 1_735_776_000;
    // 2025-01-03T00:00:00Z
    const JAN3_MIDNIGHT: i64 = 1_735_862_400;

    #[test]
    fn test_day_unit_aligns_to_utc_midnight() {
        assert_eq!(compute_next_reset(JAN1_10AM, 86_400, "day"), JAN2_MIDNIGHT);
    }

    #[test]
    fn test_day_unit_strictly_greater_than_now() {
        // At exactly midnight, the next reset is the following midnight.
        assert_eq!(
            compute_next_reset(JAN2_MIDNIGHT, 86_400, "day"),
            JAN3_MIDNIGHT
        );
    }

    #[test]
    fn test_day_unit_minimum_one_day() {
        // Sub-day durations still advance a full day.
        assert_eq!(compute_next_reset(JAN1_10AM, 3600, "day"), JAN2_MIDNIGHT);
    }

    #[test]
    fn test_multi_day_duration() {
        assert_eq!(
            compute_next_reset(JAN1_10AM, 2 * 86_400, "day"),
            JAN3_MIDNIGHT
        );
    }

    #[test]
    fn test_relative_units() {
        assert_eq!(compute_next_reset(1000, 60, "minute"), 1060);
        assert_eq!(compute_next_reset(1000, 3600, "hour"), 4600);
        // Unknown units fall back to relative.
        assert_eq!(compute_next_reset(1000, 10, "fortnight"), 1010);
    }

    #[test]
    fn test_alignment_check() {
        assert!(is_aligned_to_midnight(0));
        assert!(is_aligned_to_midnight(JAN2_MIDNIGHT));
        assert!(!is_aligned_to_midnight(JAN1_10AM));
    }
}
