//! Metrics aggregation buckets.
//!
//! All buckets live in memory and are flushed to the store on a timer or on
//! shutdown. Total/daily/hourly are single slots under read-write locks;
//! per-channel and per-API-key rows live in sharded caches with dirty sets
//! recording which ids need persisting. Metric fields are additive, so
//! concurrent request completions combine under each bucket's lock.

use std::collections::HashSet;
use std::sync::{Mutex, RwLock};

use chrono::Utc;
use tracing::debug;

use crate::core::cache::ShardedCache;
use crate::core::error::Result;
use crate::store::entities::{
    StatsApiKey, StatsChannel, StatsDaily, StatsHourly, StatsMetrics, StatsModel, StatsTotal,
};
use crate::store::Store;

/// "YYYYMMDD" in UTC.
pub fn today_date() -> String {
    Utc::now().format("%Y%m%d").to_string()
}

fn current_hour() -> i64 {
    use chrono::Timelike;
    Utc::now().hour() as i64
}

pub struct StatsService {
    store: Store,

    total: RwLock<StatsTotal>,
    daily: RwLock<StatsDaily>,
    hourly: RwLock<[StatsHourly; 24]>,

    channel: ShardedCache<i64, StatsChannel>,
    channel_dirty: Mutex<HashSet<i64>>,

    model: ShardedCache<(String, i64), StatsModel>,
    model_dirty: Mutex<HashSet<(String, i64)>>,

    api_key: ShardedCache<i64, StatsApiKey>,
    api_key_dirty: Mutex<HashSet<i64>>,
}

impl StatsService {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            total: RwLock::new(StatsTotal {
                id: 1,
                ..Default::default()
            }),
            daily: RwLock::new(StatsDaily::default()),
            hourly: RwLock::new(std::array::from_fn(|_| StatsHourly::default())),
            channel: ShardedCache::new(16),
            channel_dirty: Mutex::new(HashSet::new()),
            model: ShardedCache::new(16),
            model_dirty: Mutex::new(HashSet::new()),
            api_key: ShardedCache::new(16),
            api_key_dirty: Mutex::new(HashSet::new()),
        }
    }

    /// Populate every bucket from the store.
    pub async fn refresh(&self) -> Result<()> {
        let today = today_date();

        let mut loaded_daily = self.store.get_latest_stats_daily().await?.unwrap_or_default();
        if loaded_daily.date != today {
            loaded_daily = StatsDaily {
                date: today.clone(),
                ..Default::default()
            };
        }

        let mut loaded_total = self.store.get_stats_total().await?.unwrap_or_default();
        if loaded_total.id == 0 {
            loaded_total.id = 1;
        }

        *self.daily.write().unwrap() = loaded_daily;
        *self.total.write().unwrap() = loaded_total;

        self.channel.clear();
        self.channel_dirty.lock().unwrap().clear();
        for row in self.store.list_stats_channel().await? {
            self.channel.set(row.channel_id, row);
        }

        self.model.clear();
        self.model_dirty.lock().unwrap().clear();
        for row in self.store.list_stats_model().await? {
            self.model.set((row.name.clone(), row.channel_id), row);
        }

        self.api_key.clear();
        self.api_key_dirty.lock().unwrap().clear();
        for row in self.store.list_stats_api_key().await? {
            self.api_key.set(row.api_key_id, row);
        }

        let mut hourly = std::array::from_fn(|_| StatsHourly::default());
        for row in self.store.list_stats_hourly().await? {
            if (0..24).contains(&row.hour) {
                let hour = row.hour;
                hourly[hour as usize] = row;
            }
        }
        *self.hourly.write().unwrap() = hourly;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Updates
    // ------------------------------------------------------------------

    pub fn update_total(&self, delta: &StatsMetrics) {
        let mut total = self.total.write().unwrap();
        if total.id == 0 {
            total.id = 1;
        }
        total.metrics.add(delta);
    }

    /// Add into today's daily row. A date change swaps in a fresh row and
    /// returns the displaced one so the caller persists it before its
    /// numbers are lost to the zeroed slot.
    pub fn update_daily(&self, delta: &StatsMetrics) -> Option<StatsDaily> {
        self.update_daily_on(&today_date(), delta)
    }

    fn update_daily_on(&self, date: &str, delta: &StatsMetrics) -> Option<StatsDaily> {
        let mut daily = self.daily.write().unwrap();
        if daily.date == date {
            daily.metrics.add(delta);
            return None;
        }
        let displaced = std::mem::replace(
            &mut *daily,
            StatsDaily {
                date: date.to_string(),
                ..Default::default()
            },
        );
        daily.metrics.add(delta);
        (!displaced.date.is_empty()).then_some(displaced)
    }

    pub fn update_hourly(&self, delta: &StatsMetrics) {
        self.update_hourly_at(current_hour(), &today_date(), delta);
    }

    fn update_hourly_at(&self, hour: i64, date: &str, delta: &StatsMetrics) {
        let mut hourly = self.hourly.write().unwrap();
        let slot = &mut hourly[hour as usize];
        // A stale slot from yesterday is overwritten in place.
        if slot.date != date {
            *slot = StatsHourly {
                hour,
                date: date.to_string(),
                ..Default::default()
            };
        }
        slot.metrics.add(delta);
    }

    pub fn update_channel(&self, channel_id: i64, delta: &StatsMetrics) {
        let mut row = self.channel.get(&channel_id).unwrap_or(StatsChannel {
            channel_id,
            ..Default::default()
        });
        row.metrics.add(delta);
        self.channel.set(channel_id, row);
        self.channel_dirty.lock().unwrap().insert(channel_id);
    }

    pub fn update_model(&self, name: &str, channel_id: i64, delta: &StatsMetrics) {
        let key = (name.to_string(), channel_id);
        let mut row = self.model.get(&key).unwrap_or(StatsModel {
            id: 0,
            name: name.to_string(),
            channel_id,
            ..Default::default()
        });
        row.metrics.add(delta);
        self.model.set(key.clone(), row);
        self.model_dirty.lock().unwrap().insert(key);
    }

    pub fn update_api_key(&self, api_key_id: i64, delta: &StatsMetrics) {
        let mut row = self.api_key.get(&api_key_id).unwrap_or(StatsApiKey {
            api_key_id,
            ..Default::default()
        });
        row.metrics.add(delta);
        self.api_key.set(api_key_id, row);
        self.api_key_dirty.lock().unwrap().insert(api_key_id);
    }

    /// Apply one delta to all five buckets. Returns a displaced daily row
    /// if the date rolled over.
    pub fn update_all(
        &self,
        channel_id: i64,
        api_key_id: i64,
        delta: &StatsMetrics,
    ) -> Option<StatsDaily> {
        self.update_channel(channel_id, delta);
        self.update_total(delta);
        self.update_hourly(delta);
        self.update_api_key(api_key_id, delta);
        self.update_daily(delta)
    }

    pub fn reset_api_key(&self, api_key_id: i64) {
        self.api_key.set(
            api_key_id,
            StatsApiKey {
                api_key_id,
                ..Default::default()
            },
        );
        self.api_key_dirty.lock().unwrap().insert(api_key_id);
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn total(&self) -> StatsTotal {
        *self.total.read().unwrap()
    }

    pub fn today(&self) -> StatsDaily {
        self.daily.read().unwrap().clone()
    }

    pub fn channel_stats(&self, channel_id: i64) -> StatsChannel {
        self.channel.get(&channel_id).unwrap_or(StatsChannel {
            channel_id,
            ..Default::default()
        })
    }

    pub fn api_key_stats(&self, api_key_id: i64) -> StatsApiKey {
        self.api_key.get(&api_key_id).unwrap_or(StatsApiKey {
            api_key_id,
            ..Default::default()
        })
    }

    /// Today's hourly slots up to the current hour; stale slots read as
    /// zeroed.
    pub fn hourly_today(&self) -> Vec<StatsHourly> {
        let today = today_date();
        let now_hour = current_hour();
        let hourly = self.hourly.read().unwrap();
        (0..=now_hour)
            .map(|hour| {
                let slot = &hourly[hour as usize];
                if slot.date == today {
                    slot.clone()
                } else {
                    StatsHourly {
                        hour,
                        date: today.clone(),
                        ..Default::default()
                    }
                }
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Flush every bucket: snapshots under short lock holds, then bulk DB
    /// writes outside the locks.
    pub async fn flush(&self) -> Result<()> {
        self.flush_with_daily(None).await
    }

    /// Flush with a displaced daily row taking the place of the cached one.
    pub async fn flush_with_daily(&self, daily_override: Option<StatsDaily>) -> Result<()> {
        let total = self.total();
        let daily = daily_override.unwrap_or_else(|| self.today());

        let today = today_date();
        let hourly: Vec<StatsHourly> = {
            let slots = self.hourly.read().unwrap();
            slots
                .iter()
                .filter(|s| s.date == today)
                .cloned()
                .collect()
        };

        let channel_ids: Vec<i64> = {
            let mut dirty = self.channel_dirty.lock().unwrap();
            dirty.drain().collect()
        };
        let model_keys: Vec<(String, i64)> = {
            let mut dirty = self.model_dirty.lock().unwrap();
            dirty.drain().collect()
        };
        let api_key_ids: Vec<i64> = {
            let mut dirty = self.api_key_dirty.lock().unwrap();
            dirty.drain().collect()
        };

        self.store.save_stats_total(&total).await?;
        self.store.save_stats_daily(&daily).await?;
        self.store.save_stats_hourly(&hourly).await?;
        for id in channel_ids {
            if let Some(row) = self.channel.get(&id) {
                self.store.save_stats_channel(&row).await?;
            }
        }
        for key in model_keys {
            if let Some(row) = self.model.get(&key) {
                self.store.save_stats_model(&row).await?;
            }
        }
        for id in api_key_ids {
            if let Some(row) = self.api_key.get(&id) {
                self.store.save_stats_api_key(&row).await?;
            }
        }

        debug!("stats flushed");
        Ok(())
    }

    pub async fn delete_channel_stats(&self, channel_id: i64) -> Result<()> {
        self.channel.del(&[channel_id]);
        self.channel_dirty.lock().unwrap().remove(&channel_id);
        self.store.delete_stats_channel(channel_id).await
    }

    pub async fn delete_api_key_stats(&self, api_key_id: i64) -> Result<()> {
        self.api_key.del(&[api_key_id]);
        self.api_key_dirty.lock().unwrap().remove(&api_key_id);
        self.store.delete_stats_api_key(api_key_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service() -> StatsService {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let service = StatsService::new(store);
        service.refresh().await.unwrap();
        service
    }

    fn delta(input_cost: f64, success: i64) -> StatsMetrics {
        StatsMetrics {
            input_token: 10,
            output_token: 5,
            input_cost,
            output_cost: 0.0,
            wait_time: 100,
            request_success: success,
            request_failed: 1 - success,
        }
    }

    #[tokio::test]
    async fn test_total_is_cumulative_with_id_one() {
        let service = service().await;
        service.update_total(&delta(0.1, 1));
        service.update_total(&delta(0.2, 1));
        let total = service.total();
        assert_eq!(total.id, 1);
        assert_eq!(total.metrics.request_success, 2);
        assert!((total.metrics.input_cost - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_update_all_touches_every_bucket() {
        let service = service().await;
        let displaced = service.update_all(7, 3, &delta(0.5, 1));
        assert!(displaced.is_none());

        assert_eq!(service.total().metrics.input_token, 10);
        assert_eq!(service.today().metrics.input_token, 10);
        assert_eq!(service.channel_stats(7).metrics.input_token, 10);
        assert_eq!(service.api_key_stats(3).metrics.input_token, 10);
        let hourly_sum: i64 = service
            .hourly_today()
            .iter()
            .map(|h| h.metrics.input_token)
            .sum();
        assert_eq!(hourly_sum, 10);
    }

    #[tokio::test]
    async fn test_daily_rollover_returns_displaced_row() {
        let service = service().await;
        service.update_daily_on("20250101", &delta(0.5, 1));
        let displaced = service.update_daily_on("20250102", &delta(0.25, 1));
        let displaced = displaced.unwrap();
        assert_eq!(displaced.date, "20250101");
        assert!((displaced.metrics.input_cost - 0.5).abs() < 1e-9);

        let current = service.daily.read().unwrap().clone();
        assert_eq!(current.date, "20250102");
        assert!((current.metrics.input_cost - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_hourly_stale_slot_overwritten() {
        let service = service().await;
        service.update_hourly_at(9, "20250101", &delta(1.0, 1));
        // Same slot, next day: the stale slot must be replaced, not added to.
        service.update_hourly_at(9, "20250102", &delta(0.25, 1));
        let hourly = service.hourly.read().unwrap();
        assert_eq!(hourly[9].date, "20250102");
        assert!((hourly[9].metrics.input_cost - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_model_bucket_keyed_by_name_and_channel() {
        let service = service().await;
        service.update_model("gpt-4o-mini", 1, &delta(0.5, 1));
        service.update_model("gpt-4o-mini", 2, &delta(0.25, 1));
        service.update_model("gpt-4o-mini", 1, &delta(0.5, 1));
        service.flush().await.unwrap();

        let rows = service.store.list_stats_model().await.unwrap();
        assert_eq!(rows.len(), 2);
        let channel1 = rows.iter().find(|r| r.channel_id == 1).unwrap();
        assert_eq!(channel1.metrics.request_success, 2);
    }

    #[tokio::test]
    async fn test_reset_api_key_zeroes_and_marks_dirty() {
        let service = service().await;
        service.update_api_key(5, &delta(2.0, 1));
        service.reset_api_key(5);
        assert_eq!(service.api_key_stats(5).metrics.input_token, 0);
        assert!(service.api_key_dirty.lock().unwrap().contains(&5));
    }

    #[tokio::test]
    async fn test_flush_drains_dirty_sets_and_persists() {
        let service = service().await;
        service.update_all(7, 3, &delta(0.5, 1));
        service.flush().await.unwrap();
        assert!(service.channel_dirty.lock().unwrap().is_empty());
        assert!(service.api_key_dirty.lock().unwrap().is_empty());

        let channels = service.store.list_stats_channel().await.unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].channel_id, 7);
        let total = service.store.get_stats_total().await.unwrap().unwrap();
        assert_eq!(total.metrics.request_success, 1);
    }

    #[tokio::test]
    async fn test_refresh_survives_restart() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let service = StatsService::new(store.clone());
        service.refresh().await.unwrap();
        service.update_all(1, 1, &delta(0.5, 1));
        service.flush().await.unwrap();

        let reloaded = StatsService::new(store);
        reloaded.refresh().await.unwrap();
        assert_eq!(reloaded.total().metrics.request_success, 1);
        assert_eq!(reloaded.channel_stats(1).metrics.input_token, 10);
    }
}
