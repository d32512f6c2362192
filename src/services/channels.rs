//! Channel and channel-key caches.
//!
//! Channel rows are write-through; key hot fields (`status_code`,
//! `last_use_time_stamp`, `total_cost`) are updated in cache only and
//! recorded in a dirty set that the flush job drains in bulk.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::core::cache::ShardedCache;
use crate::core::error::{AppError, Result};
use crate::store::entities::{BaseUrl, Channel, ChannelKey};
use crate::store::Store;

pub struct ChannelsService {
    store: Store,
    channels: ShardedCache<i64, Channel>,
    keys: ShardedCache<i64, ChannelKey>,
    dirty_keys: Mutex<HashSet<i64>>,
}

impl ChannelsService {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            channels: ShardedCache::new(16),
            keys: ShardedCache::new(16),
            dirty_keys: Mutex::new(HashSet::new()),
        }
    }

    /// Load every channel (keys preloaded) from the store.
    pub async fn refresh(&self) -> Result<()> {
        let channels = self.store.list_channels().await?;
        self.channels.clear();
        self.keys.clear();
        self.dirty_keys.lock().unwrap().clear();
        for channel in channels {
            for key in &channel.keys {
                if key.id != 0 {
                    self.keys.set(key.id, key.clone());
                }
            }
            self.channels.set(channel.id, channel);
        }
        Ok(())
    }

    /// Re-load one channel with eager key preload, replacing stale key
    /// cache entries.
    pub async fn refresh_by_id(&self, id: i64) -> Result<()> {
        if let Some(old) = self.channels.get(&id) {
            let stale: Vec<i64> = old.keys.iter().map(|k| k.id).filter(|k| *k != 0).collect();
            self.keys.del(&stale);
        }
        let channel = self
            .store
            .get_channel(id)
            .await?
            .ok_or_else(|| AppError::Internal(format!("channel not found: {id}")))?;
        for key in &channel.keys {
            if key.id != 0 {
                self.keys.set(key.id, key.clone());
            }
        }
        self.channels.set(channel.id, channel);
        Ok(())
    }

    pub fn list(&self) -> Vec<Channel> {
        self.channels.get_all().into_values().collect()
    }

    pub fn get(&self, id: i64) -> Option<Channel> {
        self.channels.get(&id)
    }

    /// Update a key's hot fields in cache and mark it for the next flush.
    pub fn key_update(&self, key: ChannelKey) -> Result<()> {
        if key.id == 0 || key.channel_id == 0 {
            return Err(AppError::Internal("invalid channel key".to_string()));
        }
        let mut channel = self
            .channels
            .get(&key.channel_id)
            .ok_or_else(|| AppError::Internal("channel not found".to_string()))?;
        if let Some(slot) = channel.keys.iter_mut().find(|k| k.id == key.id) {
            *slot = key.clone();
        }
        self.channels.set(channel.id, channel);
        self.keys.set(key.id, key.clone());
        self.dirty_keys.lock().unwrap().insert(key.id);
        Ok(())
    }

    /// Replace a channel's base URLs in cache. Measured delays are
    /// volatile; they are not persisted.
    pub fn base_urls_update(&self, channel_id: i64, base_urls: Vec<BaseUrl>) -> Result<()> {
        let mut channel = self
            .channels
            .get(&channel_id)
            .ok_or_else(|| AppError::Internal("channel not found".to_string()))?;
        channel.base_urls = base_urls;
        self.channels.set(channel_id, channel);
        Ok(())
    }

    /// Persist the synced model list and re-load the channel.
    pub async fn update_models(&self, channel_id: i64, model: &str) -> Result<()> {
        self.store.update_channel_models(channel_id, model).await?;
        self.refresh_by_id(channel_id).await
    }

    /// Flush runtime-updated keys back to the store in bulk. The dirty set
    /// is drained and cloned first to keep the critical section short.
    pub async fn flush_keys(&self) -> Result<()> {
        let ids: Vec<i64> = {
            let mut dirty = self.dirty_keys.lock().unwrap();
            dirty.drain().collect()
        };
        for id in ids {
            if let Some(key) = self.keys.get(&id) {
                self.store.save_channel_key(&key).await?;
            }
        }
        Ok(())
    }

    /// Delete a channel with its cascade (keys, group items, stats row).
    /// Returns the group ids that referenced it so the caller can refresh
    /// their caches.
    pub async fn delete(&self, id: i64) -> Result<Vec<i64>> {
        let channel = self
            .channels
            .get(&id)
            .ok_or_else(|| AppError::Internal("channel not found".to_string()))?;

        let affected_groups = self.store.delete_channel(id).await?;

        self.channels.del(&[id]);
        let key_ids: Vec<i64> = channel.keys.iter().map(|k| k.id).filter(|k| *k != 0).collect();
        self.keys.del(&key_ids);
        {
            let mut dirty = self.dirty_keys.lock().unwrap();
            for key_id in key_ids {
                dirty.remove(&key_id);
            }
        }
        Ok(affected_groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::entities::ProviderKind;

    async fn seeded() -> ChannelsService {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        sqlx::query("INSERT INTO channels (name, kind, base_urls) VALUES ('up', 0, '[{\"url\":\"https://a\",\"delay\":0}]')")
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query("INSERT INTO channel_keys (channel_id, channel_key) VALUES (1, 'sk-up-1')")
            .execute(store.pool())
            .await
            .unwrap();
        let service = ChannelsService::new(store);
        service.refresh().await.unwrap();
        service
    }

    #[tokio::test]
    async fn test_refresh_preloads_keys() {
        let service = seeded().await;
        let channel = service.get(1).unwrap();
        assert_eq!(channel.kind, ProviderKind::OpenAiChat);
        assert_eq!(channel.keys.len(), 1);
        assert_eq!(service.keys.get(&1).unwrap().key, "sk-up-1");
    }

    #[tokio::test]
    async fn test_key_update_is_cache_only_until_flush() {
        let service = seeded().await;
        let mut key = service.get(1).unwrap().keys[0].clone();
        key.status_code = 429;
        key.total_cost = 1.5;
        service.key_update(key).unwrap();

        // Cache sees the update, the store does not yet.
        assert_eq!(service.get(1).unwrap().keys[0].status_code, 429);
        let stored = service.store.get_channel(1).await.unwrap().unwrap();
        assert_eq!(stored.keys[0].status_code, 0);

        service.flush_keys().await.unwrap();
        let stored = service.store.get_channel(1).await.unwrap().unwrap();
        assert_eq!(stored.keys[0].status_code, 429);
        assert!((stored.keys[0].total_cost - 1.5).abs() < 1e-9);
        assert!(service.dirty_keys.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_base_urls_update_not_persisted() {
        let service = seeded().await;
        service
            .base_urls_update(
                1,
                vec![BaseUrl {
                    url: "https://a".into(),
                    delay: 42,
                }],
            )
            .unwrap();
        assert_eq!(service.get(1).unwrap().base_urls[0].delay, 42);
        let stored = service.store.get_channel(1).await.unwrap().unwrap();
        assert_eq!(stored.base_urls[0].delay, 0);
    }

    #[tokio::test]
    async fn test_delete_cascades_and_cleans_cache() {
        let service = seeded().await;
        sqlx::query(r#"INSERT INTO "groups" (name, mode) VALUES ('g', 1)"#)
            .execute(service.store.pool())
            .await
            .unwrap();
        sqlx::query("INSERT INTO group_items (group_id, channel_id, model_name) VALUES (1, 1, 'm')")
            .execute(service.store.pool())
            .await
            .unwrap();

        let affected = service.delete(1).await.unwrap();
        assert_eq!(affected, vec![1]);
        assert!(service.get(1).is_none());
        assert!(service.keys.get(&1).is_none());
    }

    #[tokio::test]
    async fn test_update_models_persists_and_refreshes() {
        let service = seeded().await;
        service.update_models(1, "gpt-4o,gpt-4o-mini").await.unwrap();
        assert_eq!(service.get(1).unwrap().model, "gpt-4o,gpt-4o-mini");
        let stored = service.store.get_channel(1).await.unwrap().unwrap();
        assert_eq!(stored.model, "gpt-4o,gpt-4o-mini");
    }
}
