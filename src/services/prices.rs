//! LLM price table.
//!
//! Two layers: operator-managed rows in the store (authoritative) and the
//! models.dev provider feed (fallback). Lookups normalize to lowercase and
//! consult the store layer first.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Deserialize;
use tracing::debug;

use crate::core::cache::ShardedCache;
use crate::core::error::{AppError, Result};
use crate::store::entities::{LlmInfo, LlmPrice};
use crate::store::Store;

const PRICE_FEED_URL: &str = "https://models.dev/api.json";

/// Providers taken from the feed.
const FEED_PROVIDERS: &[&str] = &[
    "openai",
    "anthropic",
    "google",
    "deepseek",
    "xai",
    "alibaba",
    "zhipuai",
    "minimax",
    "moonshotai",
    "v0",
];

pub struct PricesService {
    store: Store,
    table: ShardedCache<String, LlmPrice>,
    feed: RwLock<HashMap<String, LlmPrice>>,
    last_feed_update: RwLock<i64>,
}

impl PricesService {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            table: ShardedCache::new(16),
            feed: RwLock::new(HashMap::new()),
            last_feed_update: RwLock::new(0),
        }
    }

    pub async fn refresh(&self) -> Result<()> {
        let infos = self.store.list_llm_infos().await?;
        self.table.clear();
        for info in infos {
            self.table.set(info.name, info.price);
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<LlmInfo> {
        self.table
            .get_all()
            .into_iter()
            .map(|(name, price)| LlmInfo { name, price })
            .collect()
    }

    /// Price for a model, store rows first, then the feed. `None` when the
    /// model is unknown everywhere.
    pub fn price_for(&self, model: &str) -> Option<LlmPrice> {
        let name = model.to_lowercase();
        if let Some(price) = self.table.get(&name) {
            return Some(price);
        }
        self.feed.read().unwrap().get(&name).cloned()
    }

    pub fn get(&self, model: &str) -> Option<LlmPrice> {
        self.table.get(&model.to_lowercase())
    }

    /// Add newly-seen models to the table: feed price if known, else empty.
    pub async fn batch_add(&self, model_names: &[String]) -> Result<()> {
        let mut infos = Vec::with_capacity(model_names.len());
        for name in model_names {
            if name.is_empty() {
                continue;
            }
            let name = name.to_lowercase();
            if self.table.get(&name).is_some() {
                continue;
            }
            let price = self.price_for(&name).unwrap_or_default();
            infos.push(LlmInfo { name, price });
        }
        if infos.is_empty() {
            return Ok(());
        }
        self.store.insert_llm_infos(&infos).await?;
        for info in infos {
            self.table.set(info.name, info.price);
        }
        Ok(())
    }

    /// Delete vanished models whose local price rows are all-zero;
    /// operator-priced rows survive.
    pub async fn batch_delete_unpriced(&self, model_names: &[String]) -> Result<()> {
        let mut to_delete = Vec::new();
        for name in model_names {
            if name.is_empty() {
                continue;
            }
            let name = name.to_lowercase();
            match self.table.get(&name) {
                Some(price) if price.is_zero() => to_delete.push(name),
                _ => {}
            }
        }
        if to_delete.is_empty() {
            return Ok(());
        }
        self.store.delete_llm_infos(&to_delete).await?;
        self.table.del(&to_delete);
        Ok(())
    }

    /// Refresh the provider feed.
    pub async fn update_feed(&self, client: &reqwest::Client) -> Result<()> {
        debug!("updating LLM price feed");

        let response = client.get(PRICE_FEED_URL).send().await?;
        if !response.status().is_success() {
            return Err(AppError::Internal(format!(
                "failed to fetch LLM info: {}",
                response.status()
            )));
        }
        let raw: HashMap<String, FeedProvider> = response.json().await?;

        let mut feed = self.feed.write().unwrap();
        for provider in FEED_PROVIDERS {
            let Some(entry) = raw.get(*provider) else { continue };
            for model in entry.models.values() {
                feed.insert(model.id.to_lowercase(), model.cost.clone());
            }
        }
        drop(feed);
        *self.last_feed_update.write().unwrap() = chrono::Utc::now().timestamp();
        Ok(())
    }

    pub fn last_feed_update(&self) -> i64 {
        *self.last_feed_update.read().unwrap()
    }

    #[cfg(test)]
    pub fn set_feed_price(&self, model: &str, price: LlmPrice) {
        self.feed
            .write()
            .unwrap()
            .insert(model.to_lowercase(), price);
    }
}

#[derive(Debug, Deserialize)]
struct FeedProvider {
    #[serde(default)]
    models: HashMap<String, FeedModel>,
}

#[derive(Debug, Deserialize)]
struct FeedModel {
    #[serde(default)]
    id: String,
    #[serde(default)]
    cost: LlmPrice,
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service() -> PricesService {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let service = PricesService::new(store);
        service.refresh().await.unwrap();
        service
    }

    fn token_price(input: f64, output: f64) -> LlmPrice {
        LlmPrice {
            billing: "token".into(),
            input,
            output,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_lookup_normalizes_case() {
        let service = service().await;
        service.batch_add(&["GPT-4O-Mini".to_string()]).await.unwrap();
        assert!(service.price_for("gpt-4o-mini").is_some());
        assert!(service.price_for("GPT-4o-MINI").is_some());
    }

    #[tokio::test]
    async fn test_store_layer_wins_over_feed() {
        let service = service().await;
        service.set_feed_price("m", token_price(1.0, 2.0));
        let price = service.price_for("m").unwrap();
        assert!((price.input - 1.0).abs() < 1e-9);

        service
            .store
            .insert_llm_infos(&[LlmInfo {
                name: "m".into(),
                price: token_price(9.0, 9.0),
            }])
            .await
            .unwrap();
        service.refresh().await.unwrap();
        let price = service.price_for("m").unwrap();
        assert!((price.input - 9.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_batch_add_uses_feed_price_when_known() {
        let service = service().await;
        service.set_feed_price("known", token_price(2.5, 10.0));
        service
            .batch_add(&["known".to_string(), "unknown".to_string()])
            .await
            .unwrap();
        assert!((service.get("known").unwrap().input - 2.5).abs() < 1e-9);
        assert!(service.get("unknown").unwrap().is_zero());
    }

    #[tokio::test]
    async fn test_batch_delete_only_unpriced() {
        let service = service().await;
        service
            .store
            .insert_llm_infos(&[
                LlmInfo {
                    name: "priced".into(),
                    price: token_price(1.0, 1.0),
                },
                LlmInfo {
                    name: "unpriced".into(),
                    price: LlmPrice::default(),
                },
            ])
            .await
            .unwrap();
        service.refresh().await.unwrap();

        service
            .batch_delete_unpriced(&["priced".to_string(), "unpriced".to_string()])
            .await
            .unwrap();
        assert!(service.get("priced").is_some());
        assert!(service.get("unpriced").is_none());
    }
}
