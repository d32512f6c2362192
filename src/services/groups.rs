//! Group caches and auto-grouping.
//!
//! Groups are cached twice: by id and by the model name clients request.
//! Item batches upsert with insert-or-ignore on the (group, channel, model)
//! unique triple; auto-grouping matches a channel's model list against each
//! group by its policy and batch-adds the matches.

use regex::Regex;
use tracing::warn;

use crate::core::cache::ShardedCache;
use crate::core::error::{AppError, Result};
use crate::store::entities::{AutoGroupPolicy, Channel, Group, GroupItem};
use crate::store::Store;

pub struct GroupsService {
    store: Store,
    by_id: ShardedCache<i64, Group>,
    by_name: ShardedCache<String, Group>,
}

impl GroupsService {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            by_id: ShardedCache::new(16),
            by_name: ShardedCache::new(16),
        }
    }

    pub async fn refresh(&self) -> Result<()> {
        let groups = self.store.list_groups().await?;
        self.by_id.clear();
        self.by_name.clear();
        for group in groups {
            self.by_name.set(group.name.clone(), group.clone());
            self.by_id.set(group.id, group);
        }
        Ok(())
    }

    pub async fn refresh_by_id(&self, id: i64) -> Result<()> {
        let group = self
            .store
            .get_group(id)
            .await?
            .ok_or_else(|| AppError::Internal(format!("group not found: {id}")))?;
        if let Some(old) = self.by_id.get(&id) {
            if old.name != group.name {
                self.by_name.del(&[old.name]);
            }
        }
        self.by_name.set(group.name.clone(), group.clone());
        self.by_id.set(group.id, group);
        Ok(())
    }

    pub async fn refresh_by_ids(&self, ids: &[i64]) -> Result<()> {
        for id in ids {
            self.refresh_by_id(*id).await?;
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<Group> {
        self.by_id.get_all().into_values().collect()
    }

    /// Model names clients can request.
    pub fn model_names(&self) -> Vec<String> {
        self.by_name.get_all().into_keys().collect()
    }

    /// Resolve a routing group by requested model name.
    pub fn get_by_name(&self, name: &str) -> Option<Group> {
        self.by_name.get(&name.to_string())
    }

    /// Batch-add (channel, model) routes to a group with auto-assigned
    /// ascending priorities starting after the group's current maximum.
    /// Duplicate triples are ignored by the unique index.
    pub async fn item_batch_add(
        &self,
        group_id: i64,
        items: &[(i64, String)],
    ) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let group = self
            .by_id
            .get(&group_id)
            .ok_or_else(|| AppError::Internal("group not found".to_string()))?;

        let mut seen = std::collections::HashSet::new();
        let unique: Vec<&(i64, String)> = items
            .iter()
            .filter(|(channel_id, model)| {
                *channel_id != 0
                    && !model.is_empty()
                    && seen.insert((*channel_id, model.clone()))
            })
            .collect();
        if unique.is_empty() {
            return Ok(());
        }

        let mut next_priority = group
            .items
            .iter()
            .map(|i| i.priority)
            .max()
            .unwrap_or(0)
            + 1;

        let rows: Vec<GroupItem> = unique
            .into_iter()
            .map(|(channel_id, model)| {
                let row = GroupItem {
                    id: 0,
                    group_id,
                    channel_id: *channel_id,
                    model_name: model.clone(),
                    priority: next_priority,
                    weight: 1,
                };
                next_priority += 1;
                row
            })
            .collect();

        self.store.insert_group_items(&rows).await?;
        self.refresh_by_id(group_id).await
    }

    /// Remove routes for (channel, model) pairs whose models vanished.
    pub async fn item_batch_delete(&self, pairs: &[(i64, String)]) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let affected = self
            .store
            .delete_group_items_by_channel_models(pairs)
            .await?;
        self.refresh_by_ids(&affected).await
    }

    /// Auto-group a channel's merged model list into every matching group.
    pub async fn auto_group(&self, channel: &Channel) -> Result<()> {
        if channel.auto_group == AutoGroupPolicy::None {
            return Ok(());
        }
        let model_names = channel.model_names();
        if model_names.is_empty() {
            return Ok(());
        }

        for group in self.list() {
            let matched = match_models(channel, &group, &model_names);
            if matched.is_empty() {
                continue;
            }
            let items: Vec<(i64, String)> =
                matched.into_iter().map(|m| (channel.id, m)).collect();
            if let Err(e) = self.item_batch_add(group.id, &items).await {
                warn!("group item batch add failed (channel={} group={}): {e}", channel.id, group.id);
            }
        }
        Ok(())
    }
}

/// Model names from `model_names` that belong in `group` under the
/// channel's auto-group policy.
fn match_models(channel: &Channel, group: &Group, model_names: &[String]) -> Vec<String> {
    match channel.auto_group {
        AutoGroupPolicy::None => vec![],
        AutoGroupPolicy::Exact => model_names
            .iter()
            .filter(|m| m.eq_ignore_ascii_case(&group.name))
            .cloned()
            .collect(),
        AutoGroupPolicy::Fuzzy => {
            let group_name = group.name.trim().to_lowercase();
            if group_name.is_empty() {
                return vec![];
            }
            model_names
                .iter()
                .filter(|m| m.to_lowercase().contains(&group_name))
                .cloned()
                .collect()
        }
        AutoGroupPolicy::Regex => {
            // Empty regex falls back to exact matching.
            if group.match_regex.is_empty() {
                return model_names
                    .iter()
                    .filter(|m| m.eq_ignore_ascii_case(&group.name))
                    .cloned()
                    .collect();
            }
            let re = match Regex::new(&group.match_regex) {
                Ok(re) => re,
                Err(e) => {
                    warn!(
                        "compile regex failed (channel={} group={} regex={:?}): {e}",
                        channel.id, group.id, group.match_regex
                    );
                    return vec![];
                }
            };
            model_names
                .iter()
                .filter(|m| re.is_match(m))
                .cloned()
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::entities::{GroupMode, ProviderKind};

    async fn seeded() -> GroupsService {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            r#"INSERT INTO "groups" (name, mode, first_token_time_out) VALUES ('gpt-4o-mini', 1, 5)"#,
        )
        .execute(store.pool())
        .await
        .unwrap();
        let service = GroupsService::new(store);
        service.refresh().await.unwrap();
        service
    }

    fn channel(policy: AutoGroupPolicy, models: &str, regex: Option<&str>) -> Channel {
        Channel {
            id: 1,
            name: "up".into(),
            kind: ProviderKind::OpenAiChat,
            enabled: true,
            base_urls: vec![],
            keys: vec![],
            model: models.into(),
            custom_model: String::new(),
            proxy: false,
            auto_sync: false,
            auto_group: policy,
            custom_header: vec![],
            param_override: None,
            channel_proxy: None,
            match_regex: regex.map(|s| s.to_string()),
        }
    }

    #[tokio::test]
    async fn test_get_by_name_resolves_group() {
        let service = seeded().await;
        let group = service.get_by_name("gpt-4o-mini").unwrap();
        assert_eq!(group.mode, GroupMode::RoundRobin);
        assert_eq!(group.first_token_time_out, 5);
        assert!(service.get_by_name("missing").is_none());
    }

    #[tokio::test]
    async fn test_item_batch_add_assigns_ascending_priorities() {
        let service = seeded().await;
        service
            .item_batch_add(1, &[(1, "a".to_string()), (2, "b".to_string())])
            .await
            .unwrap();
        let group = service.get_by_name("gpt-4o-mini").unwrap();
        assert_eq!(group.items.len(), 2);
        assert_eq!(group.items[0].priority, 1);
        assert_eq!(group.items[1].priority, 2);

        // Priorities continue after the current maximum.
        service.item_batch_add(1, &[(3, "c".to_string())]).await.unwrap();
        let group = service.get_by_name("gpt-4o-mini").unwrap();
        assert_eq!(group.items.iter().map(|i| i.priority).max(), Some(3));
    }

    #[tokio::test]
    async fn test_item_batch_add_ignores_duplicates() {
        let service = seeded().await;
        service.item_batch_add(1, &[(1, "m".to_string())]).await.unwrap();
        service.item_batch_add(1, &[(1, "m".to_string())]).await.unwrap();
        let group = service.get_by_name("gpt-4o-mini").unwrap();
        assert_eq!(group.items.len(), 1);
    }

    #[tokio::test]
    async fn test_item_batch_delete_refreshes_cache() {
        let service = seeded().await;
        service
            .item_batch_add(1, &[(1, "m".to_string()), (1, "n".to_string())])
            .await
            .unwrap();
        service.item_batch_delete(&[(1, "m".to_string())]).await.unwrap();
        let group = service.get_by_name("gpt-4o-mini").unwrap();
        assert_eq!(group.items.len(), 1);
        assert_eq!(group.items[0].model_name, "n");
    }

    #[tokio::test]
    async fn test_auto_group_exact() {
        let service = seeded().await;
        let ch = channel(AutoGroupPolicy::Exact, "GPT-4O-MINI,other-model", None);
        service.auto_group(&ch).await.unwrap();
        let group = service.get_by_name("gpt-4o-mini").unwrap();
        assert_eq!(group.items.len(), 1);
        assert_eq!(group.items[0].model_name, "GPT-4O-MINI");
    }

    #[tokio::test]
    async fn test_auto_group_fuzzy() {
        let service = seeded().await;
        let ch = channel(
            AutoGroupPolicy::Fuzzy,
            "openai/gpt-4o-mini-2024,claude-opus",
            None,
        );
        service.auto_group(&ch).await.unwrap();
        let group = service.get_by_name("gpt-4o-mini").unwrap();
        assert_eq!(group.items.len(), 1);
        assert_eq!(group.items[0].model_name, "openai/gpt-4o-mini-2024");
    }

    #[tokio::test]
    async fn test_auto_group_regex_and_empty_fallback() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            r#"INSERT INTO "groups" (name, mode, match_regex) VALUES ('minis', 1, '^gpt-.*-mini$')"#,
        )
        .execute(store.pool())
        .await
        .unwrap();
        let service = GroupsService::new(store);
        service.refresh().await.unwrap();

        let ch = channel(AutoGroupPolicy::Regex, "gpt-4o-mini,gpt-4o", None);
        service.auto_group(&ch).await.unwrap();
        let group = service.get_by_name("minis").unwrap();
        assert_eq!(group.items.len(), 1);
        assert_eq!(group.items[0].model_name, "gpt-4o-mini");
    }

    #[tokio::test]
    async fn test_auto_group_none_is_noop() {
        let service = seeded().await;
        let ch = channel(AutoGroupPolicy::None, "gpt-4o-mini", None);
        service.auto_group(&ch).await.unwrap();
        assert!(service.get_by_name("gpt-4o-mini").unwrap().items.is_empty());
    }
}
