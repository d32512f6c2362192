//! Provider model-list fetching and reconciliation.
//!
//! Each provider kind has its own catalog endpoint: OpenAI `/models` with a
//! Bearer token, Gemini `/models` with `pageToken` paging, Anthropic
//! `/models` with `after_id` paging. The paged fetchers fall back to the
//! OpenAI shape when they come back empty. The sync task diffs fetched
//! lists against each auto-sync channel, updates the channel row, prunes
//! orphaned group routes, auto-groups additions, and reconciles the global
//! price table.

use std::collections::HashSet;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::core::error::{AppError, Result};
use crate::services::Services;
use crate::store::entities::{BaseUrl, Channel, ProviderKind};

// ============================================================================
// Catalog wire shapes
// ============================================================================

#[derive(Debug, Deserialize)]
struct OpenAiModelList {
    #[serde(default)]
    data: Vec<OpenAiModel>,
}

#[derive(Debug, Deserialize)]
struct OpenAiModel {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GeminiModelList {
    #[serde(default)]
    models: Vec<GeminiModel>,
    #[serde(rename = "nextPageToken", default)]
    next_page_token: String,
}

#[derive(Debug, Deserialize)]
struct GeminiModel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicModelList {
    #[serde(default)]
    data: Vec<AnthropicModel>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    last_id: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicModel {
    id: String,
}

// ============================================================================
// Fetching
// ============================================================================

/// Fetch a channel's model catalog, filtered by its match regex.
pub async fn fetch_models(services: &Services, channel: &Channel) -> Result<Vec<String>> {
    let client = services.channel_http_client(channel)?;
    let models = match channel.kind {
        ProviderKind::Anthropic => fetch_anthropic_models(&client, channel).await?,
        ProviderKind::Gemini => fetch_gemini_models(&client, channel).await?,
        _ => fetch_openai_models(&client, channel).await?,
    };

    let Some(pattern) = channel.match_regex.as_deref().filter(|p| !p.is_empty()) else {
        return Ok(models);
    };
    let re = Regex::new(pattern)
        .map_err(|e| AppError::Internal(format!("invalid match regex: {e}")))?;
    Ok(models.into_iter().filter(|m| re.is_match(m)).collect())
}

async fn fetch_openai_models(
    client: &reqwest::Client,
    channel: &Channel,
) -> Result<Vec<String>> {
    let key = channel.select_key(chrono::Utc::now().timestamp()).unwrap_or_default();
    let url = format!("{}/models", channel.best_base_url().trim_end_matches('/'));
    let list: OpenAiModelList = client
        .get(&url)
        .header("Authorization", format!("Bearer {}", key.key))
        .send()
        .await?
        .json()
        .await?;
    Ok(list.data.into_iter().map(|m| m.id).collect())
}

async fn fetch_gemini_models(
    client: &reqwest::Client,
    channel: &Channel,
) -> Result<Vec<String>> {
    let key = channel.select_key(chrono::Utc::now().timestamp()).unwrap_or_default();
    let url = format!("{}/models", channel.best_base_url().trim_end_matches('/'));

    let mut models = Vec::new();
    let mut page_token = String::new();
    loop {
        let mut request = client.get(&url).header("X-Goog-Api-Key", &key.key);
        if !page_token.is_empty() {
            request = request.query(&[("pageToken", page_token.as_str())]);
        }
        let list: GeminiModelList = request.send().await?.json().await?;
        for model in list.models {
            models.push(model.name.trim_start_matches("models/").to_string());
        }
        if list.next_page_token.is_empty() {
            break;
        }
        page_token = list.next_page_token;
    }

    if models.is_empty() {
        return fetch_openai_models(client, channel).await;
    }
    Ok(models)
}

async fn fetch_anthropic_models(
    client: &reqwest::Client,
    channel: &Channel,
) -> Result<Vec<String>> {
    let key = channel.select_key(chrono::Utc::now().timestamp()).unwrap_or_default();
    let url = format!("{}/models", channel.best_base_url().trim_end_matches('/'));

    let mut models = Vec::new();
    let mut after_id = String::new();
    loop {
        let mut request = client
            .get(&url)
            .header("X-Api-Key", &key.key)
            .header("Anthropic-Version", "2023-06-01");
        if !after_id.is_empty() {
            request = request.query(&[("after_id", after_id.as_str())]);
        }
        let list: AnthropicModelList = request.send().await?.json().await?;
        models.extend(list.data.into_iter().map(|m| m.id));
        if !list.has_more {
            break;
        }
        after_id = list.last_id;
    }

    if models.is_empty() {
        return fetch_openai_models(client, channel).await;
    }
    Ok(models)
}

// ============================================================================
// Base-URL delay probing
// ============================================================================

/// Measure a URL's round trip with a HEAD request, in milliseconds.
pub async fn measure_url_delay(client: &reqwest::Client, url: &str) -> Result<i64> {
    let start = std::time::Instant::now();
    client.head(url).send().await?;
    Ok(start.elapsed().as_millis() as i64)
}

/// Re-measure every base URL of every channel.
pub async fn probe_channel_delays(services: &Services) {
    debug!("channel base url delay task started");
    for channel in services.channels.list() {
        let Ok(client) = services.channel_http_client(&channel) else {
            continue;
        };
        let mut measured = Vec::with_capacity(channel.base_urls.len());
        for base_url in &channel.base_urls {
            match measure_url_delay(&client, &base_url.url).await {
                Ok(delay) => measured.push(BaseUrl {
                    url: base_url.url.clone(),
                    delay,
                }),
                Err(e) => warn!("failed to get url delay (channel={}): {e}", channel.id),
            }
        }
        if !measured.is_empty() {
            if let Err(e) = services.channels.base_urls_update(channel.id, measured) {
                warn!("failed to update base urls (channel={}): {e}", channel.id);
            }
        }
    }
}

// ============================================================================
// Sync reconciliation
// ============================================================================

/// Diff two lists: (deleted, added).
pub fn diff_models(old: &[String], new: &[String]) -> (Vec<String>, Vec<String>) {
    let old_set: HashSet<&String> = old.iter().collect();
    let new_set: HashSet<&String> = new.iter().collect();
    let deleted = old
        .iter()
        .filter(|m| !new_set.contains(*m))
        .cloned()
        .collect();
    let added = new
        .iter()
        .filter(|m| !old_set.contains(*m))
        .cloned()
        .collect();
    (deleted, added)
}

/// Reconcile every auto-sync channel against its provider catalog, then the
/// global price table against the union of everything seen.
pub async fn sync_models(services: &Services) {
    debug!("sync models task started");
    let mut seen_models: HashSet<String> = HashSet::new();
    let mut total_new: Vec<String> = Vec::new();

    for channel in services.channels.list() {
        if !channel.auto_sync {
            continue;
        }
        let fetched = match fetch_models(services, &channel).await {
            Ok(models) => models,
            Err(e) => {
                warn!("failed to fetch models for channel {}: {e}", channel.name);
                continue;
            }
        };
        let new_models: Vec<String> = fetched
            .iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        for model in &new_models {
            let lowered = model.to_lowercase();
            if seen_models.insert(lowered.clone()) {
                total_new.push(lowered);
            }
        }

        let old_models = crate::store::entities::split_trim_compact(&[&channel.model]);
        let (deleted, added) = diff_models(&old_models, &new_models);

        if !deleted.is_empty() || !added.is_empty() {
            let joined = new_models.join(",");
            if let Err(e) = services.channels.update_models(channel.id, &joined).await {
                warn!("failed to update channel {}: {e}", channel.name);
                continue;
            }
        }

        if !deleted.is_empty() {
            info!("deleted channel {} models: {deleted:?}", channel.name);
            let pairs: Vec<(i64, String)> =
                deleted.into_iter().map(|m| (channel.id, m)).collect();
            if let Err(e) = services.groups.item_batch_delete(&pairs).await {
                warn!(
                    "failed to batch delete group items for channel {}: {e}",
                    channel.name
                );
            }
        }

        if !new_models.is_empty() {
            // Re-read so auto-grouping sees the updated model list.
            if let Some(updated) = services.channels.get(channel.id) {
                if let Err(e) = services.groups.auto_group(&updated).await {
                    warn!("auto group failed for channel {}: {e}", channel.name);
                }
            }
        }
    }

    // Reconcile the price table with the union of fetched models.
    let known: Vec<String> = services.prices.list().into_iter().map(|i| i.name).collect();
    let (vanished, added) = diff_models(&known, &total_new);
    if !vanished.is_empty() {
        if let Err(e) = services.prices.batch_delete_unpriced(&vanished).await {
            warn!("failed to batch delete models price: {e}");
        }
    }
    if !added.is_empty() {
        if let Err(e) = services.prices.batch_add(&added).await {
            warn!("failed to add models price: {e}");
        }
    }
}
