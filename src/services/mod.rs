//! Business services: write-through caches over the store plus the
//! background reconciliation jobs that keep them fresh.

pub mod api_keys;
pub mod channels;
pub mod groups;
pub mod model_sync;
pub mod prices;
pub mod relay_log;
pub mod settings;
pub mod stats;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::core::error::Result;
use crate::core::http_client::HttpClientFactory;
use crate::core::scheduler::Scheduler;
use crate::store::entities::Channel;
use crate::store::Store;

pub use api_keys::ApiKeysService;
pub use channels::ChannelsService;
pub use groups::GroupsService;
pub use prices::PricesService;
pub use relay_log::RelayLogService;
pub use settings::SettingsService;
pub use stats::StatsService;

/// Shared handle to every service. Cheap to clone.
#[derive(Clone)]
pub struct Services {
    pub store: Store,
    pub settings: Arc<SettingsService>,
    pub channels: Arc<ChannelsService>,
    pub groups: Arc<GroupsService>,
    pub api_keys: Arc<ApiKeysService>,
    pub prices: Arc<PricesService>,
    pub stats: Arc<StatsService>,
    pub relay_log: Arc<RelayLogService>,
    pub http_clients: Arc<HttpClientFactory>,
    pub scheduler: Arc<Scheduler>,
}

impl Services {
    /// Build every service and warm the caches from the store, leaves
    /// first: settings, channels+keys, groups+items, api keys, prices,
    /// stats.
    pub async fn init(store: Store) -> Result<Self> {
        let settings = Arc::new(SettingsService::new(store.clone()));
        let channels = Arc::new(ChannelsService::new(store.clone()));
        let groups = Arc::new(GroupsService::new(store.clone()));
        let api_keys = Arc::new(ApiKeysService::new(store.clone()));
        let prices = Arc::new(PricesService::new(store.clone()));
        let stats = Arc::new(StatsService::new(store.clone()));
        let relay_log = Arc::new(RelayLogService::new(store.clone(), Arc::clone(&settings)));

        settings.refresh().await?;
        channels.refresh().await?;
        groups.refresh().await?;
        api_keys.refresh().await?;
        prices.refresh().await?;
        stats.refresh().await?;

        Ok(Self {
            store,
            settings,
            channels,
            groups,
            api_keys,
            prices,
            stats,
            relay_log,
            http_clients: Arc::new(HttpClientFactory::new()),
            scheduler: Arc::new(Scheduler::new()),
        })
    }

    /// Resolve the outbound HTTP client for a channel: direct, system
    /// proxy (from the `proxy_url` setting), or per-channel proxy.
    pub fn channel_http_client(&self, channel: &Channel) -> Result<reqwest::Client> {
        if !channel.proxy {
            return self.http_clients.direct();
        }
        match channel.channel_proxy.as_deref().map(str::trim) {
            None | Some("") => {
                let proxy_url = self.settings.get_string(settings::PROXY_URL)?;
                self.http_clients.system_proxy(&proxy_url)
            }
            Some(proxy_url) => self.http_clients.custom_proxy(proxy_url),
        }
    }

    /// Flush everything held in memory: stats buckets, channel-key hot
    /// fields, relay-log ring. Called by flush jobs and on shutdown.
    pub async fn save_caches(&self) -> Result<()> {
        self.stats.flush().await?;
        self.channels.flush_keys().await?;
        self.relay_log.flush().await?;
        Ok(())
    }

    /// Register the canonical periodic jobs.
    pub fn register_tasks(&self) {
        let scheduler = &self.scheduler;

        let price_interval = self
            .settings
            .get_int(settings::MODEL_INFO_UPDATE_INTERVAL)
            .unwrap_or(24);
        let services = self.clone();
        scheduler.register(
            settings::MODEL_INFO_UPDATE_INTERVAL,
            Duration::from_secs(price_interval.max(0) as u64 * 3600),
            true,
            move || {
                let services = services.clone();
                async move {
                    let Ok(client) = services.http_clients.direct() else { return };
                    if let Err(e) = services.prices.update_feed(&client).await {
                        warn!("failed to update price info: {e}");
                    }
                }
            },
        );

        let services = self.clone();
        scheduler.register("base_url_delay", Duration::from_secs(3600), true, move || {
            let services = services.clone();
            async move {
                // One probe sweep may touch many channels; bound the run.
                let budget = Duration::from_secs(30 * 60);
                if tokio::time::timeout(budget, model_sync::probe_channel_delays(&services))
                    .await
                    .is_err()
                {
                    warn!("base url delay probe exceeded its budget");
                }
            }
        });

        let sync_interval = self
            .settings
            .get_int(settings::SYNC_LLM_INTERVAL)
            .unwrap_or(24);
        let services = self.clone();
        scheduler.register(
            settings::SYNC_LLM_INTERVAL,
            Duration::from_secs(sync_interval.max(0) as u64 * 3600),
            true,
            move || {
                let services = services.clone();
                async move {
                    let budget = Duration::from_secs(30 * 60);
                    if tokio::time::timeout(budget, model_sync::sync_models(&services))
                        .await
                        .is_err()
                    {
                        warn!("model sync exceeded its budget");
                    }
                }
            },
        );

        let stats_interval = self
            .settings
            .get_int(settings::STATS_SAVE_INTERVAL)
            .unwrap_or(10);
        let services = self.clone();
        scheduler.register(
            "stats_save",
            Duration::from_secs(stats_interval.max(0) as u64 * 60),
            false,
            move || {
                let services = services.clone();
                async move {
                    let budget = Duration::from_secs(2 * 60);
                    let flush = async {
                        if let Err(e) = services.stats.flush().await {
                            warn!("stats save task failed: {e}");
                        }
                        if let Err(e) = services.channels.flush_keys().await {
                            warn!("channel key save task failed: {e}");
                        }
                    };
                    if tokio::time::timeout(budget, flush).await.is_err() {
                        warn!("stats save exceeded its budget");
                    }
                }
            },
        );

        let services = self.clone();
        scheduler.register(
            "relay_log_save",
            Duration::from_secs(10 * 60),
            false,
            move || {
                let services = services.clone();
                async move {
                    if let Err(e) = services.relay_log.periodic_flush().await {
                        warn!("relay log save task failed: {e}");
                    }
                }
            },
        );

        let services = self.clone();
        scheduler.register("quota_reset", Duration::from_secs(60), true, move || {
            let services = services.clone();
            async move {
                services.check_and_reset_quotas().await;
            }
        });

        info!("periodic tasks registered");
    }

    /// Reset stats for every API key whose reset moment has passed (or
    /// whose day-unit reset time drifted off UTC midnight after a unit
    /// change).
    pub async fn check_and_reset_quotas(&self) {
        let now = chrono::Utc::now().timestamp();
        for mut key in self.api_keys.list() {
            if !key.auto_reset_quota || key.reset_duration <= 0 {
                continue;
            }
            let force_reset = key.reset_unit == "day"
                && key.next_reset_time > 0
                && !api_keys::is_aligned_to_midnight(key.next_reset_time);

            if key.next_reset_time == 0 {
                key.next_reset_time =
                    api_keys::compute_next_reset(now, key.reset_duration, &key.reset_unit);
                if let Err(e) = self.api_keys.update(&key).await {
                    warn!("failed to initialize next reset time for key {}: {e}", key.name);
                }
            } else if now >= key.next_reset_time || force_reset {
                self.stats.reset_api_key(key.id);
                key.next_reset_time =
                    api_keys::compute_next_reset(now, key.reset_duration, &key.reset_unit);
                match self.api_keys.update(&key).await {
                    Ok(()) => info!("reset quota for api key {} (id: {})", key.name, key.id),
                    Err(e) => warn!(
                        "failed to update api key next reset time for key {}: {e}",
                        key.name
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn services() -> Services {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        Services::init(store).await.unwrap()
    }

    #[tokio::test]
    async fn test_init_warms_all_caches() {
        let services = services().await;
        // Settings defaults bootstrap during init.
        assert!(services
            .settings
            .get_bool(settings::RELAY_LOG_KEEP_ENABLED)
            .unwrap());
        assert!(services.channels.list().is_empty());
        assert!(services.groups.list().is_empty());
    }

    #[tokio::test]
    async fn test_channel_http_client_selection() {
        let services = services().await;
        let mut channel = Channel {
            id: 1,
            name: "up".into(),
            kind: crate::store::entities::ProviderKind::OpenAiChat,
            enabled: true,
            base_urls: vec![],
            keys: vec![],
            model: String::new(),
            custom_model: String::new(),
            proxy: false,
            auto_sync: false,
            auto_group: Default::default(),
            custom_header: vec![],
            param_override: None,
            channel_proxy: None,
            match_regex: None,
        };

        // Direct
        assert!(services.channel_http_client(&channel).is_ok());

        // System proxy with no proxy_url configured fails.
        channel.proxy = true;
        assert!(services.channel_http_client(&channel).is_err());
        services
            .settings
            .set_string(settings::PROXY_URL, "http://127.0.0.1:7890")
            .await
            .unwrap();
        assert!(services.channel_http_client(&channel).is_ok());

        // Per-channel proxy.
        channel.channel_proxy = Some("socks5://127.0.0.1:1080".into());
        assert!(services.channel_http_client(&channel).is_ok());
    }

    #[tokio::test]
    async fn test_quota_reset_day_aligned_scenario() {
        let services = services().await;
        sqlx::query(
            "INSERT INTO api_keys (name, api_key, auto_reset_quota, reset_duration, reset_unit)
             VALUES ('k', 'sk-octopus-a', 1, 86400, 'day')",
        )
        .execute(services.store.pool())
        .await
        .unwrap();
        services.api_keys.refresh().await.unwrap();

        services.check_and_reset_quotas().await;
        let key = services.api_keys.get(1).unwrap();
        assert!(key.next_reset_time > 0);
        assert!(api_keys::is_aligned_to_midnight(key.next_reset_time));
    }

    #[tokio::test]
    async fn test_quota_reset_misaligned_day_forces_reset() {
        let services = services().await;
        sqlx::query(
            "INSERT INTO api_keys (name, api_key, auto_reset_quota, reset_duration, reset_unit, next_reset_time)
             VALUES ('k', 'sk-octopus-a', 1, 86400, 'day', 1735725600)",
        )
        .execute(services.store.pool())
        .await
        .unwrap();
        services.api_keys.refresh().await.unwrap();
        services.stats.update_api_key(1, &crate::store::entities::StatsMetrics {
            input_cost: 1.0,
            ..Default::default()
        });

        // 1735725600 is 10:00 UTC, not midnight, so the unit changed and a
        // reset is forced regardless of the clock.
        services.check_and_reset_quotas().await;
        let key = services.api_keys.get(1).unwrap();
        assert!(api_keys::is_aligned_to_midnight(key.next_reset_time));
        assert_eq!(services.stats.api_key_stats(1).metrics.input_cost, 0.0);
    }

    #[tokio::test]
    async fn test_save_caches_flushes_everything() {
        let services = services().await;
        services.stats.update_all(1, 1, &crate::store::entities::StatsMetrics {
            request_success: 1,
            ..Default::default()
        });
        services.save_caches().await.unwrap();
        let total = services.store.get_stats_total().await.unwrap().unwrap();
        assert_eq!(total.metrics.request_success, 1);
    }
}
