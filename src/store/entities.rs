//! Persistent entities.
//!
//! Row types for every table, shared between the store, the caches, and the
//! relay pipeline. JSON-typed columns (base URLs, custom headers, attempt
//! lists) are serialized through serde when crossing the store boundary.

use serde::{Deserialize, Serialize};

// ============================================================================
// Provider kinds
// ============================================================================

/// Upstream provider variant a channel speaks.
///
/// Stored as an integer column; the discriminants are part of the persisted
/// format and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum ProviderKind {
    OpenAiChat = 0,
    OpenAiResponse = 1,
    Anthropic = 2,
    Gemini = 3,
    Volcengine = 4,
    OpenAiEmbedding = 5,
}

impl ProviderKind {
    /// Whether channels of this kind accept embedding requests.
    pub fn supports_embedding(self) -> bool {
        matches!(self, ProviderKind::OpenAiEmbedding)
    }

    /// Whether channels of this kind accept chat/response requests.
    pub fn supports_chat(self) -> bool {
        !self.supports_embedding()
    }
}

impl TryFrom<i64> for ProviderKind {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ProviderKind::OpenAiChat),
            1 => Ok(ProviderKind::OpenAiResponse),
            2 => Ok(ProviderKind::Anthropic),
            3 => Ok(ProviderKind::Gemini),
            4 => Ok(ProviderKind::Volcengine),
            5 => Ok(ProviderKind::OpenAiEmbedding),
            other => Err(format!("unknown provider kind: {other}")),
        }
    }
}

impl From<ProviderKind> for i64 {
    fn from(kind: ProviderKind) -> Self {
        kind as i64
    }
}

// ============================================================================
// Channels
// ============================================================================

/// Auto-grouping policy applied when a channel's model list changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum AutoGroupPolicy {
    #[default]
    None = 0,
    Fuzzy = 1,
    Exact = 2,
    Regex = 3,
}

impl TryFrom<i64> for AutoGroupPolicy {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AutoGroupPolicy::None),
            1 => Ok(AutoGroupPolicy::Fuzzy),
            2 => Ok(AutoGroupPolicy::Exact),
            3 => Ok(AutoGroupPolicy::Regex),
            other => Err(format!("unknown auto group policy: {other}")),
        }
    }
}

impl From<AutoGroupPolicy> for i64 {
    fn from(policy: AutoGroupPolicy) -> Self {
        policy as i64
    }
}

/// One upstream base URL with its last measured round-trip delay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaseUrl {
    pub url: String,
    #[serde(default)]
    pub delay: i64,
}

/// Extra header appended to every upstream request on a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomHeader {
    pub header_key: String,
    pub header_value: String,
}

/// Upstream-provider binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    pub enabled: bool,
    #[serde(default)]
    pub base_urls: Vec<BaseUrl>,
    #[serde(default)]
    pub keys: Vec<ChannelKey>,
    /// Comma-joined model list maintained by sync
    #[serde(default)]
    pub model: String,
    /// Comma-joined operator-added models
    #[serde(default)]
    pub custom_model: String,
    /// False = direct; true + empty channel_proxy = system proxy
    #[serde(default)]
    pub proxy: bool,
    #[serde(default)]
    pub auto_sync: bool,
    #[serde(default)]
    pub auto_group: AutoGroupPolicy,
    #[serde(default)]
    pub custom_header: Vec<CustomHeader>,
    #[serde(default)]
    pub param_override: Option<String>,
    #[serde(default)]
    pub channel_proxy: Option<String>,
    #[serde(default)]
    pub match_regex: Option<String>,
}

/// Seconds a key stays suspended after a 429.
pub const KEY_SUSPEND_SECS: i64 = 300;

impl Channel {
    /// URL with the lowest measured delay; empty URLs are skipped, ties go
    /// to the first in iteration order. Empty set yields "".
    pub fn best_base_url(&self) -> &str {
        let mut best: Option<&BaseUrl> = None;
        for bu in &self.base_urls {
            if bu.url.is_empty() {
                continue;
            }
            match best {
                Some(b) if bu.delay >= b.delay => {}
                _ => best = Some(bu),
            }
        }
        best.map(|b| b.url.as_str()).unwrap_or("")
    }

    /// Select a key: among enabled, non-empty, non-suspended keys, pick the
    /// one with the lowest accrued total cost (ties: first in iteration
    /// order). A key is suspended iff it last saw a 429 less than five
    /// minutes ago.
    pub fn select_key(&self, now_secs: i64) -> Option<ChannelKey> {
        let mut best: Option<&ChannelKey> = None;
        for key in &self.keys {
            if !key.enabled || key.key.is_empty() {
                continue;
            }
            if key.status_code == 429
                && key.last_use_time_stamp > 0
                && now_secs - key.last_use_time_stamp < KEY_SUSPEND_SECS
            {
                continue;
            }
            match best {
                Some(b) if key.total_cost >= b.total_cost => {}
                _ => best = Some(key),
            }
        }
        best.cloned()
    }

    /// Merged model + custom_model list, trimmed and de-blanked.
    pub fn model_names(&self) -> Vec<String> {
        split_trim_compact(&[&self.model, &self.custom_model])
    }
}

/// Split comma-joined lists, trim whitespace, drop empties.
pub fn split_trim_compact(parts: &[&str]) -> Vec<String> {
    let mut out = Vec::new();
    for part in parts {
        for item in part.split(',') {
            let item = item.trim();
            if !item.is_empty() {
                out.push(item.to_string());
            }
        }
    }
    out
}

/// Secret credential attached to a channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelKey {
    pub id: i64,
    pub channel_id: i64,
    pub enabled: bool,
    #[serde(rename = "channel_key")]
    pub key: String,
    /// Last upstream status observed with this key
    #[serde(default)]
    pub status_code: i64,
    #[serde(default)]
    pub last_use_time_stamp: i64,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub remark: String,
}

// ============================================================================
// Groups
// ============================================================================

/// Load-balancing mode of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum GroupMode {
    RoundRobin = 1,
    Random = 2,
    Failover = 3,
    Weighted = 4,
}

impl TryFrom<i64> for GroupMode {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(GroupMode::RoundRobin),
            2 => Ok(GroupMode::Random),
            3 => Ok(GroupMode::Failover),
            4 => Ok(GroupMode::Weighted),
            other => Err(format!("unknown group mode: {other}")),
        }
    }
}

impl From<GroupMode> for i64 {
    fn from(mode: GroupMode) -> Self {
        mode as i64
    }
}

/// Routing bucket keyed by the model name clients see.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub mode: GroupMode,
    #[serde(default)]
    pub match_regex: String,
    /// Streaming time-to-first-output limit, seconds; 0 disables
    #[serde(default)]
    pub first_token_time_out: i64,
    #[serde(default)]
    pub items: Vec<GroupItem>,
}

/// One (channel, upstream-model) route inside a group.
/// Unique on (group_id, channel_id, model_name).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupItem {
    pub id: i64,
    pub group_id: i64,
    pub channel_id: i64,
    pub model_name: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub weight: i64,
}

// ============================================================================
// API keys
// ============================================================================

/// Tenant credential issued by the gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: i64,
    pub name: String,
    pub api_key: String,
    pub enabled: bool,
    /// Absolute expiry, unix seconds; 0 = never
    #[serde(default)]
    pub expire_at: i64,
    /// Cost ceiling in dollars; 0 = unlimited
    #[serde(default)]
    pub max_cost: f64,
    /// Comma-separated model allow-list; empty = all
    #[serde(default)]
    pub supported_models: String,
    #[serde(default)]
    pub auto_reset_quota: bool,
    /// Reset period in seconds
    #[serde(default)]
    pub reset_duration: i64,
    /// "minute" | "hour" | "day"
    #[serde(default)]
    pub reset_unit: String,
    #[serde(default)]
    pub next_reset_time: i64,
}

// ============================================================================
// LLM prices
// ============================================================================

/// Model pricing. Token costs are per million tokens.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmPrice {
    /// "token" | "request"
    #[serde(rename = "type", default)]
    pub billing: String,
    #[serde(default)]
    pub input: f64,
    #[serde(default)]
    pub output: f64,
    #[serde(default)]
    pub cache_read: f64,
    #[serde(default)]
    pub cache_write: f64,
    /// Flat cost per request when billing = "request"
    #[serde(default)]
    pub request: f64,
}

impl LlmPrice {
    pub fn is_per_request(&self) -> bool {
        self.billing == "request"
    }

    pub fn is_zero(&self) -> bool {
        self.input == 0.0 && self.output == 0.0 && self.cache_read == 0.0 && self.cache_write == 0.0
    }
}

/// Priced model row; `name` is the lowercase primary key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmInfo {
    pub name: String,
    #[serde(flatten)]
    pub price: LlmPrice,
}

// ============================================================================
// Settings
// ============================================================================

/// Key → string setting row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Setting {
    pub key: String,
    pub value: String,
}

// ============================================================================
// Stats
// ============================================================================

/// Metric counters embedded in every aggregate row. All fields are additive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsMetrics {
    #[serde(default)]
    pub input_token: i64,
    #[serde(default)]
    pub output_token: i64,
    #[serde(default)]
    pub input_cost: f64,
    #[serde(default)]
    pub output_cost: f64,
    #[serde(default)]
    pub wait_time: i64,
    #[serde(default)]
    pub request_success: i64,
    #[serde(default)]
    pub request_failed: i64,
}

impl StatsMetrics {
    /// Aggregate another metrics delta into this one.
    pub fn add(&mut self, delta: &StatsMetrics) {
        self.input_token += delta.input_token;
        self.output_token += delta.output_token;
        self.input_cost += delta.input_cost;
        self.output_cost += delta.output_cost;
        self.wait_time += delta.wait_time;
        self.request_success += delta.request_success;
        self.request_failed += delta.request_failed;
    }
}

/// Cumulative singleton; always row id 1.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StatsTotal {
    pub id: i64,
    #[serde(flatten)]
    pub metrics: StatsMetrics,
}

/// One of 24 hourly slots. `date` records which day the slot belongs to so
/// stale slots from yesterday can be detected and overwritten.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsHourly {
    pub hour: i64,
    /// "YYYYMMDD"
    pub date: String,
    #[serde(flatten)]
    pub metrics: StatsMetrics,
}

/// Daily aggregate keyed by "YYYYMMDD".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsDaily {
    pub date: String,
    #[serde(flatten)]
    pub metrics: StatsMetrics,
}

/// Per-channel aggregate.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StatsChannel {
    pub channel_id: i64,
    #[serde(flatten)]
    pub metrics: StatsMetrics,
}

/// Per-model aggregate, scoped to the channel that served the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsModel {
    pub id: i64,
    pub name: String,
    pub channel_id: i64,
    #[serde(flatten)]
    pub metrics: StatsMetrics,
}

/// Per-API-key aggregate.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StatsApiKey {
    pub api_key_id: i64,
    #[serde(flatten)]
    pub metrics: StatsMetrics,
}

// ============================================================================
// Relay logs
// ============================================================================

/// One channel attempt inside a relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelAttempt {
    pub channel_id: i64,
    pub channel_name: String,
    pub model_name: String,
    /// Retry round, 1-based
    pub round: i64,
    pub attempt_num: i64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// Milliseconds
    pub duration: i64,
}

/// Record of one client request. `id` is a millisecond-monotonic 63-bit id,
/// giving stable descending-id ordering across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayLog {
    pub id: i64,
    /// Unix seconds
    pub time: i64,
    pub request_model_name: String,
    #[serde(rename = "channel")]
    pub channel_id: i64,
    pub channel_name: String,
    pub actual_model_name: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    /// First-token latency, milliseconds
    pub ftut: i64,
    /// Total duration, milliseconds
    pub use_time: i64,
    pub cost: f64,
    pub request_content: String,
    pub response_content: String,
    pub error: String,
    #[serde(default)]
    pub attempts: Vec<ChannelAttempt>,
    pub total_attempts: i64,
    /// 0 iff terminal failure
    pub successful_round: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: i64, enabled: bool, secret: &str, status: i64, last_use: i64, cost: f64) -> ChannelKey {
        ChannelKey {
            id,
            channel_id: 1,
            enabled,
            key: secret.to_string(),
            status_code: status,
            last_use_time_stamp: last_use,
            total_cost: cost,
            remark: String::new(),
        }
    }

    fn channel_with_keys(keys: Vec<ChannelKey>) -> Channel {
        Channel {
            id: 1,
            name: "test".into(),
            kind: ProviderKind::OpenAiChat,
            enabled: true,
            base_urls: vec![],
            keys,
            model: String::new(),
            custom_model: String::new(),
            proxy: false,
            auto_sync: false,
            auto_group: AutoGroupPolicy::None,
            custom_header: vec![],
            param_override: None,
            channel_proxy: None,
            match_regex: None,
        }
    }

    #[test]
    fn test_best_base_url_picks_lowest_delay() {
        let mut ch = channel_with_keys(vec![]);
        ch.base_urls = vec![
            BaseUrl { url: "https://a".into(), delay: 120 },
            BaseUrl { url: "https://b".into(), delay: 40 },
            BaseUrl { url: "https://c".into(), delay: 90 },
        ];
        assert_eq!(ch.best_base_url(), "https://b");
    }

    #[test]
    fn test_best_base_url_skips_empty_and_handles_none() {
        let mut ch = channel_with_keys(vec![]);
        ch.base_urls = vec![BaseUrl { url: String::new(), delay: 1 }];
        assert_eq!(ch.best_base_url(), "");
        ch.base_urls.clear();
        assert_eq!(ch.best_base_url(), "");
    }

    #[test]
    fn test_select_key_lowest_cost() {
        let now = 10_000;
        let ch = channel_with_keys(vec![
            key(1, true, "k1", 200, now - 10, 5.0),
            key(2, true, "k2", 200, now - 10, 1.0),
            key(3, true, "k3", 200, now - 10, 3.0),
        ]);
        assert_eq!(ch.select_key(now).unwrap().id, 2);
    }

    #[test]
    fn test_select_key_suspends_recent_429() {
        let now = 10_000;
        let ch = channel_with_keys(vec![
            key(1, true, "k1", 429, now - 60, 0.0),
            key(2, true, "k2", 200, now - 60, 9.0),
        ]);
        // Cheapest key is rate-limit-suspended; the costlier key wins.
        assert_eq!(ch.select_key(now).unwrap().id, 2);
    }

    #[test]
    fn test_select_key_429_recovers_after_five_minutes() {
        let now = 10_000;
        let ch = channel_with_keys(vec![key(1, true, "k1", 429, now - KEY_SUSPEND_SECS, 0.0)]);
        assert_eq!(ch.select_key(now).unwrap().id, 1);
    }

    #[test]
    fn test_select_key_ignores_disabled_and_empty() {
        let now = 10_000;
        let ch = channel_with_keys(vec![
            key(1, false, "k1", 200, 0, 0.0),
            key(2, true, "", 200, 0, 0.0),
        ]);
        assert!(ch.select_key(now).is_none());
    }

    #[test]
    fn test_split_trim_compact() {
        assert_eq!(
            split_trim_compact(&["a, b, ,c,", "d"]),
            vec!["a", "b", "c", "d"]
        );
        assert!(split_trim_compact(&["", "  "]).is_empty());
    }

    #[test]
    fn test_stats_metrics_add() {
        let mut m = StatsMetrics::default();
        m.add(&StatsMetrics {
            input_token: 10,
            output_token: 5,
            input_cost: 0.1,
            output_cost: 0.2,
            wait_time: 100,
            request_success: 1,
            request_failed: 0,
        });
        m.add(&StatsMetrics {
            input_token: 1,
            request_failed: 1,
            ..Default::default()
        });
        assert_eq!(m.input_token, 11);
        assert_eq!(m.request_success, 1);
        assert_eq!(m.request_failed, 1);
        assert!((m.input_cost - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_provider_kind_compat() {
        assert!(ProviderKind::OpenAiEmbedding.supports_embedding());
        assert!(!ProviderKind::OpenAiEmbedding.supports_chat());
        for kind in [
            ProviderKind::OpenAiChat,
            ProviderKind::OpenAiResponse,
            ProviderKind::Anthropic,
            ProviderKind::Gemini,
            ProviderKind::Volcengine,
        ] {
            assert!(kind.supports_chat());
            assert!(!kind.supports_embedding());
        }
    }

    #[test]
    fn test_provider_kind_roundtrip() {
        for raw in 0..=5 {
            let kind = ProviderKind::try_from(raw).unwrap();
            assert_eq!(i64::from(kind), raw);
        }
        assert!(ProviderKind::try_from(6).is_err());
    }

    #[test]
    fn test_llm_price_flags() {
        let price = LlmPrice {
            billing: "request".into(),
            request: 0.02,
            ..Default::default()
        };
        assert!(price.is_per_request());
        assert!(price.is_zero());

        let price = LlmPrice {
            billing: "token".into(),
            input: 2.5,
            output: 10.0,
            ..Default::default()
        };
        assert!(!price.is_per_request());
        assert!(!price.is_zero());
    }
}
