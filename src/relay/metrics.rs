//! Per-request billing and telemetry.
//!
//! A [`RelayMetrics`] record straddles every attempt of one request. Cost
//! is deducted up-front from an estimate the moment an attempt is
//! dispatched, then reconciled against measured usage when the response
//! lands; the difference is written to the same five buckets, split
//! proportionally between input and output.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::core::tokenizer::count_tokens;
use crate::services::Services;
use crate::store::entities::{ChannelAttempt, RelayLog, StatsMetrics};
use crate::transformer::internal::{
    ContentPart, ImageUrl, InternalRequest, InternalResponse, MessageContent,
};

/// Floor for estimated costs, dollars.
const MIN_ESTIMATED_COST: f64 = 0.0001;

pub struct RelayMetrics {
    pub channel_id: i64,
    pub api_key_id: i64,
    pub channel_name: String,
    pub request_model: String,
    pub actual_model: String,
    start_time: Instant,
    start_unix: i64,
    first_token_at: Option<Instant>,

    pub internal_request: Option<InternalRequest>,
    pub internal_response: Option<InternalResponse>,

    pub stats: StatsMetrics,

    estimated_cost: f64,
    cost_deducted: bool,

    pub attempts: Vec<ChannelAttempt>,
}

impl RelayMetrics {
    pub fn new(request_model: &str) -> Self {
        Self {
            channel_id: 0,
            api_key_id: 0,
            channel_name: String::new(),
            request_model: request_model.to_string(),
            actual_model: String::new(),
            start_time: Instant::now(),
            start_unix: chrono::Utc::now().timestamp(),
            first_token_at: None,
            internal_request: None,
            internal_response: None,
            stats: StatsMetrics::default(),
            estimated_cost: 0.0,
            cost_deducted: false,
            attempts: Vec::new(),
        }
    }

    pub fn set_api_key_id(&mut self, api_key_id: i64) {
        self.api_key_id = api_key_id;
    }

    pub fn set_channel(&mut self, channel_id: i64, channel_name: &str, actual_model: &str) {
        self.channel_id = channel_id;
        self.channel_name = channel_name.to_string();
        self.actual_model = actual_model.to_string();
    }

    pub fn set_internal_request(&mut self, request: InternalRequest) {
        self.internal_request = Some(request);
    }

    pub fn mark_first_token(&mut self) {
        if self.first_token_at.is_none() {
            self.first_token_at = Some(Instant::now());
        }
    }

    pub fn add_attempt(
        &mut self,
        round: i64,
        attempt_num: i64,
        success: bool,
        error: Option<&str>,
        duration_ms: i64,
    ) {
        self.attempts.push(ChannelAttempt {
            channel_id: self.channel_id,
            channel_name: self.channel_name.clone(),
            model_name: self.actual_model.clone(),
            round,
            attempt_num,
            success,
            error: error.unwrap_or_default().to_string(),
            duration: duration_ms,
        });
    }

    /// Charge the estimated cost before the upstream request is issued.
    /// Once a request is dispatched it must be paid for even if it is
    /// later interrupted. Idempotent per record.
    pub async fn estimate_and_deduct(&mut self, services: &Services) {
        if self.cost_deducted {
            return;
        }

        self.estimated_cost = match services.prices.price_for(&self.actual_model) {
            None => MIN_ESTIMATED_COST,
            Some(price) if price.is_per_request() => price.request,
            Some(price) => {
                // Assume at least 100 input and 50 output tokens so most
                // requests need only a small adjustment later.
                let estimate = (100.0 * price.input + 50.0 * price.output) * 1e-6;
                estimate.max(MIN_ESTIMATED_COST)
            }
        };

        self.stats.input_cost = self.estimated_cost;
        self.stats.output_cost = 0.0;

        let delta = StatsMetrics {
            input_cost: self.estimated_cost,
            ..Default::default()
        };
        self.apply_to_buckets(services, &delta).await;
        self.cost_deducted = true;

        debug!(
            "upfront cost deducted: channel {}, model {}, estimated cost: {}",
            self.channel_id, self.actual_model, self.estimated_cost
        );
    }

    /// Record the response and reconcile billing against its usage.
    pub async fn set_internal_response(
        &mut self,
        services: &Services,
        response: InternalResponse,
    ) {
        let usage = response.usage.clone();
        self.internal_response = Some(response);

        let Some(usage) = usage else { return };
        self.stats.input_token = usage.prompt_tokens;
        self.stats.output_token = usage.completion_tokens;

        let Some(price) = services.prices.price_for(&self.actual_model) else {
            return;
        };

        let (actual_input, actual_output) = if price.is_per_request() {
            (price.request, 0.0)
        } else {
            let cached = usage.cached_tokens() as f64;
            let prompt = usage.prompt_tokens as f64;
            let completion = usage.completion_tokens as f64;
            let input = if usage.anthropic_usage {
                // Anthropic reports prompt tokens exclusive of cache reads
                // and bills cache writes separately.
                (cached * price.cache_read
                    + prompt * price.input
                    + usage.cache_creation_input_tokens as f64 * price.cache_write)
                    * 1e-6
            } else {
                (cached * price.cache_read + (prompt - cached) * price.input) * 1e-6
            };
            (input, completion * price.output * 1e-6)
        };

        if self.cost_deducted {
            let difference = (actual_input + actual_output) - self.estimated_cost;
            self.stats.input_cost = actual_input;
            self.stats.output_cost = actual_output;

            if difference != 0.0 {
                let total_actual = actual_input + actual_output;
                let (input_diff, output_diff) = if total_actual > 0.0 {
                    // Split the adjustment by each side's share of the
                    // actual cost.
                    (
                        difference * (actual_input / total_actual),
                        difference * (actual_output / total_actual),
                    )
                } else {
                    // Zero actual cost: refund the whole estimate on input.
                    (difference, 0.0)
                };
                let delta = StatsMetrics {
                    input_cost: input_diff,
                    output_cost: output_diff,
                    ..Default::default()
                };
                self.apply_to_buckets(services, &delta).await;
            }
        } else {
            self.stats.input_cost = actual_input;
            self.stats.output_cost = actual_output;
        }
    }

    /// Persist stats and the relay log for this request.
    /// `successful_round` is 0 iff the request terminally failed.
    pub async fn save(
        &mut self,
        services: &Services,
        success: bool,
        error: Option<&str>,
        successful_round: i64,
    ) {
        let duration_ms = self.start_time.elapsed().as_millis() as i64;

        self.resolve_missing_stats(services);
        self.save_stats(services, success, duration_ms).await;
        self.save_log(services, error, duration_ms, successful_round)
            .await;
    }

    /// Approximate whatever usage never arrived: tokens from the text of
    /// the request/response, costs from the price table.
    fn resolve_missing_stats(&mut self, services: &Services) {
        if self.stats.input_token == 0 {
            if let Some(request) = &self.internal_request {
                self.stats.input_token =
                    count_tokens(&request.all_text(), &self.actual_model) as i64;
            }
        }
        if self.stats.output_token == 0 {
            if let Some(response) = &self.internal_response {
                self.stats.output_token =
                    count_tokens(&response.all_text(), &self.actual_model) as i64;
            }
        }

        let Some(price) = services.prices.price_for(&self.actual_model) else {
            return;
        };
        if price.is_per_request() {
            self.stats.input_cost = price.request;
            self.stats.output_cost = 0.0;
            return;
        }
        if self.stats.input_cost == 0.0 && self.stats.input_token > 0 {
            self.stats.input_cost = self.stats.input_token as f64 * price.input * 1e-6;
        }
        if self.stats.output_cost == 0.0 && self.stats.output_token > 0 {
            self.stats.output_cost = self.stats.output_token as f64 * price.output * 1e-6;
        }
    }

    async fn save_stats(&mut self, services: &Services, success: bool, duration_ms: i64) {
        // Costs were already written at deduction/reconciliation time.
        let delta = StatsMetrics {
            input_token: self.stats.input_token,
            output_token: self.stats.output_token,
            wait_time: duration_ms,
            request_success: success as i64,
            request_failed: !success as i64,
            ..Default::default()
        };
        self.apply_to_buckets(services, &delta).await;

        info!(
            "channel: {}, model: {}, success: {}, wait time: {}, input token: {}, output token: {}, input cost: {}, output cost: {}, total cost: {}",
            self.channel_id,
            self.actual_model,
            success,
            duration_ms,
            self.stats.input_token,
            self.stats.output_token,
            self.stats.input_cost,
            self.stats.output_cost,
            self.stats.input_cost + self.stats.output_cost,
        );
    }

    async fn save_log(
        &mut self,
        services: &Services,
        error: Option<&str>,
        duration_ms: i64,
        successful_round: i64,
    ) {
        let mut log = RelayLog {
            time: self.start_unix,
            request_model_name: self.request_model.clone(),
            channel_id: self.channel_id,
            channel_name: self.channel_name.clone(),
            actual_model_name: self.actual_model.clone(),
            use_time: duration_ms,
            attempts: self.attempts.clone(),
            total_attempts: self.attempts.len() as i64,
            successful_round,
            error: error.unwrap_or_default().to_string(),
            ..Default::default()
        };

        if let Some(first_token_at) = self.first_token_at {
            log.ftut = first_token_at.duration_since(self.start_time).as_millis() as i64;
        }

        if let Some(usage) = self
            .internal_response
            .as_ref()
            .and_then(|r| r.usage.as_ref())
        {
            log.input_tokens = usage.prompt_tokens;
            log.output_tokens = usage.completion_tokens;
            log.cost = self.stats.input_cost + self.stats.output_cost;
        }

        if let Some(request) = &self.internal_request {
            if let Ok(json) = serde_json::to_string(request) {
                log.request_content = json;
            }
        }
        if let Some(response) = &self.internal_response {
            log.response_content = serialize_response_for_log(response);
        }

        if let Err(e) = services.relay_log.add(log).await {
            warn!("failed to save relay log: {e}");
        }
    }

    async fn apply_to_buckets(&self, services: &Services, delta: &StatsMetrics) {
        let displaced = services
            .stats
            .update_all(self.channel_id, self.api_key_id, delta);
        if let Some(displaced) = displaced {
            // Yesterday's total must be durable before its slot is reused.
            if let Err(e) = services.stats.flush_with_daily(Some(displaced)).await {
                warn!("failed to persist displaced daily stats: {e}");
            }
        }
    }

    /// The estimated cost charged up-front.
    pub fn estimated_cost(&self) -> f64 {
        self.estimated_cost
    }
}

/// Serialize a response for storage: image payloads are stripped (images
/// cleared, non-empty image URLs replaced with a placeholder) and
/// Anthropic-billed usage gets its cache-write count spliced back in.
fn serialize_response_for_log(response: &InternalResponse) -> String {
    let mut filtered = response.clone();
    for choice in &mut filtered.choices {
        for message in [choice.message.as_mut(), choice.delta.as_mut()]
            .into_iter()
            .flatten()
        {
            message.images.clear();
            if let Some(MessageContent::Parts(parts)) = &mut message.content {
                for part in parts {
                    if part.kind == "image_url" {
                        if let Some(image) = &part.image_url {
                            if !image.url.is_empty() {
                                *part = ContentPart {
                                    kind: "image_url".to_string(),
                                    image_url: Some(ImageUrl {
                                        url: "[image data omitted for storage]".to_string(),
                                        detail: None,
                                    }),
                                    ..Default::default()
                                };
                            }
                        }
                    }
                }
            }
        }
    }

    let Ok(json) = serde_json::to_string(&filtered) else {
        return String::new();
    };

    match &response.usage {
        Some(usage) if usage.anthropic_usage => json.replacen(
            "\"usage\":{",
            &format!(
                "\"usage\":{{\"cache_creation_input_tokens\":{},",
                usage.cache_creation_input_tokens
            ),
            1,
        ),
        _ => json,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::entities::{LlmInfo, LlmPrice};
    use crate::store::Store;
    use crate::transformer::internal::{Choice, Message, Usage};

    async fn services_with_price(price: LlmPrice) -> Services {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let services = Services::init(store).await.unwrap();
        services
            .store
            .insert_llm_infos(&[LlmInfo {
                name: "m".into(),
                price,
            }])
            .await
            .unwrap();
        services.prices.refresh().await.unwrap();
        services
    }

    fn token_price() -> LlmPrice {
        LlmPrice {
            billing: "token".into(),
            input: 1.0,
            output: 2.0,
            cache_read: 0.1,
            cache_write: 1.25,
            ..Default::default()
        }
    }

    fn metrics() -> RelayMetrics {
        let mut m = RelayMetrics::new("m");
        m.set_api_key_id(3);
        m.set_channel(7, "up", "m");
        m
    }

    #[tokio::test]
    async fn test_deduction_is_idempotent() {
        let services = services_with_price(token_price()).await;
        let mut m = metrics();
        m.estimate_and_deduct(&services).await;
        let estimated = m.estimated_cost();
        m.estimate_and_deduct(&services).await;

        // A second call must not deduct again.
        let total = services.stats.total();
        assert!((total.metrics.input_cost - estimated).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_unknown_model_uses_minimum_estimate() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let services = Services::init(store).await.unwrap();
        let mut m = metrics();
        m.estimate_and_deduct(&services).await;
        assert!((m.estimated_cost() - MIN_ESTIMATED_COST).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_per_request_billing_estimate() {
        let services = services_with_price(LlmPrice {
            billing: "request".into(),
            request: 0.02,
            ..Default::default()
        })
        .await;
        let mut m = metrics();
        m.estimate_and_deduct(&services).await;
        assert!((m.estimated_cost() - 0.02).abs() < 1e-12);
    }

    fn response_with_usage(usage: Usage) -> InternalResponse {
        InternalResponse {
            id: "r".into(),
            object: "chat.completion".into(),
            model: "m".into(),
            choices: vec![Choice {
                index: 0,
                message: Some(Message {
                    role: "assistant".into(),
                    content: Some(MessageContent::text("out")),
                    ..Default::default()
                }),
                finish_reason: Some("stop".into()),
                ..Default::default()
            }],
            usage: Some(usage),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_reconciliation_adjusts_buckets_to_actual() {
        let services = services_with_price(token_price()).await;
        let mut m = metrics();
        m.estimate_and_deduct(&services).await;

        m.set_internal_response(
            &services,
            response_with_usage(Usage {
                prompt_tokens: 1000,
                completion_tokens: 500,
                total_tokens: 1500,
                ..Default::default()
            }),
        )
        .await;

        // actual = 1000*1.0e-6 + 500*2.0e-6 = 0.002
        assert!((m.stats.input_cost - 0.001).abs() < 1e-12);
        assert!((m.stats.output_cost - 0.001).abs() < 1e-12);

        // Buckets carry estimate + diff = actual.
        let total = services.stats.total();
        let bucket_cost = total.metrics.input_cost + total.metrics.output_cost;
        assert!((bucket_cost - 0.002).abs() < 1e-9, "bucket cost {bucket_cost}");
    }

    #[tokio::test]
    async fn test_reconciliation_anthropic_usage_formula() {
        let services = services_with_price(token_price()).await;
        let mut m = metrics();
        m.estimate_and_deduct(&services).await;

        let usage = Usage {
            prompt_tokens: 1000,
            completion_tokens: 100,
            total_tokens: 1100,
            prompt_tokens_details: Some(crate::transformer::internal::PromptTokensDetails {
                cached_tokens: 200,
                ..Default::default()
            }),
            anthropic_usage: true,
            cache_creation_input_tokens: 400,
            ..Default::default()
        };
        m.set_internal_response(&services, response_with_usage(usage))
            .await;

        // (200*0.1 + 1000*1.0 + 400*1.25) * 1e-6 = 0.00152
        assert!((m.stats.input_cost - 0.00152).abs() < 1e-12);
        // 100 * 2.0e-6
        assert!((m.stats.output_cost - 0.0002).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_openai_cached_tokens_formula() {
        let services = services_with_price(token_price()).await;
        let mut m = metrics();
        m.estimate_and_deduct(&services).await;

        let usage = Usage {
            prompt_tokens: 1000,
            completion_tokens: 0,
            total_tokens: 1000,
            prompt_tokens_details: Some(crate::transformer::internal::PromptTokensDetails {
                cached_tokens: 400,
                ..Default::default()
            }),
            ..Default::default()
        };
        m.set_internal_response(&services, response_with_usage(usage))
            .await;

        // (400*0.1 + 600*1.0) * 1e-6
        assert!((m.stats.input_cost - 0.00064).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_no_usage_keeps_estimate_and_counts_tokens() {
        let services = services_with_price(token_price()).await;
        let mut m = metrics();
        m.set_internal_request(InternalRequest {
            model: "m".into(),
            messages: vec![Message {
                role: "user".into(),
                content: Some(MessageContent::text("some request text here")),
                ..Default::default()
            }],
            ..Default::default()
        });
        m.estimate_and_deduct(&services).await;
        let estimated = m.estimated_cost();

        // Stream died before usage arrived.
        m.save(&services, false, Some("connection reset"), 0).await;

        assert!((m.stats.input_cost - estimated).abs() < 1e-12);
        assert!(m.stats.input_token > 0);

        let logs = services.relay_log.query(None, 1, 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].successful_round, 0);
        assert_eq!(logs[0].error, "connection reset");
    }

    #[tokio::test]
    async fn test_save_appends_exactly_one_log_with_attempts() {
        let services = services_with_price(token_price()).await;
        let mut m = metrics();
        m.add_attempt(1, 1, false, Some("upstream error"), 120);
        m.set_channel(8, "up2", "m");
        m.add_attempt(1, 2, true, None, 80);
        m.set_internal_response(
            &services,
            response_with_usage(Usage {
                prompt_tokens: 5,
                completion_tokens: 2,
                total_tokens: 7,
                ..Default::default()
            }),
        )
        .await;
        m.save(&services, true, None, 1).await;

        let logs = services.relay_log.query(None, 1, 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].total_attempts, 2);
        assert_eq!(logs[0].successful_round, 1);
        assert_eq!(logs[0].attempts[0].channel_id, 7);
        assert_eq!(logs[0].attempts[1].channel_id, 8);
        assert_eq!(logs[0].channel_id, 8);
    }

    #[test]
    fn test_response_log_filter_strips_images() {
        let response = InternalResponse {
            choices: vec![Choice {
                index: 0,
                message: Some(Message {
                    role: "assistant".into(),
                    content: Some(MessageContent::Parts(vec![
                        ContentPart::text_part("here"),
                        ContentPart::image_part("data:image/png;base64,HUGE"),
                    ])),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        };
        let json = serialize_response_for_log(&response);
        assert!(!json.contains("HUGE"));
        assert!(json.contains("[image data omitted for storage]"));
    }

    #[test]
    fn test_response_log_splices_anthropic_cache_write() {
        let response = response_with_usage(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
            anthropic_usage: true,
            cache_creation_input_tokens: 77,
            ..Default::default()
        });
        let json = serialize_response_for_log(&response);
        assert!(json.contains("\"cache_creation_input_tokens\":77"));
    }
}
