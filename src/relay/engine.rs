//! Selection & retry engine.
//!
//! Drives a request through up to 3 rounds of channel attempts. Streaming
//! responses are committed lazily: nothing reaches the client until the
//! first transformed output arrives, so a first-token timeout or an early
//! upstream failure is still retry-eligible. Once any bytes have been
//! written the response is committed and later failures terminate the
//! stream without retry.

use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::core::error::AppError;
use crate::relay::balancer;
use crate::relay::metrics::RelayMetrics;
use crate::relay::sse::SseParser;
use crate::services::Services;
use crate::store::entities::{Channel, ChannelKey, GroupItem};

use crate::transformer::inbound::{Inbound, InboundKind};
use crate::transformer::outbound::{self, Outbound};
use crate::transformer::internal::InternalRequest;

const MAX_ROUNDS: i64 = 3;
/// Cap on captured upstream error bodies.
const MAX_ERROR_BODY: usize = 16 * 1024;

/// Headers never forwarded across the proxy boundary.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "authorization",
    "x-api-key",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
    "host",
    "accept-encoding",
];

/// Everything the ingress layer hands the engine for one request.
pub struct RelayRequest {
    pub kind: InboundKind,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub body: Bytes,
    pub api_key_id: i64,
    pub supported_models: String,
    pub max_sse_event_size: usize,
}

/// Relay one client request. Always returns a response; errors are
/// rendered through the shared error envelope.
pub async fn handle(services: Services, request: RelayRequest) -> Response {
    let mut inbound = request.kind.create();

    let mut internal = match inbound.decode_request(&request.body) {
        Ok(internal) => internal,
        Err(e) => return e.into_response(),
    };
    internal.query = request.query.clone();
    if let Err(e) = internal.validate() {
        return e.into_response();
    }

    // Per-key model allow-list.
    if !request.supported_models.is_empty() {
        let allowed = request
            .supported_models
            .split(',')
            .map(str::trim)
            .any(|m| m == internal.model);
        if !allowed {
            return AppError::ModelNotSupported.into_response();
        }
    }

    let mut metrics = RelayMetrics::new(&internal.model);
    metrics.set_internal_request(internal.clone());
    metrics.set_api_key_id(request.api_key_id);

    let Some(group) = services.groups.get_by_name(&internal.model) else {
        return AppError::ModelNotFound.into_response();
    };

    let item_count = group.items.len();
    let mut last_error: Option<String> = None;

    for round in 1..=MAX_ROUNDS {
        let Some(mut item) = balancer::select(group.mode, &group.items) else {
            return AppError::NoAvailableChannel.into_response();
        };

        for attempt_num in 1..=item_count as i64 {
            let attempt_start = Instant::now();

            match run_attempt(
                &services,
                &request,
                &mut inbound,
                &mut internal,
                &mut metrics,
                group.first_token_time_out,
                &item,
                round,
                attempt_num,
                attempt_start,
            )
            .await
            {
                AttemptOutcome::Committed(response) => return response,
                AttemptOutcome::Success {
                    status,
                    response,
                    used_key,
                } => {
                    let duration = attempt_start.elapsed().as_millis() as i64;
                    metrics.add_attempt(round, attempt_num, true, None, duration);
                    if let Some(full) = inbound.internal_response() {
                        metrics.set_internal_response(&services, full).await;
                    }
                    finish_key(
                        &services,
                        used_key,
                        status,
                        metrics.stats.input_cost + metrics.stats.output_cost,
                    );
                    metrics.save(&services, true, None, round).await;
                    return response;
                }
                AttemptOutcome::Failed { status, error, used_key } => {
                    let duration = attempt_start.elapsed().as_millis() as i64;
                    warn!(
                        "channel attempt failed (round {round}/{MAX_ROUNDS}, attempt {attempt_num}/{item_count}): {error}"
                    );
                    metrics.add_attempt(round, attempt_num, false, Some(&error), duration);
                    if let Some(key) = used_key {
                        finish_key(&services, key, status, 0.0);
                    }
                    last_error = Some(format!("channel {} failed: {error}", metrics.channel_name));
                }
            }

            match balancer::next(group.mode, &group.items, &item) {
                Some(next_item) => item = next_item,
                None => break,
            }
        }
    }

    metrics
        .save(&services, false, last_error.as_deref(), 0)
        .await;
    AppError::AllChannelsFailed.into_response()
}

enum AttemptOutcome {
    /// Non-stream success, or a stream that ended before any output.
    Success {
        status: u16,
        response: Response,
        used_key: ChannelKey,
    },
    /// A streaming response has been committed; bookkeeping happens in the
    /// pump task.
    Committed(Response),
    Failed {
        status: u16,
        error: String,
        used_key: Option<ChannelKey>,
    },
}

#[allow(clippy::too_many_arguments)]
async fn run_attempt(
    services: &Services,
    request: &RelayRequest,
    inbound: &mut Box<dyn Inbound>,
    internal: &mut InternalRequest,
    metrics: &mut RelayMetrics,
    first_token_timeout_secs: i64,
    item: &GroupItem,
    round: i64,
    attempt_num: i64,
    attempt_start: Instant,
) -> AttemptOutcome {
    let fail = |error: String| AttemptOutcome::Failed {
        status: 0,
        error,
        used_key: None,
    };

    // Re-fetch the channel; it may have been disabled or deleted between
    // attempts.
    let Some(channel) = services.channels.get(item.channel_id) else {
        return fail(format!("channel {} not found", item.channel_id));
    };
    if !channel.enabled {
        return fail(format!("channel {} is disabled", channel.name));
    }

    info!(
        "request model {}, mode: {:?}, forwarding to channel: {} model: {} (round {round}, attempt {attempt_num})",
        metrics.request_model, channel.kind, channel.name, item.model_name
    );

    // Rebind to the per-channel model name.
    internal.model = item.model_name.clone();
    metrics.set_channel(channel.id, &channel.name, &item.model_name);

    // Channel-format compatibility.
    if internal.is_embedding_request() && !channel.kind.supports_embedding() {
        return fail(format!(
            "channel kind {:?} not compatible with embedding request",
            channel.kind
        ));
    }
    if internal.is_chat_request() && !channel.kind.supports_chat() {
        return fail(format!(
            "channel kind {:?} not compatible with chat request",
            channel.kind
        ));
    }

    let mut outbound_codec = outbound::create(channel.kind);

    let Some(used_key) = channel.select_key(chrono::Utc::now().timestamp()) else {
        return fail(format!("channel {} has no available key", channel.name));
    };

    // Charge before dispatch; an issued request is paid for even if it is
    // interrupted.
    metrics.estimate_and_deduct(services).await;

    let upstream = match outbound_codec.encode_request(internal, channel.best_base_url(), &used_key.key)
    {
        Ok(upstream) => upstream,
        Err(e) => return fail(format!("failed to create request: {e}")),
    };

    let client = match services.channel_http_client(&channel) {
        Ok(client) => client,
        Err(e) => return fail(format!("failed to get http client: {e}")),
    };

    let headers = build_headers(&upstream.headers, &request.headers, &channel);
    let response = match client
        .post(&upstream.url)
        .headers(headers)
        .body(upstream.body.clone())
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            return AttemptOutcome::Failed {
                status: 0,
                error: format!("failed to send request: {e}"),
                used_key: Some(used_key),
            }
        }
    };

    let status = response.status().as_u16();
    if !(200..300).contains(&status) {
        let body = read_bounded(response).await;
        return AttemptOutcome::Failed {
            status,
            error: format!("upstream error: {status}: {body}"),
            used_key: Some(used_key),
        };
    }

    if internal.is_streaming() {
        handle_stream(
            services,
            inbound,
            outbound_codec,
            metrics,
            response,
            used_key,
            first_token_timeout_secs,
            request.max_sse_event_size,
            round,
            attempt_num,
            attempt_start,
        )
        .await
    } else {
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                return AttemptOutcome::Failed {
                    status,
                    error: format!("failed to read response body: {e}"),
                    used_key: Some(used_key),
                }
            }
        };
        let decoded = match outbound_codec.decode_response(status, &body) {
            Ok(decoded) => decoded,
            Err(e) => {
                return AttemptOutcome::Failed {
                    status,
                    error: format!("failed to transform outbound response: {e}"),
                    used_key: Some(used_key),
                }
            }
        };
        let encoded = match inbound.encode_response(decoded) {
            Ok(encoded) => encoded,
            Err(e) => {
                return AttemptOutcome::Failed {
                    status,
                    error: format!("failed to transform inbound response: {e}"),
                    used_key: Some(used_key),
                }
            }
        };

        let response = (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            encoded,
        )
            .into_response();
        AttemptOutcome::Success {
            status,
            response,
            used_key,
        }
    }
}

/// Merge headers for the upstream request: codec headers first, then the
/// client's headers filtered by the hop-by-hop list, then the channel's
/// custom headers last. Later layers replace earlier ones.
fn build_headers(
    codec_headers: &[(String, String)],
    client_headers: &HeaderMap,
    channel: &Channel,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in codec_headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    for (name, value) in client_headers {
        if HOP_BY_HOP_HEADERS.contains(&name.as_str().to_lowercase().as_str()) {
            continue;
        }
        headers.insert(name.clone(), value.clone());
    }
    for custom in &channel.custom_header {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(custom.header_key.as_bytes()),
            HeaderValue::from_str(&custom.header_value),
        ) {
            headers.insert(name, value);
        }
    }
    headers
}

async fn read_bounded(response: reqwest::Response) -> String {
    let mut collected: Vec<u8> = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(Ok(chunk)) = stream.next().await {
        let remaining = MAX_ERROR_BODY.saturating_sub(collected.len());
        if remaining == 0 {
            break;
        }
        collected.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
    }
    String::from_utf8_lossy(&collected).into_owned()
}

/// Persist key bookkeeping after an attempt: last observed status, last
/// use, and accrued cost on success.
fn finish_key(services: &Services, mut key: ChannelKey, status: u16, cost: f64) {
    key.status_code = status as i64;
    key.last_use_time_stamp = chrono::Utc::now().timestamp();
    key.total_cost += cost;
    if let Err(e) = services.channels.key_update(key) {
        warn!("failed to update channel key: {e}");
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_stream(
    services: &Services,
    inbound: &mut Box<dyn Inbound>,
    mut outbound_codec: Box<dyn Outbound>,
    metrics: &mut RelayMetrics,
    response: reqwest::Response,
    used_key: ChannelKey,
    first_token_timeout_secs: i64,
    max_sse_event_size: usize,
    round: i64,
    attempt_num: i64,
    attempt_start: Instant,
) -> AttemptOutcome {
    let status = response.status().as_u16();

    // Some upstreams return a JSON body despite a stream request; that is a
    // failure, not a stream.
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    if !content_type.is_empty() && !content_type.to_lowercase().contains("text/event-stream") {
        let body = read_bounded(response).await;
        return AttemptOutcome::Failed {
            status,
            error: format!(
                "upstream returned non-SSE content-type {content_type:?} for stream request: {body}"
            ),
            used_key: Some(used_key),
        };
    }

    let mut parser = SseParser::new(max_sse_event_size);
    let mut byte_stream = response.bytes_stream();

    // The first-token clock runs until the first transformed output; it
    // only guards the uncommitted phase.
    let deadline = (first_token_timeout_secs > 0)
        .then(|| Instant::now() + Duration::from_secs(first_token_timeout_secs as u64));

    // Uncommitted phase: look for the first client-visible bytes.
    let first_output: Option<Vec<u8>> = loop {
        let chunk = if let Some(deadline) = deadline {
            match tokio::time::timeout_at(deadline.into(), byte_stream.next()).await {
                Ok(chunk) => chunk,
                Err(_) => {
                    // Nothing written yet: abort upstream and let the
                    // caller retry the next channel.
                    return AttemptOutcome::Failed {
                        status,
                        error: format!("first token timeout ({first_token_timeout_secs}s)"),
                        used_key: Some(used_key),
                    };
                }
            }
        } else {
            byte_stream.next().await
        };

        match chunk {
            None => break None,
            Some(Err(e)) => {
                return AttemptOutcome::Failed {
                    status,
                    error: format!("failed to read stream event: {e}"),
                    used_key: Some(used_key),
                };
            }
            Some(Ok(bytes)) => {
                parser.push(&bytes);
                match drain_events(&mut parser, &mut outbound_codec, inbound) {
                    Ok(Some(output)) => break Some(output),
                    Ok(None) => continue,
                    Err(e) => {
                        return AttemptOutcome::Failed {
                            status,
                            error: e,
                            used_key: Some(used_key),
                        };
                    }
                }
            }
        }
    };

    let Some(first_output) = first_output else {
        // Upstream ended without producing output; nothing was written, so
        // treat it as a completed (empty) stream.
        info!("stream end");
        return AttemptOutcome::Success {
            status,
            response: sse_response(Body::empty()),
            used_key,
        };
    };

    metrics.mark_first_token();

    // Committed: from here on failures terminate without retry. The pump
    // task owns the codecs and finishes the bookkeeping.
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    let _ = tx.send(Bytes::from(first_output)).await;

    let services = services.clone();
    let mut inbound = std::mem::replace(inbound, InboundKind::OpenAiChat.create());
    let mut metrics = std::mem::replace(metrics, RelayMetrics::new(""));

    tokio::spawn(async move {
        let mut failure: Option<String> = None;

        'pump: while let Some(chunk) = byte_stream.next().await {
            match chunk {
                Err(e) => {
                    failure = Some(format!("failed to read stream event: {e}"));
                    break;
                }
                Ok(bytes) => {
                    parser.push(&bytes);
                    loop {
                        match next_output(&mut parser, &mut outbound_codec, &mut inbound) {
                            Ok(Some(Some(output))) => {
                                if tx.send(Bytes::from(output)).await.is_err() {
                                    // Client went away; stop reading.
                                    info!("client disconnected, stopping stream");
                                    break 'pump;
                                }
                            }
                            Ok(Some(None)) => continue,
                            Ok(None) => break,
                            Err(e) => {
                                failure = Some(e);
                                break 'pump;
                            }
                        }
                    }
                }
            }
        }
        drop(tx);

        if let Some(full) = inbound.internal_response() {
            metrics.set_internal_response(&services, full).await;
        }

        let duration = attempt_start.elapsed().as_millis() as i64;
        match failure {
            Some(error) => {
                // Committed stream died mid-flight: no retry, round 0.
                warn!("stream failed after commit: {error}");
                metrics.add_attempt(round, attempt_num, false, Some(&error), duration);
                finish_key(&services, used_key, status, 0.0);
                metrics.save(&services, false, Some(&error), 0).await;
            }
            None => {
                info!("stream end");
                metrics.add_attempt(round, attempt_num, true, None, duration);
                finish_key(
                    &services,
                    used_key,
                    status,
                    metrics.stats.input_cost + metrics.stats.output_cost,
                );
                metrics.save(&services, true, None, round).await;
            }
        }
    });

    let body_stream = futures::stream::unfold(rx, |mut rx| async {
        rx.recv()
            .await
            .map(|bytes| (Ok::<_, std::convert::Infallible>(bytes), rx))
    });
    AttemptOutcome::Committed(sse_response(Body::from_stream(body_stream)))
}

/// Pull buffered events through both codecs until the first client-visible
/// output (uncommitted phase). `Ok(None)` means the buffer ran dry.
fn drain_events(
    parser: &mut SseParser,
    outbound_codec: &mut Box<dyn Outbound>,
    inbound: &mut Box<dyn Inbound>,
) -> Result<Option<Vec<u8>>, String> {
    loop {
        match next_output(parser, outbound_codec, inbound) {
            Ok(Some(Some(output))) => return Ok(Some(output)),
            Ok(Some(None)) => continue,
            Ok(None) => return Ok(None),
            Err(e) => return Err(e),
        }
    }
}

/// One step of the event pipeline. Outer `None`: no complete frame
/// buffered. Inner `None`: the frame produced no client output.
fn next_output(
    parser: &mut SseParser,
    outbound_codec: &mut Box<dyn Outbound>,
    inbound: &mut Box<dyn Inbound>,
) -> Result<Option<Option<Vec<u8>>>, String> {
    let Some(event) = parser
        .next_event()
        .map_err(|e| format!("failed to read stream event: {e}"))?
    else {
        return Ok(None);
    };

    let Some(chunk) = outbound_codec
        .decode_stream_event(event.as_bytes())
        .map_err(|e| format!("failed to transform stream: {e}"))?
    else {
        return Ok(Some(None));
    };

    let output = inbound
        .encode_stream_event(chunk)
        .map_err(|e| format!("failed to transform stream: {e}"))?;
    Ok(Some(output.filter(|o| !o.is_empty())))
}

fn sse_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(body)
        .unwrap()
}
