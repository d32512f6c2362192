//! Octopus Gateway - a multi-tenant LLM gateway.
//!
//! Fronts heterogeneous LLM provider APIs (OpenAI Chat Completions, OpenAI
//! Responses, OpenAI Embeddings, Anthropic Messages, Google Gemini,
//! Volcengine Responses) behind one API-key-authenticated OpenAI- or
//! Anthropic-compatible surface.
//!
//! # Architecture
//!
//! - [`transformer`]: bidirectional codecs between the internal normalized
//!   request/response and each provider's wire format, including the
//!   streaming state machines
//! - [`relay`]: group → channel → key selection, the 3-round retry engine
//!   with streaming-aware failover, and per-request billing
//! - [`services`]: write-through in-memory caches for channels, keys,
//!   groups, API keys, settings, and prices, plus the stats buckets and the
//!   relay-log ring
//! - [`store`]: the authoritative sqlx/SQLite store with versioned
//!   migrations
//! - [`api`]: the API-key-authenticated ingress surface
//! - [`core`]: configuration, errors, logging, the sharded cache, the task
//!   scheduler, outbound HTTP clients, and token counting

pub mod api;
pub mod core;
pub mod relay;
pub mod services;
pub mod store;
pub mod transformer;

pub use api::{router, AppState};
pub use core::{AppError, Config, Result};
pub use services::Services;
pub use store::Store;
