//! Request relay: group selection, retry, billing, and stream pumping.

pub mod balancer;
pub mod engine;
pub mod metrics;
pub mod sse;

pub use engine::{handle, RelayRequest};
pub use metrics::RelayMetrics;
