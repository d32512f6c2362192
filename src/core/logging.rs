//! Logging initialization.
//!
//! Builds the tracing subscriber with an env-filter. `RUST_LOG` wins when
//! set; otherwise debug mode raises the crate's level to debug while keeping
//! hyper/reqwest noise at warn.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// Safe to call once at startup; later calls are ignored.
pub fn init(debug: bool) {
    let default_filter = if debug {
        "info,octopus_gateway=debug,hyper=warn,h2=warn,reqwest=warn"
    } else {
        "info,hyper=warn,h2=warn,reqwest=warn"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(debug))
        .try_init();
}
