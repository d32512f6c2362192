//! Octopus Gateway - main entry point.
//!
//! Boots the store, warms the caches, registers periodic tasks, and serves
//! the client-facing surface until SIGINT/SIGTERM; shutdown flushes every
//! in-memory cache under a 10-second deadline.

use std::time::Duration;

use anyhow::Context;
use tracing::{error, info};

use octopus_gateway::core::{logging, Config};
use octopus_gateway::{router, AppState, Services, Store};

fn main() -> anyhow::Result<()> {
    // Load .env before reading any environment variables.
    dotenvy::dotenv().ok();

    let config = Config::from_env();
    logging::init(config.debug);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    if let Err(e) = runtime.block_on(run(config)) {
        error!("startup failed: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let store = Store::connect(&config.database_url)
        .await
        .context("failed to open database")?;

    let services = Services::init(store)
        .await
        .context("failed to initialize caches")?;
    services.register_tasks();

    let state = AppState::new(services.clone(), config.clone());
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!("listening on {}", config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutting down, flushing caches");
    services.scheduler.shutdown();
    match tokio::time::timeout(Duration::from_secs(10), services.save_caches()).await {
        Ok(Ok(())) => info!("caches flushed"),
        Ok(Err(e)) => error!("failed to flush caches: {e}"),
        Err(_) => error!("cache flush timed out"),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
