//! Junction - Entry Point
//!
//! Starts the proxy listeners, latency probes, record sink and control API
//! with graceful shutdown support.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use junction::api::server::AppState;
use junction::api::ApiServer;
use junction::config::{Config, LogConfig};
use junction::models::Profile;
use junction::proxy::ProxyServer;
use junction::services::RecordRegistry;

#[tokio::main]
async fn main() -> junction::Result<()> {
    let config = Config::from_env()?;
    let profile = Profile::load(&config.profile_path)?;

    init_tracing(&config.log, &profile.general.logger_level);
    info!("Starting Junction");
    info!("Profile loaded from {}", config.profile_path.display());

    let (shutdown_tx, _) = watch::channel(false);

    // Record pipeline
    let (records, sink) = RecordRegistry::channel(config.records.queue_size, config.records.history);
    let store = sink.store();
    let sink_task = tokio::spawn(sink.run(shutdown_tx.subscribe()));

    let proxy_server = ProxyServer::build(&profile, &config.proxy, records)?;

    // Latency probes for rtt groups
    let prober = Arc::new(proxy_server.latency_prober()?);
    let probe_tasks = prober.spawn_all(shutdown_tx.subscribe());
    info!("Started {} latency probe task(s)", probe_tasks.len());

    let api_task = if config.api.enabled {
        let state = AppState::new(
            proxy_server.router().resolver().clone(),
            store,
            proxy_server.handler().pump().clone(),
        );
        let api_server = ApiServer::new(config.api.clone(), state);
        let api_shutdown = shutdown_tx.subscribe();
        info!("API enabled on {}", config.api_addr());
        Some(tokio::spawn(async move {
            if let Err(e) = api_server.run(api_shutdown).await {
                error!("API server error: {}", e);
            }
        }))
    } else {
        warn!("API server disabled");
        None
    };

    let proxy_shutdown = shutdown_tx.subscribe();
    let proxy_task = tokio::spawn(async move {
        if let Err(e) = proxy_server.run(proxy_shutdown).await {
            error!("Proxy server error: {}", e);
        }
    });

    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);

    let _ = proxy_task.await;
    if let Some(api_task) = api_task {
        let _ = api_task.await;
    }
    for task in probe_tasks {
        let _ = task.await;
    }
    let _ = sink_task.await;

    info!("Junction stopped");
    Ok(())
}

/// RUST_LOG wins, then LOG_LEVEL, then the profile's logger level
fn init_tracing(log: &LogConfig, profile_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = log.level.as_deref().unwrap_or(profile_level);
        EnvFilter::try_new(format!("junction={},tower_http=info", level))
            .unwrap_or_else(|_| EnvFilter::new("junction=info,tower_http=info"))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
