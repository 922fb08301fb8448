use std::time::Duration;

use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use bifrost::config::{self, Config};
use bifrost::metrics;
use bifrost::worker::Workers;
use bifrost::Runtime;

/// How long shutdown waits for workers and monitors to drain
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = load_config();
    let threads = config.global.threads;
    let metrics_port = config.global.metrics_port;

    let runtime = match Runtime::build(config) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Refusing to start");
            std::process::exit(1);
        }
    };

    if metrics_port != 0 {
        let addr = format!("0.0.0.0:{}", metrics_port);
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(&addr).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    let mut monitors = Vec::new();
    for monitor in runtime.monitors {
        monitors.push(monitor.start());
    }

    let workers = Workers::start(threads, &runtime.listen_points)?;

    // Load balancing between workers: sample loads into a moving average
    // and ask the busiest worker to shed a session when the spread grows.
    let global = &runtime.config.global;
    tokio::spawn(bifrost::worker::run_coordinator(
        workers.handles(),
        global.rebalance_window,
        global.rebalance_threshold,
        global.rebalance_period,
    ));

    info!(
        threads,
        listeners = runtime.listen_points.len(),
        monitors = monitors.len(),
        "bifrost is running"
    );

    shutdown_signal().await;
    info!("Shutdown signal received");

    for monitor in monitors {
        monitor.stop_and_join();
    }

    // Worker shutdown kills remaining sessions and drains pooled
    // connections; bound the wait so a wedged session cannot hold the
    // process hostage.
    let drained = tokio::task::spawn_blocking(move || workers.shutdown());
    match tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, drained).await {
        Ok(_) => info!("bifrost shutdown complete"),
        Err(_) => warn!("Shutdown timeout expired, exiting with sessions still open"),
    }

    Ok(())
}

/// Wait for SIGTERM or Ctrl+C
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
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

fn load_config() -> Config {
    let mut paths = vec![
        "bifrost.cnf".to_string(),
        "/etc/bifrost.cnf".to_string(),
    ];
    if let Some(arg) = std::env::args().nth(1) {
        paths.insert(0, arg);
    }

    for path in &paths {
        match config::load_config(path) {
            Ok(config) => {
                info!(path = %path, "Loaded configuration");
                return config;
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to load config");
            }
        }
    }

    info!("Using default configuration");
    Config::default()
}
