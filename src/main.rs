use profilegate::config::Config;
use profilegate::interceptor::Interceptor;
use profilegate::pool::{ConnectionPool, PoolConfig};
use profilegate::proxy::ProxyServer;
use profilegate::recorder::{Recorder, RecorderConfig};
use profilegate::store::RecordStore;
use profilegate::{PKG_NAME, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} <config.toml>", PKG_NAME);
        std::process::exit(1);
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("profilegate=debug".parse()?),
        )
        .init();

    // Load configuration
    let config_path = PathBuf::from(&args[1]);
    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    let origin = config.target.origin().map_err(|e| {
        error!(url = %config.target.url, error = %e, "Failed to parse target server URL");
        e
    })?;

    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let recorder = Arc::new(Recorder::new(
        RecorderConfig::from(&config.capture),
        Arc::new(RecordStore::new(&config.output.file)),
    ));

    let pool = ConnectionPool::new(
        origin,
        PoolConfig {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
        },
    );

    let interceptor = Arc::new(Interceptor::new(
        Arc::clone(&recorder),
        pool,
        config.server.request_timeout(),
    ));

    let bind_addr = config.server.listen_addr().map_err(|e| {
        error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
        e
    })?;

    let pool_stats = interceptor.forwarder().stats();
    let server = ProxyServer::bind(bind_addr, interceptor, shutdown_rx).await?;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    wait_for_shutdown_signal().await?;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for the listener to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    // Drain and flush buffered records before the store is released
    info!("Flushing captured requests...");
    recorder.shutdown().await;

    info!(
        forwarded = pool_stats.get_total_requests(),
        failed = pool_stats.get_failed_requests(),
        "Shutdown complete"
    );
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting capturing proxy");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        target = %config.target.url,
        request_timeout_secs = config.server.request_timeout_secs,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        file = %config.output.file.display(),
        format = ?config.output.format,
        "Output settings"
    );
    info!(
        strategy = config.capture.strategy.as_str(),
        queue_capacity = config.capture.queue_capacity,
        flush_threshold = config.capture.flush_threshold,
        flush_interval_ms = config.capture.flush_interval_ms,
        write_timeout_ms = config.capture.write_timeout_ms,
        "Capture settings"
    );
}
