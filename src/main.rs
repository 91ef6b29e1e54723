use tracing::info;

use roombook::config::Config;
use roombook::service::Service;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    roombook::observability::init(config.metrics_port)?;

    // No calendar provider is bundled; embedders pass one to `Service::start`.
    let service = Service::start(&config, None)?;

    info!("roombook store ready");
    info!("  wal: {}", config.wal_path().display());
    info!("  compact threshold: {} appends", config.compact_threshold);
    info!(
        "  calendar sync: {}",
        if service.calendar.is_some() { "enabled" } else { "disabled" }
    );
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown on SIGTERM/ctrl-c.
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    info!("shutdown signal received");
    service.shutdown().await;
    info!("roombook stopped");
    Ok(())
}
