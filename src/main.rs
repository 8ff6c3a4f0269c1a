use anyhow::Context;

use checkin_assist::channels::ChannelOrchestrator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let orchestrator = ChannelOrchestrator::load().context("Failed to set up channels")?;

    eprintln!("📬 Check-in Assist v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Channels: {}", orchestrator.get_registered_channels().join(", "));
    eprintln!("   Press Ctrl-C to stop.\n");

    orchestrator.start_all().await;

    let active = orchestrator.get_active_channels();
    if active.is_empty() {
        tracing::warn!("No channels are active; the monitor will keep retrying them");
    } else {
        tracing::info!(channels = ?active, "Ready");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    tracing::info!("Shutting down");
    orchestrator.stop_all().await;
    Ok(())
}
