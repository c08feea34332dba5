use std::sync::Arc;
use std::time::Duration;

use tuyalink::{load_config, DeviceSession, Discovery};

/// Minimal demo: connect to a configured device, read its current data
/// points, flip a switch, then read them again.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter("tuyalink=debug")
        .init();

    let config = load_config("tuyalink.toml")?;
    tracing::info!(device_id = %config.device_id, address = %config.address, "config loaded");

    let discovery = if config.needs_discovery() {
        tracing::info!("address not configured, starting discovery listener");
        Some(Arc::new(Discovery::start().await?))
    } else {
        None
    };

    let session = Arc::new(DeviceSession::new(config, discovery));

    let before = session.status().await?;
    tracing::info!(?before, "current status");

    session.turn_on(1).await?;
    tracing::info!("sent switch-on command");

    tokio::time::sleep(Duration::from_secs(1)).await;

    let after = session.status().await?;
    tracing::info!(?after, "status after toggling");

    session.close().await;
    Ok(())
}
