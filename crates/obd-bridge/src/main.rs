//! OBD Bridge entry point

use anyhow::Context;
use elm_link::connector_for;
use obd_bridge::{init_logging, Bridge, BridgeConfig, DEFAULT_CONFIG_PATH};
use std::sync::Arc;
use svip_wire::Message;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{error, info};

const OUTBOUND_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config =
        BridgeConfig::load(&path).with_context(|| format!("Failed to load configuration from {path}"))?;
    init_logging(&config.logging);

    info!("=== OBD Bridge v{} ===", env!("CARGO_PKG_VERSION"));

    let connector = connector_for(&config.address);
    let bridge = Arc::new(Bridge::new(config, connector).context("Failed to build bridge")?);
    bridge.start().await?;

    let (outbound, mut consumer) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = consumer.recv().await {
            stdout.write_all(message.encode().as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let requests = {
        let bridge = Arc::clone(&bridge);
        let outbound = outbound.clone();
        tokio::spawn(async move { bridge.serve(tokio::io::stdin(), outbound).await })
    };

    let publisher = {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move { bridge.run(outbound).await })
    };

    info!("Bridge running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    bridge.shutdown().await;
    requests.abort();
    if let Err(e) = publisher.await? {
        error!(error = %e, "Publish loop ended with an error");
    }
    writer.await??;

    info!("Shutdown complete");
    Ok(())
}
