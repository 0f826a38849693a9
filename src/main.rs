use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tokio::time::{interval, Duration};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lds_bridge::bridge::DEFAULT_DOWNLINK_QUEUE;
use lds_bridge::{spawn_downlink_dispatcher, Bridge, Config, RadioUplinkMetadata, TransportKind};

#[derive(Parser)]
#[command(name = "lds-bridge")]
#[command(about = "Gateway bridge for a LoRaWAN device simulator (MQTT or Semtech UDP)")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "conf.toml")]
    config: PathBuf,

    /// Transport to the network server: mqtt or udp
    #[arg(short, long, default_value = "udp")]
    transport: TransportKind,

    /// Hex encoded PHYPayload to send as a periodic test uplink
    #[arg(long)]
    uplink: Option<String>,

    /// Seconds between test uplinks
    #[arg(long, default_value_t = 10)]
    interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        Config::default()
    });

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!(
        "lds-bridge v{} (gateway {}, bridge version {})",
        env!("CARGO_PKG_VERSION"),
        config.gateway.mac,
        config.gateway.bridge_version
    );

    let uplink = cli
        .uplink
        .as_deref()
        .map(hex::decode)
        .transpose()
        .context("--uplink must be hex")?;

    let (mut bridge, downlinks) = Bridge::new(DEFAULT_DOWNLINK_QUEUE);
    let dispatcher = spawn_downlink_dispatcher(downlinks, |payload: &[u8]| -> anyhow::Result<()> {
        info!("Downlink received: {} ({} bytes)", hex::encode(payload), payload.len());
        Ok(())
    });

    bridge
        .connect(cli.transport, &config)
        .await
        .with_context(|| format!("failed to connect over {}", cli.transport))?;

    info!("Bridge running. Press Ctrl+C to stop.");
    let mut ticker = interval(Duration::from_secs(cli.interval.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick(), if uplink.is_some() => {
                let Some(payload) = uplink.as_deref() else { continue };
                let meta = RadioUplinkMetadata::from_config(&config.radio, chrono::Utc::now());
                match bridge.send_uplink(payload, &meta).await {
                    Ok(()) => info!("Uplink sent ({} bytes, {})", payload.len(), meta.data_rate()),
                    Err(e) => error!("Failed to send uplink: {}", e),
                }
            }
        }
    }

    info!("Shutting down...");
    bridge.disconnect().await;
    drop(bridge);
    dispatcher.await?;
    Ok(())
}
