mod config;
mod crypto;
mod dispatch;
mod downlink;
mod error;
mod ingest;
mod keystore;
mod rotation;
mod segment;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dispatch::{FrameDispatcher, SensorReading};
use downlink::{DownlinkCommand, DownlinkHandle};
use keystore::DeviceKeyStore;
use rotation::{RotationOrchestrator, RotationReason};
use segment::SegmentTable;

#[derive(Parser)]
#[command(name = "lora-keyrot")]
#[command(about = "Gateway-side key rotation and secure downlink engine for LoRaWAN sensor networks")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = config::Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        config::Config::default()
    });

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("lora-keyrot v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "ports: device-pubkey={} gateway-pubkey={} rotation-ack={}",
        config.ports.device_pubkey, config.ports.gateway_pubkey, config.ports.rotation_ack
    );

    // Downlink transport seam. The consumer task below stands in for the
    // network-server enqueue client; it logs what would be transmitted.
    let (downlink, mut downlink_rx) = DownlinkHandle::channel(256);
    tokio::spawn(async move {
        while let Some(cmd) = downlink_rx.recv().await {
            match cmd {
                DownlinkCommand::Enqueue { target, port, payload } => {
                    info!(
                        %target,
                        port,
                        bytes = payload.len(),
                        "downlink enqueue: {}",
                        String::from_utf8_lossy(&payload)
                    );
                }
                DownlinkCommand::Flush { target } => {
                    info!(%target, "downlink flush");
                }
            }
        }
        warn!("downlink transport channel closed");
    });

    // Decrypted readings go to the downstream data pipeline; here that
    // is a logging sink.
    let (readings_tx, mut readings_rx) = tokio::sync::mpsc::channel::<SensorReading>(256);
    tokio::spawn(async move {
        while let Some(reading) = readings_rx.recv().await {
            info!(
                dev_eui = %reading.dev_eui,
                port = reading.port,
                at = %reading.received_at,
                "sensor reading: {}",
                String::from_utf8_lossy(&reading.payload)
            );
        }
    });

    let store = Arc::new(DeviceKeyStore::new());
    let rotation = Arc::new(RotationOrchestrator::new(
        downlink,
        Arc::clone(&store),
        config.ports,
        config.rotation,
        config.segments.max_frame_len,
    )?);
    let dispatcher = Arc::new(FrameDispatcher::new(
        Arc::clone(&store),
        SegmentTable::new(config.segments.reassembly_timeout()),
        Arc::clone(&rotation),
        config.ports,
        Some(readings_tx),
    ));

    // Inbound frame listener
    let server = ingest::IngestServer::bind(&config.udp.bind).await?;
    {
        let rotation = Arc::clone(&rotation);
        tokio::spawn(async move {
            if let Err(e) = server.run(dispatcher, rotation).await {
                error!("ingest server failed: {}", e);
            }
        });
    }

    // SIGHUP is the operator's manual rotation command.
    #[cfg(unix)]
    {
        let rotation = Arc::clone(&rotation);
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut hup = match signal(SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    error!("failed to install SIGHUP handler: {}", e);
                    return;
                }
            };
            while hup.recv().await.is_some() {
                info!("manual rotation requested (SIGHUP)");
                match rotation.rotate(RotationReason::Manual).await {
                    Ok(()) => info!("manual rotation succeeded"),
                    Err(e) => error!("manual rotation failed: {}", e),
                }
            }
        });
    }

    info!("engine running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    Ok(())
}
