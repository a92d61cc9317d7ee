pub mod bridge; // Request/response coordination and fallback cache
pub mod channels; // Inter-task communication channels
pub mod client; // Client (dongle TCP) protocol
pub mod config; // Configuration management
pub mod error; // Error macros
pub mod guard; // Operation guard arbiter
pub mod inverter; // Inverter (RS-485 bus) protocol
pub mod mqtt; // MQTT status publishing
pub mod options; // Command line options parsing
pub mod prelude; // Common imports and types
pub mod rs485; // RS-485 transport
pub mod tcp_server; // Dongle TCP server
pub mod utils; // Utility functions

// Get the package version from Cargo.toml
const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::bridge::{Bridge, BridgeSettings, SharedStatus, Status};
use crate::mqtt::Mqtt;
use crate::prelude::*;
use crate::rs485::{SerialPortLine, Transport, TransportSettings};
use crate::tcp_server::{ServerSettings, TcpServer};

use std::io::Write;
use std::time::Duration;

/// Sets up env_logger; `RUST_LOG` wins over `level`.
pub fn init_logging(level: &str) {
    let result = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init();

    if let Err(e) = result {
        eprintln!("logger already initialised: {}", e);
    }
}

/// Main application entry point
///
/// Opens the serial port, starts the bus worker, TCP server, MQTT and the
/// periodic summary, then waits for a shutdown signal.
pub async fn app(config: ConfigWrapper, channels: Channels) -> Result<()> {
    info!("lux-dongle-bridge {} starting", CARGO_PKG_VERSION);

    let arbiter = GuardArbiter::new();
    let status = Status::shared();
    let mut shutdown_rx = channels.shutdown.subscribe();

    let serial_config = config.serial();
    let line = SerialPortLine::from_config(&serial_config)?;
    let transport = Transport::new(line, TransportSettings::from(&serial_config), arbiter.clone());
    let bridge = Bridge::new(transport, arbiter, BridgeSettings::from(&config.bridge()));

    info!("  Starting bridge...");
    let bridge_handle = {
        let (channels, status) = (channels.clone(), status.clone());
        tokio::spawn(async move {
            if let Err(e) = bridge.run(channels, status).await {
                error!("Bridge task failed: {}", e);
            }
        })
    };

    info!("  Starting TCP server...");
    let server = TcpServer::new(ServerSettings::from(&config.tcp()), channels.clone(), status.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.start().await {
            error!("TCP server failed: {}", e);
        }
    });

    info!("  Creating MQTT client...");
    let mqtt = Mqtt::new(config.clone(), channels.clone(), status.clone());
    let mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt.start().await {
            error!("MQTT task failed: {}", e);
        }
    });

    let summary_handle = tokio::spawn(summary(
        Duration::from_secs(config.status_interval_secs()),
        channels.clone(),
        status.clone(),
    ));

    info!("Waiting for shutdown signal...");
    let _ = shutdown_rx.recv().await;
    info!("Shutdown signal received, stopping components...");

    for (name, handle) in [
        ("bridge", bridge_handle),
        ("tcp server", server_handle),
        ("mqtt", mqtt_handle),
        ("summary", summary_handle),
    ] {
        if let Err(e) = handle.await {
            error!("Error waiting for {} task: {}", name, e);
        }
    }

    info!("Final statistics:");
    status
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .print_summary();

    info!("Application shutdown complete");
    Ok(())
}

async fn summary(interval: Duration, channels: Channels, status: SharedStatus) {
    let mut shutdown = channels.shutdown.subscribe();
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                status
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .print_summary();
            }
            _ = shutdown.recv() => break,
        }
    }
}
