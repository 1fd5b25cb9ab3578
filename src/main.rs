//! Command line front end for the connection engine.
//!
//! Runs against the simulated adapter, which exposes one peripheral with
//! the control profile, so every command works without radio hardware.

use anyhow::{Context, Result};
use ble_control::domain::models::{DeviceId, NotificationEvent};
use ble_control::domain::settings::SettingsService;
use ble_control::infrastructure::bluetooth::simulated::{SimulatedAdapter, SimulatedPeripheral};
use ble_control::infrastructure::bluetooth::{protocol, BluetoothService, TransportAdapter};
use ble_control::infrastructure::logging;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "ble-control")]
#[command(about = "Connect to a BLE peripheral and run GATT operations by role")]
struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Device address to connect to
    #[arg(short, long, default_value = "C0:FF:EE:00:00:01")]
    device: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for devices advertising the profile's service
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "2")]
        seconds: u64,
        /// Service UUID to filter for (defaults to the profile's service)
        #[arg(long)]
        service: Option<String>,
        /// Report every device regardless of advertised services
        #[arg(long)]
        all: bool,
    },
    /// Read a role and print the value as hex
    Read {
        #[arg(default_value = protocol::CONTROL_RESPONSE_ROLE)]
        role: String,
    },
    /// Write a hex payload to a role
    Write {
        role: String,
        /// Payload, e.g. 0a0b0c
        hex: String,
    },
    /// Print notifications of a role
    Subscribe {
        #[arg(default_value = protocol::CONTROL_RESPONSE_ROLE)]
        role: String,
        /// Stop after this many notifications
        #[arg(short, long, default_value = "5")]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings_service = match &cli.settings {
        Some(path) => SettingsService::load_from(path),
        None => SettingsService::new()?,
    };
    let _guard = logging::init_logger(&settings_service.get().log_settings)?;
    info!("Settings loaded from {}", settings_service.path().display());

    let device = DeviceId::new(cli.device.clone());
    let adapter = Arc::new(SimulatedAdapter::new());
    adapter.add_peripheral(SimulatedPeripheral::control_device(device.clone()));
    let transport: Arc<dyn TransportAdapter> = adapter.clone();
    let service = BluetoothService::from_settings(transport, settings_service.get())?;

    match cli.command {
        Commands::Scan {
            seconds,
            service: filter,
            all,
        } => {
            println!("Scanning ({} seconds)...", seconds);
            match filter {
                Some(uuid) => {
                    let uuid = protocol::parse_uuid(&uuid)?;
                    service.start_scan_for(Some(uuid), all).await?;
                }
                None if all => service.start_scan_for(None, true).await?,
                None => service.start_scan().await?,
            }
            tokio::time::sleep(Duration::from_secs(seconds)).await;
            service.stop_scan().await?;

            let devices = service.scanned_devices().await;
            println!("\nFound {} devices:", devices.len());
            for d in devices {
                let rssi = d
                    .signal_strength
                    .map(|r| format!("{} dBm", r))
                    .unwrap_or_else(|| "N/A".to_string());
                println!("  {} ({}) RSSI: {}", d.name, d.address, rssi);
            }
            return Ok(());
        }
        Commands::Read { role } => {
            let connection = service.connect(&device).await?;
            let value = connection.read_role(&role).await?;
            println!("{}: {}", role, hex::encode(value));
        }
        Commands::Write { role, hex: payload } => {
            let data = hex::decode(payload.trim_start_matches("0x")).context("Invalid hex payload")?;
            let connection = service.connect(&device).await?;
            connection.write_role(&role, &data).await?;
            println!("Wrote {} bytes to {}", data.len(), role);
        }
        Commands::Subscribe { role, count } => {
            let connection = service.connect(&device).await?;
            let mut stream = connection.subscribe_role(&role).await?;
            let handle = connection
                .resolved_target(&role)
                .context("Role is not resolved")?
                .handle;

            // The simulated peripheral reports a counter once per 100 ms
            let feeder = {
                let adapter = Arc::clone(&adapter);
                let device = device.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(Duration::from_millis(100));
                    for n in 0u32.. {
                        ticker.tick().await;
                        if adapter.notify(&device, handle, &n.to_le_bytes()) == 0 {
                            break;
                        }
                    }
                })
            };

            let mut received = 0;
            while received < count {
                match stream.next_event().await {
                    Some(NotificationEvent::Payload(payload)) => {
                        received += 1;
                        println!("{}: {}", role, hex::encode(payload));
                    }
                    Some(NotificationEvent::Closed(reason)) => {
                        println!("Stream closed: {:?}", reason);
                        break;
                    }
                    None => break,
                }
            }
            connection.unsubscribe_role(&role).await?;
            feeder.abort();
        }
    }

    settings_service.set_last_connected(device.as_str())?;
    service.disconnect_all().await;
    Ok(())
}
