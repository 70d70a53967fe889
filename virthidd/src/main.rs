//! # VirtHID
//!
//! Virtual HID device bridge for DaemonOS.
//!
//! ## Features
//!
//! - **Device Lifecycle**: Create and destroy virtual HID devices by name
//! - **Input Reports**: Forward client reports to the owning device
//! - **Enumeration**: Two-phase device listing
//! - **Subscriptions**: Push host-originated reports back to the client
//!
//! Without a subcommand the daemon is started; with one, the binary acts as a
//! client of a running daemon.

mod config;
mod device;
mod ipc;
mod provider;
mod task;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// VirtHID - Virtual HID Bridge
#[derive(Parser, Debug)]
#[command(name = "virthidd", version, about)]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "VIRTHID_CONFIG", default_value = "/grimoire/system/virthid.yaml")]
    config: PathBuf,

    /// Socket path
    #[arg(short, long, default_value = "/run/virthid/virthid.sock")]
    socket: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a virtual device
    Create {
        name: String,
        /// Report descriptor as hex
        #[arg(long)]
        descriptor: String,
        #[arg(long, default_value = "0000")]
        serial: String,
        /// Vendor id (decimal or 0x-prefixed hex)
        #[arg(long, value_parser = parse_id, default_value = "0")]
        vendor_id: u32,
        /// Product id (decimal or 0x-prefixed hex)
        #[arg(long, value_parser = parse_id, default_value = "0")]
        product_id: u32,
    },
    /// Destroy a virtual device
    Destroy { name: String },
    /// Send an input report (hex) to a device
    Send { name: String, report: String },
    /// List virtual devices
    List,
    /// Print host reports pushed to a device
    Monitor { name: String },
    /// Inject a host report (hex) for a device
    Inject { name: String, report: String },
}

fn parse_id(value: &str) -> Result<u32, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(digits) => u32::from_str_radix(digits, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid id {:?}: {}", value, e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .init();

    // Handle CLI commands
    if let Some(cmd) = args.command {
        return handle_client_command(&args.socket, cmd).await;
    }

    info!("VirtHID v{} starting", env!("CARGO_PKG_VERSION"));

    // Daemon mode
    run_daemon(args).await
}

async fn handle_client_command(socket: &Path, cmd: Commands) -> Result<()> {
    let mut client = ipc::VirtHidClient::connect(socket)
        .await
        .with_context(|| format!("Failed to connect to {:?}", socket))?;

    match cmd {
        Commands::Create { name, descriptor, serial, vendor_id, product_id } => {
            let descriptor = hex::decode(&descriptor).context("Invalid descriptor hex")?;
            client
                .create(&name, &descriptor, &serial, vendor_id, product_id)
                .await?;
            println!("Created {}", name);
        }
        Commands::Destroy { name } => {
            client.destroy(&name).await?;
            println!("Destroyed {}", name);
        }
        Commands::Send { name, report } => {
            let report = hex::decode(&report).context("Invalid report hex")?;
            client.send(&name, &report).await?;
        }
        Commands::List => {
            for name in client.list().await? {
                println!("{}", name);
            }
        }
        Commands::Monitor { name } => {
            client.subscribe(&name).await?;
            println!("Monitoring {} - press Ctrl+C to exit", name);
            loop {
                tokio::select! {
                    event = client.next_report() => {
                        let event = event?;
                        println!("{}", hex::encode(&event.payload));
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        Commands::Inject { name, report } => {
            let report = hex::decode(&report).context("Invalid report hex")?;
            client.host_report(&name, &report).await?;
        }
    }

    Ok(())
}

async fn run_daemon(args: Args) -> Result<()> {
    let config = config::load_config(&args.config)?;
    info!(
        "Limits: {} devices, {} byte descriptors; notify throttle {} ms",
        config.limits.max_devices, config.limits.max_descriptor_len, config.notify.throttle_ms
    );

    let provider = Arc::new(provider::HidProvider::new(config.limits.clone()));
    let server = ipc::VirtHidServer::new(args.socket.clone(), provider, config.notify.throttle());

    info!("VirtHID ready on {:?}", args.socket);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("IPC server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    let _ = std::fs::remove_file(&args.socket);
    Ok(())
}
