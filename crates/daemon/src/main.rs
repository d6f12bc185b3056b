//! usb-zebu daemon
//!
//! Binds Zebu-class USB devices from user space and exposes one write-only
//! channel per device as a Unix socket node.

use anyhow::{Context, Result};
use clap::Parser;
use common::{UsbBridge, UsbCommand, UsbEvent, create_usb_bridge, setup_logging};
use daemon::config::DaemonConfig;
use daemon::node::{NodeServer, SocketNodes};
use daemon::usb::{WorkerOptions, spawn_usb_worker};
use driver::{ChannelRegistry, DeviceLifecycle, MemoryNodes};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::signal::unix::SignalKind;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-zebud")]
#[command(author, version, about = "usb-zebu - user-space driver for Zebu USB devices")]
#[command(long_about = "
Claims Zebu-class USB devices and exposes each one as a write-only channel.
Writing to a channel node sends the bytes to the device's bulk-out pipe.

EXAMPLES:
    # Run with default config
    usb-zebud

    # Run with custom config
    usb-zebud --config /path/to/daemon.toml

    # List USB devices and whether they would be handled
    usb-zebud --list-devices

    # Put the nodes somewhere else
    usb-zebud --node-dir /tmp/zebu

    # Attach devices plugged in while hot-plug was unavailable
    kill -HUP $(pidof usb-zebud)

CONFIGURATION:
    The daemon looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-zebu/daemon.toml
    3. /etc/usb-zebu/daemon.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Directory for channel nodes
    #[arg(long, value_name = "DIR")]
    node_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = DaemonConfig::default();
        let path = DaemonConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        DaemonConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        DaemonConfig::load_or_default()
    };

    if let Some(dir) = args.node_dir {
        config.daemon.node_dir = dir;
    }

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-zebu daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    if args.list_devices {
        list_devices_mode(&config).await
    } else {
        run_daemon(&config).await
    }
}

/// List USB devices without claiming any
async fn list_devices_mode(config: &DaemonConfig) -> Result<()> {
    let registry = Arc::new(ChannelRegistry::new(
        config.registry_config(),
        Arc::new(MemoryNodes::new()),
    ));
    let options = WorkerOptions {
        table: config.id_table()?,
        transfer_timeout: config.usb.transfer_timeout(),
        attach: false,
    };

    let (usb_bridge, worker) = create_usb_bridge();
    let worker_handle = spawn_usb_worker(worker, DeviceLifecycle::new(registry), options)
        .context("Failed to spawn USB worker")?;

    let result = print_devices(&usb_bridge).await;

    shutdown_usb_worker(usb_bridge, worker_handle).await;
    result
}

async fn print_devices(usb_bridge: &UsbBridge) -> Result<()> {
    let devices = usb_bridge
        .list_devices()
        .await
        .context("Failed to list devices")?;

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        println!(
            "  Bus {:03} Device {:03}: {:04x}:{:04x} class {:02x}/{:02x}/{:02x}{}",
            device.transport.bus,
            device.transport.address,
            device.identity.vendor_id,
            device.identity.product_id,
            device.identity.class,
            device.identity.subclass,
            device.identity.protocol,
            if device.matched { "  [zebu]" } else { "" }
        );
    }
    Ok(())
}

/// Serve channels until Ctrl+C; SIGHUP rescans the bus
async fn run_daemon(config: &DaemonConfig) -> Result<()> {
    let node_dir = config.daemon.node_dir();
    let (nodes, node_events) = SocketNodes::new(&node_dir)
        .with_context(|| format!("Failed to create node directory {}", node_dir.display()))?;
    info!("Channel nodes in {}", node_dir.display());

    let registry = Arc::new(ChannelRegistry::new(
        config.registry_config(),
        Arc::new(nodes),
    ));
    let lifecycle = DeviceLifecycle::new(registry.clone());

    // Serve nodes before any device can attach
    let server_handle = tokio::spawn(NodeServer::new(registry.clone(), node_events).run());

    let options = WorkerOptions {
        table: config.id_table()?,
        transfer_timeout: config.usb.transfer_timeout(),
        attach: true,
    };
    let (usb_bridge, worker) = create_usb_bridge();
    let worker_handle = spawn_usb_worker(worker, lifecycle, options)
        .context("Failed to spawn USB worker")?;

    let events_bridge = usb_bridge.clone();
    let events_handle = tokio::spawn(async move {
        while let Ok(event) = events_bridge.recv_event().await {
            log_event(&event);
        }
    });

    let mut hangup = signal::unix::signal(SignalKind::hangup())
        .context("Failed to install SIGHUP handler")?;

    info!("Press Ctrl+C to shutdown, send SIGHUP to rescan the bus");
    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                break;
            }
            Some(()) = hangup.recv() => {
                match usb_bridge.rescan().await {
                    Ok(created) => info!("Rescan created {} channel(s)", created),
                    Err(e) => warn!("Rescan failed: {}", e),
                }
            }
        }
    }

    // Wake blocked writers so detach does not wait out their timeouts
    registry.interrupt_all();
    shutdown_usb_worker(usb_bridge, worker_handle).await;

    events_handle.abort();
    server_handle.abort();

    info!("Daemon shutdown complete");
    Ok(())
}

fn log_event(event: &UsbEvent) {
    match event {
        UsbEvent::ChannelCreated {
            name,
            minor,
            transport,
            identity,
        } => info!(
            "Channel {} (minor {}) for {:04x}:{:04x} at {}",
            name, minor, identity.vendor_id, identity.product_id, transport
        ),
        UsbEvent::ChannelRemoved { name, transport } => {
            info!("Channel {} removed, device {} left", name, transport)
        }
        UsbEvent::AttachFailed { transport, reason } => {
            warn!("Device {} not attached: {}", transport, reason)
        }
    }
}

/// Stop the USB worker and wait for it to detach every device
async fn shutdown_usb_worker(
    usb_bridge: UsbBridge,
    handle: std::thread::JoinHandle<Result<(), rusb::Error>>,
) {
    info!("Shutting down USB subsystem...");
    if let Err(e) = usb_bridge.send_command(UsbCommand::Shutdown).await {
        // Worker already gone; joining reports why
        warn!("Failed to send Shutdown command: {}", e);
    }
    drop(usb_bridge);

    match tokio::task::spawn_blocking(move || handle.join()).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!("USB worker failed: {}", e),
        Ok(Err(e)) => error!("USB worker thread panicked: {:?}", e),
        Err(e) => error!("Failed to join USB worker: {}", e),
    }
}
