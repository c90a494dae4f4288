//! vusb-bridge
//!
//! Exposes the USB devices of a usbforward stub to this host's kernel via
//! USB/IP and `vhci_hcd`.

use anyhow::{Context, Result};
use bridge::config::{BridgeConfig, TransportKind};
use bridge::Reactor;
use clap::Parser;
use common::setup_logging;
use std::path::PathBuf;
use tokio::signal;
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "vusb-bridge")]
#[command(author, version, about = "Host-side USB/IP bridge for a usbforward stub")]
#[command(long_about = "
Connects to a usbforward stub (virtio-serial port, unix socket, or inherited
descriptor), serves its devices over USB/IP, and attaches them to the local
vhci_hcd controller.

EXAMPLES:
    # Stub on a virtio-serial port
    vusb-bridge --transport-path /dev/vport0p1

    # Stub on a unix socket, USB/IP on a non-default port
    vusb-bridge --transport-path /run/vusb/stub.sock --unix --port 3241

    # Descriptor handed over by the launcher
    vusb-bridge --transport-fd 3 --vhci-port 2

CONFIGURATION:
    The bridge looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/vusb-bridge/bridge.toml
    3. /etc/vusb-bridge/bridge.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Character device or socket the stub is reachable on
    #[arg(long, value_name = "PATH", conflicts_with = "transport_fd")]
    transport_path: Option<PathBuf>,

    /// Inherited descriptor connected to the stub
    #[arg(long, value_name = "FD")]
    transport_fd: Option<i32>,

    /// Treat --transport-path as a unix stream socket
    #[arg(long, requires = "transport_path")]
    unix: bool,

    /// USB/IP TCP port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// VHCI port to try first
    #[arg(long, value_name = "PORT")]
    vhci_port: Option<u32>,
}

impl Args {
    fn apply(&self, config: &mut BridgeConfig) {
        if let Some(path) = &self.transport_path {
            config.transport.kind = if self.unix {
                TransportKind::Unix
            } else {
                TransportKind::Device
            };
            config.transport.path = Some(path.clone());
        }
        if let Some(fd) = self.transport_fd {
            config.transport.kind = TransportKind::Fd;
            config.transport.fd = Some(fd);
        }
        if let Some(port) = self.port {
            config.usbip.listen_addr.set_port(port);
        }
        if let Some(port) = self.vhci_port {
            config.vhci.preferred_port = Some(port);
        }
        if let Some(level) = &self.log_level {
            config.bridge.log_level = level.clone();
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = BridgeConfig::default();
        let path = BridgeConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        BridgeConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        BridgeConfig::load_or_default()
    };
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    setup_logging(&config.bridge.log_level).context("Failed to setup logging")?;

    info!("vusb-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", config.bridge.log_level);

    // One thread owns all socket I/O; the VHCI supervisor adds the second
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    runtime.block_on(run(config))
}

async fn run(config: BridgeConfig) -> Result<()> {
    let reactor = Reactor::new(config).context("Failed to open transport")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigterm = unix_signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
        info!("Received shutdown signal");
        shutdown_tx.send_replace(true);
    });

    match reactor.run(shutdown_rx).await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("Fatal: {}", e);
            Err(e).context("Bridge failed")
        }
    }
}
