//! usbip - attach remote USB/IP devices to a virtual host controller

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::{VhciEvent, setup_logging};
use protocol::UsbSpeed;
use std::path::PathBuf;
use tokio::signal;
use tracing::{debug, info, warn};
use vhci::config::VhciConfig;
use vhci::network;
use vhci::{ControllerOptions, VirtualHostController};

#[derive(Parser, Debug)]
#[command(name = "usbip")]
#[command(author, version, about = "Attach remote USB devices over USB/IP")]
#[command(long_about = "
Imports a USB device exported by a USB/IP host and relays its transfers
through a virtual host controller.

EXAMPLES:
    # List devices exported by a host
    usbip list -r 192.168.1.10

    # Attach bus id 1-1.2 until Ctrl+C
    usbip attach -r 192.168.1.10 -b 1-1.2

    # Run with debug logging
    usbip --log-level debug attach -r 192.168.1.10 -b 1-1.2

CONFIGURATION:
    The configuration file is searched for in the following order:
    1. Path specified with --config
    2. ~/.config/usbip-vhci/vhci.toml
    3. /etc/usbip-vhci/vhci.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List devices exported by a remote host
    List {
        /// Remote host name or address
        #[arg(short, long, value_name = "HOST")]
        remote: String,

        /// Remote TCP port (defaults to the configured port)
        #[arg(short, long, value_name = "PORT")]
        port: Option<u16>,
    },
    /// Attach a remote device and hold it until Ctrl+C
    Attach {
        /// Remote host name or address
        #[arg(short, long, value_name = "HOST")]
        remote: String,

        /// Bus id of the exported device
        #[arg(short, long, value_name = "BUSID")]
        busid: String,

        /// Remote TCP port (defaults to the configured port)
        #[arg(short, long, value_name = "PORT")]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let path = VhciConfig::default_path();
        VhciConfig::default()
            .save(&path)
            .context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = match args.config {
        Some(ref path) => {
            VhciConfig::load(Some(path.clone())).context("Failed to load configuration")?
        }
        None => VhciConfig::load_or_default(),
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.vhci.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;
    debug!("usbip v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Some(Command::List { remote, port }) => {
            list(&config, &remote, port.unwrap_or(config.network.tcp_port)).await
        }
        Some(Command::Attach {
            remote,
            busid,
            port,
        }) => {
            attach(
                &config,
                &remote,
                port.unwrap_or(config.network.tcp_port),
                &busid,
            )
            .await
        }
        None => {
            eprintln!("No command given; see `usbip --help`");
            Ok(())
        }
    }
}

async fn list(config: &VhciConfig, host: &str, port: u16) -> Result<()> {
    let mut stream = network::connect(host, port, config.network.connect_timeout())
        .await
        .with_context(|| format!("Failed to connect to {}:{}", host, port))?;
    let devices = network::list_devices(&mut stream)
        .await
        .context("Failed to list exported devices")?;

    if devices.is_empty() {
        println!("No devices exported by {}", host);
        return Ok(());
    }

    println!("Exportable USB devices");
    println!("======================");
    println!(" - {}", host);
    for exported in &devices {
        let device = &exported.device;
        println!(
            "{:>12}: {:04x}:{:04x} ({})",
            device.busid,
            device.id_vendor,
            device.id_product,
            speed_name(device.speed)
        );
        println!("{:>12}: {}", "", device.path);
        for (index, interface) in exported.interfaces.iter().enumerate() {
            println!(
                "{:>12}  {}: {:02x}/{:02x}/{:02x}",
                "", index, interface.class, interface.subclass, interface.protocol
            );
        }
    }
    Ok(())
}

async fn attach(config: &VhciConfig, host: &str, port: u16, busid: &str) -> Result<()> {
    let (controller, events) = VirtualHostController::new(ControllerOptions::from(config))
        .context("Failed to start virtual host controller")?;

    let stream = network::connect(host, port, config.network.connect_timeout())
        .await
        .with_context(|| format!("Failed to connect to {}:{}", host, port))?;
    let device = controller
        .attach(stream, busid)
        .await
        .with_context(|| format!("Failed to import {} from {}", busid, host))?;

    let descriptor = device
        .get_device_descriptor()
        .await
        .context("Failed to read device descriptor")?;
    if descriptor.len() >= 12 {
        info!(
            "Device {:04x}:{:04x} responding",
            u16::from_le_bytes([descriptor[8], descriptor[9]]),
            u16::from_le_bytes([descriptor[10], descriptor[11]])
        );
    }

    println!("Port {} attached to {}/{}", device.port(), host, busid);
    println!("Press Ctrl+C to detach");

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                info!("Detaching port {}", device.port());
                break;
            }
            event = events.recv() => match event {
                Ok(VhciEvent::DeviceRemoved { port, reason }) if port == device.port() => {
                    warn!("Port {} lost its device: {:?}", port, reason);
                    println!("Port {} detached by the remote host", port);
                    return Ok(());
                }
                Ok(event) => debug!("Controller event: {:?}", event),
                Err(e) => {
                    warn!("Event channel closed: {}", e);
                    break;
                }
            },
        }
    }

    controller
        .shutdown()
        .context("Failed to shut down controller")?;
    println!("Port {} detached", device.port());
    Ok(())
}

fn speed_name(speed: UsbSpeed) -> &'static str {
    match speed {
        UsbSpeed::Low => "1.5 Mbps",
        UsbSpeed::Full => "12 Mbps",
        UsbSpeed::High => "480 Mbps",
        UsbSpeed::Wireless => "wireless",
        UsbSpeed::Super => "5 Gbps",
        UsbSpeed::SuperPlus => "10 Gbps",
        UsbSpeed::Unknown => "unknown speed",
    }
}
