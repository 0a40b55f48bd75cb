use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

use stn_ble::config::default_targets;
use stn_ble::logging::init_logging;
use stn_ble::sim::SimulatedAdapter;
use stn_ble::{BlePlatform, Client, ClientConfig, ConnectionStatus, DeviceId};

/// Peripheral advertised by `--simulate`.
const SIMULATED_ADAPTER: &str = "00:1D:A5:68:98:8B";

#[derive(Parser, Debug)]
#[command(name = "stn-ble", about = "Poll an OBD-II adapter over Bluetooth LE")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Use the built-in simulated adapter instead of BlueZ
    #[arg(long)]
    simulate: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List adapters advertising the OBD service until discovery stops
    Scan,
    /// Connect, run the handshake and print every poll pass
    Poll {
        /// Device address; the first one discovered when omitted
        device: Option<String>,
        /// Stop after this many passes
        #[arg(long)]
        passes: Option<u64>,
    },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ClientConfig::default(),
    };
    if config.targets.is_empty() {
        config.targets = default_targets();
    }
    init_logging(config.log_level.as_deref());

    let rt = Runtime::new().context("tokio runtime init failed")?;
    rt.block_on(run_async(args, config))
}

async fn run_async(args: Args, config: ClientConfig) -> Result<()> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let (platform, simulated): (Arc<dyn BlePlatform>, Option<Arc<SimulatedAdapter>>) =
        if args.simulate {
            let sim = Arc::new(
                SimulatedAdapter::new(events_tx, config.link.clone()).with_peripheral(
                    SIMULATED_ADAPTER,
                    Some("OBDLink CX"),
                    -61,
                ),
            );
            (sim.clone(), Some(sim))
        } else {
            (bluez_platform(events_tx).await?, None)
        };

    let client = Client::new(platform, events_rx, &config);
    if let Some(sim) = &simulated {
        sim.power_on();
    }

    match args.command {
        Command::Scan => scan(&client, &config).await,
        Command::Poll { device, passes } => poll(&client, &config, device, passes).await,
    }
}

#[cfg(feature = "bluez")]
async fn bluez_platform(
    events: mpsc::UnboundedSender<stn_ble::PlatformEvent>,
) -> Result<Arc<dyn BlePlatform>> {
    let platform = stn_ble::bluez::BluezPlatform::new(events).await?;
    Ok(Arc::new(platform))
}

#[cfg(not(feature = "bluez"))]
async fn bluez_platform(
    _events: mpsc::UnboundedSender<stn_ble::PlatformEvent>,
) -> Result<Arc<dyn BlePlatform>> {
    bail!("built without the `bluez` feature; rerun with --simulate")
}

async fn scan(client: &Client, config: &ClientConfig) -> Result<()> {
    let deadline = tokio::time::Instant::now() + config.link.scan_duration();
    let mut devices = client.devices();
    let mut printed = 0;
    println!("Scanning for {:?}...", config.link.scan_duration());
    loop {
        {
            let current = devices.borrow_and_update();
            for device in current.iter().skip(printed) {
                println!("{}  {:<20} {} dBm", device.id, device.name, device.rssi);
            }
            printed = current.len();
        }
        tokio::select! {
            changed = devices.changed() => changed?,
            _ = tokio::time::sleep_until(deadline) => break,
        }
    }
    println!("Found {printed} adapter(s).");
    Ok(())
}

async fn poll(
    client: &Client,
    config: &ClientConfig,
    device: Option<String>,
    passes: Option<u64>,
) -> Result<()> {
    let id = match device {
        Some(address) => {
            let id = DeviceId(address);
            let mut devices = client.devices();
            tokio::time::timeout(
                config.link.scan_duration(),
                devices.wait_for(|list| list.iter().any(|d| d.id == id)),
            )
            .await
            .with_context(|| format!("{id} not found"))??;
            id
        }
        None => {
            let mut devices = client.devices();
            let list = tokio::time::timeout(
                config.link.scan_duration(),
                devices.wait_for(|list| !list.is_empty()),
            )
            .await
            .context("no adapter found")??;
            list[0].id.clone()
        }
    };

    let mut status = client.status();
    client.connect(&id)?;
    println!("Connecting to {id}...");
    let reached = *status
        .wait_for(|s| matches!(s, ConnectionStatus::Connected | ConnectionStatus::NotConnected))
        .await?;
    if reached != ConnectionStatus::Connected {
        bail!("connection to {id} failed");
    }
    println!("Connected. Polling {} target(s).", config.targets.len());

    let mut targets = client.targets();
    let mut batches = 0u64;
    loop {
        tokio::select! {
            changed = targets.changed() => changed?,
            _ = status.wait_for(|s| *s != ConnectionStatus::Connected) => {
                bail!("link to {id} lost");
            }
        }
        batches += 1;
        let batch = targets.borrow_and_update().clone();
        println!("--- pass {} ---", client.poll_passes());
        for target in &batch {
            let line = format!("{:>6} {:<8} {}", target.target, target.request, target.response);
            match &target.last_error {
                Some(error) => println!("{line} (error: {error})"),
                None => println!("{line}"),
            }
        }
        if passes.is_some_and(|limit| batches >= limit) {
            break;
        }
    }
    info!("done after {} passes", batches);
    client.cancel_connection();
    Ok(())
}
