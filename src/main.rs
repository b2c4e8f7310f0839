//! RLS Diagnostic Daemon
//!
//! LIN master for a rain/light sensor: runs the BCM schedule with the DRL
//! decision and streams the results over WebSocket, or performs one-shot
//! KWP2000 diagnostics (measuring blocks, DIDs, coding).

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rls_diag::blocks::{scan_lids, LidMonitor, DYNAMIC_LIDS};
use rls_diag::clock::{Clock, SystemClock};
use rls_diag::coding::{self, ascii};
use rls_diag::config::DaemonConfig;
use rls_diag::frame::hex_str;
use rls_diag::kwp2000::{services, DiagnosticService, ServiceOutcome};
use rls_diag::lin::LinBus;
use rls_diag::scheduler::Scheduler;
use rls_diag::serial::SerialTransceiver;
use rls_diag::sim::{LightProfile, SimulatedSensor};
use rls_diag::transceiver::BusTransceiver;
use rls_diag::transport::{DiagnosticTransport, TransportConfig};
use rls_diag::websocket::{self, WatchObserver};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

type Transceiver = Box<dyn BusTransceiver + Send>;

#[derive(Debug, Parser)]
#[command(name = "rls-diag-daemon", version, about = "LIN rain/light sensor daemon")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "RLS_CONFIG")]
    config: Option<PathBuf>,

    /// Serial device of the LIN adapter (overrides bus.device)
    #[arg(short, long)]
    port: Option<String>,

    /// FTDI device index (overrides bus.ftdi_index)
    #[cfg(feature = "ftdi")]
    #[arg(long)]
    ftdi_index: Option<i32>,

    /// Talk to a simulated sensor instead of hardware
    #[arg(long)]
    simulate: bool,

    /// Light profile of the simulated sensor
    #[arg(long, value_enum, default_value_t = Profile::Dusk)]
    profile: Profile,

    /// Multi-frame response handling (overrides transport.strategy)
    #[arg(long, value_enum)]
    strategy: Option<Strategy>,

    /// Debug logging with TX/RX dumps
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Profile {
    Day,
    Night,
    Dusk,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Strategy {
    AutoStream,
    FlowControl,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// BCM schedule + DRL with WebSocket streaming (default)
    Run {
        /// Wiper stage 0..3
        #[arg(long)]
        wiper: Option<u8>,
        /// Rain sensitivity 0..7
        #[arg(long)]
        sensitivity: Option<u8>,
        /// Do not start the WebSocket server
        #[arg(long)]
        no_websocket: bool,
    },
    /// Read measuring blocks (SID 0x21); all of 0x00..0x1F when none given
    ReadLid {
        #[arg(value_parser = parse_hex_u8)]
        lids: Vec<u8>,
    },
    /// Read a data identifier (SID 0x22)
    ReadDid {
        #[arg(value_parser = parse_hex_u16)]
        did: u16,
    },
    /// Read, write or restore the coding DID 0x0611
    Coding {
        #[command(subcommand)]
        action: Option<CodingAction>,
    },
    /// Sensor identification and coding
    Info,
    /// Live measuring-block dashboard
    Monitor {
        /// All 32 LIDs instead of the dynamic set
        #[arg(long)]
        full: bool,
        /// Stop after this many sweeps
        #[arg(long)]
        sweeps: Option<u64>,
    },
    /// Send one raw 8-byte frame on 0x3C and show the 0x3D answer
    Raw {
        #[arg(value_parser = parse_hex_u8, num_args = 1..=8)]
        bytes: Vec<u8>,
    },
    /// List FTDI devices
    #[cfg(feature = "ftdi")]
    Devices,
}

#[derive(Debug, Subcommand)]
enum CodingAction {
    Read,
    /// Write three coding bytes, e.g. "02 00 5D"
    Write { coding: String },
    /// Restore the factory coding 02 00 5D
    Restore,
}

fn parse_hex_u8(s: &str) -> Result<u8, String> {
    u8::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|e| format!("{}: {}", s, e))
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    u16::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|e| format!("{}: {}", s, e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let mut config = match &cli.config {
        Some(path) => DaemonConfig::load(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    apply_overrides(&mut config, &cli);
    config.validate().context("invalid configuration")?;

    let command = cli.command.unwrap_or(Command::Run {
        wiper: None,
        sensitivity: None,
        no_websocket: false,
    });

    #[cfg(feature = "ftdi")]
    if let Command::Devices = command {
        let devices = rls_diag::ftdi::list_devices()?;
        if devices.is_empty() {
            println!("No FTDI devices found");
        }
        for dev in devices {
            println!("  [{}] {} - {}", dev.index, dev.description, dev.serial_number);
        }
        return Ok(());
    }

    let transceiver = open_transceiver(&config, cli.simulate, cli.profile)?;

    match command {
        Command::Run {
            wiper,
            sensitivity,
            no_websocket,
        } => {
            if let Some(wiper) = wiper {
                config.scheduler.command.wiper = wiper;
            }
            if let Some(sensitivity) = sensitivity {
                config.scheduler.command.sensitivity = sensitivity.min(7);
            }
            if no_websocket {
                config.websocket.enabled = false;
            }
            run_schedule(config, transceiver).await
        }
        other => {
            let stop = stop_on_ctrl_c();
            tokio::task::spawn_blocking(move || run_diagnostics(other, config, transceiver, &stop))
                .await?
        }
    }
}

fn apply_overrides(config: &mut DaemonConfig, cli: &Cli) {
    if let Some(port) = &cli.port {
        config.bus.device = Some(port.clone());
    }
    #[cfg(feature = "ftdi")]
    if let Some(index) = cli.ftdi_index {
        config.bus.ftdi_index = Some(index);
    }
    match cli.strategy {
        Some(Strategy::AutoStream) => {
            config.transport = TransportConfig {
                nad: config.transport.nad,
                ..TransportConfig::auto_stream()
            }
        }
        Some(Strategy::FlowControl) => {
            config.transport = TransportConfig {
                nad: config.transport.nad,
                ..TransportConfig::flow_control()
            }
        }
        None => {}
    }
}

fn open_transceiver(config: &DaemonConfig, simulate: bool, profile: Profile) -> Result<Transceiver> {
    if simulate {
        let profile = match profile {
            Profile::Day => LightProfile::day(),
            Profile::Night => LightProfile::night(),
            Profile::Dusk => LightProfile::dusk(),
        };
        info!("Using simulated sensor ({:?})", profile);
        return Ok(Box::new(SimulatedSensor::new(
            SystemClock::new(),
            profile,
            config.transport.strategy,
        )));
    }

    #[cfg(feature = "ftdi")]
    if let Some(index) = config.bus.ftdi_index {
        let ftdi = rls_diag::ftdi::FtdiTransceiver::open(index, config.bus.baud_rate)?;
        return Ok(Box::new(ftdi));
    }

    let Some(device) = &config.bus.device else {
        bail!("no bus device configured: pass --port, set bus.device, or use --simulate");
    };
    let serial = SerialTransceiver::open(device, config.bus.baud_rate)
        .with_context(|| format!("opening {}", device))?;
    Ok(Box::new(serial))
}

fn stop_on_ctrl_c() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, stopping");
            flag.store(true, Ordering::Relaxed);
        }
    });
    stop
}

async fn run_schedule(config: DaemonConfig, transceiver: Transceiver) -> Result<()> {
    let (tx, rx) = watch::channel(None);

    if config.websocket.enabled {
        let ws_config = config.websocket.clone();
        tokio::spawn(async move {
            if let Err(e) = websocket::run_server(ws_config, rx).await {
                error!("WebSocket server failed: {}", e);
            }
        });
    }

    println!("CMD: {} [{}]", config.scheduler.command_id, hex_str(&config.scheduler.command.payload()));
    println!("Light: 0xEC00 (dark) .. 0xEFFF (bright), Ctrl+C to stop");

    let stop = stop_on_ctrl_c();
    let cycles = tokio::task::spawn_blocking(move || {
        let bus = LinBus::new(transceiver, SystemClock::new(), config.bus.lin.clone());
        let mut scheduler = Scheduler::new(bus, config.scheduler, config.drl);
        scheduler.wake();
        let mut observer = WatchObserver::new(tx, true);
        scheduler.run(&stop, &mut observer)
    })
    .await?;

    println!("Stopped after {} cycles.", cycles);
    Ok(())
}

fn run_diagnostics(
    command: Command,
    config: DaemonConfig,
    transceiver: Transceiver,
    stop: &AtomicBool,
) -> Result<()> {
    let mut bus = LinBus::new(transceiver, SystemClock::new(), config.bus.lin.clone());
    let wake = &config.scheduler;
    if !bus.wait_for_frame(wake.light_id, wake.wake_attempts, wake.wake_timeout_ms, wake.wake_gap_ms) {
        warn!("Sensor did not answer the wake-up polls, trying diagnostics anyway");
    }

    let mut service = DiagnosticService::new(DiagnosticTransport::new(bus, config.transport));

    match command {
        Command::ReadLid { lids } => {
            let lids = if lids.is_empty() { (0x00..0x20).collect() } else { lids };
            let mut found = 0;
            let read = scan_lids(&mut service, &lids, 10, stop, |lid, outcome| {
                match outcome {
                    ServiceOutcome::Positive(data) => {
                        found += 1;
                        let channels = rls_diag::blocks::decode_channels(&data);
                        let values: Vec<String> = channels
                            .iter()
                            .enumerate()
                            .map(|(i, c)| format!("ch{}={:5}(0x{:04X})", i, c.value, c.value))
                            .collect();
                        println!("LID 0x{:02X}: {}", lid, values.join(" | "));
                        println!("     raw: [{}]", hex_str(&data));
                    }
                    other => println!("LID 0x{:02X}: {}", lid, other),
                }
            });
            if read < lids.len() {
                println!("Stopped after {} of {} LIDs.", read, lids.len());
            }
            println!("Found {} LIDs.", found);
        }
        Command::ReadDid { did } => {
            let data = service
                .read_by_id(did)
                .into_result(services::READ_DATA_BY_ID)?;
            println!("DID 0x{:04X} [{:2}]: [{}]  {}", did, data.len(), hex_str(&data), ascii(&data));
        }
        Command::Coding { action } => match action.unwrap_or(CodingAction::Read) {
            CodingAction::Read => {
                let data = coding::read_coding(&mut service).into_result(services::READ_DATA_BY_ID)?;
                println!("Coding: [{}]", hex_str(&data));
            }
            CodingAction::Write { coding: text } => {
                let Some(value) = coding::parse_coding(&text) else {
                    bail!("coding must be three hex bytes, got {:?}", text);
                };
                coding::write_coding(&mut service, value).into_result(services::WRITE_DATA_BY_ID)?;
                println!("Coding written: [{}]", hex_str(&value));
            }
            CodingAction::Restore => {
                coding::restore_coding(&mut service).into_result(services::WRITE_DATA_BY_ID)?;
                println!("Coding restored: [{}]", hex_str(&coding::DEFAULT_CODING));
            }
        },
        Command::Info => {
            let ident = coding::read_identification(&mut service);
            println!("\n--- Sensor Info ---");
            for entry in &ident.entries {
                match (&entry.data, entry.text()) {
                    (Some(data), Some(text)) => println!(
                        "DID 0x{:04X} {:<16} [{}]  {}",
                        entry.did,
                        entry.label,
                        hex_str(data),
                        text
                    ),
                    _ => println!("DID 0x{:04X} {:<16} --", entry.did, entry.label),
                }
            }
            match &ident.coding {
                Some(data) => println!("Coding: [{}]", hex_str(data)),
                None => println!("Coding: --"),
            }
        }
        Command::Monitor { full, sweeps } => {
            let mut monitor = if full {
                LidMonitor::full()
            } else {
                LidMonitor::new(&DYNAMIC_LIDS)
            };
            while !stop.load(Ordering::Relaxed) && sweeps.map_or(true, |n| monitor.sweeps < n) {
                let start = service.transport().bus().clock().now();
                monitor.sweep(&mut service);
                let elapsed = service.transport().bus().clock().now() - start;
                render_monitor(&monitor, elapsed.as_millis());
            }
            println!("\nStopped after {} sweeps.", monitor.sweeps);
        }
        Command::Raw { bytes } => {
            let response = service.transport_mut().raw(&bytes)?;
            println!("TX: [{}]", hex_str(&bytes));
            println!("RX: [{}]", hex_str(&response));
        }
        Command::Run { .. } => bail!("the schedule does not run as a diagnostic session"),
        #[cfg(feature = "ftdi")]
        Command::Devices => bail!("device listing needs no bus session"),
    }

    Ok(())
}

fn render_monitor(monitor: &LidMonitor, elapsed_ms: u128) {
    print!("\x1b[2J\x1b[H");
    println!("=== LID Monitor  #{}  {}ms ===", monitor.sweeps, elapsed_ms);

    for (label, tracked) in [
        ("AMBIENT", monitor.ambient),
        ("FRONT  ", monitor.front),
        ("SOLAR  ", monitor.solar),
    ] {
        if let Some(t) = tracked {
            println!("  {} {:5}  {}..{}", label, t.value, t.min, t.max);
        }
    }

    for &lid in monitor.lids() {
        let Some(track) = monitor.tracks.get(&lid) else {
            println!("\n 0x{:02X}  --", lid);
            continue;
        };
        println!();
        for (i, ch) in track.channels.iter().enumerate().take(4) {
            let mark = if track.changed(i) { '*' } else { ' ' };
            if ch.max > ch.min {
                println!(" {}0x{:02X}.{} {:04X}  {:04X}..{:04X}", mark, lid, i, ch.value, ch.min, ch.max);
            } else {
                println!("  0x{:02X}.{} {:04X}  (static)", lid, i, ch.value);
            }
        }
    }
    println!("\n * = changed | Ctrl+C to stop");
}
