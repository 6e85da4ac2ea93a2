//! midi-device-manager CLI
//!
//! List MIDI endpoints, monitor inbound traffic and send raw bytes to a
//! device by name.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use midi_device_manager::hex::{format_hex, parse_hex_tokens};
use midi_device_manager::{
    EndpointRecord, ManagerConfig, MidiDeviceManager, MidiTransport, TokioExecutor, VirtualTransport,
};

/// Name-addressable MIDI device manager
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (defaults apply when it does not exist)
    #[arg(short, long, default_value = "midi.yaml")]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Use an in-process loopback transport instead of hardware
    #[arg(long = "virtual")]
    use_virtual: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List MIDI inputs and outputs
    List,
    /// Print inbound MIDI and device changes until Ctrl+C
    Monitor,
    /// Send bytes to an output by name
    Send {
        /// Output device name (exact match)
        #[arg(short, long)]
        device: String,

        /// Hex bytes, e.g. `90 3C 7F` or `F07E7F0601F7`
        #[arg(required = true)]
        bytes: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_logging(&args.log_level)?;

    let config = ManagerConfig::load_or_default(&args.config).await?;
    info!("Configuration file: {}", args.config);

    let transport = build_transport(&args, &config)?;
    let manager = MidiDeviceManager::from_config(transport, &config);

    match args.command {
        Command::List => list_devices(&manager),
        Command::Monitor => monitor(&manager).await,
        Command::Send { device, bytes } => send(&manager, &device, &bytes),
    }
}

fn build_transport(args: &Args, config: &ManagerConfig) -> Result<Arc<dyn MidiTransport>> {
    if args.use_virtual {
        let transport = VirtualTransport::new();
        transport.add_source("Virtual Loopback");
        transport.add_destination("Virtual Loopback");
        info!("Using virtual MIDI transport");
        return Ok(Arc::new(transport));
    }

    hardware_transport(config)
}

#[cfg(feature = "midir")]
fn hardware_transport(config: &ManagerConfig) -> Result<Arc<dyn MidiTransport>> {
    Ok(Arc::new(midi_device_manager::MidirTransport::with_poll_interval(
        config.hotplug_poll_interval(),
    )))
}

#[cfg(not(feature = "midir"))]
fn hardware_transport(_config: &ManagerConfig) -> Result<Arc<dyn MidiTransport>> {
    anyhow::bail!("built without the `midir` feature; use --virtual")
}

fn print_records(title: &str, records: &[EndpointRecord]) {
    println!("\n{}", title.bold());
    if records.is_empty() {
        println!("  {}", "(none)".dimmed());
    }
    for (index, record) in records.iter().enumerate() {
        println!(
            "  [{}] {} {}",
            index,
            record.display_name.bright_white(),
            record.handle.to_string().dimmed()
        );
    }
}

fn list_devices(manager: &MidiDeviceManager) -> Result<()> {
    manager.start().context("Failed to start MIDI client")?;

    let snapshot = manager.snapshot();
    println!("{}", "=== MIDI Devices ===".bold().cyan());
    print_records("Inputs:", snapshot.inputs());
    print_records("Outputs:", snapshot.outputs());

    manager.stop();
    Ok(())
}

async fn monitor(manager: &MidiDeviceManager) -> Result<()> {
    if let Some(executor) = TokioExecutor::current() {
        manager.set_dispatch_queue(Arc::new(executor));
    }

    let started = Instant::now();
    manager.set_input_handler(move |device: &str, data: &[u8]| {
        println!(
            "{:>10.3}s {} {:<24} {}",
            started.elapsed().as_secs_f64(),
            "IN ".green(),
            device,
            format_hex(data).yellow()
        );
    });
    manager.set_device_list_did_change_handler(|devices: &[String]| {
        println!("{} {}", "Outputs:".cyan(), devices.join(", "));
    });

    manager.start().context("Failed to start MIDI client")?;

    println!("{}", "=== MIDI Monitor ===".bold().cyan());
    println!("Press Ctrl+C to exit\n");

    shutdown_signal().await;

    manager.remove_input_handler();
    manager.remove_device_list_did_change_handler();
    manager.stop();
    info!("Monitor stopped");
    Ok(())
}

fn send(manager: &MidiDeviceManager, device: &str, tokens: &[String]) -> Result<()> {
    let data = parse_hex_tokens(tokens)
        .with_context(|| format!("Invalid hex bytes: {}", tokens.join(" ")))?;

    manager.start().context("Failed to start MIDI client")?;
    let result = manager.try_send_data_to_device_named(&data, device);
    manager.stop();

    result.with_context(|| format!("Failed to send to '{}'", device))?;
    println!("{} {} -> {}", "OUT".red(), format_hex(&data), device);
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .init();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        return;
    }
    info!("Shutdown signal received");
}
