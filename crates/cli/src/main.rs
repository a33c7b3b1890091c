//! fifo-stream
//!
//! Streams data from an FTDI FT232H/FT2232H in synchronous FIFO mode to a
//! file or stdout, keeping a pool of bulk transfers in flight.

mod config;
mod sink;
mod usb;

use anyhow::{Context as _, Result};
use clap::Parser;
use common::metrics::summarize_report;
use common::setup_logging;
use config::AppConfig;
use rusb::{Context, UsbContext};
use sink::PayloadSink;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use stream::{ChipType, SessionReport, StreamSession};
use tokio::signal;
use tracing::{error, info, warn};
use usb::{FtdiDevice, FtdiInterface, LibusbTransport};

/// FTDI vendor ID, used when listing devices
const FTDI_VENDOR_ID: u16 = 0x0403;

#[derive(Parser, Debug)]
#[command(name = "fifo-stream")]
#[command(
    author,
    version,
    about = "Stream data from an FTDI chip in synchronous FIFO mode"
)]
#[command(long_about = "
Reads continuously from an FT232H or FT2232H configured for synchronous
245 FIFO mode and writes the payload to a file or stdout.

EXAMPLES:
    # Stream from the default FT232H to a file for 10 seconds
    fifo-stream --output capture.bin --duration 10

    # Stream 100 MB from channel A of an FT2232H to stdout
    fifo-stream --pid 0x6010 --interface A --bytes 104857600 > capture.bin

    # List attached FTDI devices
    fifo-stream --list-devices

CONFIGURATION:
    The configuration file is looked up in the following order:
    1. Path specified with --config
    2. ~/.config/fifo-stream/config.toml
    3. /etc/fifo-stream/config.toml
    4. Built-in defaults

    Command line options override values from the file.
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List FTDI devices and exit
    #[arg(long)]
    list_devices: bool,

    /// USB vendor ID (e.g. 0x0403)
    #[arg(long, value_name = "VID")]
    vid: Option<String>,

    /// USB product ID (e.g. 0x6014)
    #[arg(long, value_name = "PID")]
    pid: Option<String>,

    /// FTDI channel
    #[arg(short, long, value_enum)]
    interface: Option<FtdiInterface>,

    /// Output file ("-" for stdout)
    #[arg(short, long, value_name = "PATH")]
    output: Option<String>,

    /// Stop after this many payload bytes
    #[arg(short, long, value_name = "BYTES")]
    bytes: Option<u64>,

    /// Stop after this many seconds
    #[arg(short, long, value_name = "SECS")]
    duration: Option<u64>,

    /// Packets read by each transfer
    #[arg(long, value_name = "N")]
    packets_per_transfer: Option<usize>,

    /// Transfers kept in flight
    #[arg(long, value_name = "N")]
    transfers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

impl Args {
    /// Apply command line overrides on top of the file configuration
    fn apply(&self, config: &mut AppConfig) {
        if let Some(vid) = &self.vid {
            config.device.vendor_id = vid.clone();
        }
        if let Some(pid) = &self.pid {
            config.device.product_id = pid.clone();
        }
        if let Some(interface) = self.interface {
            config.device.interface = interface;
        }
        if let Some(output) = &self.output {
            config.output.path = Some(output.clone());
        }
        if self.bytes.is_some() {
            config.output.byte_limit = self.bytes;
        }
        if self.duration.is_some() {
            config.output.duration_secs = self.duration;
        }
        if let Some(packets) = self.packets_per_transfer {
            config.stream.packets_per_transfer = packets;
        }
        if let Some(transfers) = self.transfers {
            config.stream.num_transfers = transfers;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = AppConfig::default();
        let path = AppConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(ExitCode::SUCCESS);
    }

    let mut config = if let Some(ref path) = args.config {
        AppConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        AppConfig::load_or_default()
    };
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    setup_logging(&config.logging.level).context("Failed to setup logging")?;

    info!("fifo-stream v{}", env!("CARGO_PKG_VERSION"));

    if args.list_devices {
        tokio::task::spawn_blocking(list_devices)
            .await
            .context("Device listing task failed")??;
        return Ok(ExitCode::SUCCESS);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let signal_stop = Arc::clone(&stop);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, stopping stream...");
                signal_stop.store(true, Ordering::Relaxed);
            }
            Err(e) => error!("Error waiting for Ctrl+C: {}", e),
        }
    });

    // libusb calls block, keep them off the async workers
    let result = tokio::task::spawn_blocking(move || run_stream(&config, stop))
        .await
        .context("Stream task panicked")?;

    match result {
        Ok(report) => {
            info!("Stream complete: {}", summarize_report(&report));
            if report.leaked > 0 {
                warn!("{} transfers were still pending at exit", report.leaked);
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!("Stream failed: {}", e);
            // Exit status carries the libusb-style code, truncated like exit(2)
            Ok(ExitCode::from(e.code() as u8))
        }
    }
}

/// Open the device and stream until a limit, a signal or a failure
fn run_stream(config: &AppConfig, stop: Arc<AtomicBool>) -> common::Result<SessionReport> {
    let vendor_id = config
        .device
        .vendor_id()
        .map_err(|e| common::Error::Config(e.to_string()))?;
    let product_id = config
        .device
        .product_id()
        .map_err(|e| common::Error::Config(e.to_string()))?;

    let context = Context::new().map_err(usb::map_rusb_error)?;
    let mut device = FtdiDevice::open(
        &context,
        vendor_id,
        product_id,
        config.device.interface,
        config.device.read_timeout(),
    )?;
    // Declared after the device so pending transfers are freed first
    let mut transport = LibusbTransport::new(device.handle(), device.interface().read_endpoint());

    let writer: Box<dyn Write> = match config.output.resolved_path() {
        Some(path) => {
            info!("Writing payload to {}", path.display());
            Box::new(BufWriter::new(File::create(&path)?))
        }
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };

    let mut sink = PayloadSink::new(writer, stop)
        .with_byte_limit(config.output.byte_limit)
        .with_duration_limit(config.output.duration_limit());

    let session = StreamSession::new(config.stream.clone());
    let result = session.run(&mut device, &mut transport, &mut sink);

    info!("{} bytes written", sink.bytes_written());
    let flushed = sink.finish();

    let report = result?;
    flushed?;
    Ok(report)
}

/// Print FTDI devices visible on the bus
fn list_devices() -> Result<()> {
    let context = Context::new().context("Failed to initialize libusb")?;
    let devices = context.devices().context("Failed to enumerate devices")?;

    let mut found = 0;
    for device in devices.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        if descriptor.vendor_id() != FTDI_VENDOR_ID {
            continue;
        }
        found += 1;

        let chip = ChipType::from_bcd_device(usb::device::bcd_device(descriptor.device_version()));
        println!(
            "  {:04x}:{:04x} - {} (Bus {:03} Device {:03}){}",
            descriptor.vendor_id(),
            descriptor.product_id(),
            chip,
            device.bus_number(),
            device.address(),
            if chip.supports_sync_fifo() {
                ""
            } else {
                " - no synchronous FIFO mode"
            }
        );
    }

    if found == 0 {
        println!("No FTDI devices found.");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_file_values() {
        let args = Args::parse_from([
            "fifo-stream",
            "--pid",
            "0x6010",
            "--interface",
            "B",
            "--bytes",
            "1024",
            "--transfers",
            "64",
            "-o",
            "-",
        ]);
        let mut config = AppConfig::default();
        config.output.path = Some("file.bin".to_string());
        args.apply(&mut config);

        assert_eq!(config.device.product_id().unwrap(), 0x6010);
        assert_eq!(config.device.vendor_id().unwrap(), 0x0403);
        assert_eq!(config.device.interface, FtdiInterface::B);
        assert_eq!(config.output.byte_limit, Some(1024));
        assert_eq!(config.stream.num_transfers, 64);
        assert_eq!(config.stream.packets_per_transfer, 8);
        assert!(config.output.resolved_path().is_none());
    }

    #[test]
    fn test_no_overrides_keep_file_values() {
        let args = Args::parse_from(["fifo-stream"]);
        let mut config = AppConfig::default();
        config.output.duration_secs = Some(30);
        args.apply(&mut config);

        assert_eq!(config.output.duration_secs, Some(30));
        assert_eq!(config.logging.level, "info");
    }
}
