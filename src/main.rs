#[macro_use]
extern crate log;

use std::fs::File;
use std::path::PathBuf;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};

use console_flash_dump::protocol::CONSOLE_BAUD;
use console_flash_dump::{ConfigError, Dumper, Options};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port connected to the router console, e.g. /dev/ttyUSB0
    #[structopt(long)]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    /// File to write the flash image to, truncated if it exists
    #[structopt(long, default_value = "firmware.dump", parse(from_os_str))]
    output: PathBuf,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

fn main() -> Result<(), anyhow::Error> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if o.port.trim().is_empty() {
        return Err(ConfigError::MissingPort.into());
    }
    o.options.validate()?;

    info!("Target: MediaTek MT7628KN, Macronix MX25L1606E");
    info!("Chunk size: {} bytes", o.options.chunk_size);
    info!("Cycle delay: {} ms", o.options.cycle_delay_ms);
    info!("Output: {}", o.output.display());
    info!("Serial port: {}", o.port);
    info!(
        "Memory size: {} ({} bytes)",
        bytefmt::format(o.options.memory_size as u64),
        o.options.memory_size
    );
    info!("Read cycles: {}", o.options.cycles());

    if o.baud != CONSOLE_BAUD {
        warn!("Console normally runs at {} baud", CONSOLE_BAUD);
    }

    info!("Connecting to serial port");

    let mut p = Dumper::linux(&o.port, o.baud, o.options.clone())
        .with_context(|| format!("Error connecting to serial port {}", o.port))?;

    info!("Navigating console menu");

    p.init().context("Error initialising console")?;

    let file = File::create(&o.output)
        .with_context(|| format!("Error creating {}", o.output.display()))?;

    let bar = ProgressBar::new(o.options.memory_size as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{bytes}/{total_bytes} {wide_bar} {bytes_per_sec} eta {eta}")
            .progress_chars("=>-"),
    );

    let written = match p.dump(file, |n| bar.set_position(n)) {
        Ok(n) => n,
        Err(e) => {
            bar.abandon();
            error!("Dump failed: {}", e);
            return Err(e.into());
        }
    };

    bar.finish();

    info!(
        "Wrote {} to {}",
        bytefmt::format(written),
        o.output.display()
    );

    Ok(())
}
