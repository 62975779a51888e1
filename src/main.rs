#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Result};
use indicatif::{ProgressBar, ProgressStyle};

use wch_isp_loader::serial::SerialTransport;
use wch_isp_loader::usb::UsbTransport;
use wch_isp_loader::{Flasher, Options, Transport, DATA_FLASH_SIZE};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Connection method (usb or serial)
    #[structopt(long, default_value = "usb")]
    method: Method,

    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    action: Action,
}

#[derive(Copy, Clone, PartialEq, Debug)]
enum Method {
    Usb,
    Serial,
}

impl core::str::FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "usb" => Ok(Method::Usb),
            "serial" | "uart" => Ok(Method::Serial),
            _ => Err(format!("unknown method '{}' (expected usb or serial)", s)),
        }
    }
}

#[derive(Clone, Debug, StructOpt)]
enum Action {
    /// Read and print the chip identification block
    Info,

    /// Write a raw firmware image to code flash
    Flash {
        /// Raw binary image
        file: PathBuf,

        /// Load address for the image
        #[structopt(long, default_value = "0", parse(try_from_str = parse_address))]
        address: u32,
    },

    /// Write a raw image to the DataFlash (EEPROM) region
    Eeprom {
        /// Raw binary image, exactly 32768 bytes
        file: PathBuf,
    },

    /// Leave the bootloader and restart the application firmware
    Reset,
}

fn parse_address(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn main() {
    // Parse out arguments
    let args = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(args.log_level, Config::default());

    if let Err(e) = run(&args) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    match args.method {
        Method::Serial => {
            info!("Connecting to {} at {} baud", args.port, args.baud);

            let transport = SerialTransport::open(&args.port, args.baud)
                .map_err(|e| anyhow!("failed to open {}: {}", args.port, e))?;

            execute(Flasher::new(transport, args.options.clone()), &args.action)
        }
        Method::Usb => {
            info!("Searching for a bootloader device on USB");

            let transport =
                UsbTransport::new().map_err(|e| anyhow!("failed to initialise libusb: {}", e))?;

            execute(Flasher::new(transport, args.options.clone()), &args.action)
        }
    }
}

fn execute<T>(mut flasher: Flasher<T>, action: &Action) -> Result<()>
where
    T: Transport,
    T::Error: Send + Sync + 'static,
{
    match action {
        Action::Info => {
            flasher.connect()?;

            let info = flasher.info()?;
            info!("Device info: {}", hex::encode(&info));

            flasher.close();
        }
        Action::Flash { file, address } => {
            let image = fs::read(file)
                .map_err(|e| anyhow!("failed to read {}: {}", file.display(), e))?;

            let mut segments = BTreeMap::new();
            segments.insert(*address, image);
            let total = segments.values().map(Vec::len).sum();

            flasher.connect()?;

            let bar = progress_bar(total);
            let tick = bar.clone();
            flasher.on_progress(move |written, _| tick.set_position(written as u64));

            let written = flasher.program(&segments)?;
            bar.finish();

            info!("Flashed {}", bytefmt::format(written as u64));
        }
        Action::Eeprom { file } => {
            let image = fs::read(file)
                .map_err(|e| anyhow!("failed to read {}: {}", file.display(), e))?;

            if image.len() != DATA_FLASH_SIZE {
                bail!(
                    "DataFlash image must be exactly {} bytes, got {}",
                    DATA_FLASH_SIZE,
                    image.len()
                );
            }

            flasher.connect()?;

            let bar = progress_bar(image.len());
            let tick = bar.clone();
            flasher.on_progress(move |written, _| tick.set_position(written as u64));

            let written = flasher.program_data_flash(&image)?;
            bar.finish();

            info!("Wrote {} to DataFlash", bytefmt::format(written as u64));
        }
        Action::Reset => {
            flasher.connect()?;
            flasher.reset()?;

            info!("Device reset");
        }
    }

    Ok(())
}

fn progress_bar(total: usize) -> ProgressBar {
    let bar = ProgressBar::new(total as u64);
    bar.set_style(ProgressStyle::default_bar().template("{bar:40} {bytes}/{total_bytes}"));
    bar
}
