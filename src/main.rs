use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, LevelFilter};

use mxt_flasher::i2c::I2cTransport;
use mxt_flasher::{FlashError, FlashOutcome, FlashSession};

#[derive(Parser)]
#[command(name = "mxt-flasher")]
#[command(about = "Bootloader flasher for Atmel maXTouch touchscreen controllers")]
#[command(version)]
struct Cli {
    /// Firmware image to flash (ASCII-hex frame format)
    file: PathBuf,

    /// Expected firmware version after flashing; skips the flash if the
    /// chip already reports this version
    #[arg(short = 'r', long = "version")]
    version: Option<String>,

    /// I2C adapter number (e.g. 1 for /dev/i2c-1)
    #[arg(short = 'a', long = "adapter", default_value_t = 0)]
    adapter: u8,

    /// Application-mode I2C slave address; if omitted, the device is
    /// discovered with a scan
    #[arg(short = 'b', long = "address", value_parser = parse_address)]
    address: Option<u8>,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_address(s: &str) -> Result<u8, String> {
    if let Some(hex_str) = s.strip_prefix("0x") {
        u8::from_str_radix(hex_str, 16).map_err(|_| format!("Invalid hex address: {}", s))
    } else {
        s.parse::<u8>().map_err(|_| format!("Invalid address: {}", s))
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .parse_default_env()
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if !cli.file.exists() {
        anyhow::bail!("firmware file not found: {}", cli.file.display());
    }

    let transport =
        I2cTransport::new(cli.adapter, cli.address).context("failed to open I2C transport")?;

    let mut session = FlashSession::new(transport, cli.adapter, cli.address, cli.version);

    info!("flashing {}", cli.file.display());
    match session.flash(&cli.file) {
        Ok(FlashOutcome::Success { version }) => {
            info!("SUCCESS - version {}", version);
            Ok(())
        }
        Ok(FlashOutcome::SentNoVerify) => {
            info!("SUCCESS - frames sent, no application-mode address to verify against");
            Ok(())
        }
        Ok(FlashOutcome::AlreadyAtVersion { version }) => {
            info!("firmware already at version {}, nothing to do", version);
            Ok(())
        }
        Err(e) => Err(report_error(e)),
    }
}

fn report_error(e: FlashError) -> anyhow::Error {
    match &e {
        FlashError::FrameCrcFail { frame_no, .. } => anyhow::anyhow!("{e} (frame {frame_no})"),
        other => anyhow::anyhow!("{other}"),
    }
}
