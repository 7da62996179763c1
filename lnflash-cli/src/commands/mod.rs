//! Command implementations.
//!
//! Each group of subcommands lives in its own module. The helpers here open
//! the serial port and bring the chip up to the RAM code stage.

pub(crate) mod flash;
pub(crate) mod info;
pub(crate) mod ports;
pub(crate) mod read;
pub(crate) mod terminal;

use anyhow::{Context, Result, bail};
use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use lnflash::target::ln882h::protocol::{DEFAULT_BAUD, RAM_IMAGE_NAME};
use lnflash::{
    BootloaderSession, NativePort, NativePortEnumerator, PortEnumerator, SerialConfig, StdDelay,
};
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::{Cli, use_fancy_output};

/// Session type used by every device command.
pub(crate) type Session = BootloaderSession<NativePort, StdDelay>;

/// Baud rate from the command line, then config, then the bootloader default.
pub(crate) fn resolve_baud(cli: &Cli, config: &Config) -> u32 {
    cli.baud.or(config.connection.baud).unwrap_or(DEFAULT_BAUD)
}

/// RAM code image path from the command line, then config, then the stock name.
pub(crate) fn resolve_ramcode(cli: &Cli, config: &Config) -> PathBuf {
    cli.ramcode
        .clone()
        .or_else(|| config.ramcode.path.clone())
        .unwrap_or_else(|| PathBuf::from(RAM_IMAGE_NAME))
}

/// Pick the serial port: explicit choice, configured port, or the only port present.
pub(crate) fn resolve_port(cli: &Cli, config: &Config) -> Result<String> {
    if let Some(port) = cli.port.clone().or_else(|| config.connection.serial.clone()) {
        return Ok(port);
    }

    let ports = NativePortEnumerator::list_ports().context("Failed to enumerate serial ports")?;
    match ports.as_slice() {
        [] => bail!("No serial port found, connect the board or pass --port"),
        [only] => Ok(only.name.clone()),
        many => {
            let names: Vec<&str> = many.iter().map(|p| p.name.as_str()).collect();
            bail!(
                "Found multiple serial ports ({}), choose one with --port",
                names.join(", ")
            )
        },
    }
}

/// Open the configured serial port without talking to the chip.
pub(crate) fn open_port(cli: &Cli, config: &Config) -> Result<NativePort> {
    let port_name = resolve_port(cli, config)?;
    let baud = resolve_baud(cli, config);
    if !cli.quiet {
        eprintln!(
            "{} Using port {} @ {baud}",
            style("🔌").cyan(),
            style(&port_name).cyan()
        );
    }
    NativePort::open(&SerialConfig::new(&port_name, baud))
        .with_context(|| format!("Failed to open serial port {port_name}"))
}

fn load_ram_code(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read RAM code {}", path.display()))
}

/// Open the port, sync with the bootloader and start the RAM code.
pub(crate) fn open_session(cli: &Cli, config: &Config) -> Result<Session> {
    let ram_path = resolve_ramcode(cli, config);
    let ram_code = load_ram_code(&ram_path)?;
    let ram_name = ram_path
        .file_name()
        .map_or_else(|| RAM_IMAGE_NAME.to_string(), |n| n.to_string_lossy().into_owned());

    let port = open_port(cli, config)?;
    let mut session = BootloaderSession::new(port, StdDelay);

    if !cli.quiet {
        eprintln!("{} Waiting for the bootloader, reset the board", style("⏳").yellow());
    }
    if let Err(err) = session.bring_up(&ram_name, &ram_code) {
        let _ = session.close();
        return Err(anyhow::Error::from(err).context("Failed to start the RAM code"));
    }
    if !cli.quiet {
        eprintln!("{} RAM code running", style("✓").green());
    }

    let uid = session.flash_uid().context("Failed to read the flash UID")?;
    if let Some(line) = uid.get(1) {
        println!("Flash UID: {}", line.trim());
    }

    Ok(session)
}

/// Run `f` on a freshly brought-up session and close the port afterwards.
pub(crate) fn with_session<T>(
    cli: &Cli,
    config: &Config,
    f: impl FnOnce(&mut Session) -> Result<T>,
) -> Result<T> {
    let mut session = open_session(cli, config)?;
    let result = f(&mut session);
    if let Err(e) = session.close() {
        log::debug!("Closing port failed: {e}");
    }
    result
}

/// Print reply lines from a query on stdout.
pub(crate) fn print_reply(lines: &[String]) {
    for line in lines {
        let line = line.trim();
        if !line.is_empty() {
            println!("{line}");
        }
    }
}

/// Byte progress bar on stderr, hidden in quiet or non-TTY mode.
pub(crate) fn byte_progress(cli: &Cli, total: u64) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(total);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
            )
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb
}
