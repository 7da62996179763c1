//! lnflash CLI - Command-line tool for flashing LN882H chips.
//!
//! ## Features
//!
//! - Flash raw firmware images through the RAM code loader
//! - Erase and read back flash (main array and OTP)
//! - Query flash, MAC and GPIO state
//! - Interactive pass-through terminal to the RAM code
//! - YMODEM receive
//! - Configuration files and environment variable support

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Exit code for an operation cancelled with Ctrl-C.
const EXIT_INTERRUPTED: i32 = 130;

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// lnflash - A cross-platform tool for flashing LN882H chips.
///
/// Environment variables:
///   LNFLASH_PORT      - Default serial port
///   LNFLASH_BAUD      - Default baud rate (default: 115200)
///   LNFLASH_RAMCODE   - Path to the RAM code image
#[derive(Parser)]
#[command(name = "lnflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port to use.
    #[arg(short, long, global = true, env = "LNFLASH_PORT")]
    port: Option<String>,

    /// Baud rate for the bootloader handshake [default: 115200].
    #[arg(short, long, global = true, env = "LNFLASH_BAUD")]
    baud: Option<u32>,

    /// RAM code image uploaded before every device command [default: LN882H_RAM_BIN.bin].
    #[arg(long, global = true, env = "LNFLASH_RAMCODE", value_name = "PATH")]
    ramcode: Option<PathBuf>,

    /// Increase verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only print warnings and errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this config file instead of lnflash.toml and the global config.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available serial ports.
    ListPorts {
        /// Print the port list as JSON on stdout.
        #[arg(long)]
        json: bool,
    },

    /// Program a firmware image into flash.
    Flash {
        /// Firmware image.
        firmware: PathBuf,

        /// Flash start address [default: 0x0].
        #[arg(short, long, value_parser = parse_hex_u32)]
        address: Option<u32>,
    },

    /// Erase the whole flash.
    Erase,

    /// Read flash into a file, verifying every block.
    Read {
        /// Output file.
        output: PathBuf,

        /// Number of bytes to read (hex).
        #[arg(short, long, value_parser = parse_hex_u32)]
        size: Option<u32>,

        /// Start address (hex).
        #[arg(long, value_parser = parse_hex_u32)]
        start: Option<u32>,

        /// Read the OTP area instead of the main array.
        #[arg(long)]
        otp: bool,
    },

    /// Hex dump a flash range with the RAM code's fdump command.
    Dump {
        /// Start address (hex).
        #[arg(long, value_parser = parse_hex_u32, default_value = "0x0")]
        start: u32,

        /// Number of bytes (hex).
        #[arg(long, value_parser = parse_hex_u32, default_value = "0x100")]
        len: u32,
    },

    /// Show flash information and unique ID.
    Info,

    /// Show the MAC address stored in OTP and the local MAC.
    Mac,

    /// Show the OTP lock state.
    OtpLock,

    /// Read a GPIO pin.
    GpioRead {
        /// Pin name as understood by the RAM code (e.g. "A10").
        pin: String,
    },

    /// Drive a GPIO pin.
    GpioWrite {
        /// Pin name as understood by the RAM code.
        pin: String,
        /// Value to write.
        value: String,
    },

    /// Read every GPIO pin.
    GpioAll,

    /// Interactive pass-through terminal to the RAM code.
    Terminal,

    /// Receive a file over YMODEM into a directory.
    Receive {
        /// Destination directory.
        dir: PathBuf,
    },
}

/// Parse hexadecimal address (supports 0x prefix and underscores).
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    // Support underscore separators like 0x00_20_00_00
    let s: String = s.chars().filter(|c| *c != '_').collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex value: {e}"))
}

/// Map an error to the process exit code.
fn exit_code(err: &anyhow::Error) -> i32 {
    let interrupted = err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<lnflash::Error>())
        .any(|e| matches!(e, lnflash::Error::Interrupted));
    if interrupted { EXIT_INTERRUPTED } else { 1 }
}

fn install_interrupt_handler() {
    let result = ctrlc::set_handler(|| {
        if INTERRUPTED.swap(true, Ordering::SeqCst) {
            // Second Ctrl-C: give up immediately
            std::process::exit(EXIT_INTERRUPTED);
        }
    });
    if let Err(e) = result {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    lnflash::set_interrupt_checker(was_interrupted);
}

fn main() {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "lnflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    install_interrupt_handler();

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code(&err));
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
        Commands::Flash { firmware, address } => {
            commands::flash::cmd_flash(cli, &config, firmware, *address)
        },
        Commands::Erase => commands::flash::cmd_erase(cli, &config),
        Commands::Read {
            output,
            size,
            start,
            otp,
        } => commands::read::cmd_read(cli, &config, output, *size, *start, *otp),
        Commands::Dump { start, len } => commands::read::cmd_dump(cli, &config, *start, *len),
        Commands::Info => commands::info::cmd_info(cli, &config),
        Commands::Mac => commands::info::cmd_mac(cli, &config),
        Commands::OtpLock => commands::info::cmd_otp_lock(cli, &config),
        Commands::GpioRead { pin } => commands::info::cmd_gpio_read(cli, &config, pin),
        Commands::GpioWrite { pin, value } => {
            commands::info::cmd_gpio_write(cli, &config, pin, value)
        },
        Commands::GpioAll => commands::info::cmd_gpio_all(cli, &config),
        Commands::Terminal => commands::terminal::cmd_terminal(cli, &config),
        Commands::Receive { dir } => commands::terminal::cmd_receive(cli, &config, dir),
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    // ---- clap validation ----

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_flash() {
        let cli = Cli::try_parse_from([
            "lnflash",
            "--port",
            "/dev/ttyUSB0",
            "--baud",
            "115200",
            "flash",
            "app.bin",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cli.baud, Some(115200));
        match cli.command {
            Commands::Flash { firmware, address } => {
                assert_eq!(firmware, PathBuf::from("app.bin"));
                assert!(address.is_none());
            },
            _ => panic!("expected flash"),
        }
    }

    #[test]
    fn test_cli_parse_flash_with_address() {
        let cli =
            Cli::try_parse_from(["lnflash", "flash", "app.bin", "--address", "0x7000"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Flash {
                address: Some(0x7000),
                ..
            }
        ));
    }

    #[test]
    fn test_cli_parse_read() {
        let cli = Cli::try_parse_from([
            "lnflash", "read", "out.bin", "--size", "0x1000", "--start", "0x200", "--otp",
        ])
        .unwrap();
        match cli.command {
            Commands::Read {
                output,
                size,
                start,
                otp,
            } => {
                assert_eq!(output, PathBuf::from("out.bin"));
                assert_eq!(size, Some(0x1000));
                assert_eq!(start, Some(0x200));
                assert!(otp);
            },
            _ => panic!("expected read"),
        }
    }

    #[test]
    fn test_cli_parse_read_defaults() {
        let cli = Cli::try_parse_from(["lnflash", "read", "out.bin"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Read {
                size: None,
                start: None,
                otp: false,
                ..
            }
        ));
    }

    #[test]
    fn test_cli_parse_dump_defaults() {
        let cli = Cli::try_parse_from(["lnflash", "dump"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Dump {
                start: 0,
                len: 0x100
            }
        ));
    }

    #[test]
    fn test_cli_parse_gpio_write() {
        let cli = Cli::try_parse_from(["lnflash", "gpio-write", "A10", "1"]).unwrap();
        match cli.command {
            Commands::GpioWrite { pin, value } => {
                assert_eq!(pin, "A10");
                assert_eq!(value, "1");
            },
            _ => panic!("expected gpio-write"),
        }
    }

    #[test]
    fn test_cli_parse_simple_subcommands() {
        for name in ["erase", "info", "mac", "otp-lock", "gpio-all", "terminal"] {
            assert!(
                Cli::try_parse_from(["lnflash", name]).is_ok(),
                "{name} should parse"
            );
        }
    }

    #[test]
    fn test_cli_parse_receive() {
        let cli = Cli::try_parse_from(["lnflash", "receive", "incoming"]).unwrap();
        assert!(matches!(cli.command, Commands::Receive { .. }));
    }

    #[test]
    fn test_cli_default_values() {
        let cli = Cli::try_parse_from(["lnflash", "list-ports"]).unwrap();
        assert!(!cli.quiet);
        assert!(cli.port.is_none() || env::var("LNFLASH_PORT").is_ok());
        assert!(cli.config_path.is_none());
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_cli_global_options() {
        let cli = Cli::try_parse_from([
            "lnflash",
            "--port",
            "COM3",
            "--baud",
            "230400",
            "--ramcode",
            "ram.bin",
            "-vv",
            "--quiet",
            "--config",
            "/tmp/config.toml",
            "list-ports",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("COM3"));
        assert_eq!(cli.baud, Some(230400));
        assert_eq!(cli.ramcode, Some(PathBuf::from("ram.bin")));
        assert_eq!(cli.verbose, 2);
        assert!(cli.quiet);
        assert_eq!(cli.config_path, Some(PathBuf::from("/tmp/config.toml")));
    }

    #[test]
    fn test_cli_missing_subcommand() {
        assert!(Cli::try_parse_from(["lnflash"]).is_err());
    }

    #[test]
    fn test_cli_flash_requires_firmware() {
        assert!(Cli::try_parse_from(["lnflash", "flash"]).is_err());
    }

    #[test]
    fn test_cli_invalid_hex_address() {
        assert!(Cli::try_parse_from(["lnflash", "flash", "a.bin", "--address", "xyz"]).is_err());
    }

    // ---- parse_hex_u32 ----

    #[test]
    fn test_parse_hex_u32_with_prefix() {
        assert_eq!(parse_hex_u32("0x00200000").unwrap(), 0x0020_0000);
        assert_eq!(parse_hex_u32("0X00200000").unwrap(), 0x0020_0000);
    }

    #[test]
    fn test_parse_hex_u32_without_prefix() {
        assert_eq!(parse_hex_u32("DEADBEEF").unwrap(), 0xDEAD_BEEF);
        assert_eq!(parse_hex_u32("ff").unwrap(), 0xFF);
    }

    #[test]
    fn test_parse_hex_u32_with_underscores() {
        assert_eq!(parse_hex_u32("0x00_20_00_00").unwrap(), 0x0020_0000);
    }

    #[test]
    fn test_parse_hex_u32_with_whitespace() {
        assert_eq!(parse_hex_u32("  0xFF  ").unwrap(), 0xFF);
    }

    #[test]
    fn test_parse_hex_u32_invalid() {
        assert!(parse_hex_u32("not_hex").is_err());
        assert!(parse_hex_u32("0xGG").is_err());
    }

    #[test]
    fn test_parse_hex_u32_overflow() {
        assert!(parse_hex_u32("0x1FFFFFFFF").is_err());
    }

    // ---- exit codes ----

    #[test]
    fn test_exit_code_interrupted() {
        let err = anyhow::Error::from(lnflash::Error::Interrupted).context("syncing");
        assert_eq!(exit_code(&err), EXIT_INTERRUPTED);
    }

    #[test]
    fn test_exit_code_other_errors() {
        let err = anyhow::Error::from(lnflash::Error::Timeout("no banner".into()));
        assert_eq!(exit_code(&err), 1);
        assert_eq!(exit_code(&anyhow::anyhow!("plain")), 1);
    }
}
