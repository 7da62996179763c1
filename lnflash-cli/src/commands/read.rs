//! Flash read and dump command implementations.

use anyhow::{Context, Result};
use console::style;
use lnflash::FlashRegion;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use super::{byte_progress, with_session};
use crate::Cli;
use crate::config::Config;

/// Default read size for the main flash array (2 MiB).
pub(crate) const DEFAULT_FLASH_READ_SIZE: u32 = 0x20_0000;

/// Default read size for the OTP area (one block).
pub(crate) const DEFAULT_OTP_READ_SIZE: u32 = 0x100;

/// Number of bytes `read` fetches when `--size` is not given.
fn read_size(size: Option<u32>, config: &Config, region: FlashRegion) -> u32 {
    match region {
        FlashRegion::Otp => size.unwrap_or(DEFAULT_OTP_READ_SIZE),
        FlashRegion::Main => size
            .or(config.flash.read_size)
            .unwrap_or(DEFAULT_FLASH_READ_SIZE),
    }
}

/// Read command implementation.
pub(crate) fn cmd_read(
    cli: &Cli,
    config: &Config,
    output: &Path,
    size: Option<u32>,
    start: Option<u32>,
    otp: bool,
) -> Result<()> {
    let region = if otp { FlashRegion::Otp } else { FlashRegion::Main };
    let len = read_size(size, config, region);
    let start = start.or(config.flash.start_addr).unwrap_or(0);

    with_session(cli, config, |session| {
        let file = File::create(output)
            .with_context(|| format!("Failed to create {}", output.display()))?;
        let mut writer = BufWriter::new(file);

        if !cli.quiet {
            eprintln!(
                "{} Reading 0x{len:X} bytes from 0x{start:08X} into {}",
                style("📥").cyan(),
                output.display()
            );
        }

        let pb = byte_progress(cli, u64::from(len));
        let written = session
            .read_flash_to(&mut writer, start, len, region, |done, _| pb.set_position(done))
            .context("Flash read failed")?;
        pb.finish_and_clear();

        if !cli.quiet {
            eprintln!("{} Read {written} bytes", style("✓").green());
        }
        Ok(())
    })
}

/// Dump command implementation.
pub(crate) fn cmd_dump(cli: &Cli, config: &Config, start: u32, len: u32) -> Result<()> {
    with_session(cli, config, |session| {
        let lines = session.dump(start, len).context("Dump failed")?;
        for line in lines {
            println!("{line}");
        }
        Ok(())
    })
}
