//! Flash and erase command implementations.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use super::{byte_progress, print_reply, with_session};
use crate::Cli;
use crate::config::Config;

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &Config,
    firmware: &Path,
    address: Option<u32>,
) -> Result<()> {
    if !cli.quiet {
        eprintln!(
            "{} Loading firmware {}",
            style("📦").cyan(),
            firmware.display()
        );
    }
    let image = std::fs::read(firmware)
        .with_context(|| format!("Failed to read firmware {}", firmware.display()))?;
    let name = firmware
        .file_name()
        .map_or_else(|| "firmware.bin".to_string(), |n| n.to_string_lossy().into_owned());
    let address = address.or(config.flash.start_addr).unwrap_or(0);

    if !cli.quiet {
        eprintln!(
            "{} {} ({} bytes) @ 0x{address:08X}",
            style("ℹ").blue(),
            name,
            image.len()
        );
    }

    with_session(cli, config, |session| {
        let pb = byte_progress(cli, image.len() as u64);
        let sent = session
            .flash_program(address, &name, &image, |done, total| {
                pb.set_length(total);
                pb.set_position(done);
            })
            .context("Flashing failed")?;
        pb.finish_and_clear();

        if !cli.quiet {
            eprintln!(
                "\n{} Flashed {sent} bytes",
                style("🎉").green().bold()
            );
        }
        Ok(())
    })
}

/// Erase command implementation.
pub(crate) fn cmd_erase(cli: &Cli, config: &Config) -> Result<()> {
    with_session(cli, config, |session| {
        if !cli.quiet {
            eprintln!("{} Erasing flash...", style("🗑").yellow());
        }
        let reply = session.flash_erase_all().context("Erase failed")?;
        print_reply(&reply);
        if !cli.quiet {
            eprintln!("{} Erase complete", style("✓").green());
        }
        Ok(())
    })
}
