//! Device query command implementations.

use anyhow::{Context, Result};

use super::{Session, print_reply, with_session};
use crate::Cli;
use crate::config::Config;

fn query(
    cli: &Cli,
    config: &Config,
    what: &'static str,
    f: impl FnOnce(&mut Session) -> lnflash::Result<Vec<String>>,
) -> Result<()> {
    with_session(cli, config, |session| {
        let reply = f(session).with_context(|| format!("Failed to read {what}"))?;
        print_reply(&reply);
        Ok(())
    })
}

/// Info command implementation.
pub(crate) fn cmd_info(cli: &Cli, config: &Config) -> Result<()> {
    query(cli, config, "flash info", Session::flash_info)
}

/// Mac command implementation.
pub(crate) fn cmd_mac(cli: &Cli, config: &Config) -> Result<()> {
    with_session(cli, config, |session| {
        let otp = session
            .get_mac_in_flash_otp()
            .context("Failed to read the OTP MAC")?;
        print_reply(&otp);
        let local = session
            .get_m_local_mac()
            .context("Failed to read the local MAC")?;
        print_reply(&local);
        Ok(())
    })
}

/// OTP lock state command implementation.
pub(crate) fn cmd_otp_lock(cli: &Cli, config: &Config) -> Result<()> {
    query(cli, config, "OTP lock state", Session::flash_otp_get_lock_state)
}

/// GPIO read command implementation.
pub(crate) fn cmd_gpio_read(cli: &Cli, config: &Config, pin: &str) -> Result<()> {
    query(cli, config, "GPIO", |session| session.gpio_read(pin))
}

/// GPIO write command implementation.
pub(crate) fn cmd_gpio_write(cli: &Cli, config: &Config, pin: &str, value: &str) -> Result<()> {
    query(cli, config, "GPIO", |session| session.gpio_write(pin, value))
}

/// GPIO read-all command implementation.
pub(crate) fn cmd_gpio_all(cli: &Cli, config: &Config) -> Result<()> {
    query(cli, config, "GPIO", Session::gpio_read_all)
}
