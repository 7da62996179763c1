//! LN882H bootloader session.
//!
//! Drives a device from power-up to a running RAM code and then issues flash
//! commands through it:
//!
//! ```text
//! Disconnected -> Syncing -> BootloaderReady -> RamCodeUploading -> RamCodeRunning
//!                                                                       |
//!                                                      flash / gpio / otp commands
//! ```
//!
//! The handshake loops (sync, RAM code confirmation, baud confirmation) have
//! no overall bound because the device may take arbitrarily long to boot.
//! They poll [`crate::is_interrupted_requested`] once per attempt so the
//! embedding application can stop them.
//!
//! ## Example
//!
//! ```rust,no_run
//! use lnflash::{BootloaderSession, NativePort, StdDelay};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let port = NativePort::open_simple("/dev/ttyUSB0", 115200)?;
//!     let ram_code = std::fs::read("LN882H_RAM_BIN.bin")?;
//!
//!     let mut session = BootloaderSession::new(port, StdDelay);
//!     session.bring_up("LN882H_RAM_BIN.bin", &ram_code)?;
//!
//!     for line in session.flash_info()? {
//!         println!("{line}");
//!     }
//!     Ok(())
//! }
//! ```

use crate::delay::Delay;
use crate::error::{Error, Result};
use crate::monitor::drain_utf8_lossy;
use crate::port::{Accumulated, Accumulator, Port, PortExt};
use crate::protocol::ymodem::{YmodemConfig, YmodemSender};
use crate::target::ln882h::protocol::{
    BOOTLOADER_BANNER, Command, DEFAULT_BAUD, DUMP_SENTINEL, FLASH_BLOCK_HEX_LEN, FLASH_BLOCK_SIZE,
    FlashBlock, FlashRegion, PROGRAM_BAUD, RAM_CODE_BANNER, RAM_IMAGE_LEN, RAM_LOAD_ADDR,
    UPGRADE_ACK_LEN,
};
use log::{debug, info, trace, warn};
use std::fmt;
use std::io::Write;
use std::time::Duration;

/// Poll interval while collecting pass-through output.
const TERMINAL_POLL: Duration = Duration::from_millis(10);

/// Protocol stage of a [`BootloaderSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing exchanged yet.
    Disconnected,
    /// Waiting for the bootloader banner.
    Syncing,
    /// Bootloader answered; RAM code can be loaded.
    BootloaderReady,
    /// RAM code transfer in progress.
    RamCodeUploading,
    /// RAM code confirmed; flash commands are available.
    RamCodeRunning,
    /// Port closed.
    Closed,
}

impl SessionState {
    /// Stable name used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Syncing => "Syncing",
            Self::BootloaderReady => "BootloaderReady",
            Self::RamCodeUploading => "RamCodeUploading",
            Self::RamCodeRunning => "RamCodeRunning",
            Self::Closed => "Closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Timing and protocol parameters of a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Quiet time before the first sync attempt.
    pub boot_settle: Duration,
    /// Wait before each sync attempt.
    pub sync_interval: Duration,
    /// Wait after the RAM code transfer for the jump to RAM.
    pub ram_code_settle: Duration,
    /// Wait before each RAM code confirmation attempt.
    pub ram_code_confirm_interval: Duration,
    /// Wait after switching the local baud rate.
    pub baud_settle: Duration,
    /// Wait before each baud confirmation attempt.
    pub baud_confirm_interval: Duration,
    /// Bound for each reply line.
    pub line_timeout: Duration,
    /// Attempts per YMODEM data packet.
    pub transfer_retries: u32,
    /// Poll interval while collecting a flash data line.
    pub flash_poll_interval: Duration,
    /// Empty polls before a flash data line is given up.
    pub flash_max_idle_polls: u32,
    /// Reads per flash block before it is reported invalid.
    pub flash_read_retries: u32,
    /// Quiet time that ends pass-through output.
    pub terminal_idle: Duration,
    /// Reply to `version` from the mask ROM bootloader.
    pub bootloader_banner: String,
    /// Reply to `version` from the RAM code.
    pub ram_code_banner: String,
    /// Load address for the RAM code.
    pub ram_load_addr: u32,
    /// Baud rate used while programming.
    pub program_baud: u32,
    /// Baud rate restored after programming.
    pub default_baud: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            boot_settle: Duration::from_secs(5),
            sync_interval: Duration::from_secs(2),
            ram_code_settle: Duration::from_secs(5),
            ram_code_confirm_interval: Duration::from_secs(5),
            baud_settle: Duration::from_secs(5),
            baud_confirm_interval: Duration::from_secs(1),
            line_timeout: Duration::from_secs(10),
            transfer_retries: 3,
            flash_poll_interval: Duration::from_millis(1),
            flash_max_idle_polls: 100,
            flash_read_retries: 3,
            terminal_idle: Duration::from_secs(1),
            bootloader_banner: BOOTLOADER_BANNER.to_string(),
            ram_code_banner: RAM_CODE_BANNER.to_string(),
            ram_load_addr: RAM_LOAD_ADDR,
            program_baud: PROGRAM_BAUD,
            default_baud: DEFAULT_BAUD,
        }
    }
}

impl SessionConfig {
    /// Set the per-line reply bound.
    #[must_use]
    pub fn with_line_timeout(mut self, timeout: Duration) -> Self {
        self.line_timeout = timeout;
        self
    }

    /// Set how often a flash block is re-read before it is reported invalid.
    #[must_use]
    pub fn with_flash_read_retries(mut self, retries: u32) -> Self {
        self.flash_read_retries = retries;
        self
    }

    /// Set the baud rate used while programming.
    #[must_use]
    pub fn with_program_baud(mut self, baud: u32) -> Self {
        self.program_baud = baud;
        self
    }
}

fn check_interrupted() -> Result<()> {
    if crate::is_interrupted_requested() {
        Err(Error::Interrupted)
    } else {
        Ok(())
    }
}

/// Session with one LN882H over one port.
///
/// Generic over the port `P` and the delay source `D`, so the handshake
/// loops can be driven without real time passing.
pub struct BootloaderSession<P: Port, D: Delay> {
    port: P,
    delay: D,
    config: SessionConfig,
    state: SessionState,
}

impl<P: Port, D: Delay> BootloaderSession<P, D> {
    /// Create a session with the default configuration.
    pub fn new(port: P, delay: D) -> Self {
        Self::with_config(port, delay, SessionConfig::default())
    }

    /// Create a session with a custom configuration.
    pub fn with_config(port: P, delay: D, config: SessionConfig) -> Self {
        Self {
            port,
            delay,
            config,
            state: SessionState::Disconnected,
        }
    }

    /// Current protocol stage.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Current local baud rate.
    pub fn baud_rate(&self) -> u32 {
        self.port.baud_rate()
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get a mutable reference to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the session and return the port without closing it.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Close the port. Any further operation fails.
    pub fn close(&mut self) -> Result<()> {
        info!("Closing {}", self.port.name());
        self.state = SessionState::Closed;
        self.port.close()
    }

    fn require(&self, expected: SessionState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidState {
                expected: expected.name(),
                actual: self.state.name(),
            })
        }
    }

    fn send(&mut self, cmd: &Command) -> Result<()> {
        debug!("Sending '{cmd}'");
        self.port.send_line(&cmd.to_string())
    }

    fn read_line(&mut self) -> Result<String> {
        self.port.read_line(self.config.line_timeout)
    }

    /// Read `count` lines, stopping early if one times out.
    ///
    /// Used by the handshake loops, where a timeout only means "not yet".
    fn read_reply_lenient(&mut self, count: usize) -> Result<Vec<String>> {
        let mut lines = Vec::with_capacity(count);
        for _ in 0..count {
            match self.read_line() {
                Ok(line) => {
                    debug!("<< {line}");
                    lines.push(line);
                },
                Err(e) if e.is_timeout() => break,
                Err(e) => return Err(e),
            }
        }
        Ok(lines)
    }

    /// Wait for the bootloader banner.
    ///
    /// Sends `version` every `sync_interval` until the reply line equals the
    /// banner. Returns the number of `version` commands sent.
    pub fn sync(&mut self) -> Result<u32> {
        if !matches!(self.state, SessionState::Disconnected | SessionState::Syncing) {
            self.require(SessionState::Disconnected)?;
        }
        self.state = SessionState::Syncing;

        info!("Syncing with LN882H on {}...", self.port.name());
        info!("Please reset the device to enter download mode.");
        self.port.discard_input()?;
        self.delay.delay(self.config.boot_settle);

        let mut attempts = 0;
        loop {
            check_interrupted()?;
            self.delay.delay(self.config.sync_interval);
            self.port.clear_buffers()?;

            attempts += 1;
            debug!("Sync attempt {attempts}, waiting for '{}'", self.config.bootloader_banner);
            self.send(&Command::Version)?;

            match self.read_line() {
                Ok(line) if line == self.config.bootloader_banner => {
                    info!("Bootloader ready: {line}");
                    self.state = SessionState::BootloaderReady;
                    return Ok(attempts);
                },
                Ok(line) => debug!("Unexpected sync reply {line:?}"),
                Err(e) if e.is_timeout() => trace!("No sync reply"),
                Err(e) => return Err(e),
            }
        }
    }

    /// Load the RAM code and wait until it answers.
    pub fn upload_ram_code(&mut self, name: &str, image: &[u8]) -> Result<()> {
        self.require(SessionState::BootloaderReady)?;

        if image.len() != RAM_IMAGE_LEN {
            warn!(
                "RAM code image is {} bytes, the stock image is {RAM_IMAGE_LEN}",
                image.len()
            );
        }

        self.state = SessionState::RamCodeUploading;
        self.send(&Command::DownloadRam {
            addr: self.config.ram_load_addr,
            len: image.len(),
        })?;

        info!("Uploading RAM code {name} ({} bytes)", image.len());
        let ymodem = YmodemConfig::default().with_max_retries(self.config.transfer_retries);
        let sent = YmodemSender::with_config(&mut self.port, ymodem).transfer(name, image, |sent, total| {
            trace!("RAM code: {sent}/{total}");
        });
        if let Err(e) = sent {
            self.state = SessionState::Disconnected;
            return Err(e);
        }

        info!("Starting RAM code, waiting {} s", self.config.ram_code_settle.as_secs());
        self.delay.delay(self.config.ram_code_settle);

        loop {
            check_interrupted()?;
            self.delay.delay(self.config.ram_code_confirm_interval);
            self.port.discard_input()?;

            debug!("Waiting for '{}'", self.config.ram_code_banner);
            self.send(&Command::Version)?;
            let reply = self.read_reply_lenient(2)?;
            if reply.get(1).is_some_and(|line| *line == self.config.ram_code_banner) {
                break;
            }
        }

        info!("RAM code running");
        self.state = SessionState::RamCodeRunning;
        Ok(())
    }

    /// Sync with the bootloader and start the RAM code.
    pub fn bring_up(&mut self, name: &str, image: &[u8]) -> Result<()> {
        self.sync()?;
        self.upload_ram_code(name, image)
    }

    /// Switch both ends of the link to `baud` and wait for the RAM code to
    /// answer at the new rate.
    pub fn change_baud_rate(&mut self, baud: u32) -> Result<()> {
        self.require(SessionState::RamCodeRunning)?;

        info!("Changing baud rate to {baud}");
        self.send(&Command::Baudrate(baud))?;
        self.port.discard_input()?;
        self.port.set_baud_rate(baud)?;

        debug!("Waiting {} s for the baud change", self.config.baud_settle.as_secs());
        self.delay.delay(self.config.baud_settle);
        self.port.clear_buffers()?;

        loop {
            check_interrupted()?;
            self.delay.delay(self.config.baud_confirm_interval);
            self.port.clear_buffers()?;

            self.send(&Command::Version)?;
            let reply = self.read_reply_lenient(2)?;
            if reply.iter().any(|line| line.contains(self.config.ram_code_banner.as_str())) {
                break;
            }
        }

        debug!("Baud rate changed to {baud}");
        Ok(())
    }

    /// Send a command and read its fixed-length reply.
    fn query(&mut self, cmd: &Command) -> Result<Vec<String>> {
        self.require(SessionState::RamCodeRunning)?;
        let count = cmd.reply_lines().unwrap_or(1);

        self.port.discard_input()?;
        self.send(cmd)?;

        let mut lines = Vec::with_capacity(count);
        for _ in 0..count {
            let line = self.read_line()?;
            info!("{}", line.trim());
            lines.push(line);
        }
        Ok(lines)
    }

    /// Program `image` at `start_addr`.
    ///
    /// Runs at `program_baud` and restores `default_baud` afterwards, also
    /// when the transfer fails. Returns the number of bytes sent.
    pub fn flash_program<F>(&mut self, start_addr: u32, name: &str, image: &[u8], progress: F) -> Result<u64>
    where
        F: FnMut(u64, u64),
    {
        self.require(SessionState::RamCodeRunning)?;
        info!("Programming {name} ({} bytes) at {start_addr:#x}", image.len());

        self.change_baud_rate(self.config.program_baud)?;
        let sent = match self.program_at_speed(start_addr, name, image, progress) {
            Ok(sent) => sent,
            Err(e) => {
                warn!("Programming failed, returning to {} baud", self.config.default_baud);
                if let Err(restore) = self.change_baud_rate(self.config.default_baud) {
                    warn!("Baud restore failed: {restore}");
                }
                return Err(e);
            },
        };
        self.change_baud_rate(self.config.default_baud)?;

        info!("Programmed {sent} bytes");
        Ok(sent)
    }

    fn program_at_speed<F>(&mut self, start_addr: u32, name: &str, image: &[u8], progress: F) -> Result<u64>
    where
        F: FnMut(u64, u64),
    {
        self.query(&Command::StartAddr(start_addr))?;

        self.send(&Command::Upgrade)?;
        let mut marker = [0u8; UPGRADE_ACK_LEN];
        self.port.read_exact_timeout(&mut marker, self.config.line_timeout)?;
        trace!("Upgrade marker: {}", hex::encode(marker));

        let ymodem = YmodemConfig::default()
            .with_large_packets(true)
            .with_max_retries(self.config.transfer_retries);
        let sent = YmodemSender::with_config(&mut self.port, ymodem).transfer(name, image, progress)?;

        self.query(&Command::FileCount)?;
        Ok(sent)
    }

    /// Erase the whole flash.
    pub fn flash_erase_all(&mut self) -> Result<Vec<String>> {
        info!("Erasing flash");
        self.query(&Command::EraseAll)
    }

    /// Flash identification.
    pub fn flash_info(&mut self) -> Result<Vec<String>> {
        self.query(&Command::FlashInfo)
    }

    /// Flash unique ID; the second line carries the ID.
    pub fn flash_uid(&mut self) -> Result<Vec<String>> {
        self.query(&Command::FlashUid)
    }

    /// MAC address stored in OTP.
    pub fn get_mac_in_flash_otp(&mut self) -> Result<Vec<String>> {
        self.query(&Command::MacInOtp)
    }

    /// MAC address in use.
    pub fn get_m_local_mac(&mut self) -> Result<Vec<String>> {
        self.query(&Command::LocalMac)
    }

    /// Read one GPIO, e.g. `A5`.
    pub fn gpio_read(&mut self, pin: &str) -> Result<Vec<String>> {
        self.query(&Command::GpioRead(pin.to_string()))
    }

    /// Drive one GPIO.
    pub fn gpio_write(&mut self, pin: &str, val: &str) -> Result<Vec<String>> {
        self.query(&Command::GpioWrite(pin.to_string(), val.to_string()))
    }

    /// Read all GPIOs.
    pub fn gpio_read_all(&mut self) -> Result<Vec<String>> {
        self.query(&Command::GpioReadAll)
    }

    /// OTP lock state.
    pub fn flash_otp_get_lock_state(&mut self) -> Result<Vec<String>> {
        self.query(&Command::OtpLockState)
    }

    /// Read one block once, returning it with its validity flag.
    pub fn read_flash_block(&mut self, addr: u32, region: FlashRegion) -> Result<FlashBlock> {
        self.require(SessionState::RamCodeRunning)?;

        self.port.discard_input()?;
        self.send(&Command::FlashRead { region, addr })?;
        let echo = self.read_line()?;
        trace!("Flash read echo: {echo}");

        let accumulator = Accumulator::new(self.config.flash_poll_interval, self.config.flash_max_idle_polls);
        match accumulator.until_len(&mut self.port, &mut self.delay, FLASH_BLOCK_HEX_LEN)? {
            Accumulated::Complete(hex_line) => {
                let hex_line = String::from_utf8(hex_line)
                    .map_err(|_| Error::Protocol(format!("flash block at {addr:#x} is not ASCII hex")))?;
                FlashBlock::from_hex(addr, &hex_line)
            },
            Accumulated::Idle(partial) => Err(Error::Timeout(format!(
                "flash block at {addr:#x}: got {} of {FLASH_BLOCK_HEX_LEN} hex chars",
                partial.len()
            ))),
        }
    }

    /// Read one block, re-reading it until it verifies.
    ///
    /// Fails with [`Error::InvalidBlock`] when every attempt fails its
    /// checksum.
    pub fn read_flash(&mut self, addr: u32, region: FlashRegion) -> Result<Vec<u8>> {
        let attempts = self.config.flash_read_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.read_flash_block(addr, region) {
                Ok(block) if block.is_valid() => return block.into_payload(),
                Ok(block) => {
                    warn!(
                        "Flash block at {addr:#x} failed verification (attempt {attempt}/{attempts}): \
                         device {:#06x}, computed {:#06x}",
                        block.reported_crc(),
                        block.computed_crc()
                    );
                    last_error = Some(block.invalid_error());
                },
                Err(e @ (Error::Timeout(_) | Error::Protocol(_))) => {
                    warn!("Flash block at {addr:#x} unreadable (attempt {attempt}/{attempts}): {e}");
                    last_error = Some(e);
                },
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Protocol(format!("flash block at {addr:#x} was never read"))))
    }

    /// Read `len` bytes starting at `start` into `writer`.
    ///
    /// Only verified blocks are written. Returns the number of bytes written.
    pub fn read_flash_to<W, F>(
        &mut self,
        writer: &mut W,
        start: u32,
        len: u32,
        region: FlashRegion,
        mut progress: F,
    ) -> Result<u64>
    where
        W: Write + ?Sized,
        F: FnMut(u64, u64),
    {
        info!("Reading {len:#x} bytes from {start:#x}");
        let total = u64::from(len);
        let mut written: u64 = 0;
        let mut addr = start;

        while written < total {
            let data = self.read_flash(addr, region)?;
            let remaining = usize::try_from(total - written).unwrap_or(usize::MAX);
            let take = remaining.min(data.len());
            writer.write_all(&data[..take])?;

            written += take as u64;
            progress(written, total);
            addr = addr.wrapping_add(FLASH_BLOCK_SIZE as u32);
        }

        writer.flush()?;
        Ok(written)
    }

    /// Hex dump `len` bytes from `start` with `fdump`.
    pub fn dump(&mut self, start: u32, len: u32) -> Result<Vec<String>> {
        self.require(SessionState::RamCodeRunning)?;

        self.port.discard_input()?;
        self.send(&Command::Dump { start, len })?;
        let echo = self.read_line()?;
        trace!("Dump echo: {echo}");

        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let line = line.trim();
            if line == DUMP_SENTINEL {
                break;
            }
            info!("{line}");
            lines.push(line.to_string());
        }
        Ok(lines)
    }

    /// Send an arbitrary command and return everything the device prints
    /// until the line goes quiet for `terminal_idle`.
    pub fn execute(&mut self, line: &str) -> Result<String> {
        if self.state == SessionState::Closed {
            return Err(Error::InvalidState {
                expected: SessionState::RamCodeRunning.name(),
                actual: self.state.name(),
            });
        }

        self.port.send_line(line)?;

        let polls = self.config.terminal_idle.as_millis() / TERMINAL_POLL.as_millis();
        let accumulator = Accumulator::new(TERMINAL_POLL, u32::try_from(polls).unwrap_or(u32::MAX).max(1));
        let mut bytes = accumulator.until_idle(&mut self.port, &mut self.delay)?;

        let mut output = drain_utf8_lossy(&mut bytes);
        output.push_str(&String::from_utf8_lossy(&bytes));
        Ok(output)
    }
}
