//! # lnflash
//!
//! A library for flashing LN882H chips.
//!
//! This crate provides the core functionality for talking to the LN882H
//! bootloader over a serial port, including:
//!
//! - YMODEM file transfer (sender and receiver)
//! - CRC16-XMODEM checksum calculation
//! - The LN882H bootloader / RAM code text protocol
//! - Flash program, erase and verified read
//!
//! ## Supported Platforms
//!
//! - **Native** (default): Linux, macOS, Windows via the `serialport` crate
//!
//! Any other transport can be used by implementing [`Port`].
//!
//! ## Features
//!
//! - `native` (default): Native serial port support
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use lnflash::{BootloaderSession, FlashRegion, NativePort, StdDelay};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let port = NativePort::open_simple("/dev/ttyUSB0", 115200)?;
//!     let mut session = BootloaderSession::new(port, StdDelay);
//!
//!     // Sync with the bootloader and start the RAM code
//!     let ram_code = std::fs::read("LN882H_RAM_BIN.bin")?;
//!     session.bring_up("LN882H_RAM_BIN.bin", &ram_code)?;
//!
//!     // Flash the firmware
//!     let firmware = std::fs::read("firmware.bin")?;
//!     session.flash_program(0, "firmware.bin", &firmware, |sent, total| {
//!         println!("{sent}/{total}");
//!     })?;
//!
//!     // Read back the first block
//!     let block = session.read_flash(0, FlashRegion::Main)?;
//!     println!("{:02x?}", &block[..16]);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod delay;
pub mod error;
pub mod monitor;
pub mod port;
pub mod protocol;
pub mod target;

#[cfg(test)]
mod test_support;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). Only the first
/// registration takes effect.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
thread_local! {
    static TEST_INTERRUPT_FLAG: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Toggle interruption for the calling test thread only.
#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    static INSTALLED: OnceLock<()> = OnceLock::new();

    INSTALLED.get_or_init(|| set_interrupt_checker(|| TEST_INTERRUPT_FLAG.with(std::cell::Cell::get)));
    TEST_INTERRUPT_FLAG.with(|flag| flag.set(value));
}

// Re-exports for convenience
// Native-specific re-exports
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    delay::{Delay, StdDelay},
    error::{Error, Result},
    monitor::{clean_monitor_text, drain_utf8_lossy},
    port::{Port, PortEnumerator, PortExt, PortInfo, SerialConfig},
    protocol::{
        crc::crc16_xmodem,
        ymodem::{FileInfo, ReceivedFile, YmodemConfig, YmodemReceiver, YmodemSender},
    },
    target::ln882h::{BootloaderSession, FlashBlock, FlashRegion, SessionConfig, SessionState},
};
