//! Error types for lnflash.

use std::io;
use thiserror::Error;

/// Result type for lnflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for lnflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// No reply within the bound.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Malformed header, sequence mismatch or unexpected reply.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// CRC checksum mismatch.
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch {
        /// Checksum reported by the peer.
        expected: u16,
        /// Checksum computed locally.
        actual: u16,
    },

    /// The peer cancelled the transfer with `CAN CAN`.
    #[error("Transfer cancelled by peer")]
    Cancelled,

    /// A packet was not acknowledged within the retry budget.
    #[error("Packet not acknowledged after {attempts} attempts")]
    RetriesExhausted {
        /// Number of transmission attempts made.
        attempts: u32,
    },

    /// A flash block kept failing checksum verification.
    #[error("Flash block at {addr:#x} is invalid: device reported {expected:#06x}, computed {actual:#06x}")]
    InvalidBlock {
        /// Flash address of the block.
        addr: u32,
        /// Checksum reported by the device.
        expected: u16,
        /// Checksum computed over the received payload.
        actual: u16,
    },

    /// Operation issued in the wrong session stage.
    #[error("Invalid session state: expected {expected}, currently {actual}")]
    InvalidState {
        /// Stage the operation requires.
        expected: &'static str,
        /// Stage the session is in.
        actual: &'static str,
    },

    /// The embedding application asked the current operation to stop.
    #[error("Operation interrupted")]
    Interrupted,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error means "nothing arrived in time".
    ///
    /// Serial reads that time out surface as [`io::ErrorKind::TimedOut`],
    /// so those count as well.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}
