//! LN882H bootloader text protocol.
//!
//! Both the mask ROM bootloader and the RAM code speak a line protocol: every
//! command is a single ASCII line terminated with `\r\n`, and the device
//! answers with a fixed number of lines (the first usually echoes the
//! command). Binary payloads travel over YMODEM, switched on by `download`
//! and `upgrade`.
//!
//! ## Flash read reply
//!
//! ```text
//! flash_read 0x1000 0x100          <- echo line
//! 0011...EEFF C3A1                 <- 512 hex payload chars + 4 hex CRC chars
//! ```
//!
//! Whitespace may appear anywhere in the data line.

use crate::error::{Error, Result};
use crate::protocol::crc::crc16_xmodem;
use byteorder::{BigEndian, ByteOrder};
use std::fmt;

/// Banner the mask ROM bootloader answers `version` with.
pub const BOOTLOADER_BANNER: &str = "Mar 14 2021/00:23:32";

/// Banner the RAM code answers `version` with.
pub const RAM_CODE_BANNER: &str = "RAMCODE";

/// Load address of the RAM code image.
pub const RAM_LOAD_ADDR: u32 = 0x2000_0000;

/// Expected length of the stock `LN882H_RAM_BIN.bin` image.
pub const RAM_IMAGE_LEN: usize = 37872;

/// Default file name of the RAM code image.
pub const RAM_IMAGE_NAME: &str = "LN882H_RAM_BIN.bin";

/// Baud rate the bootloader starts at.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Baud rate used while programming flash.
pub const PROGRAM_BAUD: u32 = 921_600;

/// Bytes per flash read block.
pub const FLASH_BLOCK_SIZE: usize = 0x100;

/// Hex characters in a flash read data line.
pub const FLASH_BLOCK_HEX_LEN: usize = FLASH_BLOCK_SIZE * 2 + 4;

/// Line that terminates `fdump` output.
pub const DUMP_SENTINEL: &str = "pppp";

/// Length of the binary marker the RAM code sends after `upgrade`.
pub const UPGRADE_ACK_LEN: usize = 7;

/// Flash area addressed by a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FlashRegion {
    /// Main flash array.
    #[default]
    Main,
    /// One-time-programmable area.
    Otp,
}

/// Bootloader / RAM code commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Ask for the version banner.
    Version,
    /// Load a RAM image of `len` bytes at `addr` over YMODEM.
    DownloadRam {
        /// Load address.
        addr: u32,
        /// Image length in bytes.
        len: usize,
    },
    /// Switch the device UART to another baud rate.
    Baudrate(u32),
    /// Set the start address for `upgrade`.
    StartAddr(u32),
    /// Start a firmware YMODEM transfer.
    Upgrade,
    /// Query the number of files received.
    FileCount,
    /// Erase the whole flash.
    EraseAll,
    /// Flash identification.
    FlashInfo,
    /// Flash unique ID.
    FlashUid,
    /// Read one 0x100-byte block.
    FlashRead {
        /// Area to read.
        region: FlashRegion,
        /// Block address.
        addr: u32,
    },
    /// OTP lock state.
    OtpLockState,
    /// MAC address stored in OTP.
    MacInOtp,
    /// MAC address in use.
    LocalMac,
    /// Read one GPIO.
    GpioRead(String),
    /// Drive one GPIO.
    GpioWrite(String, String),
    /// Read all GPIOs.
    GpioReadAll,
    /// Hex dump of a flash range, terminated by [`DUMP_SENTINEL`].
    Dump {
        /// Start address.
        start: u32,
        /// Length in bytes.
        len: u32,
    },
}

impl Command {
    /// Number of reply lines the device sends, for fixed-shape replies.
    ///
    /// `None` for commands whose replies are handled specially (binary
    /// markers, hex data lines or sentinel-terminated output).
    pub fn reply_lines(&self) -> Option<usize> {
        match self {
            Self::Version
            | Self::StartAddr(_)
            | Self::FileCount
            | Self::EraseAll
            | Self::FlashInfo
            | Self::FlashUid
            | Self::GpioWrite(..)
            | Self::GpioReadAll => Some(2),
            Self::MacInOtp | Self::LocalMac => Some(3),
            Self::GpioRead(_) | Self::OtpLockState => Some(4),
            Self::DownloadRam { .. }
            | Self::Baudrate(_)
            | Self::Upgrade
            | Self::FlashRead { .. }
            | Self::Dump { .. } => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Version => f.write_str("version"),
            Self::DownloadRam { addr, len } => write!(f, "download [rambin] [0x{addr:08X}] [{len}]"),
            Self::Baudrate(rate) => write!(f, "baudrate {rate}"),
            Self::StartAddr(addr) => write!(f, "startaddr 0x{addr:X}"),
            Self::Upgrade => f.write_str("upgrade"),
            Self::FileCount => f.write_str("filecount"),
            Self::EraseAll => f.write_str("ferase_all"),
            Self::FlashInfo => f.write_str("flash_info"),
            Self::FlashUid => f.write_str("flash_uid"),
            Self::FlashRead { region, addr } => {
                let cmd = match region {
                    FlashRegion::Main => "flash_read",
                    FlashRegion::Otp => "flash_otp_read",
                };
                write!(f, "{cmd} 0x{addr:X} 0x{FLASH_BLOCK_SIZE:X}")
            },
            Self::OtpLockState => f.write_str("flash_otp_get_lock_state"),
            Self::MacInOtp => f.write_str("get_mac_in_flash_otp"),
            Self::LocalMac => f.write_str("get_m_local_mac"),
            Self::GpioRead(pin) => write!(f, "gpio_read {pin}"),
            Self::GpioWrite(pin, val) => write!(f, "gpio_write {pin} {val}"),
            Self::GpioReadAll => f.write_str("gpio_read_al"),
            Self::Dump { start, len } => write!(f, "fdump 0x{start:X} 0x{len:X}"),
        }
    }
}

/// One 256-byte block read from flash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashBlock {
    addr: u32,
    data: Vec<u8>,
    reported: u16,
    computed: u16,
}

impl FlashBlock {
    /// Decode a data line (whitespace already removed).
    pub fn from_hex(addr: u32, hex_line: &str) -> Result<Self> {
        if hex_line.len() != FLASH_BLOCK_HEX_LEN {
            return Err(Error::Protocol(format!(
                "flash block at {addr:#x}: got {} hex chars, expected {FLASH_BLOCK_HEX_LEN}",
                hex_line.len()
            )));
        }

        let bytes = hex::decode(hex_line)
            .map_err(|e| Error::Protocol(format!("flash block at {addr:#x}: {e}")))?;
        let (data, crc) = bytes.split_at(FLASH_BLOCK_SIZE);

        Ok(Self {
            addr,
            reported: BigEndian::read_u16(crc),
            computed: crc16_xmodem(data),
            data: data.to_vec(),
        })
    }

    /// Flash address of the block.
    pub fn addr(&self) -> u32 {
        self.addr
    }

    /// Checksum sent by the device.
    pub fn reported_crc(&self) -> u16 {
        self.reported
    }

    /// Checksum computed over the received payload.
    pub fn computed_crc(&self) -> u16 {
        self.computed
    }

    /// Whether the payload matches the device's checksum.
    pub fn is_valid(&self) -> bool {
        self.reported == self.computed
    }

    /// Verified payload.
    pub fn payload(&self) -> Result<&[u8]> {
        if self.is_valid() {
            Ok(&self.data)
        } else {
            Err(self.invalid_error())
        }
    }

    /// Payload bytes whether or not they verified.
    pub fn raw_payload(&self) -> &[u8] {
        &self.data
    }

    /// Consume the block, returning the verified payload.
    pub fn into_payload(self) -> Result<Vec<u8>> {
        if self.is_valid() {
            Ok(self.data)
        } else {
            Err(self.invalid_error())
        }
    }

    pub(crate) fn invalid_error(&self) -> Error {
        Error::InvalidBlock {
            addr: self.addr,
            expected: self.reported,
            actual: self.computed,
        }
    }
}

/// Hex data line for `data` as the RAM code would send it.
#[cfg(test)]
pub(crate) fn encode_block_line(data: &[u8], crc: u16) -> String {
    format!("{}{:04X}", hex::encode_upper(data), crc)
}
