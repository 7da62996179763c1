//! Protocol implementations.

pub mod crc;
pub mod ymodem;
