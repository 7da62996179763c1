//! YMODEM file transfer protocol implementation.
//!
//! The LN882H boot ROM receives its RAM code over YMODEM-1K, and the RAM
//! code in turn receives firmware images over YMODEM with 16 KiB blocks.
//!
//! ## Packet Format
//!
//! ```text
//! +--------+-----+------+--------------------------+--------+
//! | SOH/STX| SEQ | ~SEQ |  DATA (128 | 1024 | 16K) | CRC16  |
//! +--------+-----+------+--------------------------+--------+
//! |   1    |  1  |  1   |          N               | 2 (BE) |
//! +--------+-----+------+--------------------------+--------+
//! ```
//!
//! `~SEQ` is `0xFF - SEQ`, and the CRC-16/XMODEM covers the data only.
//!
//! ## Session
//!
//! ```text
//! sender                         receiver
//!          <------------------- 'C'
//! [0] name\0size\0  ----------->
//!          <------------------- ACK 'C'
//! [1..n] data      ----------->
//!          <------------------- ACK (per packet)
//! EOT              ----------->
//!          <------------------- NAK
//! EOT              ----------->
//!          <------------------- ACK 'C'
//! [0] empty        ----------->
//!          <------------------- ACK
//! ```

use crate::error::{Error, Result};
use crate::port::{Port, PortExt};
use crate::protocol::crc::crc16_xmodem;
use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, trace, warn};
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// YMODEM control characters.
pub mod control {
    /// Start of Header (128-byte block).
    pub const SOH: u8 = 0x01;
    /// Start of Text (1024-byte or larger block).
    pub const STX: u8 = 0x02;
    /// End of Transmission.
    pub const EOT: u8 = 0x04;
    /// Acknowledge.
    pub const ACK: u8 = 0x06;
    /// Not Acknowledge.
    pub const NAK: u8 = 0x15;
    /// Cancel.
    pub const CAN: u8 = 0x18;
    /// CRC mode request character.
    pub const C: u8 = b'C';
}

/// Block size for SOH packets.
pub const SOH_BLOCK_SIZE: usize = 128;

/// Block size for STX packets (YMODEM-1K).
pub const STX_BLOCK_SIZE: usize = 1024;

/// Block size for STX packets in large-packet mode.
pub const LARGE_BLOCK_SIZE: usize = 16 * 1024;

/// Longest file name carried in the header packet.
pub const MAX_NAME_LEN: usize = 100;

/// Fill byte for the tail of the last data packet.
pub const DATA_PAD: u8 = 0x1A;

/// Fill byte for the header and end-of-batch packets.
pub const HEADER_PAD: u8 = 0x00;

/// Framing overhead around the payload: marker, seq, ~seq and CRC.
pub const FRAME_OVERHEAD: usize = 5;

/// YMODEM configuration options.
#[derive(Debug, Clone)]
pub struct YmodemConfig {
    /// Timeout for each handshake wait ('C', ACK, NAK).
    pub char_timeout: Duration,
    /// Timeout for the ACK of a single data packet.
    pub ack_timeout: Duration,
    /// Transmission attempts per data packet.
    pub max_retries: u32,
    /// Send 16 KiB data packets instead of 1 KiB ones.
    pub large_packets: bool,
    /// Payload size the receiver assumes for STX packets.
    pub stx_payload_size: usize,
    /// How many times the receiver solicits a header with 'C'.
    pub start_attempts: u32,
}

impl Default for YmodemConfig {
    fn default() -> Self {
        Self {
            char_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(5),
            max_retries: 3,
            large_packets: false,
            stx_payload_size: STX_BLOCK_SIZE,
            start_attempts: 10,
        }
    }
}

impl YmodemConfig {
    /// Select 16 KiB data packets.
    #[must_use]
    pub fn with_large_packets(mut self, large: bool) -> Self {
        self.large_packets = large;
        self
    }

    /// Set the per-packet attempt budget.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Payload size of a data packet for this configuration.
    pub fn data_block_size(&self) -> usize {
        if self.large_packets {
            LARGE_BLOCK_SIZE
        } else {
            STX_BLOCK_SIZE
        }
    }
}

/// File name and size carried by packet 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// File name, at most [`MAX_NAME_LEN`] bytes on the wire.
    pub name: String,
    /// Declared file length in bytes.
    pub size: u64,
}

impl FileInfo {
    /// Create file info, truncating the name to [`MAX_NAME_LEN`] bytes.
    pub fn new(name: &str, size: u64) -> Self {
        let mut end = name.len().min(MAX_NAME_LEN);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        Self {
            name: name[..end].to_string(),
            size,
        }
    }

    /// Encode as a zero-padded 128-byte header payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(SOH_BLOCK_SIZE);
        payload.extend_from_slice(self.name.as_bytes());
        payload.push(0x00);
        payload.extend_from_slice(self.size.to_string().as_bytes());
        payload.push(0x00);
        payload.resize(SOH_BLOCK_SIZE, HEADER_PAD);
        payload
    }

    /// Parse a header payload (`name\0size[ ...]\0`).
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let name_end = payload
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::Protocol("header packet has no name terminator".into()))?;
        if name_end == 0 {
            return Err(Error::Protocol("header packet has an empty name".into()));
        }
        let name = String::from_utf8_lossy(&payload[..name_end]).into_owned();

        let rest = &payload[name_end + 1..];
        let size_end = rest
            .iter()
            .position(|&b| b == 0 || b == b' ')
            .unwrap_or(rest.len());
        let size = std::str::from_utf8(&rest[..size_end])
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| Error::Protocol(format!("header packet for {name} has no valid size")))?;

        Ok(Self { name, size })
    }
}

/// One YMODEM packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    seq: u8,
    payload: Vec<u8>,
}

impl Packet {
    /// Packet 0 announcing `info`.
    pub fn header(info: &FileInfo) -> Self {
        Self {
            seq: 0,
            payload: info.encode(),
        }
    }

    /// Data packet, padding `chunk` with [`DATA_PAD`] up to `block_size`.
    pub fn data(seq: u8, chunk: &[u8], block_size: usize) -> Self {
        let mut payload = Vec::with_capacity(block_size);
        payload.extend_from_slice(&chunk[..chunk.len().min(block_size)]);
        payload.resize(block_size, DATA_PAD);
        Self { seq, payload }
    }

    /// All-zero packet 0 that closes a batch.
    pub fn end_of_batch() -> Self {
        Self {
            seq: 0,
            payload: vec![HEADER_PAD; SOH_BLOCK_SIZE],
        }
    }

    /// SOH for 128-byte payloads, STX otherwise.
    pub fn marker(&self) -> u8 {
        if self.payload.len() == SOH_BLOCK_SIZE {
            control::SOH
        } else {
            control::STX
        }
    }

    /// Sequence number.
    pub fn seq(&self) -> u8 {
        self.seq
    }

    /// Padded payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// CRC-16/XMODEM of the payload.
    pub fn checksum(&self) -> u16 {
        crc16_xmodem(&self.payload)
    }

    /// Whether this is a packet 0 with an empty name.
    pub fn is_end_of_batch(&self) -> bool {
        self.seq == 0 && self.payload.first().is_none_or(|&b| b == 0)
    }

    /// Serialize to wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(self.payload.len() + FRAME_OVERHEAD);
        frame.push(self.marker());
        frame.push(self.seq);
        frame.push(0xFF - self.seq);
        frame.extend_from_slice(&self.payload);
        frame.extend_from_slice(&self.checksum().to_be_bytes());
        frame
    }

    /// Parse and verify a complete frame.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < SOH_BLOCK_SIZE + FRAME_OVERHEAD {
            return Err(Error::Protocol(format!(
                "frame of {} bytes is too short",
                frame.len()
            )));
        }

        let payload_len = frame.len() - FRAME_OVERHEAD;
        let expected_marker = if payload_len == SOH_BLOCK_SIZE {
            control::SOH
        } else {
            control::STX
        };
        if frame[0] != expected_marker {
            return Err(Error::Protocol(format!(
                "marker 0x{:02X} does not match a {payload_len}-byte payload",
                frame[0]
            )));
        }

        let (seq, complement) = (frame[1], frame[2]);
        if complement != 0xFF - seq {
            return Err(Error::Protocol(format!(
                "sequence 0x{seq:02X} carries complement 0x{complement:02X}"
            )));
        }

        let payload = &frame[3..3 + payload_len];
        let expected = BigEndian::read_u16(&frame[3 + payload_len..]);
        let actual = crc16_xmodem(payload);
        if expected != actual {
            return Err(Error::CrcMismatch { expected, actual });
        }

        Ok(Self {
            seq,
            payload: payload.to_vec(),
        })
    }
}

/// Read until `buf` is full or the reader is exhausted.
fn fill_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {},
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(filled)
}

/// YMODEM sender.
pub struct YmodemSender<'a, P: Port + ?Sized> {
    port: &'a mut P,
    config: YmodemConfig,
}

impl<'a, P: Port + ?Sized> YmodemSender<'a, P> {
    /// Create a sender with the default configuration.
    pub fn new(port: &'a mut P) -> Self {
        Self {
            port,
            config: YmodemConfig::default(),
        }
    }

    /// Create a sender with a custom configuration.
    pub fn with_config(port: &'a mut P, config: YmodemConfig) -> Self {
        Self { port, config }
    }

    /// Wait for `expected`, skipping unrelated bytes.
    ///
    /// Two consecutive CAN bytes cancel the transfer.
    fn wait_for(&mut self, expected: u8, what: &str) -> Result<()> {
        debug!("Waiting for {what}...");
        let mut cancels = 0;

        loop {
            match self.port.read_byte(self.config.char_timeout) {
                Ok(b) if b == expected => {
                    debug!("Received {what}");
                    return Ok(());
                },
                Ok(control::CAN) => {
                    cancels += 1;
                    if cancels == 2 {
                        return Err(Error::Cancelled);
                    }
                },
                Ok(b) => {
                    trace!("Ignoring 0x{b:02X} while waiting for {what}");
                    cancels = 0;
                },
                Err(e) if e.is_timeout() => {
                    return Err(Error::Timeout(format!("waiting for {what}")));
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Send two CAN bytes.
    pub fn abort(&mut self) -> Result<()> {
        warn!("Aborting YMODEM transfer");
        self.port.write_all_bytes(&[control::CAN, control::CAN])
    }

    /// Transmit a packet until it is ACKed or the attempt budget runs out.
    fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        let frame = packet.encode();
        let attempts = self.config.max_retries.max(1);

        for attempt in 1..=attempts {
            trace!(
                "Sending packet {} ({} bytes, attempt {attempt}/{attempts})",
                packet.seq(),
                frame.len()
            );
            self.port.write_all_bytes(&frame)?;

            match self.port.read_byte(self.config.ack_timeout) {
                Ok(control::ACK) => {
                    trace!("Packet {} ACKed", packet.seq());
                    return Ok(());
                },
                Ok(control::CAN) => {
                    if let Ok(control::CAN) = self.port.read_byte(self.config.ack_timeout) {
                        return Err(Error::Cancelled);
                    }
                    debug!("Lone CAN after packet {}, retrying...", packet.seq());
                },
                Ok(control::NAK) => {
                    debug!("Packet {} NAKed, retrying...", packet.seq());
                },
                Ok(b) => {
                    debug!("Unexpected response 0x{b:02X} to packet {}, retrying...", packet.seq());
                },
                Err(e) if e.is_timeout() => {
                    debug!("Timeout waiting for ACK of packet {}, retrying...", packet.seq());
                },
                Err(e) => return Err(e),
            }
        }

        self.abort()?;
        Err(Error::RetriesExhausted { attempts })
    }

    /// Send `total_len` bytes from `reader` as `name`.
    ///
    /// `progress` is called after each acknowledged data packet with the
    /// number of bytes sent so far and `total_len`. Returns the number of
    /// bytes read from `reader` and sent.
    pub fn send<R, F>(&mut self, mut reader: R, name: &str, total_len: u64, mut progress: F) -> Result<u64>
    where
        R: Read,
        F: FnMut(u64, u64),
    {
        let info = FileInfo::new(name, total_len);
        let block_size = self.config.data_block_size();
        info!(
            "Starting YMODEM transfer: {} ({} bytes, {} byte packets)",
            info.name, total_len, block_size
        );

        self.wait_for(control::C, "'C'")?;

        trace!("Sending header packet");
        self.port.write_all_bytes(&Packet::header(&info).encode())?;
        self.wait_for(control::ACK, "header ACK")?;
        self.wait_for(control::C, "second 'C'")?;

        let mut seq: u8 = 1;
        let mut sent: u64 = 0;
        let mut chunk = vec![0u8; block_size];

        loop {
            let n = fill_chunk(&mut reader, &mut chunk)?;
            if n == 0 {
                break;
            }

            self.send_packet(&Packet::data(seq, &chunk[..n], block_size))?;

            sent += n as u64;
            seq = seq.wrapping_add(1);
            progress(sent, total_len);

            if n < block_size {
                break;
            }
        }

        if sent != total_len {
            warn!("Declared {total_len} bytes but sent {sent}");
        }

        debug!("Sending EOT");
        self.port.write_all_bytes(&[control::EOT])?;
        self.wait_for(control::NAK, "EOT NAK")?;
        self.port.write_all_bytes(&[control::EOT])?;
        self.wait_for(control::ACK, "EOT ACK")?;
        self.wait_for(control::C, "closing 'C'")?;

        debug!("Sending end-of-batch packet");
        self.port.write_all_bytes(&Packet::end_of_batch().encode())?;
        self.wait_for(control::ACK, "end-of-batch ACK")?;

        info!("YMODEM transfer complete: {sent} bytes");
        Ok(sent)
    }

    /// Send an in-memory image.
    pub fn transfer<F>(&mut self, name: &str, data: &[u8], progress: F) -> Result<u64>
    where
        F: FnMut(u64, u64),
    {
        self.send(data, name, data.len() as u64, progress)
    }
}

/// Outcome of [`YmodemReceiver::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Header announced by the sender.
    pub info: FileInfo,
    /// Where the data was written.
    pub path: PathBuf,
    /// Bytes written.
    pub bytes: u64,
}

/// YMODEM receiver (single file per batch).
pub struct YmodemReceiver<'a, P: Port + ?Sized> {
    port: &'a mut P,
    config: YmodemConfig,
}

impl<'a, P: Port + ?Sized> YmodemReceiver<'a, P> {
    /// Create a receiver with the default configuration.
    pub fn new(port: &'a mut P) -> Self {
        Self {
            port,
            config: YmodemConfig::default(),
        }
    }

    /// Create a receiver with a custom configuration.
    pub fn with_config(port: &'a mut P, config: YmodemConfig) -> Self {
        Self { port, config }
    }

    fn reply(&mut self, bytes: &[u8]) -> Result<()> {
        self.port.write_all_bytes(bytes)
    }

    /// Solicit the header with 'C' until a packet marker arrives.
    fn wait_for_start(&mut self) -> Result<u8> {
        for attempt in 1..=self.config.start_attempts.max(1) {
            trace!("Requesting transfer (attempt {attempt})");
            self.reply(&[control::C])?;

            loop {
                match self.port.read_byte(self.config.char_timeout) {
                    Ok(marker @ (control::SOH | control::STX)) => return Ok(marker),
                    Ok(b) => trace!("Ignoring 0x{b:02X} before header"),
                    Err(e) if e.is_timeout() => break,
                    Err(e) => return Err(e),
                }
            }
        }

        Err(Error::Timeout("no YMODEM header from sender".into()))
    }

    /// Read the rest of a packet whose marker was already consumed.
    ///
    /// Returns `None` for a corrupt packet, which is dropped without ACK.
    fn read_packet(&mut self, marker: u8) -> Result<Option<Packet>> {
        let payload_len = if marker == control::SOH {
            SOH_BLOCK_SIZE
        } else {
            self.config.stx_payload_size
        };

        let mut frame = vec![0u8; payload_len + FRAME_OVERHEAD];
        frame[0] = marker;
        self.port.read_exact_timeout(&mut frame[1..], self.config.char_timeout)?;

        match Packet::decode(&frame) {
            Ok(packet) => Ok(Some(packet)),
            Err(e @ (Error::Protocol(_) | Error::CrcMismatch { .. })) => {
                warn!("Dropping corrupt packet: {e}");
                Ok(None)
            },
            Err(e) => Err(e),
        }
    }

    /// Receive one file into `dir`, named after the sender's header.
    pub fn receive(&mut self, dir: &Path) -> Result<ReceivedFile> {
        let mut path = PathBuf::new();
        let (info, bytes) = self.receive_with(|info| {
            let file_name = Path::new(&info.name)
                .file_name()
                .ok_or_else(|| Error::Protocol(format!("unusable file name {:?}", info.name)))?;
            path = dir.join(file_name);
            info!("Receiving {} ({} bytes) into {}", info.name, info.size, path.display());
            Ok(BufWriter::new(File::create(&path)?))
        })?;

        Ok(ReceivedFile { info, path, bytes })
    }

    /// Receive one file, writing to the sink returned by `open`.
    ///
    /// `open` is called once the header packet has been accepted. Data past
    /// the declared size (the padding of the last packet) is not written, and
    /// a batch that closes before the declared size arrived is an error.
    pub fn receive_with<W, F>(&mut self, open: F) -> Result<(FileInfo, u64)>
    where
        W: Write,
        F: FnOnce(&FileInfo) -> Result<W>,
    {
        let mut open = Some(open);
        let mut sink: Option<(FileInfo, W)> = None;
        let mut expected: u8 = 0;
        let mut written: u64 = 0;
        let mut data_started = false;
        let mut eots = 0;
        let mut timeouts = 0;

        let mut marker = self.wait_for_start()?;

        loop {
            match marker {
                control::SOH | control::STX => {
                    if let Some(packet) = self.read_packet(marker)? {
                        if eots >= 2 {
                            if !packet.is_end_of_batch() {
                                warn!("Sender offered another file; only one file per batch is received");
                            }
                            self.reply(&[control::ACK])?;
                            break;
                        }

                        match sink.as_mut() {
                            None if packet.seq() != 0 => {
                                warn!("Expected header packet, got sequence {}", packet.seq());
                            },
                            None => {
                                let info = FileInfo::parse(packet.payload())?;
                                let open_sink = open
                                    .take()
                                    .ok_or_else(|| Error::Protocol("second file header".into()))?;
                                let writer = open_sink(&info)?;
                                sink = Some((info, writer));
                                self.reply(&[control::ACK, control::C])?;
                                expected = 1;
                            },
                            Some((info, writer)) => {
                                if packet.seq() == expected {
                                    let remaining = info.size.saturating_sub(written);
                                    let take = usize::try_from(remaining)
                                        .unwrap_or(usize::MAX)
                                        .min(packet.payload().len());
                                    writer.write_all(&packet.payload()[..take])?;
                                    written += take as u64;
                                    data_started = true;
                                    self.reply(&[control::ACK])?;
                                    expected = expected.wrapping_add(1);
                                } else if !data_started && packet.seq() == 0 {
                                    debug!("Header packet repeated");
                                    self.reply(&[control::ACK, control::C])?;
                                } else if packet.seq() == expected.wrapping_sub(1) {
                                    debug!("Packet {} repeated", packet.seq());
                                    self.reply(&[control::ACK])?;
                                } else {
                                    warn!(
                                        "Out-of-order packet {} (expected {expected})",
                                        packet.seq()
                                    );
                                }
                            },
                        }
                    }
                },
                control::EOT => {
                    eots += 1;
                    if eots == 1 {
                        debug!("First EOT, replying NAK");
                        self.reply(&[control::NAK])?;
                    } else {
                        debug!("Second EOT, replying ACK");
                        self.reply(&[control::ACK, control::C])?;
                    }
                },
                control::CAN => {
                    if let Ok(control::CAN) = self.port.read_byte(self.config.char_timeout) {
                        return Err(Error::Cancelled);
                    }
                },
                b => trace!("Ignoring 0x{b:02X} between packets"),
            }

            marker = loop {
                match self.port.read_byte(self.config.char_timeout) {
                    Ok(b) => {
                        timeouts = 0;
                        break b;
                    },
                    Err(e) if e.is_timeout() => {
                        timeouts += 1;
                        if timeouts >= self.config.max_retries.max(1) {
                            return Err(Error::Timeout(format!(
                                "sender went silent after {written} bytes"
                            )));
                        }
                    },
                    Err(e) => return Err(e),
                }
            };
        }

        let (info, mut writer) = sink.ok_or_else(|| Error::Protocol("batch closed before a file header".into()))?;
        writer.flush()?;
        if written < info.size {
            return Err(Error::Protocol(format!(
                "transfer of {} ended after {written} of {} bytes",
                info.name, info.size
            )));
        }
        info!("YMODEM receive complete: {} ({written} bytes)", info.name);
        Ok((info, written))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockPort;

    fn fast_config() -> YmodemConfig {
        YmodemConfig {
            char_timeout: Duration::from_millis(10),
            ack_timeout: Duration::from_millis(10),
            ..YmodemConfig::default()
        }
    }

    /// Split everything a sender wrote into control bytes and frames.
    fn split_frames(written: &[u8], stx_size: usize) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let mut i = 0;
        while i < written.len() {
            let len = match written[i] {
                control::SOH => SOH_BLOCK_SIZE + FRAME_OVERHEAD,
                control::STX => stx_size + FRAME_OVERHEAD,
                _ => 1,
            };
            frames.push(written[i..i + len].to_vec());
            i += len;
        }
        frames
    }

    fn happy_responses(data_packets: usize) -> Vec<u8> {
        let mut r = vec![control::C, control::ACK, control::C];
        r.extend(std::iter::repeat_n(control::ACK, data_packets));
        r.extend([control::NAK, control::ACK, control::C, control::ACK]);
        r
    }

    #[test]
    fn test_header_packet_layout() {
        let packet = Packet::header(&FileInfo::new("fw.bin", 37872));
        let frame = packet.encode();

        assert_eq!(frame[0], control::SOH);
        assert_eq!(frame[1], 0);
        assert_eq!(frame[2], 0xFF);
        assert_eq!(&frame[3..16], b"fw.bin\x0037872\x00");
        assert!(frame[16..3 + SOH_BLOCK_SIZE].iter().all(|&b| b == 0));
        assert_eq!(frame.len(), SOH_BLOCK_SIZE + FRAME_OVERHEAD);
    }

    #[test]
    fn test_data_packet_padding_and_complement() {
        let packet = Packet::data(5, &[0xAA; 10], STX_BLOCK_SIZE);
        let frame = packet.encode();

        assert_eq!(frame[0], control::STX);
        assert_eq!(frame[1], 5);
        assert_eq!(frame[2], 0xFA);
        assert!(frame[13..3 + STX_BLOCK_SIZE].iter().all(|&b| b == DATA_PAD));
        assert_eq!(frame.len(), STX_BLOCK_SIZE + FRAME_OVERHEAD);
    }

    #[test]
    fn test_large_packet_uses_stx() {
        let packet = Packet::data(1, &[1, 2, 3], LARGE_BLOCK_SIZE);
        assert_eq!(packet.marker(), control::STX);
        assert_eq!(packet.encode().len(), LARGE_BLOCK_SIZE + FRAME_OVERHEAD);
    }

    #[test]
    fn test_file_info_roundtrip() {
        for (name, size) in [("a", 0u64), ("LN882H_RAM_BIN.bin", 37872), ("x.bin", u64::from(u32::MAX))] {
            let info = FileInfo::new(name, size);
            let decoded = Packet::decode(&Packet::header(&info).encode()).unwrap();
            assert_eq!(FileInfo::parse(decoded.payload()).unwrap(), info);
        }
    }

    #[test]
    fn test_file_info_truncates_long_names() {
        let long = "n".repeat(150);
        let info = FileInfo::new(&long, 1);
        assert_eq!(info.name.len(), MAX_NAME_LEN);
        assert_eq!(FileInfo::parse(&info.encode()).unwrap().name, "n".repeat(MAX_NAME_LEN));

        // Never split a multi-byte character
        let wide = "é".repeat(60);
        assert!(FileInfo::new(&wide, 1).name.len() <= MAX_NAME_LEN);
    }

    #[test]
    fn test_file_info_parse_accepts_mtime_suffix() {
        let info = FileInfo::parse(b"app.bin\x001024 13025443011 100644\x00").unwrap();
        assert_eq!(info.size, 1024);
    }

    #[test]
    fn test_decode_rejects_bad_complement() {
        let mut frame = Packet::data(7, &[1; 4], STX_BLOCK_SIZE).encode();
        frame[2] = 0x00;
        assert!(matches!(Packet::decode(&frame), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_decode_detects_any_single_bit_flip() {
        let frame = Packet::data(1, &[0x5A; 128], SOH_BLOCK_SIZE).encode();
        for byte in 3..3 + SOH_BLOCK_SIZE {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(matches!(
                    Packet::decode(&corrupted),
                    Err(Error::CrcMismatch { .. })
                ));
            }
        }
    }

    #[test]
    fn test_send_3000_bytes_produces_expected_packets() {
        let mut port = MockPort::with_input(&happy_responses(3));
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();

        let sent = YmodemSender::with_config(&mut port, fast_config())
            .transfer("fw.bin", &data, |_, _| {})
            .unwrap();
        assert_eq!(sent, 3000);

        let frames = split_frames(port.written(), STX_BLOCK_SIZE);
        assert_eq!(frames.len(), 7);

        let header = Packet::decode(&frames[0]).unwrap();
        assert_eq!(header.seq(), 0);
        assert_eq!(FileInfo::parse(header.payload()).unwrap(), FileInfo::new("fw.bin", 3000));

        for (i, frame) in frames[1..4].iter().enumerate() {
            let packet = Packet::decode(frame).unwrap();
            assert_eq!(usize::from(packet.seq()), i + 1);
            assert_eq!(packet.payload().len(), STX_BLOCK_SIZE);
        }
        let last = Packet::decode(&frames[3]).unwrap();
        assert_eq!(&last.payload()[..952], &data[2048..]);
        assert!(last.payload()[952..].iter().all(|&b| b == DATA_PAD));

        assert_eq!(frames[4], vec![control::EOT]);
        assert_eq!(frames[5], vec![control::EOT]);
        let closing = Packet::decode(&frames[6]).unwrap();
        assert_eq!(closing, Packet::end_of_batch());
    }

    #[test]
    fn test_send_large_packets() {
        let mut port = MockPort::with_input(&happy_responses(2));
        let data = vec![0x11; LARGE_BLOCK_SIZE + 1];
        let config = fast_config().with_large_packets(true);

        YmodemSender::with_config(&mut port, config)
            .transfer("big.bin", &data, |_, _| {})
            .unwrap();

        let frames = split_frames(port.written(), LARGE_BLOCK_SIZE);
        assert_eq!(Packet::decode(&frames[1]).unwrap().payload().len(), LARGE_BLOCK_SIZE);
        assert_eq!(Packet::decode(&frames[2]).unwrap().payload()[1], DATA_PAD);
    }

    #[test]
    fn test_sequence_wraps_after_255() {
        let packets = 257;
        let mut port = MockPort::with_input(&happy_responses(packets));
        let data = vec![0x33; STX_BLOCK_SIZE * packets];

        YmodemSender::with_config(&mut port, fast_config())
            .transfer("wrap.bin", &data, |_, _| {})
            .unwrap();

        let frames = split_frames(port.written(), STX_BLOCK_SIZE);
        let seqs: Vec<u8> = frames[1..=packets]
            .iter()
            .map(|f| Packet::decode(f).unwrap().seq())
            .collect();
        assert_eq!(seqs[254], 255);
        assert_eq!(seqs[255], 0);
        assert_eq!(seqs[256], 1);
    }

    #[test]
    fn test_retry_until_final_attempt_acks() {
        let mut responses = vec![control::C, control::ACK, control::C];
        responses.extend([control::NAK, control::NAK, control::ACK]);
        responses.extend([control::NAK, control::ACK, control::C, control::ACK]);
        let mut port = MockPort::with_input(&responses);

        let sent = YmodemSender::with_config(&mut port, fast_config().with_max_retries(3))
            .transfer("r.bin", &[1, 2, 3], |_, _| {})
            .unwrap();
        assert_eq!(sent, 3);

        let data_frames = split_frames(port.written(), STX_BLOCK_SIZE)
            .into_iter()
            .filter(|f| f[0] == control::STX)
            .count();
        assert_eq!(data_frames, 3);
    }

    #[test]
    fn test_retries_exhausted_sends_cancel() {
        let responses = [control::C, control::ACK, control::C, control::NAK, control::NAK, control::NAK];
        let mut port = MockPort::with_input(&responses);

        let err = YmodemSender::with_config(&mut port, fast_config().with_max_retries(3))
            .transfer("r.bin", &[1, 2, 3], |_, _| {})
            .unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 3 }));

        let written = port.written();
        assert!(written.ends_with(&[control::CAN, control::CAN]));
        let frames = split_frames(&written[..written.len() - 2], STX_BLOCK_SIZE);
        assert_eq!(frames.iter().filter(|f| f[0] == control::STX).count(), 3);
    }

    #[test]
    fn test_peer_cancel_while_waiting_for_c() {
        let mut port = MockPort::with_input(&[0x00, control::CAN, control::CAN]);
        let err = YmodemSender::with_config(&mut port, fast_config())
            .transfer("c.bin", &[0; 4], |_, _| {})
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_missing_second_c_fails() {
        let mut port = MockPort::with_input(&[control::C, control::ACK]);
        let err = YmodemSender::with_config(&mut port, fast_config())
            .transfer("c.bin", &[0; 4], |_, _| {})
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_progress_reports_each_packet() {
        let mut port = MockPort::with_input(&happy_responses(2));
        let mut calls = Vec::new();
        YmodemSender::with_config(&mut port, fast_config())
            .transfer("p.bin", &[7; 1500], |sent, total| calls.push((sent, total)))
            .unwrap();
        assert_eq!(calls, vec![(1024, 1500), (1500, 1500)]);
    }

    /// Frames a well-behaved sender would emit for `data`.
    fn sender_frames(name: &str, data: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = vec![Packet::header(&FileInfo::new(name, data.len() as u64)).encode()];
        for (i, chunk) in data.chunks(STX_BLOCK_SIZE).enumerate() {
            let seq = u8::try_from((i + 1) % 256).unwrap();
            frames.push(Packet::data(seq, chunk, STX_BLOCK_SIZE).encode());
        }
        frames.push(vec![control::EOT]);
        frames.push(vec![control::EOT]);
        frames.push(Packet::end_of_batch().encode());
        frames
    }

    #[test]
    fn test_receive_into_directory() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 7) as u8).collect();
        let input: Vec<u8> = sender_frames("../escape/fw.bin", &data).concat();
        let mut port = MockPort::with_input(&input);

        let received = YmodemReceiver::with_config(&mut port, fast_config())
            .receive(dir.path())
            .unwrap();

        assert_eq!(received.bytes, 2500);
        assert_eq!(received.path, dir.path().join("fw.bin"));
        assert_eq!(std::fs::read(&received.path).unwrap(), data);

        let mut replies = vec![control::C, control::ACK, control::C];
        replies.extend([control::ACK; 3]);
        replies.extend([control::NAK, control::ACK, control::C, control::ACK]);
        assert_eq!(port.written(), replies.as_slice());
    }

    #[test]
    fn test_receive_drops_corrupt_packet_until_resent() {
        let data = vec![0x42; 100];
        let frames = sender_frames("f.bin", &data);
        let mut corrupt = frames[1].clone();
        corrupt[10] ^= 0x01;

        let mut input = frames[0].clone();
        input.extend(corrupt);
        for frame in &frames[1..] {
            input.extend(frame);
        }
        let mut port = MockPort::with_input(&input);

        let mut out = Vec::new();

        let sink = &mut out;
        let (info, bytes) = YmodemReceiver::with_config(&mut port, fast_config())
            .receive_with(move |_| Ok(sink))
            .unwrap();

        assert_eq!(info.size, 100);
        assert_eq!(bytes, 100);
        assert_eq!(out, data);
        // Header ACK+C, one data ACK (none for the corrupt copy), NAK, ACK+C, ACK
        assert_eq!(port.written().iter().filter(|&&b| b == control::ACK).count(), 4);
    }

    #[test]
    fn test_receive_rejects_bad_complement_and_out_of_order() {
        let data = vec![0x24; 2048];
        let frames = sender_frames("f.bin", &data);
        let mut bad_complement = frames[1].clone();
        bad_complement[2] = 0x00;

        let mut input = frames[0].clone();
        input.extend(bad_complement);
        input.extend(&frames[2]); // packet 2 before packet 1
        for frame in &frames[1..] {
            input.extend(frame);
        }
        let mut port = MockPort::with_input(&input);

        let mut out = Vec::new();

        let sink = &mut out;
        let (_, bytes) = YmodemReceiver::with_config(&mut port, fast_config())
            .receive_with(move |_| Ok(sink))
            .unwrap();
        assert_eq!(bytes, 2048);
        assert_eq!(out, data);
    }

    #[test]
    fn test_receive_accepts_sequence_wrap() {
        let data: Vec<u8> = (0..STX_BLOCK_SIZE * 257).map(|i| (i / STX_BLOCK_SIZE) as u8).collect();
        let input = sender_frames("wrap.bin", &data).concat();
        let mut port = MockPort::with_input(&input);

        let mut out = Vec::new();

        let sink = &mut out;
        let (_, bytes) = YmodemReceiver::with_config(&mut port, fast_config())
            .receive_with(move |_| Ok(sink))
            .unwrap();
        assert_eq!(bytes, data.len() as u64);
        assert_eq!(out, data);
    }

    #[test]
    fn test_receive_repeated_packet_after_wrap_gets_plain_ack() {
        let data: Vec<u8> = (0..STX_BLOCK_SIZE * 257).map(|i| (i / STX_BLOCK_SIZE) as u8).collect();
        let frames = sender_frames("wrap.bin", &data);
        assert_eq!(Packet::decode(&frames[256]).unwrap().seq(), 0);

        let mut input = Vec::new();
        for (i, frame) in frames.iter().enumerate() {
            input.extend(frame);
            if i == 256 {
                input.extend(frame);
            }
        }
        let mut port = MockPort::with_input(&input);

        let mut out = Vec::new();

        let sink = &mut out;
        let (_, bytes) = YmodemReceiver::with_config(&mut port, fast_config())
            .receive_with(move |_| Ok(sink))
            .unwrap();
        assert_eq!(bytes, data.len() as u64);
        assert_eq!(out, data);

        // Start, header ACK+C, second EOT ACK+C
        assert_eq!(port.written().iter().filter(|&&b| b == control::C).count(), 3);
        assert_eq!(port.written().iter().filter(|&&b| b == control::ACK).count(), 1 + 258 + 2);
    }

    #[test]
    fn test_receive_rejects_early_end_of_file() {
        let mut input = Packet::header(&FileInfo::new("s.bin", 3000)).encode();
        input.extend(Packet::data(1, &[0x11; STX_BLOCK_SIZE], STX_BLOCK_SIZE).encode());
        input.extend([control::EOT, control::EOT]);
        input.extend(Packet::end_of_batch().encode());
        let mut port = MockPort::with_input(&input);

        let err = YmodemReceiver::with_config(&mut port, fast_config())
            .receive_with(|_| Ok(Vec::new()))
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(ref msg) if msg.contains("1024 of 3000")));
    }

    #[test]
    fn test_receive_peer_cancel() {
        let mut input = sender_frames("f.bin", &[1; 10])[0].clone();
        input.extend([control::CAN, control::CAN]);
        let mut port = MockPort::with_input(&input);

        let err = YmodemReceiver::with_config(&mut port, fast_config())
            .receive_with(|_| Ok(Vec::new()))
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_receive_times_out_without_sender() {
        let mut port = MockPort::with_input(&[]);
        let config = YmodemConfig {
            start_attempts: 3,
            ..fast_config()
        };
        let err = YmodemReceiver::with_config(&mut port, config)
            .receive_with(|_| Ok(Vec::new()))
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(port.written(), &[control::C; 3]);
    }
}
