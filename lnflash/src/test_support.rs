//! Scripted port and delay doubles shared by the unit tests.

use crate::delay::Delay;
use crate::error::Result;
use crate::port::Port;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::Duration;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// In-memory device.
///
/// Bytes queued with [`MockPort::with_input`] are available immediately.
/// A responder, if set, sees every `write` call and its return value is
/// appended to the receive queue, which models a device answering commands.
/// An empty receive queue reads as a timeout.
pub(crate) struct MockPort {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    writes: Vec<Vec<u8>>,
    timeout: Duration,
    baud_rate: u32,
    baud_changes: Vec<u32>,
    closed: bool,
    responder: Option<Responder>,
    burst: Option<(u32, Vec<u8>)>,
    empty_polls: u32,
    input_discards: usize,
}

impl MockPort {
    pub(crate) fn with_input(input: &[u8]) -> Self {
        Self {
            rx: input.iter().copied().collect(),
            tx: Vec::new(),
            writes: Vec::new(),
            timeout: Duration::from_secs(1),
            baud_rate: 115200,
            baud_changes: Vec::new(),
            closed: false,
            responder: None,
            burst: None,
            empty_polls: 0,
            input_discards: 0,
        }
    }

    pub(crate) fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        let mut port = Self::with_input(&[]);
        port.responder = Some(Box::new(responder));
        port
    }

    /// Deliver `bytes` once `polls` empty `bytes_to_read` polls have passed.
    pub(crate) fn queue_burst_after_polls(&mut self, polls: u32, bytes: &[u8]) {
        self.burst = Some((polls, bytes.to_vec()));
        self.empty_polls = 0;
    }

    pub(crate) fn push_input(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().copied());
    }

    pub(crate) fn written(&self) -> &[u8] {
        &self.tx
    }

    /// Individual `write` calls, in order.
    pub(crate) fn writes(&self) -> &[Vec<u8>] {
        &self.writes
    }

    pub(crate) fn pending(&self) -> Vec<u8> {
        self.rx.iter().copied().collect()
    }

    pub(crate) fn baud_changes(&self) -> &[u32] {
        &self.baud_changes
    }

    pub(crate) fn input_discards(&self) -> usize {
        self.input_discards
    }

    /// Text lines written so far, split on `\r\n`.
    pub(crate) fn sent_lines(&self) -> Vec<String> {
        self.writes
            .iter()
            .filter_map(|w| w.strip_suffix(b"\r\n"))
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "port closed")
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(Self::closed_error());
        }
        if self.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(self.rx.len());
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(Self::closed_error());
        }
        self.tx.extend_from_slice(buf);
        self.writes.push(buf.to_vec());
        if let Some(responder) = self.responder.as_mut() {
            let reply = responder(buf);
            self.rx.extend(reply);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.baud_rate = baud_rate;
        self.baud_changes.push(baud_rate);
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn bytes_to_read(&mut self) -> Result<u32> {
        if self.closed {
            return Err(Self::closed_error().into());
        }
        if self.rx.is_empty() {
            if let Some((polls, _)) = &self.burst {
                if self.empty_polls >= *polls {
                    if let Some((_, bytes)) = self.burst.take() {
                        self.rx.extend(bytes);
                    }
                } else {
                    self.empty_polls += 1;
                }
            }
        }
        Ok(u32::try_from(self.rx.len()).unwrap_or(u32::MAX))
    }

    fn discard_input(&mut self) -> Result<()> {
        self.rx.clear();
        self.input_discards += 1;
        Ok(())
    }

    fn discard_output(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Records requested delays instead of sleeping.
#[derive(Debug, Default)]
pub(crate) struct RecordingDelay {
    delays: Vec<Duration>,
}

impl RecordingDelay {
    pub(crate) fn calls(&self) -> usize {
        self.delays.len()
    }

    pub(crate) fn total(&self) -> Duration {
        self.delays.iter().sum()
    }

    pub(crate) fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

impl Delay for RecordingDelay {
    fn delay(&mut self, duration: Duration) {
        self.delays.push(duration);
    }
}
