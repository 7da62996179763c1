//! Byte and line level helpers on top of [`Port`].

use crate::error::{Error, Result};
use crate::port::Port;
use log::trace;
use std::io::ErrorKind;
use std::time::Duration;

/// Line terminator the LN882H bootloader expects after every command.
pub const LINE_ENDING: &str = "\r\n";

/// Run `f` with the port timeout temporarily set to `timeout`.
fn with_timeout<P, T, F>(port: &mut P, timeout: Duration, f: F) -> Result<T>
where
    P: Port + ?Sized,
    F: FnOnce(&mut P) -> Result<T>,
{
    let original = port.timeout();
    if original == timeout {
        return f(port);
    }

    port.set_timeout(timeout)?;
    let result = f(port);
    let restored = port.set_timeout(original);
    let value = result?;
    restored?;
    Ok(value)
}

fn read_one<P: Port + ?Sized>(port: &mut P, timeout: Duration) -> Result<u8> {
    let mut buf = [0u8; 1];
    loop {
        match port.read(&mut buf) {
            Ok(1) => return Ok(buf[0]),
            Ok(_) => {
                return Err(Error::Timeout(format!(
                    "no data within {} ms",
                    timeout.as_millis()
                )));
            },
            Err(e) if e.kind() == ErrorKind::Interrupted => {},
            Err(e) if e.kind() == ErrorKind::TimedOut => {
                return Err(Error::Timeout(format!(
                    "no data within {} ms",
                    timeout.as_millis()
                )));
            },
            Err(e) => return Err(Error::Io(e)),
        }
    }
}

/// Blocking reads with explicit timeouts.
///
/// Implemented for every [`Port`].
pub trait PortExt: Port {
    /// Read a single byte, waiting at most `timeout`.
    fn read_byte(&mut self, timeout: Duration) -> Result<u8> {
        with_timeout(self, timeout, |port| read_one(port, timeout))
    }

    /// Fill `buf` completely, allowing `timeout` between consecutive bytes.
    fn read_exact_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        with_timeout(self, timeout, |port| {
            let mut filled = 0;
            while filled < buf.len() {
                match port.read(&mut buf[filled..]) {
                    Ok(0) => {
                        return Err(Error::Timeout(format!(
                            "read {filled} of {} bytes",
                            buf.len()
                        )));
                    },
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == ErrorKind::Interrupted => {},
                    Err(e) if e.kind() == ErrorKind::TimedOut => {
                        return Err(Error::Timeout(format!(
                            "read {filled} of {} bytes",
                            buf.len()
                        )));
                    },
                    Err(e) => return Err(Error::Io(e)),
                }
            }
            Ok(())
        })
    }

    /// Read one line, allowing `timeout` between consecutive bytes.
    ///
    /// Lines end at `\n`; a single trailing `\r` is stripped, so the
    /// device's `\r\n` terminated replies come back as plain text.
    fn read_line(&mut self, timeout: Duration) -> Result<String> {
        let raw = with_timeout(self, timeout, |port| {
            let mut line = Vec::new();
            loop {
                match read_one(port, timeout)? {
                    b'\n' => return Ok(line),
                    b => line.push(b),
                }
            }
        })?;

        let raw = raw.strip_suffix(b"\r").unwrap_or(&raw);
        let line = String::from_utf8_lossy(raw).into_owned();
        trace!("<< {line:?}");
        Ok(line)
    }

    /// Send a text command followed by `\r\n`.
    fn send_line(&mut self, line: &str) -> Result<()> {
        trace!(">> {line:?}");
        let mut data = Vec::with_capacity(line.len() + LINE_ENDING.len());
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(LINE_ENDING.as_bytes());
        self.write_all_bytes(&data)
    }
}

impl<P: Port + ?Sized> PortExt for P {}
