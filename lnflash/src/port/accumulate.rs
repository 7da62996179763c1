//! Accumulate bytes until a predicate holds or the line goes idle.
//!
//! The RAM code answers some commands with output that arrives in bursts:
//! the flash-read hex line may be split across several buffer fills and is
//! sprinkled with spaces, and raw commands have no fixed reply length at all.
//! [`Accumulator`] polls the port, keeps the bytes a filter accepts, and stops
//! either when the collected bytes are complete or when nothing has arrived
//! for `max_idle_polls` consecutive polls.

use crate::delay::Delay;
use crate::error::{Error, Result};
use crate::port::Port;
use std::io::ErrorKind;
use std::time::Duration;

/// How an accumulation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accumulated {
    /// The completion predicate was satisfied.
    Complete(Vec<u8>),
    /// The port stayed quiet for the whole idle budget.
    Idle(Vec<u8>),
}

impl Accumulated {
    /// Bytes collected, whichever way the accumulation ended.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Complete(bytes) | Self::Idle(bytes) => bytes,
        }
    }

    /// Whether the completion predicate was met.
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }
}

/// Polling byte collector.
#[derive(Debug, Clone, Copy)]
pub struct Accumulator {
    poll_interval: Duration,
    max_idle_polls: u32,
}

impl Accumulator {
    /// Create an accumulator polling every `poll_interval`, giving up after
    /// `max_idle_polls` empty polls in a row.
    pub fn new(poll_interval: Duration, max_idle_polls: u32) -> Self {
        Self {
            poll_interval,
            max_idle_polls,
        }
    }

    /// Maximum quiet time before the accumulation ends.
    pub fn idle_budget(&self) -> Duration {
        self.poll_interval * self.max_idle_polls
    }

    /// Collect bytes accepted by `keep` until `complete` returns true.
    ///
    /// Bytes are consumed one at a time, so nothing past the completing byte
    /// is taken off the port.
    pub fn run<P, D, K, C>(
        &self,
        port: &mut P,
        delay: &mut D,
        mut keep: K,
        mut complete: C,
    ) -> Result<Accumulated>
    where
        P: Port + ?Sized,
        D: Delay + ?Sized,
        K: FnMut(u8) -> bool,
        C: FnMut(&[u8]) -> bool,
    {
        let mut collected = Vec::new();
        let mut idle_polls = 0;

        loop {
            if port.bytes_to_read()? == 0 {
                if idle_polls >= self.max_idle_polls {
                    return Ok(Accumulated::Idle(collected));
                }
                idle_polls += 1;
                delay.delay(self.poll_interval);
                continue;
            }

            idle_polls = 0;
            let mut buf = [0u8; 1];
            match port.read(&mut buf) {
                Ok(1) => {
                    if keep(buf[0]) {
                        collected.push(buf[0]);
                        if complete(&collected) {
                            return Ok(Accumulated::Complete(collected));
                        }
                    }
                },
                Ok(_) => {},
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {},
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Collect exactly `len` non-whitespace bytes.
    pub fn until_len<P, D>(&self, port: &mut P, delay: &mut D, len: usize) -> Result<Accumulated>
    where
        P: Port + ?Sized,
        D: Delay + ?Sized,
    {
        self.run(
            port,
            delay,
            |b| !b.is_ascii_whitespace(),
            |collected| collected.len() >= len,
        )
    }

    /// Collect everything until the port goes idle.
    pub fn until_idle<P, D>(&self, port: &mut P, delay: &mut D) -> Result<Vec<u8>>
    where
        P: Port + ?Sized,
        D: Delay + ?Sized,
    {
        self.run(port, delay, |_| true, |_| false)
            .map(Accumulated::into_bytes)
    }
}
