//! Serial transport: a byte-oriented port carrying framed ISP packets.

use core::marker::PhantomData;
use std::time::{Duration, Instant};

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::protocol::SYNC_PREAMBLE;
use crate::{Error, Transport};

/// Settle time after the auto-baud preamble before draining stale input
const SYNC_SETTLE_MS: u32 = 100;

/// Default response deadline
const RESPONSE_TIMEOUT_MS: u32 = 2_000;

/// Poll period while waiting for response bytes
const POLL_DELAY_MS: u32 = 1;

/// ISP transport over any serial port. The port's own timeout should be
/// short; this transport enforces the response deadline itself by
/// polling.
pub struct SerialTransport<P, D, E> {
    port: Option<P>,
    delay: D,
    response_timeout_ms: u32,
    _err: PhantomData<E>,
}

impl<P, D, E> SerialTransport<P, D, E>
where
    P: Write<u8, Error = E> + Read<u8, Error = E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Wrap an already-open port.
    pub fn new(port: P, delay: D) -> Self {
        Self {
            port: Some(port),
            delay,
            response_timeout_ms: RESPONSE_TIMEOUT_MS,
            _err: PhantomData,
        }
    }

    /// Override the response deadline.
    pub fn with_response_timeout(mut self, ms: u32) -> Self {
        self.response_timeout_ms = ms;
        self
    }

    /// Discard whatever is already buffered on the input side.
    fn drain(&mut self) {
        let port = match self.port.as_mut() {
            Some(port) => port,
            None => return,
        };

        let mut discarded = 0;
        while port.read().is_ok() {
            discarded += 1;
        }

        if discarded > 0 {
            debug!("discarded {} stale bytes", discarded);
        }
    }

    /// Read up to `len` bytes, returning early with whatever arrived once
    /// the deadline passes. Zero bytes is a failure.
    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, Error<E>> {
        let mut bytes = Vec::with_capacity(len);
        let deadline = Instant::now() + Duration::from_millis(u64::from(self.response_timeout_ms));

        while bytes.len() < len {
            let port = self.port.as_mut().ok_or(Error::ConnectionFailed)?;

            match port.read() {
                Ok(b) => {
                    bytes.push(b);
                    continue;
                }
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
            }

            if Instant::now() >= deadline {
                if bytes.is_empty() {
                    error!("receive timeout");
                    return Err(Error::NoResponse);
                }
                break;
            }

            self.delay.delay_ms(POLL_DELAY_MS);
        }

        Ok(bytes)
    }
}

impl<P, D, E> Transport for SerialTransport<P, D, E>
where
    P: Write<u8, Error = E> + Read<u8, Error = E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    type Error = E;

    fn connect(&mut self) -> Result<(), Error<E>> {
        debug!("syncing serial link");

        let port = self.port.as_mut().ok_or(Error::ConnectionFailed)?;
        for b in SYNC_PREAMBLE.iter() {
            block!(port.write(*b))?;
        }
        block!(port.flush())?;

        // Let the device lock onto the baud rate, then drop any garbage
        // it echoed back
        self.delay.delay_ms(SYNC_SETTLE_MS);
        self.drain();

        Ok(())
    }

    fn send_and_receive(
        &mut self,
        packet: &[u8],
        response_len: usize,
    ) -> Result<Vec<u8>, Error<E>> {
        let port = self.port.as_mut().ok_or(Error::ConnectionFailed)?;

        for b in packet {
            block!(port.write(*b))?;
        }
        block!(port.flush())?;

        self.read_bytes(response_len)
    }

    fn close(&mut self) {
        self.port.take();
    }
}
