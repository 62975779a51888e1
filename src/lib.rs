//! WCH ISP bootloader client.
//!
//! Frames commands as `[command][length][payload][checksum]` packets and
//! drives the erase/write sequence over a serial or USB bulk link.

use std::collections::BTreeMap;
use std::time::Duration;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

pub mod chunk;
pub mod protocol;
pub mod serial;

#[cfg(feature = "linux")]
pub mod linux;

#[cfg(feature = "usb")]
pub mod usb;

pub use crate::protocol::{Command, DATA_FLASH_ADDR, DATA_FLASH_SIZE, MAX_CHUNK};

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<E: core::fmt::Debug> {
    /// Underlying link fault, cause preserved
    #[error("transport fault: {0:?}")]
    Transport(E),

    /// Port or device missing, not openable, or already released
    #[error("device or port could not be opened")]
    ConnectionFailed,

    /// The ISP interface did not expose a bulk IN/OUT endpoint pair
    #[error("bulk endpoints not found on the ISP interface")]
    EndpointsNotFound,

    /// The read deadline elapsed with zero bytes received
    #[error("no response from device")]
    NoResponse,

    /// A response buffer with no status byte was handed to the codec
    #[error("empty response")]
    EmptyResponse,

    /// The device answered with a non-success status byte
    #[error("device rejected command, status {0:#04x}")]
    DeviceRejected(u8),

    /// Attempted to frame more payload than the single length byte allows
    #[error("payload of {0} bytes does not fit a single packet")]
    PayloadTooLarge(usize),

    /// Caller-supplied image does not fit the hardware region
    #[error("image is {actual} bytes, region capacity is {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

impl<E: core::fmt::Debug> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Self::Transport(e)
    }
}

/// Three-state switch for session steps whose default depends on the
/// transport or target region.
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Toggle {
    Auto,
    On,
    Off,
}

impl Toggle {
    fn resolve(self, auto: bool) -> bool {
        match self {
            Toggle::Auto => auto,
            Toggle::On => true,
            Toggle::Off => false,
        }
    }
}

impl core::str::FromStr for Toggle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Toggle::Auto),
            "on" | "true" => Ok(Toggle::On),
            "off" | "false" => Ok(Toggle::Off),
            _ => Err(format!("unknown value '{}' (expected auto, on or off)", s)),
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Send the ISP key block before writing. Auto follows the link:
    /// on for USB, off for serial. Whether serial bootloaders require
    /// the key is unconfirmed; override here if a device rejects writes.
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "auto"))]
    pub key_exchange: Toggle,

    /// Erase the target region before writing. Auto erases code flash
    /// and leaves DataFlash alone.
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "auto"))]
    pub erase: Toggle,

    /// Delay after the erase acknowledgement, milliseconds
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "500"))]
    pub erase_settle_ms: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            key_exchange: Toggle::Auto,
            erase: Toggle::Auto,
            erase_settle_ms: 500,
        }
    }
}

/// Target memory region of a write sequence.
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Region {
    CodeFlash,
    DataFlash,
}

/// Session progress, Disconnected through Done or Failed.
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Disconnected,
    Connected,
    Erasing,
    Writing,
    Done,
    Failed,
}

/// Link carrying framed packets to the bootloader: a serial port or a
/// pair of USB bulk endpoints. One packet out, one bounded response back,
/// within the link's read deadline.
pub trait Transport {
    type Error: core::fmt::Debug;

    /// Bring the link up: sync a serial port, or claim the USB interface.
    fn connect(&mut self) -> Result<(), Error<Self::Error>>;

    /// Write one framed packet, then read up to `response_len` bytes.
    /// Zero bytes by the deadline is [`Error::NoResponse`]; interpreting
    /// the status byte is the caller's job.
    fn send_and_receive(
        &mut self,
        packet: &[u8],
        response_len: usize,
    ) -> Result<Vec<u8>, Error<Self::Error>>;

    /// Whether this link expects the ISP key block before writes.
    fn wants_key_exchange(&self) -> bool {
        false
    }

    /// Release the underlying port or device handle. Idempotent; further
    /// sends fail with [`Error::ConnectionFailed`].
    fn close(&mut self);
}

/// ISP flashing session over one exclusively-owned [`Transport`].
///
/// Drives connect, optional key exchange, erase and chunked writes. Any
/// rejected status or link fault aborts the remaining sequence and
/// releases the transport; chunks already written stay on the device.
pub struct Flasher<T: Transport> {
    transport: T,
    options: Options,
    state: State,
    progress: Option<Box<dyn FnMut(usize, usize)>>,
}

impl<T: Transport> Flasher<T> {
    /// Create a new session owning `transport`.
    pub fn new(transport: T, options: Options) -> Self {
        Self {
            transport,
            options,
            state: State::Disconnected,
            progress: None,
        }
    }

    /// Fetch the session state
    pub fn state(&self) -> State {
        self.state
    }

    /// Install a progress callback, called after every acknowledged chunk
    /// with (cumulative bytes written, total planned bytes).
    pub fn on_progress<F: FnMut(usize, usize) + 'static>(&mut self, progress: F) {
        self.progress = Some(Box::new(progress));
    }

    /// Bring the link up.
    pub fn connect(&mut self) -> Result<(), Error<T::Error>> {
        debug!("connecting transport");

        match self.transport.connect() {
            Ok(()) => {
                self.state = State::Connected;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Read the raw chip identification block. Not interpreted further.
    pub fn info(&mut self) -> Result<Vec<u8>, Error<T::Error>> {
        self.ensure_connected()?;

        let raw = match self.request(Command::GetInfo, &[], 1 + protocol::INFO_LEN) {
            Ok(raw) => raw,
            Err(e) => return Err(self.fail(e)),
        };

        match protocol::decode(&raw) {
            Ok(response) => Ok(response.payload.to_vec()),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Write firmware segments to code flash, erasing first unless
    /// configured off. Keys are segment start addresses; chunks inherit
    /// them plus their offset. Returns the total bytes written.
    ///
    /// On failure the device keeps whatever was already written; there is
    /// no rollback erase.
    pub fn program(&mut self, segments: &BTreeMap<u32, Vec<u8>>) -> Result<usize, Error<T::Error>> {
        self.ensure_connected()?;

        let total = segments.values().map(Vec::len).sum();
        let segments = segments.iter().map(|(address, data)| (*address, data.as_slice()));

        match self.write_region(Region::CodeFlash, segments, total) {
            Ok(()) => {
                self.finish();
                Ok(total)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Write an image to the DataFlash (EEPROM) region, addressed from
    /// its fixed base. No erase is issued unless configured on. Images
    /// larger than the region are rejected with [`Error::SizeMismatch`].
    pub fn program_data_flash(&mut self, image: &[u8]) -> Result<usize, Error<T::Error>> {
        if image.len() > protocol::DATA_FLASH_SIZE {
            return Err(self.fail(Error::SizeMismatch {
                expected: protocol::DATA_FLASH_SIZE,
                actual: image.len(),
            }));
        }

        self.ensure_connected()?;

        let segment = core::iter::once((protocol::DATA_FLASH_ADDR, image));

        match self.write_region(Region::DataFlash, segment, image.len()) {
            Ok(()) => {
                self.finish();
                Ok(image.len())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Leave the bootloader and restart the application firmware. The
    /// chip reboots out from under the link, so a missing response is
    /// tolerated for this command only.
    pub fn reset(&mut self) -> Result<(), Error<T::Error>> {
        self.ensure_connected()?;

        match self.command(Command::Reset, &[0x01]) {
            Ok(()) | Err(Error::NoResponse) | Err(Error::EmptyResponse) => {
                self.finish();
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Release the transport. Further operations fail with
    /// [`Error::ConnectionFailed`].
    pub fn close(&mut self) {
        if self.state != State::Failed {
            self.state = State::Done;
        }
        self.transport.close();
    }

    fn ensure_connected(&mut self) -> Result<(), Error<T::Error>> {
        if self.state == State::Disconnected {
            self.connect()?;
        }
        Ok(())
    }

    fn write_region<'a, I>(
        &mut self,
        region: Region,
        segments: I,
        total: usize,
    ) -> Result<(), Error<T::Error>>
    where
        I: IntoIterator<Item = (u32, &'a [u8])>,
    {
        if self
            .options
            .key_exchange
            .resolve(self.transport.wants_key_exchange())
        {
            debug!("sending ISP key block");
            self.command(Command::IspKey, &[0u8; protocol::KEY_LEN])?;
        }

        if self.options.erase.resolve(region == Region::CodeFlash) {
            debug!("erasing {:?}", region);
            self.state = State::Erasing;
            self.command(Command::Erase, &protocol::ERASE_APP_AREA)?;

            // Give the device time to finish before the first write
            std::thread::sleep(Duration::from_millis(self.options.erase_settle_ms));
        }

        debug!("writing {} bytes to {:?}", total, region);
        self.state = State::Writing;

        let mut written = 0;
        for (address, data) in segments {
            for chunk in chunk::split(address, data, protocol::MAX_CHUNK) {
                let mut payload = Vec::with_capacity(4 + chunk.data.len());
                payload.extend_from_slice(&chunk.address.to_le_bytes());
                payload.extend_from_slice(chunk.data);

                self.command(Command::Write, &payload)?;

                written += chunk.data.len();
                if let Some(progress) = self.progress.as_mut() {
                    progress(written, total);
                }
            }
        }

        Ok(())
    }

    /// Send one command and require a success status back.
    fn command(&mut self, command: Command, payload: &[u8]) -> Result<(), Error<T::Error>> {
        let raw = self.request(command, payload, 1)?;
        let response = protocol::decode(&raw)?;

        if response.status != protocol::STATUS_OK {
            debug!("{:?} rejected, status {:#04x}", command, response.status);
            return Err(Error::DeviceRejected(response.status));
        }

        Ok(())
    }

    fn request(
        &mut self,
        command: Command,
        payload: &[u8],
        response_len: usize,
    ) -> Result<Vec<u8>, Error<T::Error>> {
        let packet = protocol::encode(command, payload)?;

        trace!("-> {:02x?}", packet);
        let response = self.transport.send_and_receive(&packet, response_len)?;
        trace!("<- {:02x?}", response);

        Ok(response)
    }

    fn finish(&mut self) {
        self.state = State::Done;
        self.transport.close();
    }

    fn fail(&mut self, e: Error<T::Error>) -> Error<T::Error> {
        self.state = State::Failed;
        self.transport.close();
        e
    }
}
