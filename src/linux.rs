use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use linux_embedded_hal::serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::{Delay, Serial};

use crate::serial::SerialTransport;

impl SerialTransport<Serial, Delay, IoErrorKind> {
    /// Open a linux serial port configured for the ISP bootloader (8N1,
    /// no flow control).
    pub fn open<P: AsRef<Path>>(port: P, baud: usize) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Apply settings
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        port.0.write_settings(&settings)?;

        // Keep the device-level timeout short; the transport enforces the
        // real response deadline
        port.0.set_timeout(Duration::from_millis(10))?;

        // Return instance
        Ok(Self::new(port, Delay {}))
    }
}
