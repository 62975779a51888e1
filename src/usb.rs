//! USB transport: bulk-endpoint link to a WCH bootloader device.

use std::time::Duration;

use rusb::{Context, DeviceHandle, Direction, TransferType, UsbContext};

use crate::{Error, Transport};

/// Vendor IDs the bootloader enumerates under
pub const VENDOR_IDS: [u16; 2] = [0x4348, 0x1A86];

/// Bootloader product ID, shared across both vendor IDs
pub const PRODUCT_ID: u16 = 0x55E0;

/// Bulk packet ceiling for ISP responses
const MAX_TRANSFER: usize = 64;

/// Bulk transfer deadline
const TRANSFER_TIMEOUT: Duration = Duration::from_millis(5_000);

struct Claimed<C: UsbContext> {
    handle: DeviceHandle<C>,
    interface: u8,
    ep_in: u8,
    ep_out: u8,
    driver_detached: bool,
}

/// ISP transport over a claimed USB interface with one bulk endpoint in
/// each direction.
pub struct UsbTransport<C: UsbContext = Context> {
    context: C,
    claimed: Option<Claimed<C>>,
}

impl UsbTransport<Context> {
    /// Create a transport on a fresh libusb context. Device discovery
    /// happens at connect time.
    pub fn new() -> Result<Self, rusb::Error> {
        Ok(Self::with_context(Context::new()?))
    }
}

impl<C: UsbContext> UsbTransport<C> {
    /// Create a transport on an existing context.
    pub fn with_context(context: C) -> Self {
        Self {
            context,
            claimed: None,
        }
    }
}

impl<C: UsbContext> Transport for UsbTransport<C> {
    type Error = rusb::Error;

    fn connect(&mut self) -> Result<(), Error<rusb::Error>> {
        let device = self
            .context
            .devices()?
            .iter()
            .find(|device| match device.device_descriptor() {
                Ok(descriptor) => {
                    VENDOR_IDS.contains(&descriptor.vendor_id())
                        && descriptor.product_id() == PRODUCT_ID
                }
                Err(_) => false,
            })
            .ok_or(Error::ConnectionFailed)?;

        let mut handle = device.open()?;

        let config = device.config_descriptor(0)?;
        let interface = config.interfaces().next().ok_or(Error::EndpointsNotFound)?;
        let descriptor = interface
            .descriptors()
            .next()
            .ok_or(Error::EndpointsNotFound)?;

        let mut ep_in = None;
        let mut ep_out = None;
        for endpoint in descriptor.endpoint_descriptors() {
            if endpoint.transfer_type() == TransferType::Bulk {
                match endpoint.direction() {
                    Direction::In => ep_in = Some(endpoint.address()),
                    Direction::Out => ep_out = Some(endpoint.address()),
                }
            }
        }

        let (ep_in, ep_out) = match (ep_in, ep_out) {
            (Some(ep_in), Some(ep_out)) => (ep_in, ep_out),
            _ => return Err(Error::EndpointsNotFound),
        };

        let interface = descriptor.interface_number();

        let driver_detached = handle.kernel_driver_active(interface).unwrap_or(false);
        if driver_detached {
            debug!("detaching kernel driver from interface {}", interface);
            handle.detach_kernel_driver(interface)?;
        }

        handle.set_active_configuration(config.number())?;
        handle.claim_interface(interface)?;

        debug!(
            "claimed ISP interface {} (in {:#04x}, out {:#04x})",
            interface, ep_in, ep_out
        );

        self.claimed = Some(Claimed {
            handle,
            interface,
            ep_in,
            ep_out,
            driver_detached,
        });

        Ok(())
    }

    /// The device answers within a single bulk transfer, so the read is
    /// always sized to the packet ceiling rather than `response_len`.
    fn send_and_receive(
        &mut self,
        packet: &[u8],
        _response_len: usize,
    ) -> Result<Vec<u8>, Error<rusb::Error>> {
        let claimed = self.claimed.as_ref().ok_or(Error::ConnectionFailed)?;

        claimed
            .handle
            .write_bulk(claimed.ep_out, packet, TRANSFER_TIMEOUT)?;

        let mut buffer = [0u8; MAX_TRANSFER];
        let read = match claimed
            .handle
            .read_bulk(claimed.ep_in, &mut buffer, TRANSFER_TIMEOUT)
        {
            Ok(read) => read,
            Err(rusb::Error::Timeout) => 0,
            Err(e) => return Err(Error::Transport(e)),
        };

        if read == 0 {
            error!("receive timeout");
            return Err(Error::NoResponse);
        }

        Ok(buffer[..read].to_vec())
    }

    fn wants_key_exchange(&self) -> bool {
        true
    }

    fn close(&mut self) {
        if let Some(mut claimed) = self.claimed.take() {
            let _ = claimed.handle.release_interface(claimed.interface);
            if claimed.driver_detached {
                let _ = claimed.handle.attach_kernel_driver(claimed.interface);
            }
        }
    }
}
