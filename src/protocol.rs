use crate::Error;

/// Auto-baud sync preamble written once after opening the serial link.
pub const SYNC_PREAMBLE: [u8; 2] = [0x57, 0xAB];

/// Status byte reported by the bootloader when a command succeeded.
pub const STATUS_OK: u8 = 0x00;

/// Largest payload a single packet can carry (one length byte).
pub const MAX_PAYLOAD: usize = 255;

/// Write chunk size. One chunk frames as 1 command + 1 length + 4 address
/// + 56 data + 1 checksum = 63 bytes, inside the 64-byte transport packet
/// limit. Changing this must preserve that margin.
pub const MAX_CHUNK: usize = 56;

/// DataFlash (EEPROM) region base address.
pub const DATA_FLASH_ADDR: u32 = 0x0007_0000;

/// DataFlash region capacity in bytes.
pub const DATA_FLASH_SIZE: usize = 32_768;

/// Key block length for the IspKey command. The bootloader accepts an
/// all-zero block.
pub const KEY_LEN: usize = 30;

/// Identification block length returned by GetInfo.
pub const INFO_LEN: usize = 32;

/// Erase payload the bootloader reads as "erase the application area".
pub const ERASE_APP_AREA: [u8; 2] = [0x00, 0x00];

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Command {
    /// Read the chip identification block
    GetInfo = 0xA1,

    /// Leave the bootloader and restart the application firmware
    Reset = 0xA2,

    /// Send the ISP key block, required before writes on some links
    IspKey = 0xA3,

    /// Erase the application flash area
    Erase = 0xA4,

    /// Write one address-prefixed chunk to flash or DataFlash
    Write = 0xA5,

    /// Compare one address-prefixed chunk against flash
    Verify = 0xA6,
}

/// A decoded response: leading status byte plus whatever followed it.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Response<'a> {
    pub status: u8,
    pub payload: &'a [u8],
}

/// Additive checksum over command, length and payload, truncated to 8 bits.
pub fn checksum(command: u8, payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold(command.wrapping_add(payload.len() as u8), |sum, b| {
            sum.wrapping_add(*b)
        })
}

/// Frame a command as `[command][length][payload..][checksum]`.
pub fn encode<E: core::fmt::Debug>(command: Command, payload: &[u8]) -> Result<Vec<u8>, Error<E>> {
    if payload.len() > MAX_PAYLOAD {
        return Err(Error::PayloadTooLarge(payload.len()));
    }

    let mut packet = Vec::with_capacity(payload.len() + 3);
    packet.push(command as u8);
    packet.push(payload.len() as u8);
    packet.extend_from_slice(payload);
    packet.push(checksum(command as u8, payload));

    Ok(packet)
}

/// Split a raw response into status byte and opaque payload.
pub fn decode<E: core::fmt::Debug>(buffer: &[u8]) -> Result<Response<'_>, Error<E>> {
    match buffer.split_first() {
        Some((status, payload)) => Ok(Response {
            status: *status,
            payload,
        }),
        None => Err(Error::EmptyResponse),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_header_payload_and_checksum() {
        // Write of the 4-byte little-endian DataFlash base address
        let packet = encode::<()>(Command::Write, &[0x00, 0x00, 0x07, 0x00]).unwrap();
        assert_eq!(packet, vec![0xA5, 0x04, 0x00, 0x00, 0x07, 0x00, 0xB0]);
    }

    #[test]
    fn encodes_empty_payload() {
        let packet = encode::<()>(Command::GetInfo, &[]).unwrap();
        assert_eq!(packet, vec![0xA1, 0x00, 0xA1]);
    }

    #[test]
    fn checksum_wraps_modulo_256() {
        let payload = [0xFFu8; 8];
        let packet = encode::<()>(Command::Write, &payload).unwrap();

        let expected = payload
            .iter()
            .fold(0xA5u8.wrapping_add(8), |sum, b| sum.wrapping_add(*b));
        assert_eq!(*packet.last().unwrap(), expected);
    }

    #[test]
    fn checksum_matches_recomputation_over_encoded_bytes() {
        for len in &[0usize, 1, 55, 56, 254, 255] {
            let payload: Vec<u8> = (0..*len).map(|i| (i * 7) as u8).collect();
            let packet = encode::<()>(Command::Erase, &payload).unwrap();

            let body = &packet[..packet.len() - 1];
            let sum = body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
            assert_eq!(sum, packet[packet.len() - 1]);
        }
    }

    #[test]
    fn rejects_oversized_payload() {
        let payload = [0u8; 256];
        assert_eq!(
            encode::<()>(Command::Write, &payload),
            Err(Error::PayloadTooLarge(256))
        );
    }

    #[test]
    fn decodes_status_and_payload() {
        let response = decode::<()>(&[0x00, 0xAA, 0xBB]).unwrap();
        assert_eq!(response.status, STATUS_OK);
        assert_eq!(response.payload, &[0xAA, 0xBB]);
    }

    #[test]
    fn decodes_bare_status() {
        let response = decode::<()>(&[0x42]).unwrap();
        assert_eq!(response.status, 0x42);
        assert!(response.payload.is_empty());
    }

    #[test]
    fn empty_response_is_an_error() {
        assert_eq!(decode::<()>(&[]), Err(Error::EmptyResponse));
    }
}
