//! CRC helpers for BM13xx bus frames.
//!
//! Command frames carry a CRC-5 (USB polynomial) over everything after the
//! preamble; job frames carry a CRC-16 (CCITT-FALSE) over flags, length and
//! payload. Both are byte-oriented implementations of conceptually
//! bit-oriented checks.

use crc_all::CrcAlgo;

const CRC5_INIT: u8 = 0x1f;

const CRC5: CrcAlgo<u8> = CrcAlgo::<u8>::new(
    0x5,       // polynomial
    5,         // width
    CRC5_INIT, // init
    0,         // xorout
    false,     // reflect
);

/// CRC-5-USB over a slice of bytes.
pub fn crc5(data: &[u8]) -> u8 {
    let mut crc = CRC5_INIT;
    CRC5.update_crc(&mut crc, data);
    CRC5.finish_crc(&crc)
}

/// A frame with its CRC-5 appended checks out when the CRC over the whole
/// buffer (CRC byte included) is zero.
pub fn crc5_is_valid(data: &[u8]) -> bool {
    crc5(data) == 0
}

const CRC16_INIT: u16 = 0xffff;

const CRC16: CrcAlgo<u16> = CrcAlgo::<u16>::new(
    0x1021,     // polynomial (CRC-16-CCITT-FALSE)
    16,         // width
    CRC16_INIT, // init
    0,          // xorout
    false,      // reflect
);

/// CRC-16-CCITT-FALSE over a slice of bytes. Used for job frames only.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = CRC16_INIT;
    CRC16.update_crc(&mut crc, data);
    CRC16.finish_crc(&crc)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    // Known-good command frames captured from a live chain. The first two
    // bytes are the preamble, the last byte the expected CRC.
    #[test_case(&[0x55, 0xaa, 0x52, 0x05, 0x00, 0x00, 0x0a]; "read_register_0")]
    #[test_case(&[0x55, 0xaa, 0x51, 0x09, 0x00, 0x28, 0x11, 0x30, 0x02, 0x00, 0x03]; "set_baud")]
    #[test_case(&[0x55, 0xaa, 0x40, 0x05, 0x00, 0x00, 0x1c]; "set_chip_address_00")]
    #[test_case(&[0x55, 0xaa, 0x40, 0x05, 0x02, 0x00, 0x01]; "set_chip_address_02")]
    #[test_case(&[0x55, 0xaa, 0x53, 0x05, 0x00, 0x00, 0x03]; "chain_inactive")]
    #[test_case(&[0x55, 0xaa, 0x51, 0x09, 0x00, 0xa4, 0x90, 0x00, 0xff, 0xff, 0x1c]; "write_version_mask")]
    fn crc5_matches_captures(frame: &[u8]) {
        let crc = super::crc5(&frame[2..frame.len() - 1]);
        assert_eq!(crc, frame[frame.len() - 1]);
    }

    #[test_case(&[0xaa, 0x55, 0x13, 0x70, 0x00, 0x00, 0x00, 0x00, 0x06]; "chip_id_response")]
    fn crc5_validates_responses(frame: &[u8]) {
        assert!(super::crc5_is_valid(&frame[2..]));
    }

    #[test]
    fn crc16_empty_is_init() {
        assert_eq!(super::crc16(&[]), 0xffff);
    }

    #[test]
    fn crc16_known_vector() {
        // Standard CCITT-FALSE check value for "123456789".
        assert_eq!(super::crc16(b"123456789"), 0x29b1);
    }
}
