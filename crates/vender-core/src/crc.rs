//! CRC-8 with polynomial 0x93, used by the coprocessor link.
//!
//! Each byte is folded into the running value as
//! `crc = reduce(crc ^ byte)` where `reduce` shifts left eight times and
//! XORs `0x93` whenever bit 7 was set before the shift. Initial value is
//! zero, no reflection, no final XOR.
//!
//! Two forms are provided. [`crc8`] is the table-driven reference built on
//! the `crc` crate; [`crc8_bitwise`] is the loop form used in
//! constrained contexts and in tests to cross-check the table.
//!
//! # Examples
//!
//! ```
//! use vender_core::crc::{crc8, crc8_update};
//!
//! assert_eq!(crc8(b"123456789"), 0x83);
//! assert_eq!(crc8_update(crc8(&[0x03]), &[0x08]), crc8(&[0x03, 0x08]));
//! ```

use crc::{Algorithm, Crc};

/// Algorithm parameters for the coprocessor checksum.
pub const CRC_8_MEGA: Algorithm<u8> = Algorithm {
    width: 8,
    poly: 0x93,
    init: 0x00,
    refin: false,
    refout: false,
    xorout: 0x00,
    check: 0x83,
    residue: 0x00,
};

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_MEGA);

const POLY: u8 = 0x93;

/// Checksum of `data` starting from zero.
#[must_use]
pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

/// Continue a checksum from a previous value.
#[must_use]
pub fn crc8_update(crc: u8, data: &[u8]) -> u8 {
    let mut digest = CRC8.digest_with_initial(crc);
    digest.update(data);
    digest.finalize()
}

/// Loop form of [`crc8_update`] for a single byte.
#[must_use]
pub const fn crc8_byte(crc: u8, byte: u8) -> u8 {
    let mut crc = crc ^ byte;
    let mut i = 0;
    while i < 8 {
        crc = if crc & 0x80 != 0 {
            (crc << 1) ^ POLY
        } else {
            crc << 1
        };
        i += 1;
    }
    crc
}

/// Loop form of [`crc8`].
#[must_use]
pub fn crc8_bitwise(data: &[u8]) -> u8 {
    data.iter().fold(0, |crc, &b| crc8_byte(crc, b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(&[0x03, 0x08], 0x3a)]
    #[case(&[0x04, 0x8b, 0x05], 0x69)]
    #[case(&[0x06, 0x04, 0xbe, 0xeb, 0xee], 0x65)]
    #[case(&[0x03, 0x00], 0x5b)]
    #[case(b"123456789", 0x83)]
    fn test_known_values(#[case] input: &[u8], #[case] expected: u8) {
        assert_eq!(crc8(input), expected);
        assert_eq!(crc8_bitwise(input), expected);
    }

    #[test]
    fn test_empty_is_zero() {
        assert_eq!(crc8(&[]), 0);
        assert_eq!(crc8_bitwise(&[]), 0);
    }

    proptest! {
        #[test]
        fn test_table_matches_loop(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            prop_assert_eq!(crc8(&data), crc8_bitwise(&data));
        }

        #[test]
        fn test_left_fold(a in proptest::collection::vec(any::<u8>(), 0..64),
                          b in proptest::collection::vec(any::<u8>(), 0..64)) {
            let mut joined = a.clone();
            joined.extend_from_slice(&b);
            prop_assert_eq!(crc8(&joined), crc8_update(crc8(&a), &b));
        }
    }
}
