//! MDB packet: up to [`PACKET_MAX_LENGTH`] data bytes, immutable once built.
//!
//! The checksum byte is not stored; it is computed on the way to the wire
//! and verified on the way back.

use std::fmt;

use vender_core::hex;

use crate::error::{HardwareError, Result};

pub const PACKET_MAX_LENGTH: usize = 36;

#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Packet {
    data: Vec<u8>,
}

impl Packet {
    pub const EMPTY: Packet = Packet { data: Vec::new() };

    /// # Errors
    ///
    /// Returns [`HardwareError::PacketInvalid`] for more than
    /// [`PACKET_MAX_LENGTH`] bytes.
    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        if b.len() > PACKET_MAX_LENGTH {
            return Err(HardwareError::packet_invalid(format!(
                "length={} max={PACKET_MAX_LENGTH}",
                b.len()
            )));
        }
        Ok(Self { data: b.to_vec() })
    }

    /// Parse hex, whitespace allowed between digits.
    ///
    /// ```
    /// use vender_hardware::mdb::Packet;
    ///
    /// let p = Packet::from_hex("0c ffff 0000").unwrap();
    /// assert_eq!(p.len(), 5);
    /// assert_eq!(p.checksum(), 0x0a);
    /// assert!(Packet::from_hex("0").is_err());
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`HardwareError::PacketInvalid`] for odd length, non-hex
    /// input or an oversized packet.
    pub fn from_hex(s: &str) -> Result<Self> {
        let b = hex::decode(s).map_err(|e| HardwareError::packet_invalid(e.to_string()))?;
        Self::from_bytes(&b)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn checksum(&self) -> u8 {
        checksum(&self.data)
    }

    /// Data followed by the checksum, as sent by the bus master.
    pub fn wire(&self) -> Vec<u8> {
        let mut w = Vec::with_capacity(self.data.len() + 1);
        w.extend_from_slice(&self.data);
        w.push(self.checksum());
        w
    }

    /// Hex in groups of four bytes, for logs.
    pub fn format(&self) -> String {
        self.data
            .chunks(4)
            .map(hex::encode)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Wrapping sum of `b`.
pub fn checksum(b: &[u8]) -> u8 {
    b.iter().fold(0u8, |acc, x| acc.wrapping_add(*x))
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.data))
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet({})", hex::encode(&self.data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("", 0, 0x00)]
    #[case("0b", 1, 0x0b)]
    #[case("3401020304", 5, 0x3e)]
    #[case("ffff", 2, 0xfe)]
    fn test_packet_from_hex(#[case] input: &str, #[case] len: usize, #[case] chk: u8) {
        let p = Packet::from_hex(input).unwrap();
        assert_eq!(p.len(), len);
        assert_eq!(p.checksum(), chk);
        assert_eq!(p.to_string(), input);
    }

    #[rstest]
    #[case("0")]
    #[case("zz")]
    #[case("123")]
    fn test_packet_from_hex_invalid(#[case] input: &str) {
        assert!(matches!(
            Packet::from_hex(input),
            Err(HardwareError::PacketInvalid { .. })
        ));
    }

    #[test]
    fn test_packet_overflow() {
        assert!(Packet::from_bytes(&[0u8; PACKET_MAX_LENGTH]).is_ok());
        assert!(Packet::from_bytes(&[0u8; PACKET_MAX_LENGTH + 1]).is_err());
    }

    #[test]
    fn test_packet_wire_and_format() {
        let p = Packet::from_hex("0102030405").unwrap();
        assert_eq!(p.wire(), vec![1, 2, 3, 4, 5, 15]);
        assert_eq!(p.format(), "01020304 05");
        assert_eq!(Packet::from_hex("0102030405").unwrap(), p);
    }
}
