//! Coprocessor wire format.
//!
//! ```text
//! packet:   length(1) | header(1) | data(..) | crc8(1)
//!           length counts every byte of the packet, crc covers all but itself
//! response: total(1) | packet | packet | ...
//!           total counts itself, 0 means nothing to read
//! ```
//!
//! Requests use the packet layout with a [`Command`] in the header slot.

use std::fmt;

use vender_core::crc::crc8;
use vender_core::hex;

use crate::error::{HardwareError, Result};

pub const BUFFER_SIZE: usize = 64;
pub const PACKET_OVERHEAD: usize = 3;

pub const FLAG_ADD_CHK: u8 = 0x01;
pub const FLAG_VERIFY_CHK: u8 = 0x02;
pub const FLAG_REPEAT: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Poll = 0x01,
    Config = 0x02,
    Reset = 0x03,
    Debug = 0x04,
    MdbBusReset = 0x07,
    MdbTransaction = 0x08,
}

impl Command {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x01 => Self::Poll,
            0x02 => Self::Config,
            0x03 => Self::Reset,
            0x04 => Self::Debug,
            0x07 => Self::MdbBusReset,
            0x08 => Self::MdbTransaction,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Header {
    Ok = 0x01,
    Config = 0x02,
    Debug = 0x04,
    Twi = 0x05,
    MdbStarted = 0x08,
    MdbSuccess = 0x09,
    Error = 0x80,
    BadPacket = 0x81,
    InvalidCrc = 0x82,
    BufferOverflow = 0x83,
    UnknownCommand = 0x84,
    Corruption = 0x85,
    NotImplemented = 0x86,
    MdbBusy = 0x88,
    MdbProtocolError = 0x89,
    MdbInvalidChk = 0x8a,
    MdbNack = 0x8b,
    MdbTimeout = 0x8c,
    UartChatterbox = 0x90,
    UartReadError = 0x91,
}

impl Header {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x01 => Self::Ok,
            0x02 => Self::Config,
            0x04 => Self::Debug,
            0x05 => Self::Twi,
            0x08 => Self::MdbStarted,
            0x09 => Self::MdbSuccess,
            0x80 => Self::Error,
            0x81 => Self::BadPacket,
            0x82 => Self::InvalidCrc,
            0x83 => Self::BufferOverflow,
            0x84 => Self::UnknownCommand,
            0x85 => Self::Corruption,
            0x86 => Self::NotImplemented,
            0x88 => Self::MdbBusy,
            0x89 => Self::MdbProtocolError,
            0x8a => Self::MdbInvalidChk,
            0x8b => Self::MdbNack,
            0x8c => Self::MdbTimeout,
            0x90 => Self::UartChatterbox,
            0x91 => Self::UartReadError,
            _ => return None,
        })
    }

    pub fn is_error(self) -> bool {
        (self as u8) & 0x80 != 0
    }

    /// Result of an MDB transaction rather than a link level error.
    pub fn is_mdb_result(self) -> bool {
        matches!(
            self,
            Self::MdbSuccess
                | Self::MdbBusy
                | Self::MdbProtocolError
                | Self::MdbInvalidChk
                | Self::MdbNack
                | Self::MdbTimeout
        )
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(header: Header, data: &[u8]) -> Self {
        Self {
            header,
            data: data.to_vec(),
        }
    }

    /// Header followed by data, as hex.
    pub fn body_hex(&self) -> String {
        let mut b = Vec::with_capacity(self.data.len() + 1);
        b.push(self.header as u8);
        b.extend_from_slice(&self.data);
        hex::encode(&b)
    }

    /// Keyboard code carried by a [`Header::Twi`] packet.
    pub fn twi_code(&self) -> Option<u16> {
        match (self.header, self.data.as_slice()) {
            (Header::Twi, [hi, lo, ..]) => Some(u16::from_be_bytes([*hi, *lo])),
            (Header::Twi, [b]) => Some(u16::from(*b)),
            _ => None,
        }
    }

    /// Typed error for an error-class header.
    pub fn to_error(&self) -> HardwareError {
        HardwareError::Mega {
            header: self.header as u8,
            data: self.data.clone(),
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.header, hex::encode(&self.data))
    }
}

/// Encode a request packet.
///
/// ```
/// use vender_hardware::mega::protocol::{Command, encode_request};
///
/// assert_eq!(encode_request(Command::MdbTransaction, &[]), vec![0x03, 0x08, 0x3a]);
/// ```
pub fn encode_request(command: Command, payload: &[u8]) -> Vec<u8> {
    encode(command as u8, payload)
}

pub fn encode(header: u8, payload: &[u8]) -> Vec<u8> {
    let length = payload.len() + PACKET_OVERHEAD;
    let mut b = Vec::with_capacity(length);
    b.push(length as u8);
    b.push(header);
    b.extend_from_slice(payload);
    b.push(crc8(&b));
    b
}

/// Parse a response buffer into packets. Any broken packet discards the
/// whole buffer.
///
/// # Errors
///
/// [`HardwareError::PacketInvalid`] for empty input, bad lengths, a bad
/// checksum or an unknown header.
pub fn parse_packets(buf: &[u8]) -> Result<Vec<Packet>> {
    let (&total, _) = buf
        .split_first()
        .ok_or_else(|| HardwareError::packet_invalid("empty response"))?;
    let total = usize::from(total);
    if total == 0 {
        return Ok(Vec::new());
    }
    if total > buf.len() {
        return Err(HardwareError::packet_invalid(format!(
            "total={total} buffer={}",
            buf.len()
        )));
    }
    let mut rest = &buf[1..total];
    let mut packets = Vec::new();
    while !rest.is_empty() {
        let length = usize::from(rest[0]);
        if length < PACKET_OVERHEAD {
            return Err(HardwareError::packet_invalid(format!(
                "packet length={length} min={PACKET_OVERHEAD}"
            )));
        }
        if length > rest.len() {
            return Err(HardwareError::packet_invalid(format!(
                "packet length={length} remaining={}",
                rest.len()
            )));
        }
        let (packet, tail) = rest.split_at(length);
        let received = packet[length - 1];
        let actual = crc8(&packet[..length - 1]);
        if received != actual {
            return Err(HardwareError::packet_invalid(format!(
                "crc received={received:02x} actual={actual:02x}"
            )));
        }
        let header = Header::from_byte(packet[1]).ok_or_else(|| {
            HardwareError::packet_invalid(format!("unknown header={:02x}", packet[1]))
        })?;
        packets.push(Packet::new(header, &packet[2..length - 1]));
        rest = tail;
    }
    Ok(packets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse_hex(s: &str) -> Result<Vec<Packet>> {
        parse_packets(&hex::decode(s).unwrap())
    }

    #[test]
    fn test_parse_two_packets() {
        let packets = parse_hex("08 03 08 3a 04 8b 05 69").unwrap();
        assert_eq!(
            packets,
            vec![
                Packet::new(Header::MdbStarted, &[]),
                Packet::new(Header::MdbNack, &[0x05]),
            ]
        );
    }

    #[test]
    fn test_parse_body() {
        let packets = parse_hex("07 06 04 be eb ee 65").unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].body_hex(), "04beebee");
    }

    #[test]
    fn test_parse_zero_total() {
        assert!(parse_hex("00 ff ff").unwrap().is_empty());
    }

    #[rstest]
    #[case("")]
    #[case("02 01")]
    #[case("09 03 08 3a")]
    #[case("05 06 04 be eb")]
    fn test_parse_invalid(#[case] input: &str) {
        assert!(matches!(
            parse_hex(input),
            Err(HardwareError::PacketInvalid { .. })
        ));
    }

    #[test]
    fn test_parse_crc_mismatch() {
        match parse_hex("04 03 00 ff") {
            Err(HardwareError::PacketInvalid { message }) => {
                assert_eq!(message, "crc received=ff actual=5b");
            }
            other => panic!("expected PacketInvalid, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_unknown_header() {
        let mut buf = vec![0x04];
        buf.extend(encode(0x77, &[]));
        assert!(matches!(
            parse_packets(&buf),
            Err(HardwareError::PacketInvalid { .. })
        ));
    }

    #[test]
    fn test_encode_roundtrip_with_total() {
        let p = encode(Header::Twi as u8, &[0x00, 0x41]);
        let mut buf = vec![(p.len() + 1) as u8];
        buf.extend(&p);
        buf.resize(BUFFER_SIZE, 0);
        let packets = parse_packets(&buf).unwrap();
        assert_eq!(packets[0].twi_code(), Some(0x41));
    }

    #[test]
    fn test_header_classes() {
        assert!(Header::InvalidCrc.is_error());
        assert!(!Header::Twi.is_error());
        assert!(Header::MdbNack.is_mdb_result());
        assert!(!Header::BadPacket.is_mdb_result());
    }
}
