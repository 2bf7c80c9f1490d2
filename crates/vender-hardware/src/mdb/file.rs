//! Serial port back-end.
//!
//! MDB uses 9 data bits; the ninth ("mode") bit marks the address byte from
//! the master and the last byte from a peripheral. A plain 8-bit UART can
//! emulate it by picking odd or even parity per byte so that the parity bit
//! equals the wanted mode bit.
//!
//! On receive the port runs with input parity marking, so a byte carrying
//! the mode bit arrives as `FF 00 b` and a literal `FF` as `FF FF`. The
//! marking is configured on the line (`stty parmrk inpck`) by the system
//! image; the serial port API only sets speed and parity.
//!
//! The ACK must leave within 5 ms after the checksum arrives, so the whole
//! send/receive/ACK exchange runs on a blocking thread without yielding.

use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{Parity, SerialPort};
use tracing::debug;

use crate::error::{HardwareError, Result};

use super::packet::{PACKET_MAX_LENGTH, checksum};
use super::uart::{Uart, copy_response};

const BAUD: u32 = 9600;
const READ_TIMEOUT: Duration = Duration::from_millis(40);

pub const ACK: u8 = 0x00;
pub const NAK: u8 = 0xff;

/// Byte-level access the MDB exchange needs from a port.
pub trait WirePort: Send {
    fn set_parity_odd(&mut self, odd: bool) -> Result<()>;
    fn write_all(&mut self, b: &[u8]) -> Result<()>;
    /// Read one byte, [`HardwareError::Timeout`] when the line stays quiet.
    fn read_byte(&mut self) -> Result<u8>;
    fn set_break(&mut self, on: bool) -> Result<()>;
    fn discard_input(&mut self) -> Result<()>;
}

/// Parity that makes the parity bit of `b` equal `mode`.
pub fn parity_odd_for(b: u8, mode: bool) -> bool {
    (b.count_ones() % 2 == 1) != mode
}

/// Incremental parser of the parity-marked receive stream.
#[derive(Debug, Default)]
pub struct ResponseDecoder {
    data: Vec<u8>,
    state: DecodeState,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    #[default]
    Data,
    Escape,
    Checksum,
}

/// Final outcome of a decoded response.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Data(Vec<u8>),
    Nak,
}

impl ResponseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte; `Some` once the frame is complete.
    pub fn feed(&mut self, b: u8) -> Option<Result<Decoded>> {
        match self.state {
            DecodeState::Data => {
                if b == 0xff {
                    self.state = DecodeState::Escape;
                } else {
                    self.data.push(b);
                }
            }
            DecodeState::Escape => match b {
                0x00 => self.state = DecodeState::Checksum,
                0xff => {
                    self.data.push(0xff);
                    self.state = DecodeState::Data;
                }
                _ => {
                    return Some(Err(HardwareError::packet_invalid(format!(
                        "recv unknown sequence ff {b:02x}"
                    ))));
                }
            },
            DecodeState::Checksum => return Some(self.finish(b)),
        }
        if self.data.len() > PACKET_MAX_LENGTH {
            return Some(Err(HardwareError::packet_invalid("recv buffer overflow")));
        }
        None
    }

    fn finish(&mut self, received: u8) -> Result<Decoded> {
        let data = std::mem::take(&mut self.data);
        if data.is_empty() {
            return match received {
                ACK => Ok(Decoded::Data(data)),
                NAK => Ok(Decoded::Nak),
                other => Err(HardwareError::Checksum {
                    received: other,
                    actual: 0,
                }),
            };
        }
        let actual = checksum(&data);
        if received != actual {
            return Err(HardwareError::Checksum { received, actual });
        }
        Ok(Decoded::Data(data))
    }
}

/// Complete MDB transaction on a byte port: request with mode bit on the
/// first byte, response, ACK for non-empty data.
///
/// # Errors
///
/// Propagates port errors; [`HardwareError::Nak`] and
/// [`HardwareError::Checksum`] for the corresponding peripheral answers.
pub fn transact<P: WirePort + ?Sized>(port: &mut P, request: &[u8]) -> Result<Vec<u8>> {
    if request.is_empty() {
        return Ok(Vec::new());
    }
    port.discard_input()?;
    let chk = checksum(request);
    let mut wire = Vec::with_capacity(request.len() + 1);
    wire.extend_from_slice(request);
    wire.push(chk);

    // Group bytes sharing a parity into one write.
    let mut start = 0;
    let mut odd = parity_odd_for(wire[0], true);
    for i in 1..=wire.len() {
        let next = wire.get(i).map(|&b| parity_odd_for(b, false));
        if next != Some(odd) {
            port.set_parity_odd(odd)?;
            port.write_all(&wire[start..i])?;
            if let Some(n) = next {
                odd = n;
                start = i;
            }
        }
    }

    let mut decoder = ResponseDecoder::new();
    let decoded = loop {
        let b = port.read_byte()?;
        if let Some(result) = decoder.feed(b) {
            break result?;
        }
    };
    match decoded {
        Decoded::Nak => Err(HardwareError::Nak),
        Decoded::Data(data) => {
            if !data.is_empty() {
                port.set_parity_odd(parity_odd_for(ACK, false))?;
                port.write_all(&[ACK])?;
            }
            Ok(data)
        }
    }
}

/// [`WirePort`] over a `serialport` handle, caching the last parity.
pub struct SerialWire {
    port: Box<dyn SerialPort>,
    last_odd: Option<bool>,
}

impl SerialWire {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self {
            port,
            last_odd: None,
        }
    }
}

impl WirePort for SerialWire {
    fn set_parity_odd(&mut self, odd: bool) -> Result<()> {
        if self.last_odd == Some(odd) {
            return Ok(());
        }
        // Parity change must not affect bytes still in the output queue.
        self.port.flush()?;
        self.port
            .set_parity(if odd { Parity::Odd } else { Parity::Even })?;
        self.last_odd = Some(odd);
        Ok(())
    }

    fn write_all(&mut self, b: &[u8]) -> Result<()> {
        Write::write_all(&mut self.port, b)?;
        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(1) => Ok(buf[0]),
            Ok(_) => Err(HardwareError::timeout("mdb recv")),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                Err(HardwareError::timeout("mdb recv"))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn set_break(&mut self, on: bool) -> Result<()> {
        if on {
            self.port.set_break()?;
        } else {
            self.port.clear_break()?;
        }
        Ok(())
    }

    fn discard_input(&mut self) -> Result<()> {
        self.port.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }
}

#[derive(Default)]
pub struct FileUart {
    wire: Option<SerialWire>,
}

impl std::fmt::Debug for FileUart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileUart")
            .field("open", &self.wire.is_some())
            .finish()
    }
}

impl FileUart {
    pub fn new() -> Self {
        Self::default()
    }

    fn take_wire(&mut self) -> Result<SerialWire> {
        self.wire
            .take()
            .ok_or_else(|| HardwareError::disconnected("mdb uart not open"))
    }

    /// Run `f` on the port from a blocking thread, then put the port back.
    async fn blocking<T, F>(&mut self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SerialWire) -> Result<T> + Send + 'static,
    {
        let mut wire = self.take_wire()?;
        let (wire, result) = tokio::task::spawn_blocking(move || {
            let r = f(&mut wire);
            (wire, r)
        })
        .await
        .map_err(|e| HardwareError::bus(format!("uart thread: {e}")))?;
        self.wire = Some(wire);
        result
    }
}

impl Uart for FileUart {
    async fn open(&mut self, path: &str) -> Result<()> {
        self.wire = None;
        let port = serialport::new(path, BAUD)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(Parity::Even)
            .timeout(READ_TIMEOUT)
            .open()?;
        debug!(path, baud = BAUD, "mdb uart open");
        self.wire = Some(SerialWire::new(port));
        Ok(())
    }

    async fn tx(&mut self, request: &[u8], response: &mut [u8]) -> Result<usize> {
        let request = request.to_vec();
        let data = self.blocking(move |w| transact(w, &request)).await?;
        copy_response(&data, response)
    }

    async fn break_(&mut self, keep: Duration, sleep: Duration) -> Result<()> {
        self.blocking(move |w| {
            w.discard_input()?;
            w.set_break(true)?;
            std::thread::sleep(keep);
            w.set_break(false)
        })
        .await?;
        tokio::time::sleep(sleep).await;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.wire = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Instant;

    /// Scripted port recording writes with their parity and time.
    #[derive(Default)]
    struct ScriptPort {
        input: VecDeque<u8>,
        odd: bool,
        written: Vec<(u8, bool)>,
        last_read: Option<Instant>,
        ack_delay: Option<Duration>,
    }

    impl WirePort for ScriptPort {
        fn set_parity_odd(&mut self, odd: bool) -> Result<()> {
            self.odd = odd;
            Ok(())
        }

        fn write_all(&mut self, b: &[u8]) -> Result<()> {
            if b == [ACK] && self.input.is_empty() {
                if let Some(t) = self.last_read {
                    self.ack_delay = Some(t.elapsed());
                }
            }
            self.written.extend(b.iter().map(|&x| (x, self.odd)));
            Ok(())
        }

        fn read_byte(&mut self) -> Result<u8> {
            self.last_read = Some(Instant::now());
            self.input
                .pop_front()
                .ok_or_else(|| HardwareError::timeout("script"))
        }

        fn set_break(&mut self, _on: bool) -> Result<()> {
            Ok(())
        }

        fn discard_input(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn mode_bits(written: &[(u8, bool)]) -> Vec<bool> {
        written
            .iter()
            .map(|&(b, odd)| (b.count_ones() % 2 == 1) != odd)
            .collect()
    }

    #[test]
    fn test_parity_odd_for() {
        // 0x08 has one bit set: even parity already yields bit 1.
        assert!(!parity_odd_for(0x08, true));
        assert!(parity_odd_for(0x08, false));
        assert!(parity_odd_for(0x00, true));
        assert!(!parity_odd_for(0x00, false));
    }

    #[test]
    fn test_decoder_data_and_checksum() {
        let mut d = ResponseDecoder::new();
        let mut out = None;
        for b in [0x01, 0xff, 0xff, 0x02, 0xff, 0x00, 0x02] {
            out = d.feed(b);
        }
        assert_eq!(out.unwrap().unwrap(), Decoded::Data(vec![0x01, 0xff, 0x02]));
    }

    #[test]
    fn test_decoder_ack_nak() {
        let mut d = ResponseDecoder::new();
        assert!(d.feed(0xff).is_none());
        assert!(d.feed(0x00).is_none());
        assert_eq!(d.feed(ACK).unwrap().unwrap(), Decoded::Data(vec![]));

        let mut d = ResponseDecoder::new();
        d.feed(0xff);
        d.feed(0x00);
        assert_eq!(d.feed(NAK).unwrap().unwrap(), Decoded::Nak);
    }

    #[test]
    fn test_decoder_bad_checksum() {
        let mut d = ResponseDecoder::new();
        d.feed(0x05);
        d.feed(0xff);
        d.feed(0x00);
        let err = d.feed(0x06).unwrap().unwrap_err();
        assert!(matches!(
            err,
            HardwareError::Checksum {
                received: 0x06,
                actual: 0x05
            }
        ));
    }

    #[test]
    fn test_decoder_unknown_escape() {
        let mut d = ResponseDecoder::new();
        d.feed(0xff);
        assert!(d.feed(0x12).unwrap().is_err());
    }

    #[test]
    fn test_transact_mode_bits_and_ack() {
        let mut port = ScriptPort {
            input: [0x0b, 0xff, 0x00, 0x0b].into_iter().collect(),
            ..Default::default()
        };
        let data = transact(&mut port, &[0x30, 0x01]).unwrap();
        assert_eq!(data, vec![0x0b]);
        let bytes: Vec<u8> = port.written.iter().map(|w| w.0).collect();
        assert_eq!(bytes, vec![0x30, 0x01, 0x31, ACK]);
        assert_eq!(mode_bits(&port.written), vec![true, false, false, false]);
        assert!(port.ack_delay.unwrap() < Duration::from_millis(5));
    }

    #[test]
    fn test_transact_empty_response_no_ack() {
        let mut port = ScriptPort {
            input: [0xff, 0x00, 0x00].into_iter().collect(),
            ..Default::default()
        };
        let data = transact(&mut port, &[0x0b]).unwrap();
        assert!(data.is_empty());
        assert_eq!(port.written.len(), 2);
    }

    #[test]
    fn test_transact_nak_and_timeout() {
        let mut port = ScriptPort {
            input: [0xff, 0x00, NAK].into_iter().collect(),
            ..Default::default()
        };
        assert!(matches!(transact(&mut port, &[0x0b]), Err(HardwareError::Nak)));

        let mut port = ScriptPort::default();
        assert!(transact(&mut port, &[0x0b]).unwrap_err().is_timeout());
    }
}
