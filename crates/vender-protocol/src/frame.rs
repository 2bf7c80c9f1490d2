//! Slim frame: the unit exchanged with the telemetry server.
//!
//! # Wire layout
//!
//! All integers are big-endian.
//!
//! ```text
//! +-------+--------+-----+-------+-----------+-----------------+---------+---------+
//! | magic | length | seq | flags | [session] | [ackseq  acks]  | payload | [sig]   |
//! | 7302  |   u16  | u16 |  u8   |    u64    |  u16     u32    |   var   | 32 B    |
//! +-------+--------+-----+-------+-----------+-----------------+---------+---------+
//! ```
//!
//! `length` counts the whole frame. Payload length is whatever is left
//! after the fixed header and the optional fields. The signature is
//! HMAC-SHA256 over every byte before it.
//!
//! # Examples
//!
//! ```
//! use vender_protocol::Frame;
//!
//! let f = Frame { seq: 12345, payload: "1".into(), ..Default::default() };
//! let b = f.marshal(None).unwrap();
//! assert_eq!(vender_core::hex::encode(&b), "7302000830390031");
//! assert_eq!(Frame::unmarshal(&b, None).unwrap(), f);
//! ```

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{Result, SlimError};

pub const MAGIC: u16 = 0x7302;
pub const HEADER_FIXED: usize = 7;
pub const SIG_SIZE: usize = 32;
pub const SECRET_MIN: usize = 8;

pub const FLAG_SESSION: u8 = 1 << 0;
pub const FLAG_ACK: u8 = 1 << 1;
pub const FLAG_SIG: u8 = 1 << 2;
/// No payload; the receiver skips the application callback.
pub const FLAG_KEEPALIVE: u8 = 1 << 3;

/// Supplies the HMAC key for a frame. The returned buffer is zeroed after
/// use.
pub trait SecretSource: Send + Sync {
    fn secret(&self, frame: &Frame) -> Result<Vec<u8>>;
}

impl<F> SecretSource for F
where
    F: Fn(&Frame) -> Result<Vec<u8>> + Send + Sync,
{
    fn secret(&self, frame: &Frame) -> Result<Vec<u8>> {
        self(frame)
    }
}

/// Same key for every frame.
#[derive(Clone)]
pub struct StaticSecret(Vec<u8>);

impl StaticSecret {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self(secret.into())
    }
}

impl fmt::Debug for StaticSecret {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("StaticSecret(***)")
    }
}

impl SecretSource for StaticSecret {
    fn secret(&self, _frame: &Frame) -> Result<Vec<u8>> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub seq: u16,
    pub flags: u8,
    pub session: u64,
    pub ack_seq: u16,
    pub acks: u32,
    pub payload: Bytes,
}

/// Header fields decoded from the first [`HEADER_FIXED`] bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub length: usize,
    pub seq: u16,
    pub flags: u8,
}

impl FixedHeader {
    /// # Errors
    ///
    /// [`SlimError::UnexpectedEof`] on short input, [`SlimError::Magic`] or
    /// [`SlimError::Length`] on a malformed header.
    pub fn decode(b: &[u8]) -> Result<Self> {
        if b.len() < HEADER_FIXED {
            return Err(SlimError::eof("header"));
        }
        let magic = u16::from_be_bytes([b[0], b[1]]);
        if magic != MAGIC {
            return Err(SlimError::Magic { magic });
        }
        let length = u16::from_be_bytes([b[2], b[3]]) as usize;
        if length < HEADER_FIXED {
            return Err(SlimError::Length { length });
        }
        Ok(Self {
            length,
            seq: u16::from_be_bytes([b[4], b[5]]),
            flags: b[6],
        })
    }
}

impl Frame {
    pub fn keepalive(seq: u16) -> Self {
        Self {
            seq,
            flags: FLAG_KEEPALIVE,
            ..Default::default()
        }
    }

    pub fn check_flag(&self, flag: u8) -> bool {
        self.implied_flags() & flag != 0
    }

    /// Declared flags plus those implied by non-zero optional fields.
    pub fn implied_flags(&self) -> u8 {
        let mut flags = self.flags;
        if self.session != 0 {
            flags |= FLAG_SESSION;
        }
        if self.ack_seq != 0 || self.acks != 0 {
            flags |= FLAG_ACK;
        }
        flags
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        let flags = self.implied_flags();
        let mut s = HEADER_FIXED + self.payload.len();
        if flags & FLAG_SESSION != 0 {
            s += 8;
        }
        if flags & FLAG_ACK != 0 {
            s += 6;
        }
        if flags & FLAG_SIG != 0 {
            s += SIG_SIZE;
        }
        s
    }

    /// Encode, signing when [`FLAG_SIG`] is set.
    ///
    /// # Errors
    ///
    /// [`SlimError::TooLarge`] when the frame does not fit a u16 length,
    /// [`SlimError::SecretMissing`] or [`SlimError::WeakSecret`] when
    /// signing is impossible.
    pub fn marshal(&self, secret: Option<&dyn SecretSource>) -> Result<BytesMut> {
        let flags = self.implied_flags();
        let length = self.size();
        if length > u16::MAX as usize {
            return Err(SlimError::TooLarge {
                length,
                max: u16::MAX as usize,
            });
        }
        let mut buf = BytesMut::with_capacity(length);
        buf.put_u16(MAGIC);
        buf.put_u16(length as u16);
        buf.put_u16(self.seq);
        buf.put_u8(flags);
        if flags & FLAG_SESSION != 0 {
            buf.put_u64(self.session);
        }
        if flags & FLAG_ACK != 0 {
            buf.put_u16(self.ack_seq);
            buf.put_u32(self.acks);
        }
        buf.put_slice(&self.payload);
        if flags & FLAG_SIG != 0 {
            let source = secret.ok_or(SlimError::SecretMissing)?;
            let sig = self.sign(source, &buf)?;
            buf.put_slice(&sig);
        }
        Ok(buf)
    }

    /// Decode one complete frame from `buf`.
    ///
    /// With a secret source every frame must be signed and the signature
    /// must verify. Without one, signed frames are rejected.
    ///
    /// # Errors
    ///
    /// Header and length errors as in [`FixedHeader::decode`],
    /// [`SlimError::SignatureInvalid`] on mismatch,
    /// [`SlimError::SignatureMissing`] for an unsigned frame when a secret
    /// is configured.
    pub fn unmarshal(buf: &[u8], secret: Option<&dyn SecretSource>) -> Result<Self> {
        let header = FixedHeader::decode(buf)?;
        if header.length > buf.len() {
            return Err(SlimError::eof("frame body"));
        }
        let buf = &buf[..header.length];
        let mut frame = Frame {
            seq: header.seq,
            flags: header.flags,
            ..Default::default()
        };

        let mut optional = 0;
        if header.flags & FLAG_SESSION != 0 {
            optional += 8;
        }
        if header.flags & FLAG_ACK != 0 {
            optional += 6;
        }
        let sig_len = if header.flags & FLAG_SIG != 0 { SIG_SIZE } else { 0 };
        if HEADER_FIXED + optional + sig_len > header.length {
            return Err(SlimError::Length {
                length: header.length,
            });
        }

        let mut at = HEADER_FIXED;
        if header.flags & FLAG_SESSION != 0 {
            frame.session = u64::from_be_bytes(fixed(&buf[at..at + 8]));
            at += 8;
        }
        if header.flags & FLAG_ACK != 0 {
            frame.ack_seq = u16::from_be_bytes([buf[at], buf[at + 1]]);
            frame.acks = u32::from_be_bytes(fixed(&buf[at + 2..at + 6]));
            at += 6;
        }
        let auth_len = header.length - sig_len;
        frame.payload = Bytes::copy_from_slice(&buf[at..auth_len]);

        match (header.flags & FLAG_SIG != 0, secret) {
            (true, Some(source)) => {
                let actual = frame.sign(source, &buf[..auth_len])?;
                let declared = &buf[auth_len..];
                if !bool::from(actual.as_slice().ct_eq(declared)) {
                    return Err(SlimError::SignatureInvalid);
                }
            }
            (true, None) => return Err(SlimError::SecretMissing),
            (false, Some(_)) => return Err(SlimError::SignatureMissing),
            (false, None) => {}
        }
        Ok(frame)
    }

    fn sign(&self, source: &dyn SecretSource, data: &[u8]) -> Result<[u8; SIG_SIZE]> {
        let mut secret = source.secret(self)?;
        let sig = sign(data, &secret);
        secret.fill(0);
        sig
    }
}

/// HMAC-SHA256 of `data`.
///
/// # Errors
///
/// [`SlimError::WeakSecret`] when `secret` is shorter than 8 bytes.
pub fn sign(data: &[u8], secret: &[u8]) -> Result<[u8; SIG_SIZE]> {
    if secret.len() < SECRET_MIN {
        return Err(SlimError::WeakSecret);
    }
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(secret).map_err(|_| SlimError::WeakSecret)?;
    mac.update(data);
    let mut out = [0u8; SIG_SIZE];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

fn fixed<const N: usize>(b: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(b);
    out
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let flags = self.implied_flags();
        write!(f, "(seq={} flags=", self.seq)?;
        for (bit, c) in [
            (FLAG_SESSION, 'i'),
            (FLAG_ACK, 'a'),
            (FLAG_SIG, 's'),
            (FLAG_KEEPALIVE, 'k'),
        ] {
            if flags & bit != 0 {
                write!(f, "{c}")?;
            }
        }
        if flags & FLAG_SESSION != 0 {
            write!(f, " session={:x}", self.session)?;
        }
        if flags & FLAG_ACK != 0 {
            write!(f, " ackseq={} acks={:x}", self.ack_seq, self.acks)?;
        }
        write!(
            f,
            " payload=({}){})",
            self.payload.len(),
            vender_core::hex::encode(&self.payload)
        )
    }
}
