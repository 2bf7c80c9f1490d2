//! Lowercase hex used by packet dumps, REPL input and logs.

use crate::error::{Error, Result};

const DIGITS: &[u8; 16] = b"0123456789abcdef";

pub fn encode(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for b in data {
        s.push(DIGITS[(b >> 4) as usize] as char);
        s.push(DIGITS[(b & 0xf) as usize] as char);
    }
    s
}

/// Decode hex, ignoring ASCII whitespace between digit pairs.
///
/// # Errors
///
/// Returns [`Error::InvalidHex`] on odd length or a non-hex character.
pub fn decode(s: &str) -> Result<Vec<u8>> {
    let digits: Vec<u8> = s.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(Error::InvalidHex(format!("odd length {}", digits.len())));
    }
    digits
        .chunks_exact(2)
        .map(|pair| Ok((nibble(pair[0], s)? << 4) | nibble(pair[1], s)?))
        .collect()
}

fn nibble(c: u8, input: &str) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(Error::InvalidHex(input.to_string())),
    }
}
