//! Service password check.
//!
//! The keypad only has digits, so the technician enters a number and the
//! display shows a short hash of it. Configured passwords are such hashes:
//! FNV-1 32 over `salt ‖ input ‖ salt`, base64 without padding, lowercase.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;

const FNV32_OFFSET: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;

fn fnv1_32(h: u32, data: &[u8]) -> u32 {
    data.iter()
        .fold(h, |h, &b| h.wrapping_mul(FNV32_PRIME) ^ u32::from(b))
}

pub fn visual_hash(input: &[u8], salt: &[u8]) -> String {
    let mut h = fnv1_32(FNV32_OFFSET, salt);
    h = fnv1_32(h, input);
    h = fnv1_32(h, salt);
    STANDARD_NO_PAD.encode(h.to_be_bytes()).to_lowercase()
}

/// True when the hash of `input` is one of `passwords`.
pub fn check(input: &[u8], salt: &[u8], passwords: &[String]) -> bool {
    let hash = visual_hash(input, salt);
    passwords.iter().any(|p| *p == hash)
}
