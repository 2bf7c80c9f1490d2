//! Per-connection frame sequence numbers.

use std::sync::atomic::{AtomicU32, Ordering};

/// Monotonic u16 sequence that never yields zero; zero means "no
/// sequence" on the wire.
#[derive(Debug, Default)]
pub struct SeqCounter {
    v: AtomicU32,
}

impl SeqCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u16 {
        loop {
            let seq = self.v.fetch_add(1, Ordering::Relaxed).wrapping_add(1) as u16;
            if seq != 0 {
                return seq;
            }
        }
    }
}

/// Serial number comparison over half the u16 range.
pub fn seq_greater(s1: u16, s2: u16) -> bool {
    (s1 > s2 && s1 - s2 <= 32768) || (s1 < s2 && s2 - s1 > 32768)
}
