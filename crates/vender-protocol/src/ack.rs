//! Sliding acknowledgement window.
//!
//! A sender registers each outgoing sequence and awaits its receiver. The
//! peer acknowledges with `(ack_seq, bitmap)` where bit `i` confirms
//! sequence `ack_seq - i`, so one frame covers the last 32 sequences.
//! Entries more than 32 behind the latest ack are dropped.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::oneshot;
use tracing::trace;

use crate::seq::seq_greater;

pub const WINDOW: u16 = 32;

#[derive(Debug, Default)]
pub struct AckMap {
    waiters: Mutex<HashMap<u16, oneshot::Sender<()>>>,
    /// Last received `ack_seq << 32 | bitmap`.
    last: AtomicU64,
}

impl AckMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait handle for `seq`. A second registration of the same sequence
    /// drops the first waiter.
    pub fn register(&self, seq: u16) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(seq, tx);
        rx
    }

    pub fn receive(&self, ack_seq: u16, bitmap: u32) {
        if bitmap == 0 {
            return;
        }
        self.last
            .store((u64::from(ack_seq) << 32) | u64::from(bitmap), Ordering::Release);
        let mut waiters = self.lock();
        for i in 0..WINDOW {
            if bitmap & (1 << i) != 0 {
                complete(&mut waiters, ack_seq.wrapping_sub(i));
            }
        }
        cleanup(&mut waiters, ack_seq);
    }

    pub fn complete(&self, seq: u16) {
        complete(&mut self.lock(), seq);
    }

    pub fn cancel(&self, seq: u16) {
        let mut waiters = self.lock();
        waiters.remove(&seq);
        cleanup(&mut waiters, seq);
    }

    /// Whether `seq` was acknowledged according to the latest window.
    /// `None` when no ack was received yet or `seq` is outside the window.
    pub fn acked(&self, seq: u16) -> Option<bool> {
        let v = self.last.load(Ordering::Acquire);
        let last = (v >> 32) as u16;
        let bitmap = v as u32;
        if last == 0 {
            return None;
        }
        if seq == last {
            return Some(true);
        }
        if seq_greater(seq, last) {
            return Some(false);
        }
        if seq_greater(last, seq.wrapping_add(WINDOW - 1)) {
            return None;
        }
        let offset = u32::from(last.wrapping_sub(seq));
        Some(bitmap & (1 << offset) != 0)
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u16, oneshot::Sender<()>>> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn complete(waiters: &mut HashMap<u16, oneshot::Sender<()>>, seq: u16) {
    if let Some(tx) = waiters.remove(&seq) {
        let _ = tx.send(());
    }
}

fn cleanup(waiters: &mut HashMap<u16, oneshot::Sender<()>>, before: u16) {
    let cutoff = before.wrapping_sub(WINDOW);
    waiters.retain(|&seq, _| {
        let expired = seq_greater(cutoff, seq);
        if expired {
            trace!(before, cutoff, seq, "ack window drop");
        }
        !expired
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_receive_completes_bitmap() {
        let acks = AckMap::new();
        let r10 = acks.register(10);
        let r8 = acks.register(8);
        let r9 = acks.register(9);
        acks.receive(10, 0b101);
        assert!(r10.await.is_ok());
        assert!(r8.await.is_ok());
        assert_eq!(acks.pending(), 1);
        assert_eq!(acks.acked(9), Some(false));
        assert_eq!(acks.acked(10), Some(true));
        assert_eq!(acks.acked(8), Some(true));
        drop(r9);
    }

    #[test]
    fn test_acked_outside_window() {
        let acks = AckMap::new();
        assert_eq!(acks.acked(1), None);
        acks.receive(100, 1);
        assert_eq!(acks.acked(50), None);
        assert_eq!(acks.acked(101), Some(false));
    }

    #[tokio::test]
    async fn test_cleanup_drops_old() {
        let acks = AckMap::new();
        let old = acks.register(1);
        acks.receive(40, 1);
        assert_eq!(acks.pending(), 0);
        assert!(old.await.is_err());
    }

    #[tokio::test]
    async fn test_reregister_drops_previous() {
        let acks = AckMap::new();
        let first = acks.register(5);
        let second = acks.register(5);
        assert!(first.await.is_err());
        acks.complete(5);
        assert!(second.await.is_ok());
    }

    #[test]
    fn test_wrap_around() {
        let acks = AckMap::new();
        let _a = acks.register(65535);
        let _b = acks.register(1);
        acks.receive(1, 0b11);
        assert_eq!(acks.acked(65535), Some(false));
        assert_eq!(acks.acked(0), Some(true));
        assert_eq!(acks.pending(), 1);
    }
}
