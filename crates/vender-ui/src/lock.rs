//! Cooperative UI lock for remote commands.
//!
//! A command that must not run under a customer asks for the lock and
//! waits until the UI loop parks in [`UiState::Locked`]. Holders are
//! counted; the UI leaves `Locked` when the last one is done.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use vender_protocol::tele::Priority;

use crate::state::UiState;

fn rank(p: Priority) -> u8 {
    match p {
        Priority::Now => 0,
        Priority::Default | Priority::IdleEngine => 1,
        Priority::IdleUser => 2,
    }
}

#[derive(Debug)]
pub struct UiLock {
    count: AtomicU32,
    priority: Mutex<Priority>,
    notify: Notify,
    state: watch::Sender<UiState>,
}

impl Default for UiLock {
    fn default() -> Self {
        Self::new()
    }
}

impl UiLock {
    pub fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
            priority: Mutex::new(Priority::Default),
            notify: Notify::new(),
            state: watch::channel(UiState::Invalid).0,
        }
    }

    pub fn locked(&self) -> bool {
        self.count.load(Ordering::Acquire) > 0
    }

    /// Most urgent priority among pending lock requests.
    pub fn priority(&self) -> Priority {
        *self.priority.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current UI state as last published by the UI loop.
    pub fn current(&self) -> UiState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<UiState> {
        self.state.subscribe()
    }

    pub(crate) fn publish(&self, state: UiState) {
        self.state.send_replace(state);
    }

    pub(crate) async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Request the lock and wait until the UI is parked. `false` when
    /// `stop` fired first; the request is withdrawn then.
    pub async fn lock_wait(&self, priority: Priority, stop: &CancellationToken) -> bool {
        {
            let mut p = self.priority.lock().unwrap_or_else(PoisonError::into_inner);
            if self.count.fetch_add(1, Ordering::AcqRel) == 0 || rank(priority) < rank(*p) {
                *p = priority;
            }
        }
        debug!(?priority, "ui lock requested");
        self.notify.notify_one();
        let mut rx = self.state.subscribe();
        let ok = tokio::select! {
            _ = stop.cancelled() => false,
            r = rx.wait_for(|s| *s == UiState::Locked) => r.is_ok(),
        };
        if !ok {
            self.lock_decrement_wait();
        }
        ok
    }

    /// Release one hold.
    pub fn lock_decrement_wait(&self) {
        let prev = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(c.saturating_sub(1)))
            .unwrap_or_default();
        if prev <= 1 {
            self.reset_priority();
        }
        self.notify.notify_one();
    }

    /// Release every hold.
    pub fn lock_end(&self) {
        self.count.store(0, Ordering::Release);
        self.reset_priority();
        self.notify.notify_one();
    }

    fn reset_priority(&self) {
        *self.priority.lock().unwrap_or_else(PoisonError::into_inner) = Priority::Default;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lock_wait_until_parked() {
        let lock = Arc::new(UiLock::new());
        let stop = CancellationToken::new();
        let l = Arc::clone(&lock);
        let s = stop.clone();
        let waiter = tokio::spawn(async move { l.lock_wait(Priority::IdleUser, &s).await });
        lock.notified().await;
        assert!(lock.locked());
        assert_eq!(lock.priority(), Priority::IdleUser);
        lock.publish(UiState::Locked);
        assert!(waiter.await.unwrap());
        lock.lock_decrement_wait();
        assert!(!lock.locked());
        assert_eq!(lock.priority(), Priority::Default);
    }

    #[tokio::test]
    async fn test_lock_wait_stopped_withdraws() {
        let lock = UiLock::new();
        let stop = CancellationToken::new();
        stop.cancel();
        assert!(!lock.lock_wait(Priority::Now, &stop).await);
        assert!(!lock.locked());
    }

    #[tokio::test]
    async fn test_most_urgent_priority_wins() {
        let lock = Arc::new(UiLock::new());
        let stop = CancellationToken::new();
        for p in [Priority::IdleUser, Priority::Now, Priority::IdleEngine] {
            let l = Arc::clone(&lock);
            let s = stop.clone();
            tokio::spawn(async move { l.lock_wait(p, &s).await });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(lock.priority(), Priority::Now);
        lock.lock_end();
        assert!(!lock.locked());
        stop.cancel();
    }
}
