//! Input fan-out.
//!
//! ```text
//!  source task ─┐                        ┌─► subscription "ui"     (channel)
//!  source task ─┼─► bus ─► delivery loop ┼─► subscription "money"  (callback)
//!  emit()      ─┘                        └─► ...
//! ```
//!
//! Each subscription carries its own stop token. A fired token removes the
//! subscription on the next delivery and closes its channel; a delivery
//! blocked on a full channel gives up when the token fires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{HardwareError, Result};

use super::event::{DEV_INPUT_EVENT_TAG, InputEvent};
use super::source::{AnySource, Source};

const BUS_CAPACITY: usize = 16;
const SUBSCRIPTION_CAPACITY: usize = 1;

type EventFn = Box<dyn Fn(&InputEvent) + Send + Sync>;

enum Target {
    Chan(mpsc::Sender<InputEvent>),
    Func(EventFn),
}

struct Subscription {
    target: Target,
    stop: CancellationToken,
}

type Subscriptions = Arc<tokio::sync::Mutex<HashMap<String, Subscription>>>;

pub struct Dispatcher {
    bus: mpsc::Sender<InputEvent>,
    subs: Subscriptions,
    evend_enabled: Arc<AtomicBool>,
    stop: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("stopped", &self.stop.is_cancelled())
            .finish()
    }
}

impl Dispatcher {
    /// Start the delivery loop; it ends when `stop` fires.
    pub fn new(stop: &CancellationToken) -> Arc<Self> {
        let (bus, rx) = mpsc::channel(BUS_CAPACITY);
        let subs: Subscriptions = Arc::default();
        let stop = stop.child_token();
        let mut tasks = JoinSet::new();
        tasks.spawn(deliver_loop(rx, subs.clone(), stop.clone()));
        Arc::new(Self {
            bus,
            subs,
            evend_enabled: Arc::new(AtomicBool::new(true)),
            stop,
            tasks: Mutex::new(tasks),
        })
    }

    /// Spawn a reader task for `source`. A read error stops the dispatcher.
    pub fn add_source(&self, mut source: AnySource) {
        let bus = self.bus.clone();
        let stop = self.stop.clone();
        let enabled = self.evend_enabled.clone();
        let task = async move {
            let tag = source.tag();
            debug!(source = tag, "input source started");
            loop {
                let event = tokio::select! {
                    _ = stop.cancelled() => return,
                    r = source.read() => r,
                };
                match event {
                    Ok(ev) if enabled.load(Ordering::Relaxed) || ev.source == DEV_INPUT_EVENT_TAG => {
                        tokio::select! {
                            _ = stop.cancelled() => return,
                            _ = bus.send(ev) => {}
                        }
                    }
                    Ok(ev) => debug!(event = %ev, "keyboard disabled, event ignored"),
                    Err(e) => {
                        error!(source = tag, error = %e, "input source failed");
                        stop.cancel();
                        return;
                    }
                }
            }
        };
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .spawn(task);
    }

    /// Let keyboard events through; service button events always pass.
    pub fn set_enabled(&self, on: bool) {
        self.evend_enabled.store(on, Ordering::Relaxed);
        info!(enabled = on, "keyboard input");
    }

    pub fn is_enabled(&self) -> bool {
        self.evend_enabled.load(Ordering::Relaxed)
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Inject an event as if a source produced it.
    pub async fn emit(&self, event: InputEvent) {
        debug!(event = %event, "input emit");
        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = self.bus.send(event) => {}
        }
    }

    /// # Errors
    ///
    /// [`HardwareError::DuplicateSubscriber`] when `name` is live.
    pub async fn subscribe_chan(
        &self,
        name: &str,
        stop: CancellationToken,
    ) -> Result<mpsc::Receiver<InputEvent>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.subscribe(name, Target::Chan(tx), stop).await?;
        Ok(rx)
    }

    /// # Errors
    ///
    /// [`HardwareError::DuplicateSubscriber`] when `name` is live.
    pub async fn subscribe_func(
        &self,
        name: &str,
        f: impl Fn(&InputEvent) + Send + Sync + 'static,
        stop: CancellationToken,
    ) -> Result<()> {
        self.subscribe(name, Target::Func(Box::new(f)), stop).await
    }

    async fn subscribe(&self, name: &str, target: Target, stop: CancellationToken) -> Result<()> {
        let mut subs = self.subs.lock().await;
        if let Some(existing) = subs.get(name)
            && !existing.stop.is_cancelled()
        {
            return Err(HardwareError::DuplicateSubscriber {
                name: name.to_string(),
            });
        }
        subs.insert(name.to_string(), Subscription { target, stop });
        Ok(())
    }

    pub async fn unsubscribe(&self, name: &str) -> bool {
        self.subs.lock().await.remove(name).is_some()
    }

    /// Stop all tasks and wait for them.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        while tasks.join_next().await.is_some() {}
    }
}

async fn deliver_loop(
    mut rx: mpsc::Receiver<InputEvent>,
    subs: Subscriptions,
    stop: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => break,
            ev = rx.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
        };
        let mut subs = subs.lock().await;
        let mut closed = Vec::new();
        for (name, sub) in subs.iter() {
            if sub.stop.is_cancelled() {
                closed.push(name.clone());
                continue;
            }
            match &sub.target {
                Target::Func(f) => f(&event),
                Target::Chan(tx) => {
                    tokio::select! {
                        r = tx.send(event.clone()) => if r.is_err() { closed.push(name.clone()) },
                        _ = sub.stop.cancelled() => closed.push(name.clone()),
                    }
                }
            }
        }
        if subs.is_empty() {
            warn!(event = %event, "input not handled");
        }
        for name in closed {
            debug!(name, "input subscription closed");
            subs.remove(&name);
        }
    }
    rx.close();
    debug!("input dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::event::{EVEND_KEYBOARD_TAG, KEY_ACCEPT};
    use crate::input::source::MockSource;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[tokio::test]
    async fn test_source_to_channel() {
        let stop = CancellationToken::new();
        let d = Dispatcher::new(&stop);
        let (src, handle) = MockSource::new(EVEND_KEYBOARD_TAG);
        d.add_source(AnySource::Mock(src));
        let mut rx = d.subscribe_chan("ui", CancellationToken::new()).await.unwrap();
        handle.send(InputEvent::keyboard(KEY_ACCEPT)).await;
        assert!(rx.recv().await.unwrap().is_accept());
        stop.cancel();
    }

    #[tokio::test]
    async fn test_duplicate_subscriber() {
        let stop = CancellationToken::new();
        let d = Dispatcher::new(&stop);
        let sub_stop = CancellationToken::new();
        let _rx = d.subscribe_chan("ui", sub_stop.clone()).await.unwrap();
        assert!(matches!(
            d.subscribe_chan("ui", CancellationToken::new()).await,
            Err(HardwareError::DuplicateSubscriber { .. })
        ));
        sub_stop.cancel();
        assert!(d.subscribe_chan("ui", CancellationToken::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_stopped_subscription_closed() {
        let stop = CancellationToken::new();
        let d = Dispatcher::new(&stop);
        let sub_stop = CancellationToken::new();
        let mut rx = d.subscribe_chan("ui", sub_stop.clone()).await.unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        d.subscribe_func(
            "count",
            move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();
        sub_stop.cancel();
        d.emit(InputEvent::keyboard(u16::from(b'1'))).await;
        assert_eq!(rx.recv().await, None);
        tokio::time::timeout(Duration::from_secs(1), async {
            while calls.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_disabled_keyboard_passes_service() {
        let stop = CancellationToken::new();
        let d = Dispatcher::new(&stop);
        d.set_enabled(false);
        let (kb, kb_handle) = MockSource::new(EVEND_KEYBOARD_TAG);
        let (svc, svc_handle) = MockSource::new(DEV_INPUT_EVENT_TAG);
        d.add_source(AnySource::Mock(kb));
        d.add_source(AnySource::Mock(svc));
        let mut rx = d.subscribe_chan("ui", CancellationToken::new()).await.unwrap();
        kb_handle.send(InputEvent::keyboard(KEY_ACCEPT)).await;
        svc_handle
            .send(InputEvent::new(DEV_INPUT_EVENT_TAG, 256, true))
            .await;
        let ev = rx.recv().await.unwrap();
        assert!(ev.is_service());
        stop.cancel();
    }

    #[tokio::test]
    async fn test_source_error_stops() {
        let stop = CancellationToken::new();
        let d = Dispatcher::new(&stop);
        let (src, handle) = MockSource::new(EVEND_KEYBOARD_TAG);
        d.add_source(AnySource::Mock(src));
        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), async {
            while !d.is_stopped() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(!stop.is_cancelled());
        d.shutdown().await;
    }
}
