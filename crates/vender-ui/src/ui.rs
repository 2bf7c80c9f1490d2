//! The UI loop: one state handler at a time, each returning the next
//! state.
//!
//! ```text
//!   loop {
//!     next = enter(current)          // handler may wait() for events
//!     exit(current, next)
//!     lock pending and not deferred? lock_next = next; next = Locked
//!     publish(next); hook(next)
//!   }
//!
//!   wait(timeout) ─select─► ui alive   ─► Stop
//!                           money      ─► Money(credit | gift)
//!                           input      ─► Input | Service (dev-input key up)
//!                           lock       ─► Lock (only while locked)
//!                           timer      ─► Time
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vender_core::Amount;
use vender_engine::{Doer, ExecEnv, Stock};
use vender_hardware::display::{LogDisplay, TextDisplay, TextDisplayConfig};
use vender_hardware::input::InputEvent;
use vender_hardware::input::event::DEV_INPUT_EVENT_TAG;
use vender_protocol::tele::{Priority, State};

use crate::error::{Result, UiError};
use crate::event::Event;
use crate::global::Global;
use crate::menu::{Menu, MenuItem};
use crate::money::{MoneyEvent, MoneySystem};
use crate::state::UiState;

/// Poll interval while parked in [`UiState::Locked`].
pub const LOCK_POLL: Duration = Duration::from_millis(300);
const BOOT_ATTEMPTS: u32 = 3;
const BROKEN_POLL: Duration = Duration::from_secs(1);
const SERVICE_RESET_DEFAULT: Duration = Duration::from_secs(3);
const MONEY_EVENT_CAPACITY: usize = 8;

pub type TransitionHook = Box<dyn Fn(UiState) + Send + Sync>;

/// Selection in progress.
#[derive(Debug, Default)]
pub(crate) struct Front {
    pub(crate) item: Option<MenuItem>,
    pub(crate) cream: u8,
    pub(crate) sugar: u8,
    pub(crate) max_price: Amount,
}

#[derive(Debug, Default)]
pub(crate) struct Service {
    pub(crate) ask_report: bool,
    pub(crate) menu_idx: usize,
    pub(crate) inv_idx: usize,
    pub(crate) inv_list: Vec<Arc<Stock>>,
    pub(crate) test_idx: usize,
    pub(crate) tests: Vec<(String, Doer)>,
    pub(crate) salt: Vec<u8>,
    pub(crate) reset: Duration,
}

/// Background `accept_credit` bound to the state that started it.
#[derive(Debug)]
pub(crate) struct CreditAccept {
    parent: CancellationToken,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl CreditAccept {
    pub(crate) fn new(parent: &CancellationToken) -> Self {
        Self {
            parent: parent.clone(),
            stop: parent.child_token(),
            task: None,
        }
    }

    /// Stop the previous round, if any, and accept again.
    pub(crate) async fn restart(
        &mut self,
        money: &Arc<MoneySystem>,
        max_price: Amount,
        events: mpsc::Sender<MoneyEvent>,
    ) {
        self.finish_round().await;
        self.stop = self.parent.child_token();
        let (money, stop) = (Arc::clone(money), self.stop.clone());
        self.task = Some(tokio::spawn(async move {
            if let Err(e) = money.accept_credit(max_price, &stop, Some(events)).await {
                error!(error = %e, "accept credit");
            }
        }));
    }

    async fn finish_round(&mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            error!(error = %e, "accept credit task");
        }
    }

    pub(crate) async fn finish(mut self) {
        self.finish_round().await;
    }
}

pub struct Ui {
    pub(crate) g: Arc<Global>,
    pub(crate) display: Arc<TextDisplay>,
    pub(crate) menu: Menu,
    state: UiState,
    broken: bool,
    lock_next: Option<UiState>,
    pub(crate) alive: CancellationToken,
    pub(crate) front: Front,
    pub(crate) service: Service,
    pub(crate) input_buf: Vec<u8>,
    input_rx: mpsc::Receiver<InputEvent>,
    pub(crate) money_tx: mpsc::Sender<MoneyEvent>,
    money_rx: mpsc::Receiver<MoneyEvent>,
    pub(crate) front_reset: Duration,
    pub(crate) tune_timeout: Duration,
    hook: Option<TransitionHook>,
}

impl std::fmt::Debug for Ui {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ui")
            .field("state", &self.state)
            .field("broken", &self.broken)
            .field("input", &String::from_utf8_lossy(&self.input_buf))
            .finish_non_exhaustive()
    }
}

impl Ui {
    /// Load the menu and service tests, subscribe to input and money
    /// events. The loop starts in [`UiState::Boot`].
    ///
    /// # Errors
    ///
    /// Menu or service test scenarios that fail to parse, a second UI on
    /// the same dispatcher, an invalid headless display configuration.
    pub async fn init(g: Arc<Global>) -> Result<Self> {
        let menu = Menu::init(&g.config, &g.engine)?;
        info!(items = menu.len(), "menu");

        let display = match &g.display {
            Some(d) => Arc::clone(d),
            None => Arc::new(TextDisplay::new(
                Box::new(LogDisplay::default()),
                &TextDisplayConfig::default(),
            )?),
        };

        let service_config = &g.config.ui.service;
        let mut tests = Vec::with_capacity(service_config.test.len());
        for t in &service_config.test {
            let d = g.engine.parse_text(&t.name, &t.scenario)?;
            tests.push((t.name.clone(), d));
        }
        let salt = if service_config.auth.salt.is_empty() {
            g.config.tele.vm_id.to_string().into_bytes()
        } else {
            service_config.auth.salt.clone().into_bytes()
        };
        let service = Service {
            tests,
            salt,
            reset: nonzero_secs(service_config.reset_sec, SERVICE_RESET_DEFAULT),
            ..Service::default()
        };

        let input_rx = g.input.subscribe_chan("ui", g.alive().clone()).await?;
        let (money_tx, money_rx) = mpsc::channel(MONEY_EVENT_CAPACITY);
        let gift_tx = money_tx.clone();
        g.money.event_subscribe(move |e| {
            if let MoneyEvent::Gift(_) = e
                && gift_tx.try_send(*e).is_err()
            {
                debug!("ui money event dropped");
            }
        });

        let front_config = &g.config.ui.front;
        let front_reset = nonzero_secs(front_config.reset_sec, Duration::from_secs(300));
        let tune_timeout = Duration::from_millis(front_config.tune_timeout_ms.max(1));
        Ok(Self {
            alive: g.ui_alive(),
            g,
            display,
            menu,
            state: UiState::Boot,
            broken: false,
            lock_next: None,
            front: Front::default(),
            service,
            input_buf: Vec::with_capacity(32),
            input_rx,
            money_tx,
            money_rx,
            front_reset,
            tune_timeout,
            hook: None,
        })
    }

    /// Start from `state` instead of [`UiState::Boot`].
    #[must_use]
    pub fn with_state(mut self, state: UiState) -> Self {
        self.state = state;
        self
    }

    /// Called with every state the loop moves to.
    #[must_use]
    pub fn on_transition(mut self, f: impl Fn(UiState) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(f));
        self
    }

    pub fn state(&self) -> UiState {
        self.state
    }

    pub fn display(&self) -> &Arc<TextDisplay> {
        &self.display
    }

    /// Run until [`UiState::Stop`] or the UI alive token is cancelled.
    ///
    /// # Errors
    ///
    /// [`UiError::InvalidState`] when a handler produced no next state.
    pub async fn run(&mut self) -> Result<()> {
        self.alive = self.g.ui_renew();
        self.g.lock.publish(self.state);
        let mut next = self.state;
        while next != UiState::Stop && !self.alive.is_cancelled() {
            let current = self.state;
            next = self.enter(current).await;
            if next == UiState::Invalid {
                error!(state = %current, "ui state handler returned no next state");
                return Err(UiError::InvalidState { from: current });
            }
            self.exit(current, next);

            if current != UiState::Locked && self.check_interrupt(next) {
                info!(next = %next, "ui lock interrupt");
                self.lock_next = Some(next);
                next = UiState::Locked;
            }
            if self.alive.is_cancelled() {
                debug!("ui stopping");
                next = UiState::Stop;
            }
            self.state = next;
            self.g.lock.publish(next);
            if let Some(hook) = &self.hook {
                hook(next);
            }
        }
        debug!("ui loop end");
        Ok(())
    }

    async fn enter(&mut self, s: UiState) -> UiState {
        debug!(state = %s, "ui enter");
        match s {
            UiState::Boot => self.on_boot().await,
            UiState::Broken => self.on_broken().await,
            UiState::Locked => self.on_locked().await,

            UiState::FrontBegin => self.on_front_begin().await,
            UiState::FrontSelect => self.on_front_select(false).await,
            UiState::FrontTune => self.on_front_select(true).await,
            UiState::FrontAccept => self.on_front_accept().await,
            UiState::FrontTimeout => {
                debug!(input = %String::from_utf8_lossy(&self.input_buf), "front timeout");
                UiState::FrontEnd
            }
            UiState::FrontEnd => UiState::FrontBegin,

            UiState::ServiceBegin => self.on_service_begin().await,
            UiState::ServiceAuth => self.on_service_auth().await,
            UiState::ServiceMenu => self.on_service_menu().await,
            UiState::ServiceInventory => self.on_service_inventory().await,
            UiState::ServiceTest => self.on_service_test().await,
            UiState::ServiceReboot => self.on_service_reboot().await,
            UiState::ServiceNetwork => self.on_service_network().await,
            UiState::ServiceMoneyLoad => self.on_service_money_load().await,
            UiState::ServiceReport => self.on_service_report().await,
            UiState::ServiceEnd => self.on_service_end().await,

            UiState::Stop => UiState::Stop,
            UiState::Invalid => UiState::Invalid,
        }
    }

    fn exit(&mut self, current: UiState, next: UiState) {
        debug!(from = %current, to = %next, "ui exit");
        // a lock taken while broken returns to Broken without rerunning on_broken
        if next != UiState::Broken && next != UiState::Locked {
            self.broken = false;
        }
    }

    /// Whether a pending lock may take over before `next`.
    fn check_interrupt(&self, next: UiState) -> bool {
        let lock = &self.g.lock;
        if !lock.locked() || next == UiState::Locked || next == UiState::Stop {
            return false;
        }
        if next == UiState::FrontAccept || next.is_service() {
            return false;
        }
        !(lock.priority() == Priority::IdleUser && next.is_customer())
    }

    /// Next event or [`Event::Time`] after `timeout`.
    pub(crate) async fn wait(&mut self, timeout: Duration) -> Event {
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = self.alive.cancelled() => return Event::Stop,
                Some(e) = self.money_rx.recv() => return Event::Money(e),
                e = self.input_rx.recv() => match e {
                    None => return Event::Stop,
                    Some(e) if e.source == DEV_INPUT_EVENT_TAG => {
                        if e.up {
                            return Event::Service;
                        }
                    }
                    Some(e) => return Event::Input(e),
                },
                () = self.g.lock.notified() => {
                    // stale permit after the lock was already released
                    if self.g.lock.locked() {
                        return Event::Lock;
                    }
                }
                () = &mut sleep => return Event::Time,
            }
        }
    }

    /// Run a configured hook list, reporting a failure.
    pub(crate) async fn exec_hooks(&self, tag: &str, list: &[String]) -> Result<()> {
        if list.is_empty() {
            return Ok(());
        }
        self.g
            .engine
            .exec_list(&ExecEnv::new(), tag, list)
            .await
            .map_err(|e| {
                let e = e.annotate(tag);
                error!(error = %e, "ui hook");
                self.g.tele.error(&e);
                UiError::from(e)
            })
    }

    async fn on_boot(&mut self) -> UiState {
        let g = Arc::clone(&self.g);
        g.tele.state(State::Boot);
        for attempt in 1..=BOOT_ATTEMPTS {
            match self.exec_hooks("on_boot", &g.config.engine.on_boot).await {
                Ok(()) => {
                    self.broken = false;
                    return UiState::FrontBegin;
                }
                Err(e) => warn!(attempt, error = %e, "on_boot"),
            }
        }
        UiState::Broken
    }

    async fn on_broken(&mut self) -> UiState {
        let g = Arc::clone(&self.g);
        info!("state=broken");
        if !self.broken {
            g.tele.state(State::Problem);
            if let Err(e) = self.exec_hooks("on_broken", &g.config.engine.on_broken).await {
                debug!(error = %e, "on_broken");
            }
            g.money.set_accept_max(Amount::ZERO, Amount::ZERO).await;
        }
        self.broken = true;
        self.display
            .set_lines(Some(&g.config.ui.front.msg_broken), Some(""));
        loop {
            match self.wait(BROKEN_POLL).await {
                Event::Service => return UiState::ServiceBegin,
                Event::Stop => return UiState::Stop,
                Event::Lock => {
                    self.lock_next = Some(UiState::Broken);
                    return UiState::Locked;
                }
                _ => {}
            }
        }
    }

    async fn on_locked(&mut self) -> UiState {
        let g = Arc::clone(&self.g);
        self.display
            .set_lines(Some(&g.config.ui.front.msg_locked), Some(""));
        g.tele.state(State::Lock);
        loop {
            match self.wait(LOCK_POLL).await {
                Event::Service => return UiState::ServiceBegin,
                Event::Stop => return UiState::Stop,
                _ => {}
            }
            if !g.lock.locked() {
                return self.lock_next.take().unwrap_or(UiState::FrontBegin);
            }
        }
    }
}

fn nonzero_secs(secs: u64, default: Duration) -> Duration {
    if secs == 0 {
        default
    } else {
        Duration::from_secs(secs)
    }
}
