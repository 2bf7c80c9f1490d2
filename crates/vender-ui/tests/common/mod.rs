//! Shared harness for UI scenario tests.
//!
//! A scenario builds a [`Global`] on mock hardware, runs the UI loop on a
//! task and steps through it: wait for a display state, inject a key or a
//! coin, wait for the next display state.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vender_core::config::{MenuItemConfig, StockConfig};
use vender_core::{Config, Nominal};
use vender_engine::Doer;
use vender_hardware::display::{LogDisplay, State, TextDisplay, TextDisplayConfig};
use vender_hardware::input::{Dispatcher, InputEvent};
use vender_hardware::money::{Devicer, MockMoneyDevice, MockMoneyHandle, PollItem, PollStatus};
use vender_network::{NoopTele, Teler};
use vender_ui::{Global, Hardware, Ui, UiState};

pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);
pub const COINS: [Nominal; 3] = [Nominal(100), Nominal(200), Nominal(500)];

pub fn stock(name: &str, code: i32, register_add: &str) -> StockConfig {
    StockConfig {
        name: name.to_string(),
        code,
        register_add: register_add.to_string(),
        ..StockConfig::default()
    }
}

pub fn menu_item(code: &str, price: u32, scenario: &str) -> MenuItemConfig {
    MenuItemConfig {
        code: code.to_string(),
        name: format!("item{code}"),
        price,
        scenario: scenario.to_string(),
    }
}

pub struct Builder {
    config: Config,
    coin: bool,
    tele: Arc<dyn Teler>,
    actions: Vec<(String, Doer)>,
}

impl Builder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            coin: false,
            tele: Arc::new(NoopTele),
            actions: Vec::new(),
        }
    }

    /// Register a hardware action before the UI loads its menu.
    pub fn with_action(mut self, name: &str, doer: Doer) -> Self {
        self.actions.push((name.to_string(), doer));
        self
    }

    pub fn with_coin(mut self) -> Self {
        self.coin = true;
        self
    }

    pub fn with_tele(mut self, tele: Arc<dyn Teler>) -> Self {
        self.tele = tele;
        self
    }

    /// Start the UI in `initial`; the global context stops once the loop
    /// moves to `last`.
    pub async fn start(self, initial: UiState, last: UiState) -> Env {
        let alive = CancellationToken::new();
        let display = Arc::new(TextDisplay::new(Box::new(LogDisplay::default()), &TextDisplayConfig::default()).unwrap());
        let (display_tx, display_rx) = mpsc::channel(256);
        display.set_update_chan(Some(display_tx));

        let mut coin = None;
        let mut hw = Hardware::empty(&alive);
        hw.display = Some(Arc::clone(&display));
        if self.coin {
            let (dev, handle) = MockMoneyDevice::new("coin", &COINS);
            hw.coin = Some(Devicer::Mock(dev));
            coin = Some(handle);
        }
        let input = Arc::clone(&hw.input);
        let g = Global::new(self.config, hw, self.tele, alive).await.unwrap();
        for (name, doer) in self.actions {
            g.engine.register(name, doer).unwrap();
        }

        let (state_tx, state_rx) = mpsc::unbounded_channel();
        let stopper = Arc::clone(&g);
        let ui = Ui::init(Arc::clone(&g))
            .await
            .unwrap()
            .with_state(initial)
            .on_transition(move |s| {
                let _ = state_tx.send(s);
                if s == last {
                    stopper.stop();
                }
            });
        let task = tokio::spawn(async move {
            let mut ui = ui;
            ui.run().await
        });
        Env {
            g,
            display,
            input,
            coin,
            display_rx,
            state_rx,
            task: Some(task),
        }
    }
}

pub struct Env {
    pub g: Arc<Global>,
    pub display: Arc<TextDisplay>,
    pub input: Arc<Dispatcher>,
    pub coin: Option<MockMoneyHandle>,
    display_rx: mpsc::Receiver<State>,
    state_rx: mpsc::UnboundedReceiver<UiState>,
    task: Option<JoinHandle<vender_ui::Result<()>>>,
}

impl Env {
    pub async fn key(&self, key: u8) {
        self.input.emit(InputEvent::keyboard(u16::from(key))).await;
    }

    pub async fn key_code(&self, key: u16) {
        self.input.emit(InputEvent::keyboard(key)).await;
    }

    pub fn inject_coin(&self, nominal: u32) {
        let coin = self.coin.as_ref().expect("coin device");
        coin.push_poll(vec![PollItem::money(PollStatus::Credit, Nominal(nominal), 1)]);
    }

    /// Display text as the UI would set it.
    pub fn text(&self, l1: &str, l2: &str) -> State {
        State {
            l1: self.display.translate(l1),
            l2: self.display.translate(l2),
        }
    }

    /// Skip display updates until `want` shows up.
    pub async fn expect_state(&mut self, want: State) {
        let found = tokio::time::timeout(STEP_TIMEOUT, async {
            let mut seen = Vec::new();
            while let Some(s) = self.display_rx.recv().await {
                if s == want {
                    return Ok(());
                }
                seen.push(s.to_string());
            }
            Err(seen)
        })
        .await;
        match found {
            Ok(Ok(())) => {}
            Ok(Err(seen)) => panic!("display closed waiting for {want:?}, seen {seen:?}"),
            Err(_) => panic!(
                "timeout waiting for display {want:?}, current {:?}",
                self.display.state()
            ),
        }
    }

    pub async fn expect(&mut self, l1: &str, l2: &str) {
        let want = self.text(l1, l2);
        self.expect_state(want).await;
    }

    /// Skip transitions until the loop moves to `want`.
    pub async fn expect_ui_state(&mut self, want: UiState) {
        let found = tokio::time::timeout(STEP_TIMEOUT, async {
            while let Some(s) = self.state_rx.recv().await {
                if s == want {
                    return true;
                }
            }
            false
        })
        .await;
        assert_eq!(found, Ok(true), "ui never reached {want}");
    }

    /// Wait for the loop to return.
    pub async fn finish(&mut self) {
        let task = self.task.take().expect("ui task");
        let result = tokio::time::timeout(STEP_TIMEOUT, task)
            .await
            .expect("ui loop did not stop")
            .expect("ui task panicked");
        result.unwrap();
    }

    pub async fn stop(&mut self) {
        self.g.stop();
        self.finish().await;
    }
}
