//! Process-wide context shared by the UI, the money system and telemetry
//! command handling.
//!
//! ```text
//!            Global::init(config)
//!   mega::Client ──► mdb::Bus ──► coin / bill ──► MoneySystem
//!        │                                            │
//!        └──► EvendKeyboard ──► input::Dispatcher ◄───┘ (money abort)
//!   Engine ◄── Inventory, money.* actions, aliases
//!   Tele ──serve_commands──► Global (CommandHandler) ──schedule──► UiLock
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vender_core::Config;
use vender_core::config::HardwareConfig;
use vender_engine::{Engine, ExecEnv, Inventory, ProfileFn};
use vender_hardware::display::{Codepage, LogDisplay, TextDisplay, TextDisplayConfig};
use vender_hardware::input::{AnySource, DevInputEventSource, Dispatcher, EvendKeyboard};
use vender_hardware::mdb::{self, BillValidator, Bus, CoinAcceptor, UartDriver};
use vender_hardware::mega::{self, SpidevBus, SysfsPin};
use vender_hardware::money::Devicer;
use vender_network::{CommandHandler, NoopTele, Tele, Teler};
use vender_protocol::tele::{Command, CommandTask, Priority, Telemetry};
use vender_storage::Persist;

use crate::error::{Result, UiError};
use crate::lock::UiLock;
use crate::money::MoneySystem;

/// Opened peripherals handed to [`Global::new`].
pub struct Hardware {
    pub display: Option<Arc<TextDisplay>>,
    pub input: Arc<Dispatcher>,
    pub mdb: Option<Arc<Bus>>,
    pub mega: Option<Arc<mega::Client>>,
    pub bill: Option<Devicer>,
    pub coin: Option<Devicer>,
}

impl Hardware {
    /// Nothing attached but an input dispatcher.
    pub fn empty(alive: &CancellationToken) -> Self {
        Self {
            display: None,
            input: Dispatcher::new(alive),
            mdb: None,
            mega: None,
            bill: None,
            coin: None,
        }
    }
}

pub struct Global {
    pub config: Config,
    alive: CancellationToken,
    pub engine: Arc<Engine>,
    pub inventory: Arc<Inventory>,
    pub display: Option<Arc<TextDisplay>>,
    pub input: Arc<Dispatcher>,
    pub mdb: Option<Arc<Bus>>,
    pub mega: Option<Arc<mega::Client>>,
    pub money: Arc<MoneySystem>,
    pub tele: Arc<dyn Teler>,
    pub lock: Arc<UiLock>,
    ui_alive: RwLock<CancellationToken>,
    reboot: AtomicBool,
}

impl std::fmt::Debug for Global {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Global")
            .field("alive", &!self.alive.is_cancelled())
            .field("engine", &self.engine)
            .field("money", &self.money)
            .finish_non_exhaustive()
    }
}

impl Global {
    /// Wire already opened hardware: engine aliases and profiling,
    /// inventory with its persisted state, money actions, the telemetry
    /// reporter.
    ///
    /// # Errors
    ///
    /// Invalid aliases, stocks, profile regexp or an unusable persist root.
    pub async fn new(
        config: Config,
        hw: Hardware,
        tele: Arc<dyn Teler>,
        alive: CancellationToken,
    ) -> Result<Arc<Self>> {
        let engine = Arc::new(Engine::new());
        for a in &config.engine.alias {
            engine.register_alias(&a.name, &a.scenario)?;
        }
        let profile = &config.engine.profile;
        if !profile.regexp.is_empty() {
            let re = Regex::new(&profile.regexp)
                .map_err(|e| UiError::config(format!("engine.profile.regexp: {e}")))?;
            engine.set_profile(
                Some(re),
                Duration::from_micros(profile.min_us),
                Some(profile_logger(&profile.log_format)),
            );
        }

        let persist = Persist::new(
            &config.persist.root,
            "inventory",
            config.engine.inventory.persist,
        )?;
        let inventory =
            Arc::new(Inventory::init(&config.engine.inventory, &engine)?.with_persist(persist));
        if let Err(e) = inventory.load() {
            error!(error = %e, "inventory load");
            tele.error(&e);
        }

        let money = Arc::new(
            MoneySystem::new(&config.money, hw.bill, hw.coin, Arc::clone(&tele), &alive)
                .with_input(Arc::clone(&hw.input)),
        );
        money.start(&engine).await?;

        let (inv, m) = (Arc::clone(&inventory), Arc::clone(&money));
        tele.set_reporter(Arc::new(move |t: &mut Telemetry| {
            t.inventory = Some(inv.tele());
            t.money_cashbox = Some(m.tele_cashbox());
            t.money_change = Some(m.tele_change());
        }));

        Ok(Arc::new(Self {
            ui_alive: RwLock::new(alive.child_token()),
            config,
            alive,
            engine,
            inventory,
            display: hw.display,
            input: hw.input,
            mdb: hw.mdb,
            mega: hw.mega,
            money,
            tele,
            lock: Arc::new(UiLock::new()),
            reboot: AtomicBool::new(false),
        }))
    }

    /// Open configured hardware and telemetry, then [`Global::new`].
    /// Commands from the telemetry server are served from here on.
    ///
    /// # Errors
    ///
    /// Configuration errors and peripherals that fail to open.
    pub async fn init(config: Config) -> Result<Arc<Self>> {
        config.validate()?;
        let alive = CancellationToken::new();
        let hw = open_hardware(&config.hardware, &config, &alive).await?;
        let client = Tele::from_config(&config.tele, &config.persist.root, &alive)?;
        let tele: Arc<dyn Teler> = match &client {
            Some(t) => Arc::clone(t) as Arc<dyn Teler>,
            None => Arc::new(NoopTele),
        };
        let g = Self::new(config, hw, tele, alive).await?;
        if let Some(t) = client {
            t.serve_commands(Arc::clone(&g));
        }
        Ok(g)
    }

    pub fn alive(&self) -> &CancellationToken {
        &self.alive
    }

    pub fn stop(&self) {
        info!("global stop");
        self.alive.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.alive.is_cancelled()
    }

    /// Stop with a request to reboot the machine afterwards.
    pub fn request_reboot(&self) {
        self.reboot.store(true, Ordering::Release);
        self.stop();
    }

    pub fn reboot_requested(&self) -> bool {
        self.reboot.load(Ordering::Acquire)
    }

    /// Token of the running UI loop.
    pub fn ui_alive(&self) -> CancellationToken {
        self.ui_alive
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Fresh UI token, replacing and cancelling the previous one.
    pub(crate) fn ui_renew(&self) -> CancellationToken {
        let token = self.alive.child_token();
        let old = std::mem::replace(
            &mut *self.ui_alive.write().unwrap_or_else(PoisonError::into_inner),
            token.clone(),
        );
        old.cancel();
        token
    }

    /// End the UI loop without stopping the process.
    pub fn ui_stop(&self) {
        self.ui_alive().cancel();
    }

    /// Run `task` under the UI lock unless `priority` is
    /// [`Priority::Now`].
    ///
    /// # Errors
    ///
    /// [`UiError::Interrupted`] when stopped while waiting for the lock,
    /// otherwise whatever `task` returns.
    pub async fn schedule<F, Fut, T>(&self, priority: Priority, task: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if priority == Priority::Now {
            return task().await;
        }
        if !self.lock.lock_wait(priority, &self.alive).await {
            return Err(UiError::Interrupted);
        }
        let result = task().await;
        self.lock.lock_decrement_wait();
        result
    }

    /// Flush state and release devices.
    pub async fn close(&self) {
        self.stop();
        self.money.stop().await;
        if let Err(e) = self.inventory.store() {
            error!(error = %e, "inventory store on close");
        }
        self.input.shutdown().await;
        if let Some(d) = &self.display {
            d.close();
        }
        self.tele.close();
        if let Some(m) = &self.mega {
            m.close();
        }
        info!("global closed");
    }

    async fn remote_lock(&self, priority: Priority, duration: Duration) -> Result<()> {
        if !self.lock.lock_wait(priority, &self.alive).await {
            return Err(UiError::Interrupted);
        }
        let lock = Arc::clone(&self.lock);
        let alive = self.alive.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = alive.cancelled() => {}
                _ = tokio::time::sleep(duration) => {}
            }
            lock.lock_decrement_wait();
            debug!("remote lock released");
        });
        Ok(())
    }

    async fn remote_exec(&self, scenario: &str, lock: bool, priority: Priority) -> Result<()> {
        let d = self.engine.parse_text("tele-exec", scenario)?;
        let priority = if lock { priority } else { Priority::Now };
        self.schedule(priority, || async {
            self.engine
                .exec(&ExecEnv::new(), &d)
                .await
                .map_err(UiError::from)
        })
        .await
    }

    fn stop_after(&self, timeout: Duration) {
        let alive = self.alive.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = alive.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    info!(timeout_sec = timeout.as_secs(), "remote stop");
                    alive.cancel();
                }
            }
        });
    }
}

impl CommandHandler for Global {
    async fn handle(&self, command: &Command) -> std::result::Result<(), String> {
        let result = match &command.task {
            CommandTask::Lock { duration_sec } => {
                self.remote_lock(command.priority, Duration::from_secs(u64::from(*duration_sec)))
                    .await
            }
            CommandTask::Exec { scenario, lock } => {
                self.remote_exec(scenario, *lock, command.priority).await
            }
            CommandTask::SetInventory { new } => self
                .inventory
                .set_tele(new)
                .and_then(|()| self.inventory.store())
                .map_err(UiError::from),
            CommandTask::Stop { timeout_sec } => {
                self.stop_after(Duration::from_secs(u64::from(*timeout_sec)));
                Ok(())
            }
            CommandTask::SetGiftCredit { amount } => {
                self.money.set_gift_credit((*amount).into());
                Ok(())
            }
            CommandTask::Abort => self.money.abort().await,
            CommandTask::Ping | CommandTask::Report => Ok(()),
        };
        result.map_err(|e| e.to_string())
    }
}

fn profile_logger(format: &str) -> ProfileFn {
    let format = format.to_string();
    Arc::new(move |name, elapsed| {
        if format.is_empty() {
            info!(action = name, elapsed_us = elapsed.as_micros() as u64, "profile");
        } else {
            let line = format
                .replace("{action}", name)
                .replace("{elapsed}", &format!("{elapsed:?}"));
            info!("{line}");
        }
    })
}

/// Open the coprocessor link configured in `hardware.mega`.
///
/// # Errors
///
/// SPI or notify pin open failures and a failed handshake.
pub async fn open_mega(
    hw: &HardwareConfig,
    alive: &CancellationToken,
) -> Result<Arc<mega::Client>> {
    let spi = SpidevBus::open(&hw.mega.spi, hw.mega.spi_speed)?;
    let pin = SysfsPin::open(&hw.mega.pin)?;
    let client = mega::Client::open(spi, pin, mega::ClientConfig::default(), alive).await?;
    info!(spi = %hw.mega.spi, "mega open");
    Ok(client)
}

/// Open the MDB bus with the configured UART driver. The `mega` driver
/// needs an already open coprocessor client.
///
/// # Errors
///
/// [`UiError::Config`] for an unknown driver, or the driver's open error.
pub async fn open_mdb(hw: &HardwareConfig, mega: Option<&Arc<mega::Client>>) -> Result<Arc<Bus>> {
    let uart = match hw.mdb.uart_driver.as_str() {
        "file" | "" => UartDriver::File(mdb::FileUart::new()),
        "helper" => UartDriver::Helper(mdb::HelperUart::new(hw.mdb.helper_path.clone())),
        "mega" => match mega {
            Some(c) => UartDriver::Mega(mdb::MegaUart::new(Arc::clone(c))),
            None => return Err(UiError::config("mdb.uart_driver=mega without mega")),
        },
        other => {
            return Err(UiError::config(format!("mdb.uart_driver={other} unknown")));
        }
    };
    let bus = Arc::new(Bus::open(uart, &hw.mdb.uart_device).await?);
    bus.set_debug(hw.mdb.log_debug);
    Ok(bus)
}

async fn open_hardware(
    hw: &HardwareConfig,
    config: &Config,
    alive: &CancellationToken,
) -> Result<Hardware> {
    let mut out = Hardware::empty(alive);

    let mdb_on_mega = hw.mdb.uart_driver == "mega";
    if hw.keyboard.enable || mdb_on_mega {
        out.mega = Some(open_mega(hw, alive).await?);
    }

    if hw.mdb.bill.enable || hw.mdb.coin.enable {
        let bus = open_mdb(hw, out.mega.as_ref()).await?;
        if hw.mdb.coin.enable {
            let coin = CoinAcceptor::new(
                Arc::clone(&bus),
                mdb::coin::CoinConfig {
                    dispense_timeout: Duration::from_secs(hw.mdb.coin.dispense_timeout_sec),
                    change_over_compensate: config
                        .money
                        .scaled(config.money.change_over_compensate),
                    ..Default::default()
                },
            );
            out.coin = Some(Devicer::Coin(Arc::new(coin)));
        }
        if hw.mdb.bill.enable {
            let bill = BillValidator::new(
                Arc::clone(&bus),
                mdb::bill::BillConfig {
                    scaling_factor: hw.mdb.bill.scaling_factor,
                    ..Default::default()
                },
            );
            out.bill = Some(Devicer::Bill(Arc::new(bill)));
        }
        out.mdb = Some(bus);
    }

    if hw.display.enable {
        let display = Arc::new(TextDisplay::new(
            Box::new(LogDisplay::default()),
            &TextDisplayConfig {
                width: hw.display.width as usize,
                codepage: Codepage::parse(&hw.display.codepage)?,
                scroll_delay: Duration::from_millis(hw.display.scroll_delay_ms),
            },
        )?);
        let d = Arc::clone(&display);
        tokio::spawn(async move { d.run().await });
        out.display = Some(display);
    }

    if hw.keyboard.enable
        && let Some(client) = &out.mega
    {
        out.input
            .add_source(AnySource::Evend(EvendKeyboard::new(Arc::clone(client))?));
    }
    if !hw.input.dev_input_event_device.is_empty() {
        match DevInputEventSource::open(&hw.input.dev_input_event_device).await {
            Ok(src) => out.input.add_source(AnySource::DevInput(src)),
            Err(e) => warn!(
                device = %hw.input.dev_input_event_device,
                error = %e,
                "service button input unavailable"
            ),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vender_core::Amount;
    use vender_core::config::{AliasConfig, StockConfig};
    use vender_network::{MockTransport, TeleOptions};
    use vender_protocol::tele::{Inventory as TeleInventory, StockItem};
    use vender_storage::Queue;

    async fn global() -> Arc<Global> {
        let mut config = Config::default();
        config.engine.alias.push(AliasConfig {
            name: "noop".to_string(),
            scenario: "sleep(1ms)".to_string(),
        });
        config.engine.inventory.stock.push(StockConfig {
            name: "water".to_string(),
            code: 1,
            ..StockConfig::default()
        });
        config.money.scale = 100;
        let alive = CancellationToken::new();
        Global::new(config, Hardware::empty(&alive), Arc::new(NoopTele), alive)
            .await
            .unwrap()
    }

    fn command(task: CommandTask) -> Command {
        Command {
            id: 1,
            task,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_schedule_now_runs_unlocked() {
        let g = global().await;
        let v = g.schedule(Priority::Now, || async { Ok(7) }).await.unwrap();
        assert_eq!(v, 7);
        assert!(!g.lock.locked());
    }

    #[tokio::test]
    async fn test_schedule_stopped_is_interrupted() {
        let g = global().await;
        g.stop();
        let r = g.schedule(Priority::IdleUser, || async { Ok(()) }).await;
        assert!(matches!(r, Err(UiError::Interrupted)));
    }

    #[tokio::test]
    async fn test_commands() {
        let g = global().await;
        g.handle(&command(CommandTask::SetGiftCredit { amount: 300 }))
            .await
            .unwrap();
        assert_eq!(g.money.credit(), Amount(300));

        g.handle(&command(CommandTask::Exec {
            scenario: "noop money.abort".to_string(),
            lock: false,
        }))
        .await
        .unwrap();
        assert_eq!(g.money.credit(), Amount::ZERO);

        let err = g
            .handle(&command(CommandTask::Exec {
                scenario: "missing".to_string(),
                lock: false,
            }))
            .await
            .unwrap_err();
        assert!(err.contains("missing"), "{err}");

        g.handle(&command(CommandTask::SetInventory {
            new: TeleInventory {
                stocks: vec![StockItem {
                    code: 1,
                    valuef: 42.0,
                    ..Default::default()
                }],
            },
        }))
        .await
        .unwrap();
        assert_eq!(g.inventory.must_get("water").unwrap().value(), 42.0);
    }

    #[tokio::test]
    async fn test_remote_stop_after_timeout() {
        let g = global().await;
        g.handle(&command(CommandTask::Stop { timeout_sec: 0 }))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), g.alive().cancelled())
            .await
            .unwrap();
        assert!(g.is_stopped());
    }

    #[tokio::test]
    async fn test_reporter_fills_report() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, handle, commands) = MockTransport::new();
        handle.set_online(true);
        let stop = CancellationToken::new();
        let tele = Tele::start(
            TeleOptions {
                vm_id: 9,
                state_interval: Duration::from_secs(60),
                log_debug: false,
            },
            Queue::open(dir.path().join("queue")).unwrap(),
            vender_network::TransportDriver::Mock(transport),
            commands,
            stop.clone(),
        );
        let alive = CancellationToken::new();
        let mut config = Config::default();
        config.engine.inventory.stock.push(StockConfig {
            name: "water".to_string(),
            code: 1,
            ..StockConfig::default()
        });
        let g = Global::new(config, Hardware::empty(&alive), tele.clone(), alive)
            .await
            .unwrap();
        g.inventory.must_get("water").unwrap().set(5.0);
        g.tele.report(true).unwrap();
        let mut report = None;
        for _ in 0..100 {
            report = handle.telemetry().into_iter().find(|t| t.at_service);
            if report.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let t = report.unwrap();
        assert_eq!(t.inventory.as_ref().unwrap().stocks[0].valuef, 5.0);
        assert!(t.money_cashbox.is_some());
        stop.cancel();
    }
}
