//! Customer credit and change.
//!
//! ```text
//!  bill ──poll──┐                        ┌──> MoneyEvent (UI, subscribers)
//!               ├─ accept_credit ─ Credit┤
//!  coin ──poll──┘                        └──> tele stat (rejects, slugs)
//!
//!  withdraw_prepare(price) ─> change payout (background, serialized)
//!  withdraw_commit(price)  ─> credit zeroed
//!  abort()                 ─> everything returned
//! ```
//!
//! `dirty` is cash inserted but not yet committed to a sale. Gift credit
//! is granted remotely and is never paid out as change.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use vender_core::config::MoneyConfig;
use vender_core::{Amount, NominalGroup};
use vender_engine::{Arg, Doer, Engine, EngineError};
use vender_hardware::input::{Dispatcher, InputEvent};
use vender_hardware::mdb::device::PollDelay;
use vender_hardware::money::{Devicer, MoneyFault, PollItem, PollStatus};
use vender_network::Teler;
use vender_protocol::tele;

use crate::error::{Result, UiError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoneyEvent {
    /// Cash accepted.
    Credit(Amount),
    /// Gift credit set remotely.
    Gift(Amount),
}

pub type MoneySubscriber = Arc<dyn Fn(&MoneyEvent) + Send + Sync>;

#[derive(Debug, Default)]
struct Credit {
    dirty: Amount,
    bill_credit: Amount,
    coin_credit: Amount,
    /// Bill held in escrow, counted as credit until stacked or returned.
    escrow: Amount,
    gift: Amount,
    bill_cashbox: NominalGroup,
    coin_cashbox: NominalGroup,
}

impl Credit {
    fn cash(&self) -> Amount {
        self.dirty + self.escrow
    }

    fn total(&self) -> Amount {
        self.cash() + self.gift
    }

    fn zero(&mut self) {
        self.dirty = Amount::ZERO;
        self.bill_credit = Amount::ZERO;
        self.coin_credit = Amount::ZERO;
        self.escrow = Amount::ZERO;
        self.gift = Amount::ZERO;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Bill,
    Coin,
}

pub struct MoneySystem {
    config: MoneyConfig,
    credit_max: Amount,
    bill: Option<Devicer>,
    coin: Option<Devicer>,
    input: Option<Arc<Dispatcher>>,
    tele: Arc<dyn Teler>,
    state: Mutex<Credit>,
    payout: Arc<tokio::sync::Mutex<()>>,
    subscribers: Mutex<Vec<MoneySubscriber>>,
    alive: CancellationToken,
}

impl std::fmt::Debug for MoneySystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoneySystem")
            .field("credit", &self.credit())
            .field("bill", &self.bill.as_ref().map(Devicer::name))
            .field("coin", &self.coin.as_ref().map(Devicer::name))
            .finish_non_exhaustive()
    }
}

impl MoneySystem {
    pub fn new(
        config: &MoneyConfig,
        bill: Option<Devicer>,
        coin: Option<Devicer>,
        tele: Arc<dyn Teler>,
        alive: &CancellationToken,
    ) -> Self {
        Self {
            credit_max: config.scaled(config.credit_max),
            config: config.clone(),
            bill,
            coin,
            input: None,
            tele,
            state: Mutex::new(Credit::default()),
            payout: Arc::new(tokio::sync::Mutex::new(())),
            subscribers: Mutex::new(Vec::new()),
            alive: alive.child_token(),
        }
    }

    /// Coin return lever presses are emitted here as money-abort input.
    #[must_use]
    pub fn with_input(mut self, input: Arc<Dispatcher>) -> Self {
        self.input = Some(input);
        self
    }

    /// Initialize devices and register the `money.*` actions.
    ///
    /// A device that fails to initialize is reported and left in place;
    /// its next poll retries.
    ///
    /// # Errors
    ///
    /// Action registration conflicts.
    pub async fn start(self: &Arc<Self>, engine: &Engine) -> Result<()> {
        for dev in self.devices() {
            if let Err(e) = dev.init().await {
                error!(device = dev.name(), error = %e, "money device init failed");
                self.tele.error(&e);
            }
        }
        {
            let mut st = self.lock();
            if let Some(bill) = &self.bill {
                st.bill_cashbox.set_valid(&bill.supported_nominals());
            }
            if let Some(coin) = &self.coin {
                st.coin_cashbox.set_valid(&coin.supported_nominals());
            }
        }
        self.register(engine)?;
        info!(
            bill = self.bill.is_some(),
            coin = self.coin.is_some(),
            credit_max = %self.credit_max,
            "money started"
        );
        Ok(())
    }

    /// Return credit and disable acceptors.
    pub async fn stop(&self) {
        if let Err(e) = self.abort().await {
            error!(error = %e, "money stop abort");
        }
        self.set_accept_max(Amount::ZERO, Amount::ZERO).await;
        self.alive.cancel();
    }

    fn devices(&self) -> impl Iterator<Item = &Devicer> {
        self.bill.iter().chain(self.coin.iter())
    }

    fn lock(&self) -> MutexGuard<'_, Credit> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn credit(&self) -> Amount {
        self.lock().total()
    }

    pub fn bill_credit(&self) -> Amount {
        self.lock().bill_credit
    }

    pub fn coin_credit(&self) -> Amount {
        self.lock().coin_credit
    }

    pub fn gift_credit(&self) -> Amount {
        self.lock().gift
    }

    pub fn set_gift_credit(&self, amount: Amount) {
        self.lock().gift = amount;
        info!(%amount, "gift credit set");
        self.fire(&MoneyEvent::Gift(amount));
    }

    pub fn event_subscribe(&self, f: impl Fn(&MoneyEvent) + Send + Sync + 'static) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(f));
    }

    pub fn event_fire(&self, event: &MoneyEvent) {
        self.fire(event);
    }

    fn fire(&self, event: &MoneyEvent) {
        let subs = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for f in subs {
            f(event);
        }
    }

    /// Enable acceptors up to the given amounts; zero disables.
    pub async fn set_accept_max(&self, bill: Amount, coin: Amount) {
        for (dev, max) in [(&self.bill, bill), (&self.coin, coin)] {
            if let Some(dev) = dev
                && let Err(e) = dev.accept_max(max).await
            {
                warn!(device = dev.name(), %max, error = %e, "accept max failed");
            }
        }
    }

    /// Accept money until `stop` fires or one credit arrives. Acceptors are
    /// limited to the room left under `money.credit_max` and to
    /// `max_price`; with enough credit for anything on the menu nothing is
    /// accepted. Acceptors are disabled on return.
    pub async fn accept_credit(
        &self,
        max_price: Amount,
        stop: &CancellationToken,
        events: Option<mpsc::Sender<MoneyEvent>>,
    ) -> Result<()> {
        let limit = {
            let st = self.lock();
            let available = st.cash();
            if available >= max_price {
                Amount::ZERO
            } else if self.credit_max == Amount::ZERO {
                max_price
            } else {
                self.credit_max.saturating_sub(available).min(max_price)
            }
        };
        debug!(%max_price, %limit, "accept credit");
        if limit == Amount::ZERO {
            self.set_accept_max(Amount::ZERO, Amount::ZERO).await;
            return Ok(());
        }
        self.set_accept_max(limit, limit).await;

        let done = stop.child_token();
        let bill = async {
            if let Some(dev) = &self.bill {
                self.poll_loop(dev, Role::Bill, limit, &done, events.as_ref())
                    .await;
            }
        };
        let coin = async {
            if let Some(dev) = &self.coin {
                self.poll_loop(dev, Role::Coin, limit, &done, events.as_ref())
                    .await;
            }
        };
        tokio::join!(bill, coin);
        self.set_accept_max(Amount::ZERO, Amount::ZERO).await;
        Ok(())
    }

    async fn poll_loop(
        &self,
        dev: &Devicer,
        role: Role,
        limit: Amount,
        done: &CancellationToken,
        events: Option<&mpsc::Sender<MoneyEvent>>,
    ) {
        let delays = dev.delays();
        let mut pacing = PollDelay::default();
        loop {
            if done.is_cancelled() || self.alive.is_cancelled() {
                return;
            }
            let r = dev.poll().await;
            if let Some(e) = &r.error {
                warn!(device = dev.name(), error = %e, "money poll");
            }
            for item in &r.items {
                let credited = match role {
                    Role::Bill => self.handle_bill(dev, item, limit).await,
                    Role::Coin => self.handle_coin(dev, item).await,
                };
                if let Some(amount) = credited {
                    let event = MoneyEvent::Credit(amount);
                    self.fire(&event);
                    if let Some(tx) = events {
                        tokio::select! {
                            _ = done.cancelled() => {}
                            _ = tx.send(event) => {}
                        }
                    }
                    done.cancel();
                }
            }
            if !pacing
                .delay(&delays, !r.items.is_empty(), r.error.is_some(), done)
                .await
            {
                return;
            }
        }
    }

    async fn handle_bill(&self, dev: &Devicer, item: &PollItem, limit: Amount) -> Option<Amount> {
        match item.status {
            PollStatus::Escrow => {
                let amount = item.amount();
                if amount > limit {
                    info!(%amount, %limit, "bill escrow over limit, rejecting");
                    self.tele.stat_modify(&mut |s| s.bill_escrow_rejected += 1);
                    if let Err(e) = dev.escrow_reject().await {
                        warn!(error = %e, "bill escrow reject");
                    }
                    return None;
                }
                self.lock().escrow = amount;
                if let Err(e) = dev.escrow_accept().await {
                    warn!(error = %e, "bill escrow accept");
                    self.lock().escrow = Amount::ZERO;
                }
                None
            }
            PollStatus::Credit => {
                let amount = item.amount();
                let mut st = self.lock();
                st.escrow = Amount::ZERO;
                if item.cashbox
                    && let Err(e) = st.bill_cashbox.add(item.nominal, u32::from(item.count.max(1)))
                {
                    warn!(error = %e, "bill cashbox");
                }
                st.bill_credit += amount;
                st.dirty += amount;
                info!(%amount, dirty = %st.dirty, "bill credit");
                Some(amount)
            }
            PollStatus::Rejected => {
                let n = item.nominal.0;
                self.tele
                    .stat_modify(&mut |s| *s.bill_rejected.entry(n).or_default() += 1);
                None
            }
            PollStatus::Error | PollStatus::Fatal => {
                warn!(device = dev.name(), item = %item, "bill fault");
                None
            }
            _ => {
                trace!(item = %item, "bill poll");
                None
            }
        }
    }

    async fn handle_coin(&self, dev: &Devicer, item: &PollItem) -> Option<Amount> {
        match item.status {
            PollStatus::Dispensed => {
                self.refresh_tubes(dev).await;
                None
            }
            PollStatus::ReturnRequest => {
                if let Some(input) = &self.input {
                    input.emit(InputEvent::money_abort()).await;
                }
                None
            }
            PollStatus::Rejected => {
                let (n, c) = (item.nominal.0, u32::from(item.count.max(1)));
                self.tele
                    .stat_modify(&mut |s| *s.coin_rejected.entry(n).or_default() += c);
                None
            }
            PollStatus::Credit => {
                let amount = item.amount();
                {
                    let mut st = self.lock();
                    if item.cashbox
                        && let Err(e) =
                            st.coin_cashbox.add(item.nominal, u32::from(item.count.max(1)))
                    {
                        warn!(error = %e, "coin cashbox");
                    }
                    st.coin_credit += amount;
                    st.dirty += amount;
                    info!(%amount, dirty = %st.dirty, "coin credit");
                }
                self.refresh_tubes(dev).await;
                Some(amount)
            }
            PollStatus::Error | PollStatus::Fatal => {
                if item.error == Some(MoneyFault::Slugs) {
                    self.tele.stat_modify(&mut |s| s.coin_slug += 1);
                }
                warn!(device = dev.name(), item = %item, "coin fault");
                None
            }
            _ => {
                trace!(item = %item, "coin poll");
                None
            }
        }
    }

    async fn refresh_tubes(&self, dev: &Devicer) {
        if let Err(e) = dev.refresh_tubes().await {
            warn!(error = %e, "coin tube status");
        }
    }

    /// Check credit for a sale of `amount` and pay the change in the
    /// background. Later payouts, commits and aborts wait for it.
    ///
    /// # Errors
    ///
    /// [`UiError::NeedMoreMoney`] when credit is below `amount`.
    pub async fn withdraw_prepare(self: &Arc<Self>, amount: Amount) -> Result<()> {
        let guard = Arc::clone(&self.payout).lock_owned().await;
        let change = {
            let st = self.lock();
            let credit = st.total();
            if credit < amount {
                return Err(UiError::NeedMoreMoney {
                    need: amount,
                    credit,
                });
            }
            st.cash().saturating_sub(amount)
        };
        debug!(%amount, %change, "withdraw prepare");
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            if change > Amount::ZERO
                && let Err(e) = this.payout_locked(change).await
            {
                error!(error = %e, "change payout");
                this.tele.error(&e);
            }
            let escrow = this.lock().escrow;
            if escrow > Amount::ZERO {
                if let Some(bill) = &this.bill
                    && let Err(e) = bill.escrow_accept().await
                {
                    warn!(error = %e, "bill escrow accept");
                }
                let mut st = this.lock();
                st.escrow = Amount::ZERO;
                st.dirty += escrow;
                st.bill_credit += escrow;
            }
            let st = this.lock();
            if st.dirty > amount {
                error!(dirty = %st.dirty, %amount, "CRITICAL change payout left unaccounted cash");
            }
        });
        Ok(())
    }

    /// Finish a sale: all credit is consumed.
    pub async fn withdraw_commit(&self, amount: Amount) -> Result<()> {
        let _guard = self.payout.lock().await;
        let mut st = self.lock();
        if st.dirty > amount || st.dirty + st.gift < amount {
            error!(dirty = %st.dirty, gift = %st.gift, %amount, "CRITICAL withdraw commit mismatch");
        }
        info!(%amount, "withdraw commit");
        st.zero();
        Ok(())
    }

    /// Return all cash credit and forget the gift.
    ///
    /// # Errors
    ///
    /// [`UiError::Debt`] when not everything could be returned; the
    /// remaining credit is kept then.
    pub async fn abort(&self) -> Result<()> {
        let _guard = self.payout.lock().await;
        let cash = self.lock().cash();
        info!(%cash, "money abort");
        if let Err(e) = self.payout_locked(cash).await {
            self.tele.error(&e);
            return Err(e);
        }
        self.lock().zero();
        Ok(())
    }

    /// Return `amount` from escrow and coin tubes. Caller holds `payout`.
    async fn payout_locked(&self, mut amount: Amount) -> Result<()> {
        let escrow = self.lock().escrow;
        if escrow > Amount::ZERO
            && escrow <= amount
            && let Some(bill) = &self.bill
        {
            bill.escrow_reject().await?;
            self.lock().escrow = Amount::ZERO;
            amount -= escrow;
        }
        if amount == Amount::ZERO {
            return Ok(());
        }
        let Some(coin) = &self.coin else {
            return Err(UiError::debt(amount, None));
        };
        let (dispensed, cause) = match coin.give(amount, true).await {
            Ok(g) => (g.total(), None),
            Err(e) => (Amount::ZERO, Some(e)),
        };
        self.refresh_tubes(coin).await;
        {
            let mut st = self.lock();
            st.dirty = st.dirty.saturating_sub(dispensed.min(amount));
        }
        info!(%amount, %dispensed, "payout");
        if dispensed < amount {
            return Err(UiError::debt(amount - dispensed, cause));
        }
        Ok(())
    }

    pub fn cashbox_zero(&self) {
        let mut st = self.lock();
        st.bill_cashbox.clear();
        st.coin_cashbox.clear();
        info!("cashbox zeroed");
    }

    pub fn tele_cashbox(&self) -> tele::Money {
        let st = self.lock();
        tele::Money {
            total_bills: st.bill_cashbox.total().0,
            total_coins: st.coin_cashbox.total().0,
            bills: counts(&st.bill_cashbox),
            coins: counts(&st.coin_cashbox),
        }
    }

    /// Coins available for change, as last read from the tubes.
    pub fn tele_change(&self) -> tele::Money {
        let tubes = self.coin.as_ref().map(Devicer::tubes).unwrap_or_default();
        tele::Money {
            total_coins: tubes.total().0,
            coins: counts(&tubes),
            ..tele::Money::default()
        }
    }

    fn scaled(&self, action: &str, arg: Arg) -> vender_engine::Result<Amount> {
        u32::try_from(arg)
            .map(|v| self.config.scaled(v))
            .map_err(|_| EngineError::config(format!("{action}: negative amount {arg}")))
    }

    fn register(self: &Arc<Self>, engine: &Engine) -> Result<()> {
        let m = Arc::clone(self);
        engine.register(
            "money.cashbox_zero",
            Doer::func("money.cashbox_zero", move |_| {
                m.cashbox_zero();
                async { Ok(()) }
            }),
        )?;

        let m = Arc::clone(self);
        engine.register(
            "money.consume!",
            Doer::func("money.consume!", move |_| {
                let m = Arc::clone(&m);
                async move {
                    let credit = m.credit();
                    m.withdraw_commit(credit)
                        .await
                        .map_err(|e| EngineError::action("money.consume!", e))
                }
            }),
        )?;

        let m = Arc::clone(self);
        engine.register(
            "money.commit",
            Doer::func("money.commit", move |env| {
                let m = Arc::clone(&m);
                async move {
                    m.withdraw_commit(env.price)
                        .await
                        .map_err(|e| EngineError::action("money.commit", e))
                }
            }),
        )?;

        let m = Arc::clone(self);
        engine.register(
            "money.abort",
            Doer::func("money.abort", move |_| {
                let m = Arc::clone(&m);
                async move {
                    m.abort()
                        .await
                        .map_err(|e| EngineError::action("money.abort", e))
                }
            }),
        )?;

        let m = Arc::clone(self);
        engine.register(
            "money.accept(?)",
            Doer::func_arg("money.accept(?)", move |_, arg| {
                let m = Arc::clone(&m);
                async move {
                    let max = m.scaled("money.accept", arg)?;
                    let stop = m.alive.child_token();
                    m.accept_credit(max, &stop, None)
                        .await
                        .map_err(|e| EngineError::action("money.accept", e))
                }
            }),
        )?;

        for name in ["money.give(?)", "money.dispense(?)"] {
            let m = Arc::clone(self);
            engine.register(
                name,
                Doer::func_arg(name, move |_, arg| {
                    let m = Arc::clone(&m);
                    async move {
                        let amount = m.scaled(name, arg)?;
                        let coin = m.coin.as_ref().ok_or_else(|| {
                            EngineError::config(format!("{name}: no coin acceptor"))
                        })?;
                        let _guard = m.payout.lock().await;
                        let given = coin
                            .give(amount, false)
                            .await
                            .map_err(|e| EngineError::action(name, e))?;
                        info!(%amount, dispensed = %given.total(), "{name}");
                        m.refresh_tubes(coin).await;
                        Ok(())
                    }
                }),
            )?;
        }

        let m = Arc::clone(self);
        engine.register(
            "money.set_gift_credit(?)",
            Doer::func_arg("money.set_gift_credit(?)", move |_, arg| {
                let m = Arc::clone(&m);
                async move {
                    m.set_gift_credit(m.scaled("money.set_gift_credit", arg)?);
                    Ok(())
                }
            }),
        )?;
        Ok(())
    }
}

fn counts(g: &NominalGroup) -> BTreeMap<u32, u32> {
    g.iter()
        .filter(|(_, c)| *c > 0)
        .map(|(n, c)| (n.0, c))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;
    use std::time::Duration;
    use vender_core::Nominal;
    use vender_engine::ExecEnv;
    use vender_hardware::money::{MockMoneyDevice, MockMoneyHandle};
    use vender_network::Reporter;
    use vender_protocol::tele::{Command, Stat, State, Transaction};

    #[derive(Default)]
    struct StatTele {
        stat: Mutex<Stat>,
        errors: Mutex<Vec<String>>,
    }

    impl Teler for StatTele {
        fn state(&self, _: State) {}
        fn error(&self, err: &(dyn StdError + 'static)) {
            self.errors.lock().unwrap().push(err.to_string());
        }
        fn stat_modify(&self, f: &mut dyn FnMut(&mut Stat)) {
            f(&mut self.stat.lock().unwrap());
        }
        fn transaction(&self, _: Transaction) {}
        fn report(&self, _: bool) -> vender_network::Result<()> {
            Ok(())
        }
        fn command_reply_err(&self, _: &Command, _: Option<&str>) {}
        fn set_reporter(&self, _: Reporter) {}
        fn close(&self) {}
    }

    const COINS: [Nominal; 3] = [Nominal(100), Nominal(200), Nominal(500)];

    struct Fixture {
        money: Arc<MoneySystem>,
        coin: MockMoneyHandle,
        bill: MockMoneyHandle,
        tele: Arc<StatTele>,
        engine: Engine,
    }

    async fn fixture(config: MoneyConfig) -> Fixture {
        let (coin_dev, coin) = MockMoneyDevice::new("coin", &COINS);
        let (bill_dev, bill) = MockMoneyDevice::new("bill", &[Nominal(1000), Nominal(5000)]);
        let tele = Arc::new(StatTele::default());
        let money = Arc::new(MoneySystem::new(
            &config,
            Some(Devicer::Mock(bill_dev)),
            Some(Devicer::Mock(coin_dev)),
            tele.clone(),
            &CancellationToken::new(),
        ));
        let engine = Engine::new();
        money.start(&engine).await.unwrap();
        Fixture {
            money,
            coin,
            bill,
            tele,
            engine,
        }
    }

    fn coin_credit(n: u32) -> Vec<PollItem> {
        vec![PollItem::money(PollStatus::Credit, Nominal(n), 1)]
    }

    async fn accept(f: &Fixture, max_price: Amount) -> Vec<MoneyEvent> {
        let (tx, mut rx) = mpsc::channel(4);
        let stop = CancellationToken::new();
        tokio::time::timeout(
            Duration::from_secs(5),
            f.money.accept_credit(max_price, &stop, Some(tx)),
        )
        .await
        .unwrap()
        .unwrap();
        let mut got = Vec::new();
        while let Ok(e) = rx.try_recv() {
            got.push(e);
        }
        got
    }

    #[tokio::test]
    async fn test_accept_coin_credit() {
        let f = fixture(MoneyConfig::default()).await;
        f.coin.push_poll(coin_credit(500));
        let events = accept(&f, Amount(700)).await;
        assert_eq!(events, vec![MoneyEvent::Credit(Amount(500))]);
        assert_eq!(f.money.credit(), Amount(500));
        assert_eq!(f.money.coin_credit(), Amount(500));
        assert_eq!(
            f.coin.accept_max_calls(),
            vec![Amount(700), Amount::ZERO]
        );
    }

    #[tokio::test]
    async fn test_accept_limited_by_credit_max() {
        let f = fixture(MoneyConfig {
            scale: 100,
            credit_max: 10,
            ..MoneyConfig::default()
        })
        .await;
        f.coin.push_poll(coin_credit(500));
        accept(&f, Amount(2000)).await;
        f.bill
            .push_poll(vec![PollItem::money(PollStatus::Escrow, Nominal(1000), 1)]);
        let stop = CancellationToken::new();
        let s = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            s.cancel();
        });
        f.money.accept_credit(Amount(2000), &stop, None).await.unwrap();
        assert_eq!(f.bill.accept_max_calls()[2], Amount(500));
        assert_eq!(f.bill.escrow_calls(), vec![false]);
        assert_eq!(f.tele.stat.lock().unwrap().bill_escrow_rejected, 1);
        assert_eq!(f.money.credit(), Amount(500));
    }

    #[tokio::test]
    async fn test_enough_credit_disables_acceptors() {
        let f = fixture(MoneyConfig::default()).await;
        f.coin.push_poll(coin_credit(500));
        accept(&f, Amount(500)).await;
        let events = accept(&f, Amount(500)).await;
        assert!(events.is_empty());
        assert_eq!(f.coin.accept_max_calls().last(), Some(&Amount::ZERO));
    }

    #[tokio::test]
    async fn test_rejects_and_return_lever() {
        let f = fixture(MoneyConfig::default()).await;
        f.coin.push_poll(vec![
            PollItem::money(PollStatus::Rejected, Nominal(200), 2),
            PollItem::fault(PollStatus::Error, MoneyFault::Slugs),
        ]);
        f.coin.push_poll(coin_credit(100));
        accept(&f, Amount(700)).await;
        let stat = f.tele.stat.lock().unwrap().clone();
        assert_eq!(stat.coin_rejected.get(&200), Some(&2));
        assert_eq!(stat.coin_slug, 1);
    }

    #[tokio::test]
    async fn test_withdraw_pays_change() {
        let f = fixture(MoneyConfig::default()).await;
        f.coin.fill_tubes(Nominal(100), 10).unwrap();
        f.coin.push_poll(coin_credit(500));
        accept(&f, Amount(700)).await;

        let err = f.money.withdraw_prepare(Amount(700)).await.unwrap_err();
        assert!(matches!(err, UiError::NeedMoreMoney { .. }));

        f.money.withdraw_prepare(Amount(300)).await.unwrap();
        f.money.withdraw_commit(Amount(300)).await.unwrap();
        assert_eq!(f.coin.given(), vec![Amount(200)]);
        assert_eq!(f.money.credit(), Amount::ZERO);
    }

    #[tokio::test]
    async fn test_abort_returns_cash_or_reports_debt() {
        let f = fixture(MoneyConfig::default()).await;
        f.coin.push_poll(coin_credit(500));
        accept(&f, Amount(700)).await;
        let err = f.money.abort().await.unwrap_err();
        assert!(matches!(err, UiError::Debt { debt: Amount(500), .. }));
        assert_eq!(f.money.credit(), Amount(500));
        assert_eq!(f.tele.errors.lock().unwrap().len(), 1);

        f.coin.fill_tubes(Nominal(500), 1).unwrap();
        f.money.abort().await.unwrap();
        assert_eq!(f.money.credit(), Amount::ZERO);
    }

    #[tokio::test]
    async fn test_gift_credit_action() {
        let f = fixture(MoneyConfig {
            scale: 100,
            ..MoneyConfig::default()
        })
        .await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        f.money
            .event_subscribe(move |e| s.lock().unwrap().push(*e));
        let d = f
            .engine
            .parse_text("test", "money.set_gift_credit(5)")
            .unwrap();
        f.engine.exec(&ExecEnv::new(), &d).await.unwrap();
        assert_eq!(f.money.credit(), Amount(500));
        assert_eq!(f.money.gift_credit(), Amount(500));
        assert_eq!(*seen.lock().unwrap(), vec![MoneyEvent::Gift(Amount(500))]);

        let d = f.engine.parse_text("test", "money.consume!").unwrap();
        f.engine.exec(&ExecEnv::new(), &d).await.unwrap();
        assert_eq!(f.money.credit(), Amount::ZERO);
    }

    #[tokio::test]
    async fn test_cashbox_report() {
        let f = fixture(MoneyConfig::default()).await;
        f.coin
            .push_poll(vec![PollItem::money(PollStatus::Credit, Nominal(200), 1).with_cashbox(true)]);
        accept(&f, Amount(700)).await;
        f.bill
            .push_poll(vec![PollItem::money(PollStatus::Credit, Nominal(1000), 1).with_cashbox(true)]);
        accept(&f, Amount(5000)).await;

        let m = f.money.tele_cashbox();
        assert_eq!((m.total_bills, m.total_coins), (1000, 200));
        assert_eq!(m.coins.get(&200), Some(&1));

        let d = f.engine.parse_text("test", "money.cashbox_zero").unwrap();
        f.engine.exec(&ExecEnv::new(), &d).await.unwrap();
        assert_eq!(f.money.tele_cashbox(), tele::Money::default());
    }
}
