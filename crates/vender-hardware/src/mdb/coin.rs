//! Coin acceptor / changer at MDB address 0x08.
//!
//! | command     | request              | response                    |
//! |-------------|----------------------|-----------------------------|
//! | RESET       | `08`                 | ack                         |
//! | SETUP       | `09`                 | level, currency, scaling .. |
//! | TUBE STATUS | `0a`                 | full(2) counts(16)          |
//! | POLL        | `0b`                 | activity bytes              |
//! | COIN TYPE   | `0c accept dispense` | ack                         |
//! | DISPENSE    | `0d count<<4\|type`  | ack                         |
//! | PAYOUT      | `0f02 scaled`        | ack                         |

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, error, info, warn};
use vender_core::{Amount, ExpendStrategy, Nominal, NominalGroup};

use crate::error::{HardwareError, Result};
use crate::money::{MoneyFault, PollItem, PollResult, PollStatus};

use super::bus::Bus;
use super::device::{Delays, Device, DeviceLock, TxOpt};
use super::packet::Packet;

pub const ADDRESS: u8 = 0x08;
pub const DEVICE_NAME: &str = "mdb.coin";
const TYPE_COUNT: usize = 16;
const SETUP_MIN_LENGTH: usize = 7;

const ROUTE_CASHBOX: u8 = 0;
const ROUTE_TUBES: u8 = 1;
const ROUTE_REJECT: u8 = 3;

#[derive(Debug, Clone)]
pub struct CoinConfig {
    pub dispense_timeout: Duration,
    /// Largest shortfall that may be covered by paying out a bit more.
    pub change_over_compensate: Amount,
    pub delays: Delays,
}

impl Default for CoinConfig {
    fn default() -> Self {
        Self {
            dispense_timeout: Duration::from_secs(5),
            change_over_compensate: Amount::ZERO,
            delays: Delays::default(),
        }
    }
}

#[derive(Debug, Default)]
struct CoinState {
    nominals: [Nominal; TYPE_COUNT],
    scaling: u32,
    feature_level: u8,
    tubes: NominalGroup,
}

#[derive(Debug)]
pub struct CoinAcceptor {
    dev: Device,
    config: CoinConfig,
    state: Mutex<CoinState>,
}

impl CoinAcceptor {
    pub fn new(bus: Arc<Bus>, config: CoinConfig) -> Self {
        Self {
            dev: Device::new(bus, ADDRESS, DEVICE_NAME, config.delays),
            config,
            state: Mutex::new(CoinState {
                scaling: 1,
                ..CoinState::default()
            }),
        }
    }

    pub fn device(&self) -> &Device {
        &self.dev
    }

    fn state(&self) -> MutexGuard<'_, CoinState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// RESET, SETUP, TUBE STATUS, then every coin type disabled for accept.
    pub async fn init(&self) -> Result<()> {
        let setup = self.dev.tx_setup(SETUP_MIN_LENGTH).await?;
        self.parse_setup(setup.bytes())?;
        self.tube_status().await?;
        self.coin_type(0, 0xffff).await?;
        self.dev.set_ready();
        info!(nominals = ?self.supported_nominals(), "coin acceptor ready");
        Ok(())
    }

    fn parse_setup(&self, bs: &[u8]) -> Result<()> {
        if bs.len() < SETUP_MIN_LENGTH {
            return Err(HardwareError::device(DEVICE_NAME, "SETUP too short"));
        }
        let scaling = u32::from(bs[3]);
        let mut st = self.state();
        st.feature_level = bs[0];
        st.scaling = scaling.max(1);
        st.nominals = [Nominal(0); TYPE_COUNT];
        for (i, b) in bs[7..].iter().take(TYPE_COUNT).enumerate() {
            st.nominals[i] = Nominal(u32::from(*b) * scaling);
        }
        let valid: Vec<Nominal> = st.nominals.iter().copied().filter(|n| n.0 > 0).collect();
        st.tubes.set_valid(&valid);
        debug!(
            level = bs[0],
            currency = %format!("{:02x}{:02x}", bs[1], bs[2]),
            scaling,
            decimal_places = bs[4],
            routing = u16::from_be_bytes([bs[5], bs[6]]),
            "coin setup"
        );
        Ok(())
    }

    pub fn supported_nominals(&self) -> Vec<Nominal> {
        self.state()
            .nominals
            .iter()
            .copied()
            .filter(|n| n.0 > 0)
            .collect()
    }

    pub fn tubes(&self) -> NominalGroup {
        self.state().tubes.clone()
    }

    fn type_nominal(&self, t: u8) -> Nominal {
        self.state()
            .nominals
            .get(usize::from(t))
            .copied()
            .unwrap_or_default()
    }

    fn nominal_type(&self, nominal: Nominal) -> Option<u8> {
        self.state()
            .nominals
            .iter()
            .position(|n| *n == nominal && n.0 > 0)
            .map(|i| i as u8)
    }

    pub async fn tube_status(&self) -> Result<()> {
        let lock = self.dev.lock().await;
        self.tube_status_locked(&lock).await
    }

    async fn tube_status_locked(&self, lock: &DeviceLock<'_>) -> Result<()> {
        let response = lock.tx(&packet(&[0x0a]), TxOpt::KNOWN).await?;
        let bs = response.bytes();
        if bs.len() < 2 {
            return Err(HardwareError::device(
                DEVICE_NAME,
                format!("TUBE STATUS response={response} expected>=2"),
            ));
        }
        let full = u16::from_be_bytes([bs[0], bs[1]]);
        let mut st = self.state();
        st.tubes.clear();
        for (i, count) in bs[2..].iter().take(TYPE_COUNT).enumerate() {
            let n = st.nominals[i];
            if n.0 > 0 && *count > 0 {
                st.tubes.add(n, u32::from(*count))?;
            }
        }
        debug!(full = %format!("{full:016b}"), tubes = %st.tubes, "coin tube status");
        Ok(())
    }

    /// COIN TYPE with explicit accept and dispense masks.
    pub async fn coin_type(&self, accept: u16, dispense: u16) -> Result<()> {
        let [a1, a2] = accept.to_be_bytes();
        let [d1, d2] = dispense.to_be_bytes();
        self.dev.tx_known(&packet(&[0x0c, a1, a2, d1, d2])).await?;
        Ok(())
    }

    /// Enable only coin types not above `max`; zero disables accepting.
    pub async fn accept_max(&self, max: Amount) -> Result<()> {
        let mask = self.accept_mask(max);
        debug!(max = %max, mask = %format!("{mask:016b}"), "coin accept");
        self.coin_type(mask, 0xffff).await
    }

    fn accept_mask(&self, max: Amount) -> u16 {
        self.state()
            .nominals
            .iter()
            .enumerate()
            .filter(|(_, n)| n.0 > 0 && Amount::from(**n) <= max)
            .fold(0u16, |mask, (i, _)| mask | (1 << i))
    }

    pub async fn poll(&self) -> PollResult {
        match self.dev.tx_known(self.dev.packet_poll()).await {
            Ok(response) => PollResult {
                items: self.parse_poll(response.bytes()),
                ..PollResult::default()
            },
            Err(e) => PollResult::failed(e),
        }
    }

    pub fn parse_poll(&self, bs: &[u8]) -> Vec<PollItem> {
        let mut items = Vec::with_capacity(bs.len());
        let mut i = 0;
        while i < bs.len() {
            let (item, skip) = self.parse_poll_item(bs[i]);
            items.push(item);
            i += if skip { 2 } else { 1 };
        }
        items
    }

    /// Returns the item and whether the next byte (tube count) belongs to it.
    fn parse_poll_item(&self, b: u8) -> (PollItem, bool) {
        use PollStatus as S;
        let item = match b {
            0x01 => PollItem::status(S::ReturnRequest),
            0x02 | 0x0a => PollItem::status(S::Busy),
            0x03 => PollItem::fault(S::Error, MoneyFault::NoCredit),
            0x04 => PollItem::fault(S::Fatal, MoneyFault::Sensor),
            0x05 => PollItem::fault(S::Info, MoneyFault::DoubleArrival),
            0x06 => PollItem::fault(S::Fatal, MoneyFault::NoStorage),
            0x07 => PollItem::fault(S::Fatal, MoneyFault::Jam),
            0x08 => PollItem::fault(S::Fatal, MoneyFault::RomChecksum),
            0x09 => PollItem::fault(S::Error, MoneyFault::CoinRouting),
            0x0b => PollItem::status(S::WasReset),
            0x0c => PollItem::fault(S::Fatal, MoneyFault::CoinJam),
            0x0d => PollItem::fault(S::Error, MoneyFault::Fraud),
            _ if b & 0x80 != 0 => {
                let count = (b >> 4) & 7;
                let item = PollItem::money(S::Dispensed, self.type_nominal(b & 0xf), count);
                return (item, true);
            }
            _ if b & 0xc0 == 0x40 => {
                let nominal = self.type_nominal(b & 0xf);
                let item = match (b >> 4) & 3 {
                    ROUTE_CASHBOX => PollItem::money(S::Credit, nominal, 1).with_cashbox(true),
                    ROUTE_TUBES => PollItem::money(S::Credit, nominal, 1),
                    ROUTE_REJECT => PollItem::money(S::Rejected, nominal, 1),
                    _ => PollItem::fault(S::Error, MoneyFault::CoinRouting),
                };
                return (item, true);
            }
            _ if b & 0xe0 == 0x20 => PollItem {
                count: b & 0x1f,
                ..PollItem::fault(S::Info, MoneyFault::Slugs)
            },
            _ => {
                error!(byte = %format!("{b:02x}"), "coin poll unknown");
                PollItem::fault(S::Fatal, MoneyFault::Unknown(b))
            }
        };
        (item, false)
    }

    /// DISPENSE `count` coins of `nominal` and verify the tube counts.
    ///
    /// # Errors
    ///
    /// `Unsupported` for an unknown nominal, `NominalCount` when the tube
    /// holds fewer coins, device errors reported while dispensing.
    pub async fn dispense(&self, nominal: Nominal, count: u8) -> Result<()> {
        if count >= 16 {
            return Err(HardwareError::device(
                DEVICE_NAME,
                format!("dispense count={count} overflow"),
            ));
        }
        let coin_type = self.nominal_type(nominal).ok_or_else(|| {
            HardwareError::unsupported(format!("coin dispense nominal={nominal}"))
        })?;
        let lock = self.dev.lock().await;
        self.tube_status_locked(&lock).await?;
        let before = self.state().tubes.get(nominal)?;
        if before < u32::from(count) {
            return Err(vender_core::Error::NominalCount {
                amount: Amount::from(nominal) * u32::from(count),
            }
            .into());
        }

        lock.tx(&packet(&[0x0d, (count << 4) | coin_type]), TxOpt::MAYBE)
            .await?;
        let timeout = self.config.dispense_timeout * u32::from(count);
        lock.poll_loop("coin dispense", self.dev.packet_poll(), timeout, |p| {
            let Some(&b) = p.bytes().first() else {
                return Ok(true);
            };
            let (item, _) = self.parse_poll_item(b);
            match item.status {
                PollStatus::Busy => Ok(false),
                PollStatus::Dispensed => Ok(true),
                _ => Err(HardwareError::device(
                    DEVICE_NAME,
                    format!("dispense poll {item}"),
                )),
            }
        })
        .await?;

        self.tube_status_locked(&lock).await?;
        let after = self.state().tubes.get(nominal)?;
        let diff = i64::from(before) - i64::from(after);
        if diff != i64::from(count) {
            return Err(HardwareError::device(
                DEVICE_NAME,
                format!("dispense nominal={nominal} requested={count} diff={diff}"),
            ));
        }
        Ok(())
    }

    /// PAYOUT through the changer's own algorithm, adding paid coins to
    /// `success`.
    pub async fn payout(&self, amount: Amount, success: &mut NominalGroup) -> Result<()> {
        let scaled = amount.0 / self.state().scaling;
        let arg = u8::try_from(scaled).map_err(|_| {
            HardwareError::device(DEVICE_NAME, format!("payout amount={amount} too large"))
        })?;
        let lock = self.dev.lock().await;
        lock.tx(&packet(&[0x0f, 0x02, arg]), TxOpt::MAYBE).await?;
        tokio::time::sleep(self.dev.delays().next).await;
        lock.poll_loop(
            "coin payout",
            &packet(&[0x0f, 0x04]),
            self.config.dispense_timeout * 4,
            |p| Ok(p.is_empty()),
        )
        .await?;
        let status = lock.tx(&packet(&[0x0f, 0x03]), TxOpt::MAYBE).await?;
        let nominals = self.state().nominals;
        for (i, count) in status.bytes().iter().enumerate().take(TYPE_COUNT) {
            if *count > 0 {
                success.add(nominals[i], u32::from(*count))?;
            }
        }
        Ok(())
    }

    /// Give change: exact coins from the tubes first, changer payout for
    /// the rest, then optionally a little over.
    ///
    /// # Errors
    ///
    /// `NominalCount` when the amount cannot be given; device errors.
    pub async fn give(&self, amount: Amount, over: bool) -> Result<NominalGroup> {
        let mut success = NominalGroup::with_valid(&self.supported_nominals());
        if amount == Amount::ZERO {
            return Ok(success);
        }

        self.give_smart(amount, &mut success).await?;
        let mut left = amount.saturating_sub(success.total());
        if left > Amount::ZERO {
            warn!(left = %left, "coin give fallback to payout");
            self.payout(left, &mut success).await?;
            left = amount.saturating_sub(success.total());
        }
        if left == Amount::ZERO {
            return Ok(success);
        }

        error!(given = %success.total(), requested = %amount, "coin give short");
        if !over || left > self.config.change_over_compensate {
            return Err(vender_core::Error::NominalCount { amount: left }.into());
        }
        self.give_least_over(left, &mut success).await?;
        Ok(success)
    }

    async fn give_smart(&self, amount: Amount, success: &mut NominalGroup) -> Result<()> {
        self.tube_status().await?;
        let mut tubes = self.tubes();
        if tubes.total() < amount {
            warn!(amount = %amount, tubes = %tubes, "not enough coins in tubes");
            return Ok(());
        }
        let mut plan = NominalGroup::with_valid(&self.supported_nominals());
        if let Err(e) = tubes.withdraw(Some(&mut plan), amount, &ExpendStrategy::LeastCount) {
            warn!(amount = %amount, error = %e, "no exact coin combination");
            return Ok(());
        }
        for (nominal, mut count) in plan.iter().collect::<Vec<_>>() {
            while count > 0 {
                let batch = count.min(15) as u8;
                self.dispense(nominal, batch).await?;
                success.add(nominal, u32::from(batch))?;
                count -= u32::from(batch);
            }
        }
        Ok(())
    }

    async fn give_least_over(&self, amount: Amount, success: &mut NominalGroup) -> Result<()> {
        let mut nominals = self.supported_nominals();
        nominals.sort();
        let mut left = amount;
        for nominal in nominals {
            let n = Amount::from(nominal);
            let rounded = Amount(left.0.div_ceil(n.0) * n.0);
            let mut paid = NominalGroup::with_valid(&self.supported_nominals());
            self.payout(rounded, &mut paid).await?;
            success.add_from(&paid)?;
            if paid.total() >= left {
                return Ok(());
            }
            left -= paid.total();
        }
        Err(vender_core::Error::NominalCount { amount: left }.into())
    }
}

fn packet(b: &[u8]) -> Packet {
    Packet::from_bytes(b).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mdb::mock::{MockUart, MockUartHandle};
    use crate::mdb::uart::UartDriver;
    use rstest::rstest;

    // level 3, currency 1643, scaling 1, 2 decimals, routing 0003, types 1 2 5 10
    const SETUP: &str = "03 1643 01 02 0003 01 02 05 0a";

    fn coin() -> (CoinAcceptor, MockUartHandle) {
        let (uart, handle) = MockUart::new();
        let bus = Arc::new(Bus::new(UartDriver::Mock(uart)));
        let config = CoinConfig {
            delays: Delays::FAST,
            dispense_timeout: Duration::from_millis(200),
            ..CoinConfig::default()
        };
        (CoinAcceptor::new(bus, config), handle)
    }

    async fn ready_coin(tubes: &str) -> (CoinAcceptor, MockUartHandle) {
        let (c, mock) = coin();
        mock.expect("08", "");
        mock.expect("09", SETUP);
        mock.expect("0a", tubes);
        mock.expect("0c0000ffff", "");
        c.init().await.unwrap();
        assert!(mock.leftover().is_empty());
        (c, mock)
    }

    #[tokio::test]
    async fn test_init() {
        let (c, _mock) = ready_coin("0000 05 04 03 02").await;
        assert_eq!(
            c.supported_nominals(),
            vec![Nominal(1), Nominal(2), Nominal(5), Nominal(10)]
        );
        assert_eq!(c.tubes().total(), Amount(5 + 8 + 15 + 20));
        assert!(c.device().state().ok());
    }

    #[rstest]
    #[case("0b", vec![PollItem::status(PollStatus::WasReset)])]
    #[case("21", vec![PollItem { count: 1, ..PollItem::fault(PollStatus::Info, MoneyFault::Slugs) }])]
    #[case("4109", vec![PollItem::money(PollStatus::Credit, Nominal(2), 1).with_cashbox(true)])]
    #[case("521e", vec![PollItem::money(PollStatus::Credit, Nominal(5), 1)])]
    #[case("7300", vec![PollItem::money(PollStatus::Rejected, Nominal(10), 1)])]
    #[case("9251", vec![PollItem::money(PollStatus::Dispensed, Nominal(5), 1)])]
    #[case("0a02", vec![PollItem::status(PollStatus::Busy), PollItem::status(PollStatus::Busy)])]
    #[case("ff00", vec![PollItem::money(PollStatus::Dispensed, Nominal(0), 7)])]
    #[tokio::test]
    async fn test_parse_poll(#[case] input: &str, #[case] expect: Vec<PollItem>) {
        let (c, _mock) = ready_coin("0000").await;
        let bs = vender_core::hex::decode(input).unwrap();
        assert_eq!(c.parse_poll(&bs), expect);
    }

    #[tokio::test]
    async fn test_poll_error_delay() {
        let (c, mock) = ready_coin("0000").await;
        mock.expect_err("0b", HardwareError::Nak);
        let r = c.poll().await;
        assert!(!r.ready());
        assert_eq!(r.delay, crate::money::DELAY_ERROR);
    }

    #[tokio::test]
    async fn test_accept_max_mask() {
        let (c, mock) = ready_coin("0000").await;
        mock.expect("0c0007ffff", "");
        c.accept_max(Amount(5)).await.unwrap();
        mock.expect("0c0000ffff", "");
        c.accept_max(Amount::ZERO).await.unwrap();
        assert!(mock.leftover().is_empty());
    }

    #[tokio::test]
    async fn test_dispense_checks_tubes() {
        let (c, mock) = ready_coin("0000 00 01").await;
        mock.expect("0a", "0000 00 01");
        mock.expect("0d11", "");
        mock.expect("0b", "02");
        mock.expect("0b", "9100");
        mock.expect("0a", "0000 00 00");
        c.dispense(Nominal(2), 1).await.unwrap();
        assert!(mock.leftover().is_empty());

        mock.expect("0a", "0000 00 00");
        assert!(c.dispense(Nominal(2), 1).await.is_err());
        assert!(c.dispense(Nominal(3), 1).await.is_err());
        assert!(c.dispense(Nominal(2), 16).await.is_err());
    }

    #[tokio::test]
    async fn test_give_exact_from_tubes() {
        let (c, mock) = ready_coin("0000 00 00 01 01").await;
        // tube status for planning
        mock.expect("0a", "0000 00 00 01 01");
        // smallest nominal first: one 5
        mock.expect("0a", "0000 00 00 01 01");
        mock.expect("0d12", "");
        mock.expect("0b", "");
        mock.expect("0a", "0000 00 00 00 01");
        // then one 10
        mock.expect("0a", "0000 00 00 00 01");
        mock.expect("0d13", "");
        mock.expect("0b", "");
        mock.expect("0a", "0000 00 00 00 00");
        let given = c.give(Amount(15), false).await.unwrap();
        assert_eq!(given.total(), Amount(15));
        assert!(mock.leftover().is_empty());
    }

    #[tokio::test]
    async fn test_give_short_without_over() {
        let (c, mock) = ready_coin("0000").await;
        mock.expect("0a", "0000");
        mock.expect("0f0203", "");
        mock.expect("0f04", "");
        mock.expect("0f03", "00");
        let err = c.give(Amount(3), false).await.unwrap_err();
        assert!(matches!(
            err,
            HardwareError::Core(vender_core::Error::NominalCount { .. })
        ));
    }
}
