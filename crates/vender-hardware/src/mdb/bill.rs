//! Bill validator at MDB address 0x30.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info};
use vender_core::{Amount, Nominal};

use crate::error::{HardwareError, Result};
use crate::money::{MoneyFault, PollItem, PollResult, PollStatus};

use super::bus::Bus;
use super::device::{Delays, Device};
use super::packet::Packet;

pub const ADDRESS: u8 = 0x30;
pub const DEVICE_NAME: &str = "mdb.bill";
const TYPE_COUNT: usize = 16;
const SETUP_MIN_LENGTH: usize = 27;

#[derive(Debug, Clone)]
pub struct BillConfig {
    /// Multiplier on top of the SETUP scaling factor, 0 means 1.
    pub scaling_factor: u32,
    pub delays: Delays,
}

impl Default for BillConfig {
    fn default() -> Self {
        Self {
            scaling_factor: 1,
            delays: Delays::default(),
        }
    }
}

#[derive(Debug, Default)]
struct BillState {
    nominals: [Nominal; TYPE_COUNT],
    escrow: bool,
    feature_level: u8,
}

#[derive(Debug)]
pub struct BillValidator {
    dev: Device,
    config: BillConfig,
    state: Mutex<BillState>,
}

/// Stacker fill state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stacker {
    pub full: bool,
    pub count: u16,
}

impl BillValidator {
    pub fn new(bus: Arc<Bus>, config: BillConfig) -> Self {
        Self {
            dev: Device::new(bus, ADDRESS, DEVICE_NAME, config.delays),
            config,
            state: Mutex::new(BillState::default()),
        }
    }

    pub fn device(&self) -> &Device {
        &self.dev
    }

    fn state(&self) -> MutexGuard<'_, BillState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// RESET, SETUP, STACKER, then all bill types disabled.
    pub async fn init(&self) -> Result<()> {
        let setup = self.dev.tx_setup(SETUP_MIN_LENGTH).await?;
        self.parse_setup(setup.bytes())?;
        match self.stacker().await {
            Ok(s) => debug!(full = s.full, count = s.count, "bill stacker"),
            Err(e) => info!(error = %e, "bill stacker"),
        }
        self.bill_type(0, 0).await?;
        self.dev.set_ready();
        info!(nominals = ?self.supported_nominals(), escrow = self.escrow_supported(), "bill validator ready");
        Ok(())
    }

    fn parse_setup(&self, bs: &[u8]) -> Result<()> {
        if bs.len() < SETUP_MIN_LENGTH {
            return Err(HardwareError::device(DEVICE_NAME, "SETUP too short"));
        }
        let scaling = u32::from(u16::from_be_bytes([bs[3], bs[4]])) * self.config.scaling_factor.max(1);
        let mut st = self.state();
        st.feature_level = bs[0];
        st.escrow = bs[10] == 0xff;
        st.nominals = [Nominal(0); TYPE_COUNT];
        for (i, b) in bs[11..].iter().take(TYPE_COUNT).enumerate() {
            st.nominals[i] = Nominal(u32::from(*b) * scaling);
        }
        debug!(
            level = bs[0],
            currency = %format!("{:02x}{:02x}", bs[1], bs[2]),
            scaling,
            decimal_places = bs[5],
            stacker_capacity = u16::from_be_bytes([bs[6], bs[7]]),
            escrow = st.escrow,
            "bill setup"
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

    pub fn escrow_supported(&self) -> bool {
        self.state().escrow
    }

    fn type_nominal(&self, t: u8) -> Nominal {
        self.state()
            .nominals
            .get(usize::from(t))
            .copied()
            .unwrap_or_default()
    }

    /// BILL TYPE with explicit accept and escrow masks.
    pub async fn bill_type(&self, accept: u16, escrow: u16) -> Result<()> {
        let [a1, a2] = accept.to_be_bytes();
        let [e1, e2] = escrow.to_be_bytes();
        self.dev.tx_known(&packet(&[0x34, a1, a2, e1, e2])).await?;
        Ok(())
    }

    /// Enable bill types not above `max`, escrow them when supported.
    pub async fn accept_max(&self, max: Amount) -> Result<()> {
        let mask = self
            .state()
            .nominals
            .iter()
            .enumerate()
            .filter(|(_, n)| n.0 > 0 && Amount::from(**n) <= max)
            .fold(0u16, |mask, (i, _)| mask | (1 << i));
        let escrow = if self.escrow_supported() { mask } else { 0 };
        debug!(max = %max, mask = %format!("{mask:016b}"), "bill accept");
        self.bill_type(mask, escrow).await
    }

    pub async fn escrow_accept(&self) -> Result<()> {
        self.dev.tx_known(&packet(&[0x35, 0x01])).await.map(drop)
    }

    pub async fn escrow_reject(&self) -> Result<()> {
        self.dev.tx_known(&packet(&[0x35, 0x00])).await.map(drop)
    }

    pub async fn stacker(&self) -> Result<Stacker> {
        let response = self.dev.tx_known(&packet(&[0x36])).await?;
        match response.bytes() {
            [hi, lo, ..] => {
                let v = u16::from_be_bytes([*hi, *lo]);
                Ok(Stacker {
                    full: v & 0x8000 != 0,
                    count: v & 0x7fff,
                })
            }
            _ => Err(HardwareError::device(
                DEVICE_NAME,
                format!("STACKER response={response}"),
            )),
        }
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
        bs.iter().map(|b| self.parse_poll_item(*b)).collect()
    }

    fn parse_poll_item(&self, b: u8) -> PollItem {
        use PollStatus as S;
        match b {
            0x01 => PollItem::fault(S::Fatal, MoneyFault::DefectiveMotor),
            0x02 => PollItem::fault(S::Fatal, MoneyFault::Sensor),
            0x03 => PollItem::status(S::Busy),
            0x04 => PollItem::fault(S::Fatal, MoneyFault::RomChecksum),
            0x05 => PollItem::fault(S::Fatal, MoneyFault::Jam),
            0x06 => PollItem::status(S::WasReset),
            0x07 => PollItem::fault(S::Error, MoneyFault::BillRemoved),
            0x08 => PollItem::fault(S::Fatal, MoneyFault::NoStorage),
            0x09 => PollItem::status(S::Disabled),
            0x0a => PollItem::fault(S::Error, MoneyFault::EscrowImpossible),
            0x0b => PollItem::status(S::Rejected),
            0x0c => PollItem::fault(S::Error, MoneyFault::Fraud),
            _ if b & 0x80 != 0 => {
                let nominal = self.type_nominal(b & 0xf);
                match (b >> 4) & 7 {
                    0 => PollItem::money(S::Credit, nominal, 1).with_cashbox(true),
                    1 => PollItem::money(S::Escrow, nominal, 1),
                    _ => PollItem::money(S::Rejected, nominal, 1),
                }
            }
            _ if b & 0xe0 == 0x40 => PollItem {
                count: b & 0x1f,
                ..PollItem::fault(S::Info, MoneyFault::Attempts)
            },
            _ => {
                error!(byte = %format!("{b:02x}"), "bill poll unknown");
                PollItem::fault(S::Fatal, MoneyFault::Unknown(b))
            }
        }
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

    // level 1, currency 1643, scaling 5, 2 decimals, stacker 100,
    // security ffff, escrow ff, types 1 2 4
    const SETUP: &str = "01 1643 0005 02 0064 ffff ff 01 02 04 00000000 00000000 00000000 00";

    async fn ready_bill() -> (BillValidator, MockUartHandle) {
        let (uart, mock) = MockUart::new();
        let bus = Arc::new(Bus::new(UartDriver::Mock(uart)));
        let config = BillConfig {
            delays: Delays::FAST,
            ..BillConfig::default()
        };
        let bill = BillValidator::new(bus, config);
        mock.expect("30", "");
        mock.expect("31", SETUP);
        mock.expect("36", "0010");
        mock.expect("3400000000", "");
        bill.init().await.unwrap();
        assert!(mock.leftover().is_empty());
        (bill, mock)
    }

    #[tokio::test]
    async fn test_init() {
        let (bill, _mock) = ready_bill().await;
        assert_eq!(
            bill.supported_nominals(),
            vec![Nominal(5), Nominal(10), Nominal(20)]
        );
        assert!(bill.escrow_supported());
    }

    #[rstest]
    #[case("09", vec![PollItem::status(PollStatus::Disabled)])]
    #[case("0609", vec![PollItem::status(PollStatus::WasReset), PollItem::status(PollStatus::Disabled)])]
    #[case("9209", vec![PollItem::money(PollStatus::Escrow, Nominal(20), 1), PollItem::status(PollStatus::Disabled)])]
    #[case("80", vec![PollItem::money(PollStatus::Credit, Nominal(5), 1).with_cashbox(true)])]
    #[case("a1", vec![PollItem::money(PollStatus::Rejected, Nominal(10), 1)])]
    #[case("43", vec![PollItem { count: 3, ..PollItem::fault(PollStatus::Info, MoneyFault::Attempts) }])]
    #[tokio::test]
    async fn test_parse_poll(#[case] input: &str, #[case] expect: Vec<PollItem>) {
        let (bill, _mock) = ready_bill().await;
        let bs = vender_core::hex::decode(input).unwrap();
        assert_eq!(bill.parse_poll(&bs), expect);
    }

    #[tokio::test]
    async fn test_accept_max_with_escrow() {
        let (bill, mock) = ready_bill().await;
        mock.expect("3400030003", "");
        bill.accept_max(Amount(10)).await.unwrap();
        mock.expect("3501", "");
        bill.escrow_accept().await.unwrap();
        mock.expect("3500", "");
        bill.escrow_reject().await.unwrap();
        assert!(mock.leftover().is_empty());
    }

    #[tokio::test]
    async fn test_stacker() {
        let (bill, mock) = ready_bill().await;
        mock.expect("36", "8005");
        assert_eq!(
            bill.stacker().await.unwrap(),
            Stacker {
                full: true,
                count: 5
            }
        );
    }
}
