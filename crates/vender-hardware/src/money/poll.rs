//! Poll results shared by coin acceptors and bill validators.

use std::fmt;
use std::time::Duration;

use vender_core::{Amount, Nominal};

use crate::error::HardwareError;

pub const DELAY_NEXT: Duration = Duration::from_millis(200);
pub const DELAY_ERROR: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollStatus {
    Info,
    Error,
    Fatal,
    Disabled,
    Busy,
    WasReset,
    Credit,
    Rejected,
    Escrow,
    ReturnRequest,
    Dispensed,
}

/// Condition reported inside a poll response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MoneyFault {
    Sensor,
    NoStorage,
    Jam,
    RomChecksum,
    Fraud,
    NoCredit,
    DoubleArrival,
    CoinRouting,
    CoinJam,
    Slugs,
    DefectiveMotor,
    BillRemoved,
    EscrowImpossible,
    Attempts,
    Unknown(u8),
}

impl fmt::Display for MoneyFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sensor => f.write_str("defective sensor"),
            Self::NoStorage => f.write_str("storage unplugged"),
            Self::Jam => f.write_str("jam"),
            Self::RomChecksum => f.write_str("ROM checksum"),
            Self::Fraud => f.write_str("possible credited money removal"),
            Self::NoCredit => f.write_str("no credit"),
            Self::DoubleArrival => f.write_str("double arrival"),
            Self::CoinRouting => f.write_str("coin routing"),
            Self::CoinJam => f.write_str("coin jam"),
            Self::Slugs => f.write_str("slugs"),
            Self::DefectiveMotor => f.write_str("defective motor"),
            Self::BillRemoved => f.write_str("bill removed"),
            Self::EscrowImpossible => f.write_str("escrow requested without bill in escrow position"),
            Self::Attempts => f.write_str("attempts while disabled"),
            Self::Unknown(b) => write!(f, "unknown poll byte {b:02x}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollItem {
    pub status: PollStatus,
    pub error: Option<MoneyFault>,
    pub nominal: Nominal,
    pub count: u8,
    pub cashbox: bool,
}

impl PollItem {
    pub fn status(status: PollStatus) -> Self {
        Self {
            status,
            error: None,
            nominal: Nominal(0),
            count: 0,
            cashbox: false,
        }
    }

    pub fn fault(status: PollStatus, fault: MoneyFault) -> Self {
        Self {
            error: Some(fault),
            ..Self::status(status)
        }
    }

    pub fn money(status: PollStatus, nominal: Nominal, count: u8) -> Self {
        Self {
            nominal,
            count,
            ..Self::status(status)
        }
    }

    pub fn with_cashbox(mut self, cashbox: bool) -> Self {
        self.cashbox = cashbox;
        self
    }

    /// `nominal × count`, a zero count counts as one.
    pub fn amount(&self) -> Amount {
        Amount::from(self.nominal) * u32::from(self.count.max(1))
    }
}

impl fmt::Display for PollItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "status={:?} cashbox={} nominal={} count={}",
            self.status, self.cashbox, self.nominal, self.count
        )?;
        if let Some(e) = self.error {
            write!(f, " error={e}")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct PollResult {
    pub items: Vec<PollItem>,
    pub error: Option<HardwareError>,
    pub delay: Duration,
}

impl Default for PollResult {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            error: None,
            delay: DELAY_NEXT,
        }
    }
}

impl PollResult {
    pub fn failed(error: HardwareError) -> Self {
        Self {
            items: Vec::new(),
            error: Some(error),
            delay: DELAY_ERROR,
        }
    }

    /// Idle and able to take the next command.
    pub fn ready(&self) -> bool {
        self.error.is_none() && !self.has_status(PollStatus::Busy)
    }

    pub fn has_status(&self, status: PollStatus) -> bool {
        self.items.iter().any(|i| i.status == status)
    }

    pub fn single_status(&self) -> Option<PollStatus> {
        match self.items.as_slice() {
            [one] => Some(one.status),
            _ => None,
        }
    }
}
