//! Money peripherals behind one closed set.
//!
//! ```text
//!  Devicer ──► Coin  (mdb 0x08: accept, tubes, change)
//!          ──► Bill  (mdb 0x30: accept, escrow)
//!          ──► Mock  (scripted)
//! ```

pub mod mock;
pub mod poll;

use std::sync::Arc;

use vender_core::{Amount, Nominal, NominalGroup};

use crate::error::{HardwareError, Result};
use crate::mdb::bill::BillValidator;
use crate::mdb::coin::CoinAcceptor;
use crate::mdb::device::Delays;

pub use mock::{MockMoneyDevice, MockMoneyHandle};
pub use poll::{DELAY_ERROR, DELAY_NEXT, MoneyFault, PollItem, PollResult, PollStatus};

#[derive(Debug, Clone)]
pub enum Devicer {
    Coin(Arc<CoinAcceptor>),
    Bill(Arc<BillValidator>),
    Mock(MockMoneyDevice),
}

impl Devicer {
    pub fn name(&self) -> &str {
        match self {
            Self::Coin(d) => d.device().name(),
            Self::Bill(d) => d.device().name(),
            Self::Mock(d) => d.name(),
        }
    }

    pub fn delays(&self) -> Delays {
        match self {
            Self::Coin(d) => *d.device().delays(),
            Self::Bill(d) => *d.device().delays(),
            Self::Mock(_) => Delays::FAST,
        }
    }

    pub async fn init(&self) -> Result<()> {
        match self {
            Self::Coin(d) => d.init().await,
            Self::Bill(d) => d.init().await,
            Self::Mock(_) => Ok(()),
        }
    }

    pub async fn poll(&self) -> PollResult {
        match self {
            Self::Coin(d) => d.poll().await,
            Self::Bill(d) => d.poll().await,
            Self::Mock(d) => d.poll(),
        }
    }

    pub async fn accept_max(&self, max: Amount) -> Result<()> {
        match self {
            Self::Coin(d) => d.accept_max(max).await,
            Self::Bill(d) => d.accept_max(max).await,
            Self::Mock(d) => {
                d.accept_max(max);
                Ok(())
            }
        }
    }

    pub fn supported_nominals(&self) -> Vec<Nominal> {
        match self {
            Self::Coin(d) => d.supported_nominals(),
            Self::Bill(d) => d.supported_nominals(),
            Self::Mock(d) => d.supported_nominals(),
        }
    }

    pub async fn escrow_accept(&self) -> Result<()> {
        match self {
            Self::Bill(d) => d.escrow_accept().await,
            Self::Mock(d) => {
                d.escrow(true);
                Ok(())
            }
            Self::Coin(_) => Err(HardwareError::unsupported("coin escrow")),
        }
    }

    pub async fn escrow_reject(&self) -> Result<()> {
        match self {
            Self::Bill(d) => d.escrow_reject().await,
            Self::Mock(d) => {
                d.escrow(false);
                Ok(())
            }
            Self::Coin(_) => Err(HardwareError::unsupported("coin escrow")),
        }
    }

    /// Pay out `amount`; `over` allows giving slightly more when exact
    /// change is impossible.
    pub async fn give(&self, amount: Amount, over: bool) -> Result<NominalGroup> {
        match self {
            Self::Coin(d) => d.give(amount, over).await,
            Self::Mock(d) => d.give(amount),
            Self::Bill(_) => Err(HardwareError::unsupported("bill give")),
        }
    }

    pub fn tubes(&self) -> NominalGroup {
        match self {
            Self::Coin(d) => d.tubes(),
            Self::Mock(d) => d.tubes(),
            Self::Bill(_) => NominalGroup::new(),
        }
    }

    pub async fn refresh_tubes(&self) -> Result<()> {
        match self {
            Self::Coin(d) => d.tube_status().await,
            Self::Bill(_) | Self::Mock(_) => Ok(()),
        }
    }
}
