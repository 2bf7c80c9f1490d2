use thiserror::Error;
use vender_core::Amount;
use vender_engine::EngineError;
use vender_hardware::HardwareError;
use vender_network::TeleError;
use vender_storage::StorageError;

use crate::state::UiState;

/// Errors of the money system, the UI and the global context.
#[derive(Debug, Error)]
pub enum UiError {
    #[error("Engine: {0}")]
    Engine(#[from] EngineError),

    #[error("Hardware: {0}")]
    Hardware(#[from] HardwareError),

    #[error("Core: {0}")]
    Core(#[from] vender_core::Error),

    #[error("Tele: {0}")]
    Tele(#[from] TeleError),

    #[error("Storage: {0}")]
    Storage(#[from] StorageError),

    #[error("not enough money: need={need} credit={credit}")]
    NeedMoreMoney { need: Amount, credit: Amount },

    /// Change could not be paid out completely.
    #[error("payout debt={debt}{}", cause.as_ref().map(|c| format!(": {c}")).unwrap_or_default())]
    Debt {
        debt: Amount,
        cause: Option<HardwareError>,
    },

    #[error("service password rejected")]
    AuthDenied,

    /// A scheduled task gave up waiting for the lock.
    #[error("interrupted")]
    Interrupted,

    #[error("menu: {message}")]
    Menu { message: String },

    #[error("config: {message}")]
    Config { message: String },

    /// A UI state handler returned no next state.
    #[error("state={from} returned no next state")]
    InvalidState { from: UiState },

    #[error("shutting down")]
    Closing,
}

impl UiError {
    pub fn menu(message: impl Into<String>) -> Self {
        Self::Menu {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn debt(debt: Amount, cause: Option<HardwareError>) -> Self {
        Self::Debt { debt, cause }
    }
}

pub type Result<T> = std::result::Result<T, UiError>;
