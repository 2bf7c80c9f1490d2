//! Vending machine controller: money system, customer and service UI,
//! and the global context tying hardware, engine and telemetry together.
//!
//! ```text
//!                 ┌──────────── Global ─────────────┐
//!  keyboard ─►  Dispatcher        Engine ◄── Inventory
//!  dev-input ─►     │               ▲  ▲
//!                   ▼               │  └── money.* ── MoneySystem ◄── coin / bill (MDB)
//!                  Ui ──exec menu───┘                     │
//!                   │  ◄──── credit / gift events ────────┘
//!                   ├──► TextDisplay
//!                   └──► Teler (state, transactions, reports)
//!  Tele commands ──► Global::handle ──► UiLock ──► Ui parks in Locked
//! ```

pub mod auth;
pub mod error;
pub mod event;
mod front;
pub mod global;
pub mod lock;
pub mod menu;
pub mod money;
mod service;
pub mod state;
pub mod tune;
pub mod ui;

pub use error::{Result, UiError};
pub use event::Event;
pub use global::{Global, Hardware};
pub use lock::UiLock;
pub use menu::{Menu, MenuItem};
pub use money::{MoneyEvent, MoneySystem};
pub use service::SERVICE_MENU;
pub use state::UiState;
pub use ui::Ui;
