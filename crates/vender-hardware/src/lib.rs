//! Peripherals of the vending controller.
//!
//! ```text
//!                 ┌──────────── money::Devicer ────────────┐
//!                 │  CoinAcceptor (0x08)   BillValidator (0x30)
//!                 └───────────────┬────────────────────────┘
//!                           mdb::Device
//!                                 │
//!                            mdb::Bus
//!                                 │
//!        ┌────────────── UartDriver ───────────────┐
//!     FileUart          HelperUart            MegaUart ──► mega::Client ──► SpiBus
//!                                                              │
//!                                            twi codes ──► input::EvendKeyboard
//!
//!   input::Dispatcher ◄── sources (keyboard, /dev/input, mock)
//!   display::TextDisplay ──► DisplayDevice
//! ```
//!
//! Async seams ([`mdb::Uart`], [`input::Source`], [`mega::NotifyPin`])
//! use `impl Future` return types and are wrapped in closed enums where a
//! runtime choice is needed. Byte level seams ([`mega::SpiBus`],
//! [`display::DisplayDevice`]) are plain synchronous traits.
//!
//! Every device has a mock counterpart returned together with a handle for
//! scripting and inspection:
//!
//! ```no_run
//! use std::sync::Arc;
//! use vender_hardware::mdb::{Bus, CoinAcceptor, Delays, MockUart, UartDriver};
//!
//! # async fn demo() -> vender_hardware::Result<()> {
//! let (uart, script) = MockUart::new();
//! script.expect("0b", "");
//! let bus = Arc::new(Bus::open(UartDriver::Mock(uart), "mock").await?);
//! let coin = CoinAcceptor::new(bus, Default::default());
//! # Ok(())
//! # }
//! ```

pub mod display;
pub mod error;
pub mod input;
pub mod mdb;
pub mod mega;
pub mod money;

pub use error::{HardwareError, Result};
