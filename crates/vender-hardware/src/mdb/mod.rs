//! MDB (multi-drop bus) peripherals.
//!
//! ```text
//!  CoinAcceptor ─┐
//!  BillValidator ┼─► Device (state, RESET policy) ─► Bus (one tx at a time) ─► UartDriver
//!               ─┘
//! ```

pub mod bill;
pub mod bus;
pub mod coin;
pub mod device;
pub mod file;
pub mod helper;
pub mod mega;
pub mod mock;
pub mod packet;
pub mod uart;

pub use bill::BillValidator;
pub use bus::Bus;
pub use coin::CoinAcceptor;
pub use device::{Delays, Device, DeviceState, TxOpt};
pub use file::FileUart;
pub use helper::HelperUart;
pub use mega::MegaUart;
pub use mock::{MockUart, MockUartHandle};
pub use packet::{PACKET_MAX_LENGTH, Packet};
pub use uart::{Uart, UartDriver};
