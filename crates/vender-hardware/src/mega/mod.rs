//! AVR coprocessor over SPI: MDB transactions, bus reset and the keyboard
//! stream share one link.

pub mod client;
pub mod protocol;
pub mod spi;

pub use client::{Client, ClientConfig};
pub use protocol::{Command, Header, Packet};
pub use spi::{MockPin, MockPinHandle, MockSpi, MockSpiHandle, NotifyPin, SpiBus, SpidevBus, SysfsPin};
