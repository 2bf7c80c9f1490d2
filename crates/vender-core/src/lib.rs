//! Shared building blocks for the vending controller: money arithmetic,
//! the coprocessor checksum, hex helpers and the typed configuration.

pub mod config;
pub mod crc;
pub mod currency;
pub mod error;
pub mod hex;
pub mod strategy;

pub use config::Config;
pub use currency::{Amount, Nominal, NominalGroup};
pub use error::{Error, Result};
pub use strategy::ExpendStrategy;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Widest text display the firmware can address.
pub const DISPLAY_MAX_WIDTH: usize = 40;
