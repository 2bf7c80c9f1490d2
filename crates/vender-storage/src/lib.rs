//! Durable local state of the vending controller.
//!
//! - [`persist`]: small state blobs written twice (main and backup), each
//!   with a CRC-64 trailer, so a torn write never loses the last good copy.
//! - [`queue`]: append-only journal FIFO for telemetry that must survive
//!   power loss until the server acknowledges it.

pub mod error;
pub mod persist;
pub mod queue;

pub use error::{Result, StorageError};
pub use persist::Persist;
pub use queue::{Entry, Queue};
