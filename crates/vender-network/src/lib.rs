//! Telemetry link between the machine and its server.
//!
//! ```text
//! UI / money / engine
//!     │  Teler (state, error, transaction, report, responses)
//!     ▼
//!   Tele ──> Queue (vender-storage, durable)
//!     │
//!     └─> TransportDriver ─┬─> SlimTransport ──> TcpConn ──(TCP, slim frames)──> server
//!                          └─> MockTransport (tests)
//! ```
//!
//! Commands flow back from the transport into [`Tele::serve_commands`],
//! which answers `Ping` and `Report` itself and hands the rest to a
//! [`CommandHandler`].

pub mod conn;
pub mod error;
pub mod slim;
pub mod tele;
pub mod transport;

pub use conn::{Conn, TcpConn, TcpConnConfig};
pub use error::{Result, TeleError};
pub use slim::{SlimOptions, SlimTransport};
pub use tele::{CommandHandler, NoopTele, Reporter, Tele, TeleOptions, Teler};
pub use transport::{MockTransport, MockTransportHandle, Transport, TransportDriver};

/// Wall clock as Unix nanoseconds, the time unit of every telemetry packet.
pub fn unix_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}
