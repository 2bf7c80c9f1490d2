//! UART back-ends for the MDB bus.
//!
//! ```text
//!            ┌──────────────┐
//!  Bus ────► │  UartDriver  │──► File    serial port, parity emulated 9th bit
//!            │  (closed)    │──► Mega    coprocessor MDB transaction command
//!            └──────────────┘──► Helper  child process over pipes
//!                            └─► Mock    scripted (request, response) queue
//! ```
//!
//! Back-ends receive request data without the checksum and fill `response`
//! with verified data, also without the checksum.

use std::future::Future;
use std::time::Duration;

use crate::error::{HardwareError, Result};

use super::file::FileUart;
use super::helper::HelperUart;
use super::mega::MegaUart;
use super::mock::MockUart;

pub trait Uart: Send {
    fn open(&mut self, path: &str) -> impl Future<Output = Result<()>> + Send;

    /// Send `request`, receive into `response`, return the response length.
    fn tx(
        &mut self,
        request: &[u8],
        response: &mut [u8],
    ) -> impl Future<Output = Result<usize>> + Send;

    /// Hold the line in break state for `keep`, then wait `sleep`.
    fn break_(
        &mut self,
        keep: Duration,
        sleep: Duration,
    ) -> impl Future<Output = Result<()>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Closed set of back-ends, selected by `mdb.uart_driver`.
#[derive(Debug)]
pub enum UartDriver {
    File(FileUart),
    Mega(MegaUart),
    Helper(HelperUart),
    Mock(MockUart),
}

impl UartDriver {
    pub fn name(&self) -> &'static str {
        match self {
            Self::File(_) => "file",
            Self::Mega(_) => "mega",
            Self::Helper(_) => "helper",
            Self::Mock(_) => "mock",
        }
    }

    pub fn is_mock(&self) -> bool {
        matches!(self, Self::Mock(_))
    }
}

impl Uart for UartDriver {
    async fn open(&mut self, path: &str) -> Result<()> {
        match self {
            Self::File(u) => u.open(path).await,
            Self::Mega(u) => u.open(path).await,
            Self::Helper(u) => u.open(path).await,
            Self::Mock(u) => u.open(path).await,
        }
    }

    async fn tx(&mut self, request: &[u8], response: &mut [u8]) -> Result<usize> {
        match self {
            Self::File(u) => u.tx(request, response).await,
            Self::Mega(u) => u.tx(request, response).await,
            Self::Helper(u) => u.tx(request, response).await,
            Self::Mock(u) => u.tx(request, response).await,
        }
    }

    async fn break_(&mut self, keep: Duration, sleep: Duration) -> Result<()> {
        match self {
            Self::File(u) => u.break_(keep, sleep).await,
            Self::Mega(u) => u.break_(keep, sleep).await,
            Self::Helper(u) => u.break_(keep, sleep).await,
            Self::Mock(u) => u.break_(keep, sleep).await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self {
            Self::File(u) => u.close().await,
            Self::Mega(u) => u.close().await,
            Self::Helper(u) => u.close().await,
            Self::Mock(u) => u.close().await,
        }
    }
}

/// Copy `data` into `response`, failing when it does not fit.
pub(crate) fn copy_response(data: &[u8], response: &mut [u8]) -> Result<usize> {
    if data.len() > response.len() {
        return Err(HardwareError::packet_invalid(format!(
            "response length={} buffer={}",
            data.len(),
            response.len()
        )));
    }
    response[..data.len()].copy_from_slice(data);
    Ok(data.len())
}
