//! MDB bus: one outstanding transaction at a time over a [`UartDriver`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::Result;

use super::packet::{PACKET_MAX_LENGTH, Packet};
use super::uart::{Uart, UartDriver};

pub const DEFAULT_BREAK_KEEP: Duration = Duration::from_millis(200);
pub const DEFAULT_BREAK_SLEEP: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct Bus {
    uart: Mutex<UartDriver>,
    debug: AtomicBool,
}

impl Bus {
    pub fn new(uart: UartDriver) -> Self {
        Self {
            uart: Mutex::new(uart),
            debug: AtomicBool::new(false),
        }
    }

    /// Open `path` with the driver and wrap it.
    pub async fn open(mut uart: UartDriver, path: &str) -> Result<Self> {
        uart.open(path).await?;
        debug!(driver = uart.name(), path, "mdb bus open");
        Ok(Self::new(uart))
    }

    /// Log every request and response at debug level.
    pub fn set_debug(&self, on: bool) {
        self.debug.store(on, Ordering::Relaxed);
    }

    /// Send `request`, return the verified response.
    ///
    /// # Errors
    ///
    /// `Checksum`, `Timeout`, `Busy`, `Nak` or `Bus` from the back-end.
    pub async fn tx(&self, request: &Packet) -> Result<Packet> {
        let mut buf = [0u8; PACKET_MAX_LENGTH];
        let mut uart = self.uart.lock().await;
        let result = uart.tx(request.bytes(), &mut buf).await;
        drop(uart);
        let debug = self.debug.load(Ordering::Relaxed);
        match result {
            Ok(n) => {
                let response = Packet::from_bytes(&buf[..n])?;
                if debug {
                    debug!(request = %request, response = %response, "mdb tx");
                } else {
                    trace!(request = %request, response = %response, "mdb tx");
                }
                Ok(response)
            }
            Err(e) => {
                if debug {
                    debug!(request = %request, error = %e, "mdb tx");
                }
                Err(e)
            }
        }
    }

    pub async fn break_(&self, keep: Duration, sleep: Duration) -> Result<()> {
        debug!(keep_ms = keep.as_millis() as u64, "mdb bus reset");
        self.uart.lock().await.break_(keep, sleep).await
    }

    pub async fn reset_default(&self) -> Result<()> {
        self.break_(DEFAULT_BREAK_KEEP, DEFAULT_BREAK_SLEEP).await
    }

    pub async fn close(&self) -> Result<()> {
        self.uart.lock().await.close().await
    }

    pub async fn driver_name(&self) -> &'static str {
        self.uart.lock().await.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HardwareError;
    use crate::mdb::mock::MockUart;

    #[tokio::test]
    async fn test_bus_tx() {
        let (uart, handle) = MockUart::new();
        let bus = Bus::open(UartDriver::Mock(uart), "").await.unwrap();
        handle.expect("0b", "0b1f");
        handle.expect_err("33", HardwareError::timeout("test"));
        let p = bus.tx(&Packet::from_hex("0b").unwrap()).await.unwrap();
        assert_eq!(p.bytes(), &[0x0b, 0x1f]);
        assert!(
            bus.tx(&Packet::from_hex("33").unwrap())
                .await
                .unwrap_err()
                .is_timeout()
        );
        bus.reset_default().await.unwrap();
        assert_eq!(handle.breaks(), 1);
        assert_eq!(bus.driver_name().await, "mock");
    }
}
