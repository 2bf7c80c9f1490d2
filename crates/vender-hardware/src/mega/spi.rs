//! SPI bus and notify pin seams of the coprocessor link.
//!
//! Real devices: [`SpidevBus`] over `/dev/spidevB.C` in half-duplex mode
//! (write request, read response buffer) and [`SysfsPin`] polling a GPIO
//! value file. Mocks come in (device, handle) pairs.

use std::collections::VecDeque;
use std::fs::File;
use std::future::Future;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{HardwareError, Result};

pub trait SpiBus: Send + 'static {
    /// Write `tx` (when non-empty), then fill `rx` (when non-empty).
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()>;
}

pub trait NotifyPin: Send + 'static {
    /// Resolve on the next rising edge. Must be cancel safe.
    fn wait_rising(&mut self) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug)]
pub struct SpidevBus {
    file: File,
}

impl SpidevBus {
    /// Bus clock comes from the device tree; `speed_hz` is informational.
    pub fn open(path: &str, speed_hz: u32) -> Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        debug!(path, speed_hz, "spidev open");
        Ok(Self { file })
    }
}

impl SpiBus for SpidevBus {
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        if !tx.is_empty() {
            self.file.write_all(tx)?;
        }
        if !rx.is_empty() {
            self.file.read_exact(rx)?;
        }
        Ok(())
    }
}

/// GPIO input through `/sys/class/gpio`.
#[derive(Debug)]
pub struct SysfsPin {
    value_path: PathBuf,
    last: bool,
    interval: Duration,
}

impl SysfsPin {
    pub fn open(pin: &str) -> Result<Self> {
        let base = PathBuf::from("/sys/class/gpio");
        let dir = base.join(format!("gpio{pin}"));
        if !dir.exists() {
            std::fs::write(base.join("export"), pin)?;
        }
        std::fs::write(dir.join("direction"), "in")?;
        Ok(Self {
            value_path: dir.join("value"),
            last: false,
            interval: Duration::from_millis(2),
        })
    }

    async fn read(&self) -> Result<bool> {
        let s = tokio::fs::read_to_string(&self.value_path).await?;
        Ok(s.trim() == "1")
    }
}

impl NotifyPin for SysfsPin {
    async fn wait_rising(&mut self) -> Result<()> {
        loop {
            let v = self.read().await?;
            let rising = v && !self.last;
            self.last = v;
            if rising {
                return Ok(());
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

#[derive(Default)]
struct MockSpiState {
    requests: Vec<Vec<u8>>,
    reads: VecDeque<Vec<u8>>,
    responder: Option<Responder>,
}

/// Scripted SPI peer: records writes, answers reads from a queue.
pub struct MockSpi {
    state: Arc<Mutex<MockSpiState>>,
}

#[derive(Clone)]
pub struct MockSpiHandle {
    state: Arc<Mutex<MockSpiState>>,
}

impl MockSpi {
    pub fn new() -> (Self, MockSpiHandle) {
        let state = Arc::new(Mutex::new(MockSpiState::default()));
        (
            Self {
                state: state.clone(),
            },
            MockSpiHandle { state },
        )
    }
}

impl SpiBus for MockSpi {
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !tx.is_empty() {
            st.requests.push(tx.to_vec());
            let answer = st.responder.as_mut().and_then(|f| f(tx));
            if let Some(buf) = answer {
                st.reads.push_back(buf);
            }
        }
        if !rx.is_empty() {
            rx.fill(0);
            if let Some(buf) = st.reads.pop_front() {
                let n = buf.len().min(rx.len());
                rx[..n].copy_from_slice(&buf[..n]);
            }
        }
        Ok(())
    }
}

impl MockSpiHandle {
    /// Queue a raw response buffer for the next read.
    pub fn push_read(&self, buf: Vec<u8>) {
        self.lock().reads.push_back(buf);
    }

    /// Answer each request with the buffer returned by `f`.
    pub fn set_responder(&self, f: impl FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static) {
        self.lock().responder = Some(Box::new(f));
    }

    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.lock().requests.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockSpiState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for MockSpi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MockSpi")
    }
}

/// Notify pin driven by [`MockPinHandle::trigger`].
#[derive(Debug)]
pub struct MockPin {
    rx: mpsc::Receiver<()>,
}

#[derive(Debug, Clone)]
pub struct MockPinHandle {
    tx: mpsc::Sender<()>,
}

impl MockPin {
    pub fn new() -> (Self, MockPinHandle) {
        let (tx, rx) = mpsc::channel(32);
        (Self { rx }, MockPinHandle { tx })
    }
}

impl NotifyPin for MockPin {
    async fn wait_rising(&mut self) -> Result<()> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| HardwareError::disconnected("mock notify pin"))
    }
}

impl MockPinHandle {
    pub async fn trigger(&self) {
        let _ = self.tx.send(()).await;
    }
}
