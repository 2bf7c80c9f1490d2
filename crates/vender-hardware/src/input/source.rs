//! Input sources.

use std::future::Future;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

use crate::error::{HardwareError, Result};

use super::event::{DEV_INPUT_EVENT_TAG, InputEvent};
use super::keyboard::EvendKeyboard;

pub trait Source: Send {
    fn tag(&self) -> &'static str;

    /// Next event; an error means the source is gone for good.
    fn read(&mut self) -> impl Future<Output = Result<InputEvent>> + Send;
}

/// Closed set of sources the dispatcher can own.
#[derive(Debug)]
pub enum AnySource {
    Evend(EvendKeyboard),
    DevInput(DevInputEventSource),
    Mock(MockSource),
}

impl Source for AnySource {
    fn tag(&self) -> &'static str {
        match self {
            Self::Evend(s) => s.tag(),
            Self::DevInput(s) => s.tag(),
            Self::Mock(s) => s.tag(),
        }
    }

    async fn read(&mut self) -> Result<InputEvent> {
        match self {
            Self::Evend(s) => s.read().await,
            Self::DevInput(s) => s.read().await,
            Self::Mock(s) => s.read().await,
        }
    }
}

/// Size of `struct input_event` on 64-bit Linux.
pub const INPUT_EVENT_SIZE: usize = 24;
const EV_KEY: u16 = 1;
const KEY_STATE_UP: i32 = 0;

/// Linux evdev node, used for the service button.
pub struct DevInputEventSource {
    reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl std::fmt::Debug for DevInputEventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DevInputEventSource")
    }
}

impl DevInputEventSource {
    pub async fn open(device: &str) -> Result<Self> {
        let file = tokio::fs::File::open(device).await?;
        Ok(Self::from_reader(file))
    }

    pub fn from_reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            reader: Box::new(reader),
        }
    }

    /// Decode one record: timeval(16), type(2), code(2), value(4).
    pub fn decode(record: &[u8; INPUT_EVENT_SIZE]) -> Option<InputEvent> {
        let kind = u16::from_ne_bytes([record[16], record[17]]);
        if kind != EV_KEY {
            return None;
        }
        let code = u16::from_ne_bytes([record[18], record[19]]);
        let value = i32::from_ne_bytes([record[20], record[21], record[22], record[23]]);
        Some(InputEvent::new(
            DEV_INPUT_EVENT_TAG,
            code,
            value == KEY_STATE_UP,
        ))
    }
}

impl Source for DevInputEventSource {
    fn tag(&self) -> &'static str {
        DEV_INPUT_EVENT_TAG
    }

    async fn read(&mut self) -> Result<InputEvent> {
        let mut record = [0u8; INPUT_EVENT_SIZE];
        loop {
            self.reader.read_exact(&mut record).await?;
            if let Some(ev) = Self::decode(&record) {
                return Ok(ev);
            }
        }
    }
}

/// Source fed through [`MockSourceHandle::send`].
#[derive(Debug)]
pub struct MockSource {
    tag: &'static str,
    rx: mpsc::Receiver<InputEvent>,
}

#[derive(Debug, Clone)]
pub struct MockSourceHandle {
    tx: mpsc::Sender<InputEvent>,
}

impl MockSource {
    pub fn new(tag: &'static str) -> (Self, MockSourceHandle) {
        let (tx, rx) = mpsc::channel(32);
        (Self { tag, rx }, MockSourceHandle { tx })
    }
}

impl Source for MockSource {
    fn tag(&self) -> &'static str {
        self.tag
    }

    async fn read(&mut self) -> Result<InputEvent> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| HardwareError::disconnected(self.tag))
    }
}

impl MockSourceHandle {
    pub async fn send(&self, event: InputEvent) {
        let _ = self.tx.send(event).await;
    }
}
