//! Scripted back-end for tests.
//!
//! Each expectation pairs a request (hex, without checksum) with its
//! response. Requests are matched strictly in order.
//!
//! ```
//! # tokio_test_block_on(async {
//! use vender_hardware::mdb::{MockUart, Uart};
//!
//! let (mut uart, handle) = MockUart::new();
//! handle.expect("0b", "0b");
//! let mut buf = [0u8; 36];
//! let n = uart.tx(&[0x0b], &mut buf).await.unwrap();
//! assert_eq!(&buf[..n], &[0x0b]);
//! assert!(handle.leftover().is_empty());
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::trace;
use vender_core::hex;

use crate::error::{HardwareError, Result};

use super::uart::{Uart, copy_response};

#[derive(Debug)]
enum Reply {
    Data(Vec<u8>),
    Error(HardwareError),
}

#[derive(Debug)]
struct Expect {
    request: Vec<u8>,
    reply: Reply,
}

#[derive(Debug, Default)]
struct MockState {
    queue: VecDeque<Expect>,
    breaks: u32,
}

#[derive(Debug)]
pub struct MockUart {
    state: Arc<Mutex<MockState>>,
}

#[derive(Debug, Clone)]
pub struct MockUartHandle {
    state: Arc<Mutex<MockState>>,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn script(request: &str, reply: Result<Vec<u8>>) -> Expect {
    match hex::decode(request) {
        Ok(request) => Expect {
            request,
            reply: match reply {
                Ok(data) => Reply::Data(data),
                Err(e) => Reply::Error(e),
            },
        },
        // never matches a real request, so the broken script surfaces on tx
        Err(e) => Expect {
            request: request.as_bytes().to_vec(),
            reply: Reply::Error(e.into()),
        },
    }
}

impl MockUart {
    pub fn new() -> (Self, MockUartHandle) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            Self {
                state: state.clone(),
            },
            MockUartHandle { state },
        )
    }
}

impl MockUartHandle {
    pub fn expect(&self, request: &str, response: &str) {
        let response = hex::decode(response).map_err(HardwareError::from);
        lock(&self.state).queue.push_back(script(request, response));
    }

    pub fn expect_err(&self, request: &str, error: HardwareError) {
        lock(&self.state).queue.push_back(script(request, Err(error)));
    }

    /// Expectations not consumed yet, as request hex.
    pub fn leftover(&self) -> Vec<String> {
        lock(&self.state)
            .queue
            .iter()
            .map(|e| hex::encode(&e.request))
            .collect()
    }

    pub fn breaks(&self) -> u32 {
        lock(&self.state).breaks
    }
}

impl Uart for MockUart {
    async fn open(&mut self, _path: &str) -> Result<()> {
        Ok(())
    }

    async fn tx(&mut self, request: &[u8], response: &mut [u8]) -> Result<usize> {
        let expect = lock(&self.state).queue.pop_front().ok_or_else(|| {
            HardwareError::bus(format!("mock uart unexpected request={}", hex::encode(request)))
        })?;
        if expect.request != request {
            return Err(HardwareError::bus(format!(
                "mock uart request={} expected={}",
                hex::encode(request),
                hex::encode(&expect.request)
            )));
        }
        trace!(request = %hex::encode(request), "mock uart");
        match expect.reply {
            Reply::Data(data) => copy_response(&data, response),
            Reply::Error(e) => Err(e),
        }
    }

    async fn break_(&mut self, _keep: Duration, _sleep: Duration) -> Result<()> {
        lock(&self.state).breaks += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
