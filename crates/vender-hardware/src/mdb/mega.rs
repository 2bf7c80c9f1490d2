//! MDB through the coprocessor.
//!
//! The coprocessor answers an `MdbTransaction` with `MdbStarted` and, when
//! the bus round trip finishes, a result packet. Both may arrive in one
//! response buffer.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{HardwareError, Result};
use crate::mega::protocol::{FLAG_ADD_CHK, FLAG_VERIFY_CHK};
use crate::mega::{Client, Command, Header, Packet};

use super::uart::{Uart, copy_response};

const BUSY_RETRIES: u32 = 3;
const BUSY_DELAY: Duration = Duration::from_millis(10);
const REF_TAG: &str = "mdb-uart";

#[derive(Debug)]
pub struct MegaUart {
    client: Arc<Client>,
    opened: bool,
}

impl MegaUart {
    pub fn new(client: Arc<Client>) -> Self {
        Self {
            client,
            opened: false,
        }
    }

    async fn transaction(&self, request: &[u8]) -> Result<Packet> {
        let mut payload = Vec::with_capacity(request.len() + 1);
        payload.push(FLAG_ADD_CHK | FLAG_VERIFY_CHK);
        payload.extend_from_slice(request);
        let mut p = self.client.tx(Command::MdbTransaction, &payload).await?;
        if p.header == Header::MdbStarted {
            p = self.client.next().await?;
        }
        Ok(p)
    }
}

/// Translate an MDB result packet into response data.
fn mdb_result(p: Packet) -> Result<Vec<u8>> {
    match p.header {
        Header::MdbSuccess => Ok(p.data),
        Header::MdbBusy => Err(HardwareError::Busy),
        Header::MdbNack => Err(HardwareError::Nak),
        Header::MdbTimeout => Err(HardwareError::timeout("mdb via mega")),
        Header::MdbInvalidChk => {
            let received = p.data.first().copied().unwrap_or_default();
            let actual = p.data.get(1).copied().unwrap_or_default();
            Err(HardwareError::Checksum { received, actual })
        }
        Header::MdbProtocolError => Err(HardwareError::bus(format!(
            "mega mdb protocol error {}",
            p.body_hex()
        ))),
        _ => Err(HardwareError::bus(format!("mega unexpected {p:?}"))),
    }
}

impl Uart for MegaUart {
    async fn open(&mut self, _path: &str) -> Result<()> {
        if !self.opened {
            self.client.inc_ref(REF_TAG);
            self.opened = true;
        }
        Ok(())
    }

    async fn tx(&mut self, request: &[u8], response: &mut [u8]) -> Result<usize> {
        let mut attempt = 1;
        loop {
            let p = self.transaction(request).await?;
            match mdb_result(p) {
                Err(HardwareError::Busy) if attempt < BUSY_RETRIES => {
                    debug!(attempt, "mega mdb busy");
                    attempt += 1;
                    tokio::time::sleep(BUSY_DELAY).await;
                }
                Ok(data) => return copy_response(&data, response),
                Err(e) => return Err(e),
            }
        }
    }

    async fn break_(&mut self, keep: Duration, sleep: Duration) -> Result<()> {
        let ms = u16::try_from(keep.as_millis()).unwrap_or(u16::MAX);
        let p = self
            .client
            .tx(Command::MdbBusReset, &ms.to_be_bytes())
            .await?;
        if p.header != Header::Ok {
            warn!(response = ?p, "mega bus reset");
        }
        tokio::time::sleep(sleep).await;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.opened {
            self.opened = false;
            self.client.dec_ref(REF_TAG);
        }
        Ok(())
    }
}
