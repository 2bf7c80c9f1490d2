//! Coprocessor client.
//!
//! One background task owns the SPI bus and the notify pin. Callers talk to
//! it over a channel, so requests are serialised in arrival order.
//!
//! ```text
//!  tx(cmd) ──► ┌──────────┐  write request   ┌─────────────┐
//!              │ io task  │ ───────────────► │ coprocessor │
//!  next()  ──► │          │ ◄─────────────── │             │
//!              └──────────┘  notify edge or  └─────────────┘
//!                   │        backup tick, read 64 byte buffer
//!                   ├──► Twi packets ──► keyboard channel
//!                   └──► other packets ──► response / pending queue
//! ```
//!
//! Users take a reference with [`Client::inc_ref`]; the task stops when the
//! last one calls [`Client::dec_ref`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};
use vender_core::hex;

use crate::error::{HardwareError, Result};

use super::protocol::{BUFFER_SIZE, Command, Header, Packet, encode_request, parse_packets};
use super::spi::{NotifyPin, SpiBus};

pub const TWI_CHANNEL_CAPACITY: usize = 32;
const HANDSHAKE_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Read the response buffer even without a notify edge after this long.
    pub backup_tick: Duration,
    /// Give up waiting for a response after this long.
    pub response_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backup_tick: Duration::from_millis(740),
            response_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Default)]
pub struct Stat {
    pub request: AtomicU32,
    pub error: AtomicU32,
    pub twi: AtomicU32,
}

enum Request {
    Tx {
        command: Command,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<Packet>>,
    },
    Next {
        reply: oneshot::Sender<Result<Packet>>,
    },
    Raw {
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<Packet>>>,
    },
}

#[derive(Debug)]
pub struct Client {
    txch: mpsc::Sender<Request>,
    twi: Mutex<Option<mpsc::Receiver<u16>>>,
    refcount: AtomicI32,
    alive: CancellationToken,
    stat: Arc<Stat>,
}

impl Client {
    /// Start the io task and run the handshake.
    ///
    /// # Errors
    ///
    /// Returns the last handshake error when the coprocessor did not answer
    /// `Reset` and `Poll` within 5 attempts.
    pub async fn open<S: SpiBus, P: NotifyPin>(
        spi: S,
        pin: P,
        config: ClientConfig,
        parent: &CancellationToken,
    ) -> Result<Arc<Self>> {
        let (txch, rx) = mpsc::channel(16);
        let (twi_tx, twi_rx) = mpsc::channel(TWI_CHANNEL_CAPACITY);
        let alive = parent.child_token();
        let stat = Arc::new(Stat::default());
        let io = IoTask {
            spi,
            pin: Some(pin),
            config,
            twi: twi_tx,
            pending: VecDeque::new(),
            stat: stat.clone(),
        };
        tokio::spawn(io.run(rx, alive.clone()));

        let client = Arc::new(Self {
            txch,
            twi: Mutex::new(Some(twi_rx)),
            refcount: AtomicI32::new(0),
            alive,
            stat,
        });
        if let Err(e) = client.handshake().await {
            client.alive.cancel();
            return Err(e);
        }
        Ok(client)
    }

    async fn handshake(&self) -> Result<()> {
        let mut last = HardwareError::timeout("mega handshake");
        for attempt in 1..=HANDSHAKE_ATTEMPTS {
            let result = match self.tx(Command::Reset, &[]).await {
                Ok(_) => self.tx(Command::Poll, &[]).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => {
                    debug!(attempt, "mega handshake");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "mega handshake");
                    last = e;
                }
            }
        }
        Err(last)
    }

    /// Send `command`, return the first non-keyboard packet of the answer.
    ///
    /// # Errors
    ///
    /// Link level error headers become [`HardwareError::Mega`]; MDB result
    /// headers are returned as packets for the caller to interpret.
    pub async fn tx(&self, command: Command, payload: &[u8]) -> Result<Packet> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Tx {
            command,
            payload: payload.to_vec(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| HardwareError::Closing)?
    }

    /// Next packet of a multi-packet answer, reading more if needed.
    pub async fn next(&self) -> Result<Packet> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Next { reply }).await?;
        rx.await.map_err(|_| HardwareError::Closing)?
    }

    /// Write raw bytes and return everything read back.
    pub async fn raw(&self, bytes: &[u8]) -> Result<Vec<Packet>> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Raw {
            bytes: bytes.to_vec(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| HardwareError::Closing)?
    }

    async fn send(&self, request: Request) -> Result<()> {
        if self.alive.is_cancelled() {
            return Err(HardwareError::Closing);
        }
        self.stat.request.fetch_add(1, Ordering::Relaxed);
        self.txch
            .send(request)
            .await
            .map_err(|_| HardwareError::Closing)
    }

    /// Keyboard code stream; only the first caller gets it.
    pub fn take_twi(&self) -> Option<mpsc::Receiver<u16>> {
        self.twi
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn inc_ref(&self, tag: &str) {
        let n = self.refcount.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(tag, refcount = n, "mega incref");
    }

    pub fn dec_ref(&self, tag: &str) {
        let n = self.refcount.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(tag, refcount = n, "mega decref");
        if n <= 0 {
            if n < 0 {
                error!(tag, refcount = n, "mega decref below zero");
            }
            self.close();
        }
    }

    pub fn refcount(&self) -> i32 {
        self.refcount.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.alive.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.alive.is_cancelled()
    }

    pub fn stat(&self) -> &Stat {
        &self.stat
    }
}

struct IoTask<S, P> {
    spi: S,
    pin: Option<P>,
    config: ClientConfig,
    twi: mpsc::Sender<u16>,
    pending: VecDeque<Packet>,
    stat: Arc<Stat>,
}

impl<S: SpiBus, P: NotifyPin> IoTask<S, P> {
    async fn run(mut self, mut rx: mpsc::Receiver<Request>, alive: CancellationToken) {
        let mut backup = tokio::time::interval(self.config.backup_tick);
        backup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = alive.cancelled() => break,
                request = rx.recv() => match request {
                    Some(r) => self.handle(r).await,
                    None => break,
                },
                edge = wait_edge(&mut self.pin) => {
                    if let Err(e) = edge {
                        warn!(error = %e, "mega notify pin failed, using backup tick");
                        self.pin = None;
                    }
                    self.read_unsolicited();
                }
                _ = backup.tick() => self.read_unsolicited(),
            }
        }
        debug!("mega io task stopped");
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Tx {
                command,
                payload,
                reply,
            } => {
                if !self.pending.is_empty() {
                    debug!(discarded = ?self.pending, "mega pending packets dropped");
                    self.pending.clear();
                }
                let bytes = encode_request(command, &payload);
                let result = match self.write(&bytes) {
                    Ok(()) => self.wait_response().await,
                    Err(e) => Err(e),
                };
                self.count_error(&result);
                let _ = reply.send(result);
            }
            Request::Next { reply } => {
                let result = self.wait_response().await;
                self.count_error(&result);
                let _ = reply.send(result);
            }
            Request::Raw { bytes, reply } => {
                let result = match self.write(&bytes) {
                    Ok(()) => {
                        self.wait_edge_or_tick().await;
                        self.read().map(|packets| {
                            let mut all: Vec<Packet> = self.pending.drain(..).collect();
                            all.extend(packets);
                            all
                        })
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
        }
    }

    fn count_error<T>(&self, result: &Result<T>) {
        if result.is_err() {
            self.stat.error.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        trace!(request = %hex::encode(bytes), "mega write");
        self.spi.transfer(bytes, &mut [])
    }

    /// Read one buffer; keyboard packets are diverted, the rest returned.
    fn read(&mut self) -> Result<Vec<Packet>> {
        let mut buf = [0u8; BUFFER_SIZE];
        self.spi.transfer(&[], &mut buf)?;
        let packets = parse_packets(&buf)?;
        let mut rest = Vec::with_capacity(packets.len());
        for p in packets {
            match p.twi_code() {
                Some(code) => {
                    self.stat.twi.fetch_add(1, Ordering::Relaxed);
                    if self.twi.try_send(code).is_err() {
                        warn!(code, "mega keyboard channel full, key dropped");
                    }
                }
                None => rest.push(p),
            }
        }
        if !rest.is_empty() {
            trace!(packets = ?rest, "mega read");
        }
        Ok(rest)
    }

    fn read_unsolicited(&mut self) {
        match self.read() {
            Ok(packets) => {
                if !packets.is_empty() {
                    debug!(packets = ?packets, "mega unsolicited");
                }
                self.pending.extend(packets);
            }
            Err(e) => warn!(error = %e, "mega read"),
        }
    }

    async fn wait_edge_or_tick(&mut self) {
        let tick = self.config.backup_tick;
        tokio::select! {
            r = wait_edge(&mut self.pin) => if r.is_err() { self.pin = None },
            _ = tokio::time::sleep(tick) => {},
        }
    }

    async fn wait_response(&mut self) -> Result<Packet> {
        let deadline = Instant::now() + self.config.response_timeout;
        loop {
            if let Some(p) = self.pending.pop_front() {
                if p.header.is_error() && !p.header.is_mdb_result() {
                    return Err(p.to_error());
                }
                return Ok(p);
            }
            if Instant::now() >= deadline {
                return Err(HardwareError::timeout("mega response"));
            }
            self.wait_edge_or_tick().await;
            let packets = self.read()?;
            self.pending.extend(packets);
        }
    }
}

async fn wait_edge<P: NotifyPin>(pin: &mut Option<P>) -> Result<()> {
    match pin {
        Some(p) => p.wait_rising().await,
        None => std::future::pending().await,
    }
}

/// Build a response buffer from packets, as the firmware sends it.
pub fn response_buffer(packets: &[(Header, &[u8])]) -> Vec<u8> {
    let mut buf = vec![0u8];
    for (header, data) in packets {
        buf.extend(super::protocol::encode(*header as u8, data));
    }
    buf[0] = buf.len() as u8;
    buf
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mega::spi::{MockPin, MockSpi, MockSpiHandle};

    pub(crate) fn fast_config() -> ClientConfig {
        ClientConfig {
            backup_tick: Duration::from_millis(2),
            response_timeout: Duration::from_millis(200),
        }
    }

    /// Coprocessor that acknowledges everything.
    pub(crate) fn ok_responder(handle: &MockSpiHandle) {
        handle.set_responder(|req| match Command::from_byte(req[1]) {
            Some(Command::Reset | Command::Poll | Command::Config) => {
                Some(response_buffer(&[(Header::Ok, &[])]))
            }
            _ => None,
        });
    }

    #[tokio::test]
    async fn test_open_handshake() {
        let (spi, handle) = MockSpi::new();
        let (pin, _pin_handle) = MockPin::new();
        ok_responder(&handle);
        let alive = CancellationToken::new();
        let client = Client::open(spi, pin, fast_config(), &alive).await.unwrap();
        let requests = handle.requests();
        assert_eq!(requests[0], encode_request(Command::Reset, &[]));
        assert_eq!(requests[1], encode_request(Command::Poll, &[]));
        client.close();
    }

    #[tokio::test]
    async fn test_open_fails_silent_peer() {
        let (spi, _handle) = MockSpi::new();
        let (pin, _pin_handle) = MockPin::new();
        let alive = CancellationToken::new();
        let err = Client::open(spi, pin, fast_config(), &alive)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_twi_diverted_and_error_header() {
        let (spi, handle) = MockSpi::new();
        let (pin, _pin_handle) = MockPin::new();
        ok_responder(&handle);
        let alive = CancellationToken::new();
        let client = Client::open(spi, pin, fast_config(), &alive).await.unwrap();
        let mut twi = client.take_twi().unwrap();
        assert!(client.take_twi().is_none());

        handle.set_responder(|_| {
            Some(response_buffer(&[
                (Header::Twi, &[0x00, b'5']),
                (Header::UnknownCommand, &[0x42]),
            ]))
        });
        let err = client.tx(Command::Debug, &[]).await.unwrap_err();
        assert!(matches!(err, HardwareError::Mega { header: 0x84, .. }));
        assert_eq!(twi.recv().await, Some(u16::from(b'5')));
        client.close();
    }

    #[tokio::test]
    async fn test_refcount_closes() {
        let (spi, handle) = MockSpi::new();
        let (pin, _pin_handle) = MockPin::new();
        ok_responder(&handle);
        let alive = CancellationToken::new();
        let client = Client::open(spi, pin, fast_config(), &alive).await.unwrap();
        client.inc_ref("a");
        client.inc_ref("b");
        client.dec_ref("a");
        assert!(!client.is_closed());
        client.dec_ref("b");
        assert!(client.is_closed());
        assert!(matches!(
            client.tx(Command::Poll, &[]).await,
            Err(HardwareError::Closing)
        ));
    }
}
