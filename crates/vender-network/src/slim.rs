//! Telemetry over slim frames on a long-lived TCP connection.
//!
//! ```text
//! send_*() ──mpsc──> session task ──Conn──> server
//!    ▲                   │   ▲
//!    └── oneshot(bool) ──┘   └── ack frames, Command packets, keepalives
//! ```
//!
//! Every payload frame is one JSON [`Packet`] and is confirmed by the
//! server through the ack window. A send reports `true` only after the ack
//! arrives within the network timeout. The session greets the server with
//! [`Packet::Hello`], acknowledges every payload frame it receives and
//! sends a keepalive frame each `keepalive` period. Silence longer than
//! `keepalive + network_timeout` ends the session; the task reconnects
//! with exponential backoff until stopped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use vender_core::config::TeleConfig;
use vender_protocol::frame::{FLAG_ACK, FLAG_KEEPALIVE, SECRET_MIN};
use vender_protocol::tele::{Command, Packet, Response, State, Telemetry};
use vender_protocol::{AckMap, Frame, SecretSource, SeqCounter, SlimError, StaticSecret};

use crate::conn::{Conn, TcpConn, TcpConnConfig};
use crate::error::{Result, TeleError};
use crate::transport::{COMMAND_CAPACITY, Transport};
use crate::unix_nanos;

pub const MIN_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);
const OUTGOING_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct SlimOptions {
    pub vm_id: i32,
    pub conn: TcpConnConfig,
    pub keepalive: Duration,
    /// Ack wait for each packet, also the connect and write timeout.
    pub network_timeout: Duration,
}

impl SlimOptions {
    /// # Errors
    ///
    /// [`TeleError::Config`] without an address or with a vm id out of
    /// range, [`SlimError::WeakSecret`] for a secret shorter than 8 bytes.
    pub fn from_config(config: &TeleConfig) -> Result<Self> {
        if config.address.is_empty() {
            return Err(TeleError::config("tele.address is empty"));
        }
        let vm_id = i32::try_from(config.vm_id)
            .map_err(|_| TeleError::config(format!("tele.vm_id={} out of range", config.vm_id)))?;
        let secret: Option<Arc<dyn SecretSource>> = match config.secret.as_bytes() {
            [] => None,
            s if s.len() < SECRET_MIN => return Err(SlimError::WeakSecret.into()),
            s => Some(Arc::new(StaticSecret::new(s))),
        };
        let network_timeout = Duration::from_secs(config.network_timeout_sec.max(1));
        Ok(Self {
            vm_id,
            conn: TcpConnConfig {
                address: config.address.clone(),
                timeout: network_timeout,
                secret,
            },
            keepalive: Duration::from_secs(config.keepalive_sec.max(1)),
            network_timeout,
        })
    }
}

#[derive(Debug)]
struct Outgoing {
    packet: Packet,
    done: oneshot::Sender<bool>,
}

#[derive(Debug)]
pub struct SlimTransport {
    out: mpsc::Sender<Outgoing>,
    connected: Arc<AtomicBool>,
    stop: CancellationToken,
}

impl SlimTransport {
    /// Spawn the connection task. Must be called within a tokio runtime.
    pub fn start(options: SlimOptions, stop: CancellationToken) -> (Self, mpsc::Receiver<Command>) {
        let (out_tx, out_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        tokio::spawn(run(
            options,
            out_rx,
            cmd_tx,
            Arc::clone(&connected),
            stop.clone(),
        ));
        (
            Self {
                out: out_tx,
                connected,
                stop,
            },
            cmd_rx,
        )
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn send(&self, packet: Packet) -> bool {
        if !self.is_connected() {
            return false;
        }
        let (done, rx) = oneshot::channel();
        if self.out.send(Outgoing { packet, done }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

impl Transport for SlimTransport {
    async fn send_state(&self, state: State) -> bool {
        self.send(Packet::State(state)).await
    }

    async fn send_telemetry(&self, telemetry: Telemetry) -> bool {
        self.send(Packet::Telemetry(Box::new(telemetry))).await
    }

    async fn send_command_response(&self, topic: String, response: Response) -> bool {
        self.send(Packet::Response { topic, response }).await
    }

    fn close(&self) {
        self.stop.cancel();
    }
}

async fn run(
    options: SlimOptions,
    mut out_rx: mpsc::Receiver<Outgoing>,
    commands: mpsc::Sender<Command>,
    connected: Arc<AtomicBool>,
    stop: CancellationToken,
) {
    let mut backoff = MIN_BACKOFF;
    while !stop.is_cancelled() {
        match TcpConn::connect(&options.conn).await {
            Ok(mut conn) => {
                backoff = MIN_BACKOFF;
                connected.store(true, Ordering::Release);
                let result = session(&mut conn, &options, &mut out_rx, &commands, &stop).await;
                connected.store(false, Ordering::Release);
                let _ = conn.close().await;
                match result {
                    Ok(()) => break,
                    Err(e) => warn!(error = %e, "slim session ended"),
                }
            }
            Err(e) => warn!(
                address = %options.conn.address,
                error = %e,
                backoff_ms = backoff.as_millis() as u64,
                "slim connect failed"
            ),
        }
        while let Ok(out) = out_rx.try_recv() {
            let _ = out.done.send(false);
        }
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
    info!("slim transport stopped");
}

/// Serve one connection until it fails or `stop` fires.
async fn session<C: Conn>(
    conn: &mut C,
    options: &SlimOptions,
    out_rx: &mut mpsc::Receiver<Outgoing>,
    commands: &mpsc::Sender<Command>,
    stop: &CancellationToken,
) -> Result<()> {
    let seqs = SeqCounter::new();
    let acks = Arc::new(AckMap::new());
    let hello = Packet::Hello {
        vm_id: options.vm_id,
        time: unix_nanos(),
    };
    conn.send_frame(payload_frame(seqs.next(), &hello)?).await?;

    let mut keepalive =
        tokio::time::interval_at(Instant::now() + options.keepalive, options.keepalive);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let idle_limit = options.keepalive + options.network_timeout;
    let mut last_rx = Instant::now();

    loop {
        tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            frame = conn.recv_frame() => {
                let Some(frame) = frame? else {
                    return Err(TeleError::ConnectionLost("closed by server".to_string()));
                };
                last_rx = Instant::now();
                if frame.check_flag(FLAG_ACK) {
                    acks.receive(frame.ack_seq, frame.acks);
                }
                if !frame.payload.is_empty() {
                    conn.send_frame(Frame {
                        seq: seqs.next(),
                        ack_seq: frame.seq,
                        acks: 1,
                        ..Default::default()
                    })
                    .await?;
                    incoming(&frame.payload, commands);
                } else if frame.check_flag(FLAG_KEEPALIVE) {
                    trace!(seq = frame.seq, "slim keepalive from server");
                }
            }
            Some(out) = out_rx.recv() => {
                let frame = match payload_frame(seqs.next(), &out.packet) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(error = %e, "slim packet encode failed");
                        let _ = out.done.send(false);
                        continue;
                    }
                };
                let seq = frame.seq;
                let ack = acks.register(seq);
                if let Err(e) = conn.send_frame(frame).await {
                    acks.cancel(seq);
                    let _ = out.done.send(false);
                    return Err(e);
                }
                let acks = Arc::clone(&acks);
                let wait = options.network_timeout;
                tokio::spawn(async move {
                    let ok = matches!(tokio::time::timeout(wait, ack).await, Ok(Ok(())));
                    if !ok {
                        debug!(seq, "slim ack not received");
                        acks.cancel(seq);
                    }
                    let _ = out.done.send(ok);
                });
            }
            _ = keepalive.tick() => {
                if last_rx.elapsed() > idle_limit {
                    return Err(TeleError::ReadTimeout(idle_limit.as_millis() as u64));
                }
                conn.send_frame(Frame::keepalive(seqs.next())).await?;
            }
        }
    }
}

fn payload_frame(seq: u16, packet: &Packet) -> Result<Frame> {
    Ok(Frame {
        seq,
        payload: Bytes::from(packet.to_bytes()?),
        ..Default::default()
    })
}

fn incoming(payload: &[u8], commands: &mpsc::Sender<Command>) {
    match Packet::from_bytes(payload) {
        Ok(Packet::Command(command)) => {
            debug!(id = command.id, task = command.task.name(), "slim command");
            if let Err(e) = commands.try_send(command) {
                warn!(error = %e, "slim command dropped");
            }
        }
        Ok(other) => warn!(
            error = %TeleError::protocol(format!("unexpected packet {other:?}")),
            "slim incoming"
        ),
        Err(e) => warn!(error = %e, "slim incoming payload invalid"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config(secret: &str) -> TeleConfig {
        TeleConfig {
            enable: true,
            vm_id: 42,
            address: "127.0.0.1:1".to_string(),
            secret: secret.to_string(),
            ..Default::default()
        }
    }

    #[rstest]
    #[case("", false)]
    #[case("password", true)]
    fn test_options_secret(#[case] secret: &str, #[case] signed: bool) {
        let o = SlimOptions::from_config(&config(secret)).unwrap();
        assert_eq!(o.vm_id, 42);
        assert_eq!(o.conn.secret.is_some(), signed);
        assert_eq!(o.keepalive, Duration::from_secs(60));
    }

    #[test]
    fn test_options_invalid() {
        assert!(matches!(
            SlimOptions::from_config(&config("short")),
            Err(TeleError::Slim(SlimError::WeakSecret))
        ));
        let mut c = config("");
        c.address.clear();
        assert!(matches!(
            SlimOptions::from_config(&c),
            Err(TeleError::Config { .. })
        ));
    }

    #[test]
    fn test_incoming_command_forwarded() {
        let (tx, mut rx) = mpsc::channel(1);
        let command = Command {
            id: 5,
            ..Default::default()
        };
        incoming(&Packet::Command(command.clone()).to_bytes().unwrap(), &tx);
        incoming(b"not json", &tx);
        incoming(&Packet::State(State::Boot).to_bytes().unwrap(), &tx);
        assert_eq!(rx.try_recv().unwrap(), command);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_offline_is_false() {
        let stop = CancellationToken::new();
        let options = SlimOptions::from_config(&config("")).unwrap();
        let (t, _rx) = SlimTransport::start(options, stop.clone());
        assert!(!t.send_state(State::Boot).await);
        t.close();
        assert!(stop.is_cancelled());
    }
}
