//! Framed slim connection.
//!
//! ```text
//! SlimTransport
//!     │
//!     └─> TcpConn ───(TCP)───> telemetry server
//!            │
//!            └─> SlimCodec (framing, HMAC)
//! ```
//!
//! [`Conn`] is the seam the transport session is written against; the TCP
//! implementation keeps no retry logic of its own. Any I/O or codec
//! failure drops the stream and later calls return
//! [`TeleError::NotConnected`] until the owner connects again.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};
use vender_protocol::{Frame, SecretSource, SlimCodec};

use crate::error::{Result, TeleError};

const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

pub trait Conn: Send + 'static {
    fn send_frame(&mut self, frame: Frame) -> impl Future<Output = Result<()>> + Send;

    /// Next frame from the peer, `Ok(None)` once the peer closed the
    /// stream. Must be cancel safe.
    fn recv_frame(&mut self) -> impl Future<Output = Result<Option<Frame>>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Clone)]
pub struct TcpConnConfig {
    /// `host:port` of the server.
    pub address: String,
    /// Connect and write timeout.
    pub timeout: Duration,
    /// Sign outgoing frames and require signed incoming frames.
    pub secret: Option<Arc<dyn SecretSource>>,
}

impl fmt::Debug for TcpConnConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnConfig")
            .field("address", &self.address)
            .field("timeout", &self.timeout)
            .field("signed", &self.secret.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub struct TcpConn {
    framed: Option<Framed<TcpStream, SlimCodec>>,
    timeout: Duration,
    peer: String,
}

impl TcpConn {
    /// # Errors
    ///
    /// [`TeleError::ConnectionTimeout`] when the server does not accept in
    /// time, [`TeleError::Io`] when the connection is refused.
    pub async fn connect(config: &TcpConnConfig) -> Result<Self> {
        let ms = config.timeout.as_millis() as u64;
        debug!(address = %config.address, timeout_ms = ms, "slim connecting");
        let stream = timeout(config.timeout, TcpStream::connect(&config.address))
            .await
            .map_err(|_| TeleError::ConnectionTimeout(ms))??;
        stream.set_nodelay(true)?;
        let mut codec = SlimCodec::new();
        if let Some(secret) = &config.secret {
            codec = codec.with_secret(Arc::clone(secret));
        }
        info!(address = %config.address, "slim connected");
        Ok(Self::from_stream(stream, codec, config.timeout))
    }

    /// Wrap an accepted or already connected stream.
    pub fn from_stream(stream: TcpStream, codec: SlimCodec, timeout: Duration) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            framed: Some(Framed::new(stream, codec)),
            timeout,
            peer,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.framed.is_some()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl Conn for TcpConn {
    async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        let framed = self.framed.as_mut().ok_or(TeleError::NotConnected)?;
        trace!(peer = %self.peer, seq = frame.seq, len = frame.payload.len(), "slim send");
        match timeout(self.timeout, framed.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!(peer = %self.peer, error = %e, "slim send failed");
                self.framed = None;
                Err(e.into())
            }
            Err(_) => Err(TeleError::WriteTimeout(self.timeout.as_millis() as u64)),
        }
    }

    async fn recv_frame(&mut self) -> Result<Option<Frame>> {
        let framed = self.framed.as_mut().ok_or(TeleError::NotConnected)?;
        match framed.next().await {
            Some(Ok(frame)) => {
                trace!(peer = %self.peer, seq = frame.seq, len = frame.payload.len(), "slim recv");
                Ok(Some(frame))
            }
            Some(Err(e)) => {
                warn!(peer = %self.peer, error = %e, "slim recv failed");
                self.framed = None;
                Err(e.into())
            }
            None => {
                debug!(peer = %self.peer, "slim peer closed");
                self.framed = None;
                Ok(None)
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut framed) = self.framed.take() {
            if timeout(CLOSE_TIMEOUT, framed.flush()).await.is_err() {
                debug!(peer = %self.peer, "slim flush timed out on close");
            }
            let _ = timeout(CLOSE_TIMEOUT, framed.get_mut().shutdown()).await;
            info!(peer = %self.peer, "slim connection closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::net::TcpListener;
    use vender_protocol::{SlimError, StaticSecret};

    fn secret() -> Arc<dyn SecretSource> {
        Arc::new(StaticSecret::new("password"))
    }

    async fn listener() -> (TcpListener, String) {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = l.local_addr().unwrap().to_string();
        (l, addr)
    }

    fn config(address: String, secret: Option<Arc<dyn SecretSource>>) -> TcpConnConfig {
        TcpConnConfig {
            address,
            timeout: Duration::from_secs(2),
            secret,
        }
    }

    #[tokio::test]
    async fn test_signed_roundtrip() {
        let (l, addr) = listener().await;
        let server = tokio::spawn(async move {
            let (stream, _) = l.accept().await.unwrap();
            let codec = SlimCodec::new().with_secret(secret());
            let mut conn = TcpConn::from_stream(stream, codec, Duration::from_secs(2));
            let frame = conn.recv_frame().await.unwrap().unwrap();
            conn.send_frame(Frame {
                seq: 1,
                ack_seq: frame.seq,
                acks: 1,
                ..Default::default()
            })
            .await
            .unwrap();
            frame
        });

        let mut conn = TcpConn::connect(&config(addr, Some(secret()))).await.unwrap();
        conn.send_frame(Frame {
            seq: 7,
            payload: Bytes::from_static(b"hi"),
            ..Default::default()
        })
        .await
        .unwrap();
        let ack = conn.recv_frame().await.unwrap().unwrap();
        assert_eq!((ack.ack_seq, ack.acks), (7, 1));

        let got = server.await.unwrap();
        assert_eq!(got.payload.as_ref(), b"hi");
        conn.close().await.unwrap();
        assert!(!conn.is_connected());
        assert!(matches!(
            conn.send_frame(Frame::keepalive(8)).await,
            Err(TeleError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_unsigned_frame_rejected_with_secret() {
        let (l, addr) = listener().await;
        tokio::spawn(async move {
            let (stream, _) = l.accept().await.unwrap();
            let mut conn = TcpConn::from_stream(stream, SlimCodec::new(), Duration::from_secs(2));
            conn.send_frame(Frame::keepalive(1)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let mut conn = TcpConn::connect(&config(addr, Some(secret()))).await.unwrap();
        let err = conn.recv_frame().await.unwrap_err();
        assert!(matches!(err, TeleError::Slim(SlimError::SignatureMissing)));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_peer_close_is_none() {
        let (l, addr) = listener().await;
        tokio::spawn(async move {
            let (stream, _) = l.accept().await.unwrap();
            drop(stream);
        });
        let mut conn = TcpConn::connect(&config(addr, None)).await.unwrap();
        assert!(conn.recv_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (l, addr) = listener().await;
        drop(l);
        let err = TcpConn::connect(&config(addr, None)).await.unwrap_err();
        assert!(err.is_connection());
    }
}
