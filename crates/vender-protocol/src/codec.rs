//! Tokio codec for slim frames.
//!
//! `SlimCodec` plugs [`Frame`] into `tokio_util::codec::Framed` so a TCP
//! stream becomes a `Stream<Item = Result<Frame>>` plus a `Sink<Frame>`.
//!
//! ```text
//! TCP Stream -> Decoder -> Frame (verified)
//! Frame -> Encoder -> TCP Stream (signed when FLAG_SIG)
//! ```
//!
//! The decoder reads the fixed header first and rejects a declared length
//! above the configured maximum before buffering the body, so a hostile
//! peer cannot make the codec hold more than `max_frame_size` bytes.
//!
//! # Usage with Tokio Framed
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use futures::{SinkExt, StreamExt};
//! use tokio::net::TcpStream;
//! use tokio_util::codec::Framed;
//! use vender_protocol::{Frame, SlimCodec, StaticSecret};
//!
//! # async fn example() -> vender_protocol::Result<()> {
//! let stream = TcpStream::connect("127.0.0.1:3000").await?;
//! let codec = SlimCodec::new().with_secret(Arc::new(StaticSecret::new("password")));
//! let mut framed = Framed::new(stream, codec);
//! framed.send(Frame::keepalive(1)).await?;
//! if let Some(Ok(frame)) = framed.next().await {
//!     println!("Received: {frame}");
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Result, SlimError};
use crate::frame::{FLAG_SIG, FixedHeader, Frame, HEADER_FIXED, SecretSource};

/// Default maximum frame size in bytes (64 KB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

#[derive(Clone)]
pub struct SlimCodec {
    max_frame_size: usize,
    secret: Option<Arc<dyn SecretSource>>,
}

impl SlimCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            secret: None,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Sign outgoing frames and require valid signatures on incoming ones.
    pub fn with_secret(mut self, secret: Arc<dyn SecretSource>) -> Self {
        self.secret = Some(secret);
        self
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn secret(&self) -> Option<&dyn SecretSource> {
        self.secret.as_deref()
    }
}

impl Default for SlimCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SlimCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SlimCodec")
            .field("max_frame_size", &self.max_frame_size)
            .field("signed", &self.secret.is_some())
            .finish()
    }
}

impl Decoder for SlimCodec {
    type Item = Frame;
    type Error = SlimError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < HEADER_FIXED {
            return Ok(None);
        }
        let header = FixedHeader::decode(&src[..HEADER_FIXED])?;
        if header.length > self.max_frame_size {
            return Err(SlimError::TooLarge {
                length: header.length,
                max: self.max_frame_size,
            });
        }
        if src.len() < header.length {
            src.reserve(header.length - src.len());
            return Ok(None);
        }
        let raw = src.split_to(header.length);
        Frame::unmarshal(&raw, self.secret()).map(Some)
    }
}

impl Encoder<Frame> for SlimCodec {
    type Error = SlimError;

    fn encode(&mut self, mut item: Frame, dst: &mut BytesMut) -> Result<()> {
        if self.secret.is_some() {
            item.flags |= FLAG_SIG;
        }
        let size = item.size();
        if size > self.max_frame_size {
            return Err(SlimError::TooLarge {
                length: size,
                max: self.max_frame_size,
            });
        }
        let b = item.marshal(self.secret())?;
        dst.extend_from_slice(&b);
        Ok(())
    }
}
