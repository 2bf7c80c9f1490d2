//! Wire formats shared between the machine and the telemetry server.
//!
//! * [`frame`]: the slim frame, a small length-prefixed binary envelope
//!   with optional session, acknowledgement window and HMAC signature.
//! * [`codec`] / [`stream`]: tokio framing of slim frames.
//! * [`ack`] / [`seq`]: sequence numbering and the 32-wide ack window.
//! * [`tele`]: telemetry, state and command messages carried in frame
//!   payloads.

pub mod ack;
pub mod codec;
pub mod error;
pub mod frame;
pub mod seq;
pub mod stream;
pub mod tele;

pub use ack::AckMap;
pub use codec::SlimCodec;
pub use error::{Result, SlimError};
pub use frame::{Frame, SecretSource, StaticSecret};
pub use seq::{SeqCounter, seq_greater};
pub use stream::read_frame;
