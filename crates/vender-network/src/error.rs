use std::io;

use thiserror::Error;
use vender_protocol::SlimError;
use vender_storage::StorageError;

/// Errors of the telemetry client and its transports.
#[derive(Debug, Error)]
pub enum TeleError {
    #[error("Not connected to server")]
    NotConnected,

    #[error("Connection timeout after {0}ms")]
    ConnectionTimeout(u64),

    #[error("Read timeout after {0}ms")]
    ReadTimeout(u64),

    #[error("Write timeout after {0}ms")]
    WriteTimeout(u64),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Peer sent something that is not a valid packet for this direction.
    #[error("Protocol violation: {message}")]
    ProtocolViolation { message: String },

    #[error("Telemetry is closing")]
    Closing,

    #[error("Tele config: {message}")]
    Config { message: String },

    #[error("Slim error: {0}")]
    Slim(#[from] SlimError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TeleError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Connection level failures after which the transport reconnects.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            Self::NotConnected
                | Self::ConnectionTimeout(_)
                | Self::ReadTimeout(_)
                | Self::WriteTimeout(_)
                | Self::ConnectionLost(_)
                | Self::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TeleError>;
