//! Error types for peripheral operations.
//!
//! Covers the MDB bus (checksum, timeout, NAK, busy), the coprocessor link
//! (framing, CRC, firmware error codes), device state problems and the
//! input dispatcher.

/// Result type alias for hardware operations.
pub type Result<T> = std::result::Result<T, HardwareError>;

/// Errors that can occur during hardware device operations.
#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    /// MDB response checksum does not match its data.
    #[error("MDB checksum mismatch: received={received:02x} actual={actual:02x}")]
    Checksum { received: u8, actual: u8 },

    /// Peer did not answer in time.
    #[error("Timeout: {operation}")]
    Timeout { operation: String },

    /// MDB peripheral answered NAK.
    #[error("MDB NAK")]
    Nak,

    /// Bus or coprocessor is busy with another transaction.
    #[error("MDB busy")]
    Busy,

    /// Generic bus failure.
    #[error("Bus error: {message}")]
    Bus { message: String },

    /// Malformed packet or buffer.
    #[error("Invalid packet: {message}")]
    PacketInvalid { message: String },

    /// Coprocessor reported an error header.
    #[error("Coprocessor error header={header:02x} data={data:02x?}")]
    Mega { header: u8, data: Vec<u8> },

    /// Device did not respond and is considered offline.
    #[error("Device offline: {device}")]
    Offline { device: String },

    /// Device is in a state that does not allow the operation.
    #[error("Device {device} state invalid: {state}")]
    StateInvalid { device: String, state: String },

    /// Device reported an error condition.
    #[error("Device {device}: {message}")]
    Device { device: String, message: String },

    /// Operation is not supported by this device.
    #[error("Unsupported operation: {operation}")]
    Unsupported { operation: String },

    /// Device or channel is gone.
    #[error("Device disconnected: {device}")]
    Disconnected { device: String },

    /// Device configuration error.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// An input subscription with this name already exists.
    #[error("Duplicate input subscriber: {name}")]
    DuplicateSubscriber { name: String },

    /// Component is shutting down.
    #[error("Closing")]
    Closing,

    /// Currency arithmetic failure.
    #[error(transparent)]
    Core(#[from] vender_core::Error),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port error.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

impl HardwareError {
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub fn bus(message: impl Into<String>) -> Self {
        Self::Bus {
            message: message.into(),
        }
    }

    pub fn packet_invalid(message: impl Into<String>) -> Self {
        Self::PacketInvalid {
            message: message.into(),
        }
    }

    pub fn offline(device: impl Into<String>) -> Self {
        Self::Offline {
            device: device.into(),
        }
    }

    pub fn device(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Device {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    pub fn disconnected(device: impl Into<String>) -> Self {
        Self::Disconnected {
            device: device.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// MDB response timeout, the usual sign of an absent peripheral.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Timeout on a command the device is known to support.
    pub fn is_offline(&self) -> bool {
        matches!(self, Self::Offline { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_error() {
        let error = HardwareError::Checksum {
            received: 0x12,
            actual: 0x34,
        };
        assert_eq!(
            error.to_string(),
            "MDB checksum mismatch: received=12 actual=34"
        );
    }

    #[test]
    fn test_timeout_error() {
        let error = HardwareError::timeout("mdb tx");
        assert!(error.is_timeout());
        assert_eq!(error.to_string(), "Timeout: mdb tx");
        assert!(!HardwareError::Nak.is_timeout());
    }

    #[test]
    fn test_mega_error_display() {
        let error = HardwareError::Mega {
            header: 0x82,
            data: vec![0x01],
        };
        assert_eq!(error.to_string(), "Coprocessor error header=82 data=[01]");
    }
}
