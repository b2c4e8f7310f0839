//! Error types for every layer of the LIN diagnostic stack
//!
//! Nothing below the service layer panics or aborts. Each failure is a value
//! the caller can inspect or retry.

use thiserror::Error;

/// Frame codec failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame id 0x{0:02X} does not fit in 6 bits")]
    InvalidId(u8),

    #[error("payload of {0} bytes exceeds the 8 byte LIN maximum")]
    PayloadTooLong(usize),

    #[error("frame too short: {0} bytes (need data + checksum)")]
    TooShort(usize),

    #[error("checksum mismatch: calculated 0x{expected:02X}, received 0x{received:02X}")]
    ChecksumMismatch { expected: u8, received: u8 },
}

/// Physical transceiver failures (port I/O, driver errors)
#[derive(Debug, Error)]
pub enum TransceiverError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("device error: {0}")]
    Device(String),
}

/// Bus transaction failures
#[derive(Debug, Error)]
pub enum LinError {
    #[error("no response on frame 0x{id:02X} within {timeout_ms}ms")]
    BusTimeout { id: u8, timeout_ms: u64 },

    #[error("PID 0x{pid:02X} not found in captured stream {raw:02X?}")]
    MissingPid { pid: u8, raw: Vec<u8> },

    #[error("short response after PID: {len} bytes")]
    ShortResponse { len: usize },

    #[error("checksum mismatch on frame 0x{id:02X}: calculated 0x{expected:02X}, received 0x{received:02X}")]
    ChecksumMismatch {
        id: u8,
        data: Vec<u8>,
        expected: u8,
        received: u8,
    },

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Transceiver(#[from] TransceiverError),
}

impl LinError {
    /// True for every failure callers treat as "nothing usable came back".
    ///
    /// A corrupted frame is handled exactly like a timeout.
    pub fn is_no_response(&self) -> bool {
        matches!(
            self,
            LinError::BusTimeout { .. }
                | LinError::MissingPid { .. }
                | LinError::ShortResponse { .. }
                | LinError::ChecksumMismatch { .. }
        )
    }
}

/// Diagnostic transport failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Bus(#[from] LinError),

    #[error("request of {0} bytes (SID + data) does not fit a single frame")]
    RequestTooLong(usize),

    #[error("response from NAD 0x{got:02X}, expected 0x{expected:02X}")]
    UnexpectedNad { expected: u8, got: u8 },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("reassembly gave up after {retries} unusable polls: {received}/{expected} bytes")]
    RetryExhausted {
        expected: usize,
        received: usize,
        retries: u32,
        partial: Vec<u8>,
    },
}

impl TransportError {
    /// True when the device never produced a usable answer.
    pub fn is_no_response(&self) -> bool {
        match self {
            TransportError::Bus(e) => e.is_no_response(),
            _ => false,
        }
    }
}

/// Service request that did not end in a positive response
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("SID 0x{sid:02X} rejected: {name} (0x{code:02X})")]
    Negative {
        sid: u8,
        code: u8,
        name: &'static str,
    },

    #[error("SID 0x{sid:02X}: no response")]
    NoResponse { sid: u8 },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Configuration loading/validation failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("{field}: {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_mismatch_counts_as_no_response() {
        let err = LinError::ChecksumMismatch {
            id: 0x23,
            data: vec![1, 2],
            expected: 0x10,
            received: 0x11,
        };
        assert!(err.is_no_response());
        assert!(TransportError::Bus(err).is_no_response());
    }

    #[test]
    fn test_protocol_violation_is_not_no_response() {
        let err = TransportError::UnexpectedNad {
            expected: 0x02,
            got: 0x7F,
        };
        assert!(!err.is_no_response());
        assert_eq!(err.to_string(), "response from NAD 0x7F, expected 0x02");
    }
}
