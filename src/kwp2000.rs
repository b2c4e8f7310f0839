//! KWP2000 diagnostic services
//!
//! Typed requests on top of [`DiagnosticTransport`] and classification of
//! the answer into positive, negative (with NRC), no response, or a
//! transport-level failure.

use crate::clock::Clock;
use crate::error::{ServiceError, TransportError};
use crate::transceiver::BusTransceiver;
use crate::transport::DiagnosticTransport;
use std::fmt;
use tracing::{debug, warn};

/// KWP2000 Service IDs
pub mod services {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const READ_ECU_IDENTIFICATION: u8 = 0x1A;
    pub const READ_DATA_BY_LOCAL_ID: u8 = 0x21;
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const WRITE_DATA_BY_ID: u8 = 0x2E;
    pub const IO_CONTROL_BY_LOCAL_ID: u8 = 0x30;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const WRITE_DATA_BY_LOCAL_ID: u8 = 0x3B;
    pub const TESTER_PRESENT: u8 = 0x3E;

    pub const NEGATIVE_RESPONSE: u8 = 0x7F;

    /// Positive response SID = request SID + 0x40
    pub const POSITIVE_OFFSET: u8 = 0x40;
}

/// Negative response code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nrc {
    GeneralReject,
    ServiceNotSupported,
    SubFunctionNotSupported,
    IncorrectMessageLength,
    ResponseTooLong,
    BusyRepeatRequest,
    ConditionsNotCorrect,
    RequestSequenceError,
    RequestOutOfRange,
    SecurityAccessDenied,
    InvalidKey,
    ExceededNumberOfAttempts,
    GeneralProgrammingFailure,
    ResponsePending,
    SubFunctionNotSupportedInActiveSession,
    ServiceNotSupportedInActiveSession,
    Other(u8),
}

impl Nrc {
    pub fn code(self) -> u8 {
        match self {
            Nrc::GeneralReject => 0x10,
            Nrc::ServiceNotSupported => 0x11,
            Nrc::SubFunctionNotSupported => 0x12,
            Nrc::IncorrectMessageLength => 0x13,
            Nrc::ResponseTooLong => 0x14,
            Nrc::BusyRepeatRequest => 0x21,
            Nrc::ConditionsNotCorrect => 0x22,
            Nrc::RequestSequenceError => 0x24,
            Nrc::RequestOutOfRange => 0x31,
            Nrc::SecurityAccessDenied => 0x33,
            Nrc::InvalidKey => 0x35,
            Nrc::ExceededNumberOfAttempts => 0x36,
            Nrc::GeneralProgrammingFailure => 0x72,
            Nrc::ResponsePending => 0x78,
            Nrc::SubFunctionNotSupportedInActiveSession => 0x7E,
            Nrc::ServiceNotSupportedInActiveSession => 0x7F,
            Nrc::Other(code) => code,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Nrc::GeneralReject => "generalReject",
            Nrc::ServiceNotSupported => "serviceNotSupported",
            Nrc::SubFunctionNotSupported => "subFunctionNotSupported",
            Nrc::IncorrectMessageLength => "incorrectMessageLength",
            Nrc::ResponseTooLong => "responseTooLong",
            Nrc::BusyRepeatRequest => "busyRepeatRequest",
            Nrc::ConditionsNotCorrect => "conditionsNotCorrect",
            Nrc::RequestSequenceError => "requestSequenceError",
            Nrc::RequestOutOfRange => "requestOutOfRange",
            Nrc::SecurityAccessDenied => "securityAccessDenied",
            Nrc::InvalidKey => "invalidKey",
            Nrc::ExceededNumberOfAttempts => "exceededNumberOfAttempts",
            Nrc::GeneralProgrammingFailure => "generalProgrammingFailure",
            Nrc::ResponsePending => "responsePending",
            Nrc::SubFunctionNotSupportedInActiveSession => "subFunctionNotSupportedInActiveSession",
            Nrc::ServiceNotSupportedInActiveSession => "serviceNotSupportedInActiveSession",
            Nrc::Other(_) => "unknown",
        }
    }
}

impl From<u8> for Nrc {
    fn from(code: u8) -> Self {
        match code {
            0x10 => Nrc::GeneralReject,
            0x11 => Nrc::ServiceNotSupported,
            0x12 => Nrc::SubFunctionNotSupported,
            0x13 => Nrc::IncorrectMessageLength,
            0x14 => Nrc::ResponseTooLong,
            0x21 => Nrc::BusyRepeatRequest,
            0x22 => Nrc::ConditionsNotCorrect,
            0x24 => Nrc::RequestSequenceError,
            0x31 => Nrc::RequestOutOfRange,
            0x33 => Nrc::SecurityAccessDenied,
            0x35 => Nrc::InvalidKey,
            0x36 => Nrc::ExceededNumberOfAttempts,
            0x72 => Nrc::GeneralProgrammingFailure,
            0x78 => Nrc::ResponsePending,
            0x7E => Nrc::SubFunctionNotSupportedInActiveSession,
            0x7F => Nrc::ServiceNotSupportedInActiveSession,
            other => Nrc::Other(other),
        }
    }
}

impl fmt::Display for Nrc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), self.code())
    }
}

/// Result of one service request
#[derive(Debug)]
pub enum ServiceOutcome {
    /// Positive response; data after the echoed SID and identifier
    Positive(Vec<u8>),
    Negative(Nrc),
    /// Nothing usable came back
    NoResponse,
    /// Something came back but broke the protocol, or reassembly gave up
    TransportError(TransportError),
}

impl ServiceOutcome {
    pub fn is_positive(&self) -> bool {
        matches!(self, ServiceOutcome::Positive(_))
    }

    pub fn data(&self) -> Option<&[u8]> {
        match self {
            ServiceOutcome::Positive(data) => Some(data),
            _ => None,
        }
    }

    /// Collapse into a `Result`, tagging failures with the request SID
    pub fn into_result(self, sid: u8) -> Result<Vec<u8>, ServiceError> {
        match self {
            ServiceOutcome::Positive(data) => Ok(data),
            ServiceOutcome::Negative(nrc) => Err(ServiceError::Negative {
                sid,
                code: nrc.code(),
                name: nrc.name(),
            }),
            ServiceOutcome::NoResponse => Err(ServiceError::NoResponse { sid }),
            ServiceOutcome::TransportError(e) => Err(ServiceError::Transport(e)),
        }
    }
}

impl fmt::Display for ServiceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceOutcome::Positive(data) => write!(f, "positive {:02X?}", data),
            ServiceOutcome::Negative(nrc) => write!(f, "NRC {}", nrc),
            ServiceOutcome::NoResponse => write!(f, "no response"),
            ServiceOutcome::TransportError(e) => write!(f, "transport error: {}", e),
        }
    }
}

/// Classify a reassembled response to `sid`.
///
/// `header_len` is the number of leading bytes of a positive response
/// (SID plus echoed identifier) stripped from the returned data.
pub fn classify(sid: u8, response: &[u8], header_len: usize) -> ServiceOutcome {
    match response.first() {
        Some(&services::NEGATIVE_RESPONSE) => {
            if response.len() < 3 {
                return ServiceOutcome::TransportError(TransportError::ProtocolViolation(format!(
                    "truncated negative response {:02X?}",
                    response
                )));
            }
            if response[1] != sid {
                return ServiceOutcome::TransportError(TransportError::ProtocolViolation(format!(
                    "negative response for SID 0x{:02X}, requested 0x{:02X}",
                    response[1], sid
                )));
            }
            ServiceOutcome::Negative(Nrc::from(response[2]))
        }
        Some(&first) if first == sid.wrapping_add(services::POSITIVE_OFFSET) => {
            if response.len() < header_len {
                return ServiceOutcome::TransportError(TransportError::ProtocolViolation(format!(
                    "positive response of {} bytes, expected at least {}",
                    response.len(),
                    header_len
                )));
            }
            ServiceOutcome::Positive(response[header_len..].to_vec())
        }
        _ => ServiceOutcome::TransportError(TransportError::ProtocolViolation(format!(
            "unexpected response {:02X?} to SID 0x{:02X}",
            response, sid
        ))),
    }
}

/// Typed KWP2000 requests
pub struct DiagnosticService<T, C> {
    transport: DiagnosticTransport<T, C>,
    max_pending_polls: u32,
}

impl<T: BusTransceiver, C: Clock> DiagnosticService<T, C> {
    pub fn new(transport: DiagnosticTransport<T, C>) -> Self {
        Self {
            transport,
            max_pending_polls: 5,
        }
    }

    /// Bound on re-polls while the ECU answers "response pending"
    pub fn with_max_pending_polls(mut self, polls: u32) -> Self {
        self.max_pending_polls = polls;
        self
    }

    pub fn transport(&self) -> &DiagnosticTransport<T, C> {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut DiagnosticTransport<T, C> {
        &mut self.transport
    }

    /// Send a request and classify the answer
    pub fn execute(&mut self, sid: u8, data: &[u8], header_len: usize) -> ServiceOutcome {
        let mut result = self.transport.request(sid, data);
        let mut pending_polls = 0;

        loop {
            let response = match result {
                Ok(response) => response,
                Err(e) if e.is_no_response() => {
                    debug!("SID 0x{:02X}: {}", sid, e);
                    return ServiceOutcome::NoResponse;
                }
                Err(e) => {
                    warn!("SID 0x{:02X}: {}", sid, e);
                    return ServiceOutcome::TransportError(e);
                }
            };

            let outcome = classify(sid, &response, header_len);
            match outcome {
                ServiceOutcome::Negative(Nrc::ResponsePending)
                    if pending_polls < self.max_pending_polls =>
                {
                    pending_polls += 1;
                    debug!("SID 0x{:02X}: response pending, poll {}", sid, pending_polls);
                    result = self.transport.receive();
                }
                outcome => return outcome,
            }
        }
    }

    /// ReadDataByLocalIdentifier (0x21)
    pub fn read_local_id(&mut self, lid: u8) -> ServiceOutcome {
        self.execute(services::READ_DATA_BY_LOCAL_ID, &[lid], 2)
    }

    /// ReadDataByIdentifier (0x22)
    pub fn read_by_id(&mut self, did: u16) -> ServiceOutcome {
        let [hi, lo] = did.to_be_bytes();
        self.execute(services::READ_DATA_BY_ID, &[hi, lo], 3)
    }

    /// WriteDataByIdentifier (0x2E); at most 3 data bytes fit a single frame
    pub fn write_by_id(&mut self, did: u16, data: &[u8]) -> ServiceOutcome {
        let [hi, lo] = did.to_be_bytes();
        let mut request = vec![hi, lo];
        request.extend_from_slice(data);
        self.execute(services::WRITE_DATA_BY_ID, &request, 3)
    }

    /// WriteDataByLocalIdentifier (0x3B)
    pub fn write_local_id(&mut self, lid: u8, data: &[u8]) -> ServiceOutcome {
        let mut request = vec![lid];
        request.extend_from_slice(data);
        self.execute(services::WRITE_DATA_BY_LOCAL_ID, &request, 2)
    }

    /// RoutineControl (0x31): sub-function, 16-bit routine id, options
    pub fn routine_control(&mut self, sub_function: u8, routine: u16, options: &[u8]) -> ServiceOutcome {
        let [hi, lo] = routine.to_be_bytes();
        let mut request = vec![sub_function, hi, lo];
        request.extend_from_slice(options);
        self.execute(services::ROUTINE_CONTROL, &request, 4)
    }

    /// SecurityAccess (0x27) seed request; returns the seed bytes
    pub fn security_access(&mut self, level: u8) -> ServiceOutcome {
        self.execute(services::SECURITY_ACCESS, &[level], 2)
    }

    /// SecurityAccess (0x27) key answer for the seed of `level`
    pub fn security_key(&mut self, level: u8, key: &[u8]) -> ServiceOutcome {
        let mut request = vec![level.wrapping_add(1)];
        request.extend_from_slice(key);
        self.execute(services::SECURITY_ACCESS, &request, 2)
    }

    /// DiagnosticSessionControl (0x10)
    pub fn session_control(&mut self, session: u8) -> ServiceOutcome {
        self.execute(services::DIAGNOSTIC_SESSION_CONTROL, &[session], 2)
    }

    /// TesterPresent (0x3E)
    pub fn tester_present(&mut self) -> ServiceOutcome {
        self.execute(services::TESTER_PRESENT, &[], 1)
    }

    /// ReadEcuIdentification (0x1A)
    pub fn read_ecu_identification(&mut self, option: u8) -> ServiceOutcome {
        self.execute(services::READ_ECU_IDENTIFICATION, &[option], 2)
    }

    /// InputOutputControlByLocalIdentifier (0x30)
    pub fn io_control_local_id(&mut self, lid: u8, control: &[u8]) -> ServiceOutcome {
        let mut request = vec![lid];
        request.extend_from_slice(control);
        self.execute(services::IO_CONTROL_BY_LOCAL_ID, &request, 2)
    }
}
