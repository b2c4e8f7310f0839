//! Diagnostic transport over LIN (frames 0x3C / 0x3D)
//!
//! Requests go out as a single frame on the master request frame:
//! `[NAD, PCI, SID, data.., 0xFF padding]`. Responses are polled on the slave
//! response frame and may be a Single Frame or a First Frame followed by
//! Consecutive Frames. Both frames use the classic checksum.
//!
//! Two device profiles exist for multi-frame responses:
//! - auto-stream: the slave pushes CFs by itself, the master only polls
//! - flow-control: the master answers the FF with `[NAD, 0x30, BS, STmin]`

use crate::clock::Clock;
use crate::error::{LinError, TransportError};
use crate::frame::{ChecksumKind, FrameId};
use crate::lin::LinBus;
use crate::transceiver::BusTransceiver;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Node address of the rain/light sensor
pub const DEFAULT_NAD: u8 = 0x02;

/// Unused bytes of a diagnostic frame
pub const PADDING: u8 = 0xFF;

/// SID + data bytes that fit a single-frame request
pub const MAX_REQUEST_LEN: usize = 6;

/// Largest length a First Frame can announce (12 bits)
pub const MAX_MESSAGE_LEN: usize = 0x0FFF;

/// Flow control "continue to send"
pub const FLOW_CONTROL_CTS: u8 = 0x30;

/// Data bytes carried by a First Frame
const FF_DATA_LEN: usize = 5;

/// Data bytes carried by a Consecutive Frame
const CF_DATA_LEN: usize = 6;

/// How the slave delivers the frames after a First Frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum ReassemblyStrategy {
    /// Slave streams CFs unprompted
    AutoStream,
    /// Master sends a Flow Control frame before polling CFs
    FlowControl { block_size: u8, st_min: u8 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub nad: u8,
    pub strategy: ReassemblyStrategy,
    /// Unusable polls tolerated in a row while reassembling
    pub max_retries: u32,
    /// Wait between request and first response poll
    pub request_gap_ms: u64,
    pub response_timeout_ms: u64,
    pub cf_timeout_ms: u64,
    /// Backoff after a poll that returned nothing
    pub retry_backoff_ms: u64,
    /// Pause after each accepted CF
    pub cf_gap_ms: u64,
    /// Pause between the FF and our Flow Control frame
    pub fc_lead_ms: u64,
    /// Pause after the Flow Control frame before the first CF poll
    pub fc_settle_ms: u64,
}

impl TransportConfig {
    /// Profile of the observed sensor: CFs arrive without flow control
    pub fn auto_stream() -> Self {
        Self {
            nad: DEFAULT_NAD,
            strategy: ReassemblyStrategy::AutoStream,
            max_retries: 20,
            request_gap_ms: 15,
            response_timeout_ms: 100,
            cf_timeout_ms: 120,
            retry_backoff_ms: 5,
            cf_gap_ms: 2,
            fc_lead_ms: 2,
            fc_settle_ms: 5,
        }
    }

    /// Classic ISO-TP style profile: clear-to-send, no block limit, no STmin
    pub fn flow_control() -> Self {
        Self {
            strategy: ReassemblyStrategy::FlowControl {
                block_size: 0,
                st_min: 0,
            },
            max_retries: 30,
            ..Self::auto_stream()
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::auto_stream()
    }
}

/// Protocol control information of a diagnostic frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pci {
    SingleFrame { len: usize },
    FirstFrame { total: usize },
    ConsecutiveFrame { seq: u8 },
    FlowControl { status: u8 },
}

/// One parsed frame from the response channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticResponse {
    pub nad: u8,
    pub pci: Pci,
    /// Message bytes carried by this frame
    pub fragment: Vec<u8>,
}

impl DiagnosticResponse {
    pub fn parse(frame: &[u8]) -> Result<Self, TransportError> {
        if frame.len() < 2 {
            return Err(TransportError::ProtocolViolation(format!(
                "diagnostic frame of {} bytes",
                frame.len()
            )));
        }

        let nad = frame[0];
        let pci_byte = frame[1];
        let low = pci_byte & 0x0F;

        let (pci, fragment) = match pci_byte >> 4 {
            0x0 => {
                let len = usize::from(low);
                if len == 0 || len > frame.len() - 2 {
                    return Err(TransportError::ProtocolViolation(format!(
                        "single frame length {} in {}-byte frame",
                        len,
                        frame.len()
                    )));
                }
                (Pci::SingleFrame { len }, frame[2..2 + len].to_vec())
            }
            0x1 => {
                let Some(&len_low) = frame.get(2) else {
                    return Err(TransportError::ProtocolViolation(
                        "first frame without length byte".into(),
                    ));
                };
                let total = usize::from(low) << 8 | usize::from(len_low);
                (Pci::FirstFrame { total }, frame[3..].to_vec())
            }
            0x2 => (Pci::ConsecutiveFrame { seq: low }, frame[2..].to_vec()),
            0x3 => (Pci::FlowControl { status: pci_byte }, frame[2..].to_vec()),
            other => {
                return Err(TransportError::ProtocolViolation(format!(
                    "unknown PCI type 0x{:X}",
                    other
                )))
            }
        };

        Ok(Self { nad, pci, fragment })
    }
}

/// Multi-frame response being collected
#[derive(Debug, Clone)]
pub struct Reassembly {
    nad: u8,
    total_length: usize,
    collected: Vec<u8>,
    retries_remaining: u32,
    max_retries: u32,
}

impl Reassembly {
    /// Start from a First Frame; its data bytes seed the buffer
    pub fn new(nad: u8, total_length: usize, first: &[u8], max_retries: u32) -> Self {
        let mut collected = Vec::with_capacity(total_length.max(first.len()));
        collected.extend_from_slice(first);
        Self {
            nad,
            total_length,
            collected,
            retries_remaining: max_retries,
            max_retries,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.collected.len() >= self.total_length
    }

    pub fn is_exhausted(&self) -> bool {
        self.retries_remaining == 0
    }

    pub fn retries_remaining(&self) -> u32 {
        self.retries_remaining
    }

    pub fn received(&self) -> usize {
        self.collected.len().min(self.total_length)
    }

    /// Offer a polled frame. Returns whether it was taken as the next CF.
    ///
    /// Frames from another NAD or with a non-CF PCI count as unusable polls;
    /// the transport backs off only after a foreign NAD, a wrong PCI type from
    /// our node is re-polled at once. Sequence numbers are not checked; data
    /// is appended in arrival order.
    pub fn accept(&mut self, frame: &[u8]) -> bool {
        if frame.len() < 2 || frame[0] != self.nad || frame[1] >> 4 != 0x2 {
            debug!("Dropped frame during reassembly: {:02X?}", frame);
            self.reject();
            return false;
        }

        self.collected.extend_from_slice(&frame[2..]);
        self.retries_remaining = self.max_retries;
        true
    }

    /// Count one unusable poll
    pub fn reject(&mut self) {
        self.retries_remaining = self.retries_remaining.saturating_sub(1);
    }

    /// The message truncated to the announced length, or the partial data
    pub fn finish(mut self) -> Result<Vec<u8>, TransportError> {
        if self.is_complete() {
            self.collected.truncate(self.total_length);
            Ok(self.collected)
        } else {
            Err(TransportError::RetryExhausted {
                expected: self.total_length,
                received: self.collected.len(),
                retries: self.max_retries,
                partial: self.collected,
            })
        }
    }
}

/// Split a response message into the frames a slave sends for it
pub fn segment_response(nad: u8, message: &[u8]) -> Vec<[u8; 8]> {
    let mut frames = Vec::new();
    let len = message.len().min(MAX_MESSAGE_LEN);
    let message = &message[..len];

    if len <= CF_DATA_LEN {
        let mut frame = [PADDING; 8];
        frame[0] = nad;
        frame[1] = len as u8;
        frame[2..2 + len].copy_from_slice(message);
        frames.push(frame);
        return frames;
    }

    let mut first = [PADDING; 8];
    first[0] = nad;
    first[1] = 0x10 | ((len >> 8) as u8 & 0x0F);
    first[2] = (len & 0xFF) as u8;
    first[3..].copy_from_slice(&message[..FF_DATA_LEN]);
    frames.push(first);

    for (i, chunk) in message[FF_DATA_LEN..].chunks(CF_DATA_LEN).enumerate() {
        let mut frame = [PADDING; 8];
        frame[0] = nad;
        frame[1] = 0x20 | ((i + 1) as u8 & 0x0F);
        frame[2..2 + chunk.len()].copy_from_slice(chunk);
        frames.push(frame);
    }

    frames
}

/// Diagnostic request/response exchange on top of a [`LinBus`]
pub struct DiagnosticTransport<T, C> {
    bus: LinBus<T, C>,
    config: TransportConfig,
}

impl<T: BusTransceiver, C: Clock> DiagnosticTransport<T, C> {
    pub fn new(bus: LinBus<T, C>, config: TransportConfig) -> Self {
        Self { bus, config }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn bus(&self) -> &LinBus<T, C> {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut LinBus<T, C> {
        &mut self.bus
    }

    /// Send `sid` + `data` and return the reassembled response message
    pub fn request(&mut self, sid: u8, data: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.send_request(sid, data)?;
        self.bus.clock().sleep_ms(self.config.request_gap_ms);
        self.receive()
    }

    /// Transmit a single-frame request without waiting for the answer
    pub fn send_request(&mut self, sid: u8, data: &[u8]) -> Result<(), TransportError> {
        let len = 1 + data.len();
        if len > MAX_REQUEST_LEN {
            return Err(TransportError::RequestTooLong(len));
        }

        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&[self.config.nad, len as u8, sid]);
        payload.extend_from_slice(data);
        self.send_padded(&payload)
    }

    /// Poll the response channel and collect one complete message
    pub fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        let frame = self.poll(self.config.response_timeout_ms)?;
        let response = DiagnosticResponse::parse(&frame)?;

        if response.nad != self.config.nad {
            return Err(TransportError::UnexpectedNad {
                expected: self.config.nad,
                got: response.nad,
            });
        }

        match response.pci {
            Pci::SingleFrame { .. } => Ok(response.fragment),
            Pci::FirstFrame { total } => self.reassemble(total, &response.fragment),
            other => Err(TransportError::ProtocolViolation(format!(
                "expected single or first frame, got {:?}",
                other
            ))),
        }
    }

    /// Exchange one raw 8-byte frame: send on 0x3C, poll 0x3D once.
    ///
    /// No PCI handling; the returned bytes are the response frame as is.
    pub fn raw(&mut self, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.send_padded(payload)?;
        self.bus.clock().sleep_ms(self.config.request_gap_ms);
        Ok(self.poll(self.config.response_timeout_ms)?)
    }

    fn reassemble(&mut self, total: usize, first: &[u8]) -> Result<Vec<u8>, TransportError> {
        debug!("First frame: {} bytes announced", total);
        let mut state = Reassembly::new(self.config.nad, total, first, self.config.max_retries);

        if state.is_complete() {
            return state.finish();
        }

        if let ReassemblyStrategy::FlowControl { block_size, st_min } = self.config.strategy {
            self.bus.clock().sleep_ms(self.config.fc_lead_ms);
            self.send_padded(&[self.config.nad, FLOW_CONTROL_CTS, block_size, st_min])?;
            self.bus.clock().sleep_ms(self.config.fc_settle_ms);
        }

        while !state.is_complete() && !state.is_exhausted() {
            match self.poll(self.config.cf_timeout_ms) {
                Ok(frame) => {
                    if state.accept(&frame) {
                        self.bus.clock().sleep_ms(self.config.cf_gap_ms);
                    } else if frame.first() != Some(&self.config.nad) {
                        // another node's answer: back off as after a silent poll
                        self.bus.clock().sleep_ms(self.config.retry_backoff_ms);
                    }
                }
                Err(e) if e.is_no_response() => {
                    state.reject();
                    self.bus.clock().sleep_ms(self.config.retry_backoff_ms);
                }
                Err(e) => return Err(e.into()),
            }
        }

        if !state.is_complete() {
            warn!(
                "Reassembly exhausted: {}/{} bytes after {} retries",
                state.received(),
                total,
                self.config.max_retries
            );
        }
        state.finish()
    }

    fn poll(&mut self, timeout_ms: u64) -> Result<Vec<u8>, LinError> {
        self.bus
            .recv_with(FrameId::DIAG_RESPONSE, timeout_ms, ChecksumKind::Classic.into())
            .map(|frame| frame.payload)
    }

    fn send_padded(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let mut frame = [PADDING; 8];
        let len = payload.len().min(8);
        frame[..len].copy_from_slice(&payload[..len]);
        self.bus
            .send(FrameId::DIAG_REQUEST, &frame, ChecksumKind::Classic)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::lin::LinConfig;
    use crate::testing::{Reply, ScriptedTransceiver};
    use std::time::Duration;

    fn transport(config: TransportConfig) -> DiagnosticTransport<ScriptedTransceiver, VirtualClock> {
        let clock = VirtualClock::new();
        let bus = LinBus::new(
            ScriptedTransceiver::new(clock.clone()),
            clock,
            LinConfig::default(),
        );
        DiagnosticTransport::new(bus, config)
    }

    fn script(t: &mut DiagnosticTransport<ScriptedTransceiver, VirtualClock>, frames: &[[u8; 8]]) {
        for frame in frames {
            t.bus_mut().transceiver_mut().push_diag(*frame);
        }
    }

    fn message(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn test_request_layout() {
        let mut t = transport(TransportConfig::default());
        script(&mut t, &[[0x02, 0x03, 0x61, 0x01, 0xAB, 0xFF, 0xFF, 0xFF]]);

        t.request(0x21, &[0x01]).unwrap();

        let sent = t.bus().transceiver().sent_on(FrameId::DIAG_REQUEST);
        assert_eq!(sent, vec![vec![0x02, 0x02, 0x21, 0x01, 0xFF, 0xFF, 0xFF, 0xFF]]);
    }

    #[test]
    fn test_request_too_long_is_not_sent() {
        let mut t = transport(TransportConfig::default());
        let err = t.request(0x2E, &[0x06, 0x11, 0x02, 0x00, 0x5D, 0x00]).unwrap_err();

        assert!(matches!(err, TransportError::RequestTooLong(7)));
        assert!(t.bus().transceiver().transmissions().is_empty());
    }

    #[test]
    fn test_single_frame_response() {
        let mut t = transport(TransportConfig::default());
        script(&mut t, &[[0x02, 0x03, 0x61, 0x01, 0xAB, 0xFF, 0xFF, 0xFF]]);

        assert_eq!(t.request(0x21, &[0x01]).unwrap(), vec![0x61, 0x01, 0xAB]);
    }

    #[test]
    fn test_wrong_nad_fails_without_retry() {
        let mut t = transport(TransportConfig::default());
        script(&mut t, &[[0x05, 0x03, 0x61, 0x01, 0xAB, 0xFF, 0xFF, 0xFF]]);

        let err = t.request(0x21, &[0x01]).unwrap_err();
        assert!(matches!(
            err,
            TransportError::UnexpectedNad { expected: 0x02, got: 0x05 }
        ));
        // one request header + one poll, nothing more
        assert_eq!(t.bus().transceiver().transmissions().len(), 2);
    }

    #[test]
    fn test_no_response() {
        let mut t = transport(TransportConfig::default());
        let err = t.request(0x21, &[0x01]).unwrap_err();
        assert!(err.is_no_response());
    }

    #[test]
    fn test_consecutive_frame_as_first_response_is_violation() {
        let mut t = transport(TransportConfig::default());
        script(&mut t, &[[0x02, 0x21, 1, 2, 3, 4, 5, 6]]);

        assert!(matches!(
            t.request(0x21, &[0x01]),
            Err(TransportError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_first_frame_plus_one_cf() {
        let mut t = transport(TransportConfig::default());
        script(
            &mut t,
            &[
                [0x02, 0x10, 0x0A, 0x61, 0x02, 0x87, 0x00, 0x12],
                [0x02, 0x21, 0x87, 0x00, 0x34, 0x87, 0xFF, 0xFF],
            ],
        );

        let response = t.request(0x21, &[0x02]).unwrap();
        assert_eq!(
            response,
            vec![0x61, 0x02, 0x87, 0x00, 0x12, 0x87, 0x00, 0x34, 0x87, 0xFF]
        );
        // auto-stream never sends flow control
        assert_eq!(t.bus().transceiver().sent_on(FrameId::DIAG_REQUEST).len(), 1);
    }

    #[test]
    fn test_reassembly_lengths() {
        for len in [7, 11, 12, 17, 100, 255, 256, MAX_MESSAGE_LEN] {
            let msg = message(len);
            let mut t = transport(TransportConfig::default());
            script(&mut t, &segment_response(DEFAULT_NAD, &msg));

            assert_eq!(t.receive().unwrap(), msg, "length {}", len);
        }
    }

    #[test]
    fn test_first_frame_complete_on_its_own() {
        let mut t = transport(TransportConfig::flow_control());
        script(&mut t, &[[0x02, 0x10, 0x04, 0x61, 0x01, 0x02, 0x03, 0xFF]]);

        assert_eq!(t.receive().unwrap(), vec![0x61, 0x01, 0x02, 0x03]);
        assert!(t.bus().transceiver().sent_on(FrameId::DIAG_REQUEST).is_empty());
    }

    #[test]
    fn test_flow_control_frame_after_first_frame() {
        let msg = message(20);
        let mut t = transport(TransportConfig::flow_control());
        script(&mut t, &segment_response(DEFAULT_NAD, &msg));

        assert_eq!(t.request(0x21, &[0x05]).unwrap(), msg);

        let sent = t.bus().transceiver().sent_on(FrameId::DIAG_REQUEST);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1], vec![0x02, 0x30, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF]);

        let headers = t.bus().transceiver().header_ids();
        // request, FF poll, flow control, then CF polls
        assert_eq!(headers[2], FrameId::DIAG_REQUEST);
        assert!(headers[3..].iter().all(|&id| id == FrameId::DIAG_RESPONSE));
    }

    #[test]
    fn test_foreign_frames_dropped_and_counted() {
        let msg = message(11);
        let frames = segment_response(DEFAULT_NAD, &msg);
        let mut t = transport(TransportConfig::default());

        script(&mut t, &frames[..1]);
        script(&mut t, &[[0x07, 0x21, 0, 0, 0, 0, 0, 0]]); // other node
        script(&mut t, &[[0x02, 0x03, 0x61, 0, 0, 0xFF, 0xFF, 0xFF]]); // not a CF
        t.bus_mut().transceiver_mut().push(FrameId::DIAG_RESPONSE, Reply::Silence);
        script(&mut t, &frames[1..]);

        assert_eq!(t.receive().unwrap(), msg);
    }

    #[test]
    fn test_backoff_after_foreign_nad_only() {
        let msg = message(11);
        let frames = segment_response(DEFAULT_NAD, &msg);
        let mut t = transport(TransportConfig::default());

        script(&mut t, &frames[..1]);
        script(&mut t, &[[0x07, 0x21, 0, 0, 0, 0, 0, 0]]);
        script(&mut t, &[[0x02, 0x03, 0x61, 0, 0, 0xFF, 0xFF, 0xFF]]);
        script(&mut t, &frames[1..]);

        assert_eq!(t.receive().unwrap(), msg);

        // polls: FF, foreign NAD, wrong type, CF
        let at: Vec<Duration> = t
            .bus()
            .transceiver()
            .transmissions()
            .iter()
            .map(|tx| tx.at)
            .collect();
        assert_eq!(at.len(), 4);
        assert_eq!(at[2] - at[1], Duration::from_millis(5));
        assert_eq!(at[3] - at[2], Duration::ZERO);
    }

    #[test]
    fn test_retry_exhaustion_returns_partial() {
        let msg = message(20);
        let frames = segment_response(DEFAULT_NAD, &msg);
        let mut t = transport(TransportConfig::default());
        script(&mut t, &frames[..2]);

        match t.receive() {
            Err(TransportError::RetryExhausted {
                expected,
                received,
                retries,
                partial,
            }) => {
                assert_eq!(expected, 20);
                assert_eq!(received, 11);
                assert_eq!(retries, 20);
                assert_eq!(partial, msg[..11]);
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }

        // FF poll, one accepted CF, then 20 failed polls
        assert_eq!(t.bus().transceiver().header_ids().len(), 22);
    }

    #[test]
    fn test_reassembly_counter_resets_on_accept() {
        let mut state = Reassembly::new(0x02, 17, &[1, 2, 3, 4, 5], 3);
        state.reject();
        state.reject();
        assert_eq!(state.retries_remaining(), 1);

        assert!(state.accept(&[0x02, 0x21, 6, 7, 8, 9, 10, 11]));
        assert_eq!(state.retries_remaining(), 3);

        assert!(!state.accept(&[0x02, 0x10, 0, 0, 0, 0, 0, 0]));
        assert_eq!(state.retries_remaining(), 2);
        assert!(!state.is_complete());
    }

    #[test]
    fn test_raw_exchange() {
        let mut t = transport(TransportConfig::default());
        script(&mut t, &[[0x02, 0x02, 0x7E, 0x00, 0xFF, 0xFF, 0xFF, 0xFF]]);

        let response = t.raw(&[0x02, 0x01, 0x3E]).unwrap();
        assert_eq!(response, vec![0x02, 0x02, 0x7E, 0x00, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_parse_pci() {
        let ff = DiagnosticResponse::parse(&[0x02, 0x1F, 0xFF, 1, 2, 3, 4, 5]).unwrap();
        assert_eq!(ff.pci, Pci::FirstFrame { total: 4095 });
        assert_eq!(ff.fragment, vec![1, 2, 3, 4, 5]);

        let fc = DiagnosticResponse::parse(&[0x02, 0x30, 0x00, 0x00]).unwrap();
        assert_eq!(fc.pci, Pci::FlowControl { status: 0x30 });

        assert!(DiagnosticResponse::parse(&[0x02, 0x07, 1, 2]).is_err());
        assert!(DiagnosticResponse::parse(&[0x02, 0x40, 0]).is_err());
    }

    #[test]
    fn test_segment_response() {
        let frames = segment_response(0x02, &[0x61, 0x01, 0xAB]);
        assert_eq!(frames, vec![[0x02, 0x03, 0x61, 0x01, 0xAB, 0xFF, 0xFF, 0xFF]]);

        let frames = segment_response(0x02, &message(10));
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0][1..3], [0x10, 0x0A]);
        assert_eq!(frames[1][1], 0x21);
        assert_eq!(frames[1][7], PADDING);
    }
}
