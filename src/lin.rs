//! LIN Master Bus
//!
//! Master-side frame transactions on top of a [`BusTransceiver`]:
//! publishing master frames (header + data + checksum) and polling slave
//! responses (header, bounded read, PID alignment, checksum validation).

use crate::clock::Clock;
use crate::error::{FrameError, LinError};
use crate::frame::{ChecksumKind, ChecksumRule, Frame, FrameId, SYNC_BYTE};
use crate::transceiver::BusTransceiver;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Bus timing and capture parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinConfig {
    /// Bytes captured per slave poll: echoed sync + PID, 8 data, checksum
    pub rx_capacity: usize,
    /// Gap after every master frame (microseconds)
    pub inter_frame_gap_us: u64,
}

impl Default for LinConfig {
    fn default() -> Self {
        Self {
            rx_capacity: 11,
            inter_frame_gap_us: 300,
        }
    }
}

/// LIN master owning the transceiver and the time source
pub struct LinBus<T, C> {
    transceiver: T,
    clock: C,
    config: LinConfig,
}

impl<T: BusTransceiver, C: Clock> LinBus<T, C> {
    pub fn new(transceiver: T, clock: C, config: LinConfig) -> Self {
        Self {
            transceiver,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &LinConfig {
        &self.config
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn transceiver(&self) -> &T {
        &self.transceiver
    }

    pub fn transceiver_mut(&mut self) -> &mut T {
        &mut self.transceiver
    }

    /// Break + sync + PID after clearing stale receive data. Returns the PID.
    pub fn header(&mut self, id: FrameId) -> Result<u8, LinError> {
        self.transceiver.purge_rx()?;
        let pid = self.transceiver.send_break_sync_id(id)?;
        Ok(pid)
    }

    /// Publish a master frame: header, data bytes, checksum, inter-frame gap
    pub fn send(&mut self, id: FrameId, data: &[u8], checksum: ChecksumKind) -> Result<(), LinError> {
        let frame = Frame::new(id, data, checksum)?;
        self.send_frame(&frame)
    }

    pub fn send_frame(&mut self, frame: &Frame) -> Result<(), LinError> {
        self.header(frame.id)?;

        let bytes = frame.encode();
        debug!("TX {}: {:02X?}", frame.id, bytes);
        for byte in bytes {
            self.transceiver.send_byte(byte)?;
        }

        self.clock.sleep_us(self.config.inter_frame_gap_us);
        Ok(())
    }

    /// Poll a slave-response frame validated with the enhanced checksum
    pub fn recv(&mut self, id: FrameId, timeout_ms: u64) -> Result<Vec<u8>, LinError> {
        self.recv_with(id, timeout_ms, ChecksumKind::Enhanced.into())
            .map(|frame| frame.payload)
    }

    /// Poll a slave-response frame with an explicit checksum rule
    pub fn recv_with(
        &mut self,
        id: FrameId,
        timeout_ms: u64,
        rule: ChecksumRule,
    ) -> Result<Frame, LinError> {
        let pid = self.header(id)?;
        let raw = self
            .transceiver
            .read_bytes(self.config.rx_capacity, Duration::from_millis(timeout_ms))?;

        // Echoed sync + PID plus at least one byte, otherwise nothing answered
        if raw.len() < 3 {
            return Err(LinError::BusTimeout {
                id: id.value(),
                timeout_ms,
            });
        }

        let start = find_pid(&raw, pid).ok_or_else(|| LinError::MissingPid {
            pid,
            raw: raw.clone(),
        })?;

        let field = &raw[start + 1..];
        if field.len() < 2 {
            return Err(LinError::ShortResponse { len: field.len() });
        }

        let frame = Frame::decode(id, field, rule).map_err(|e| match e {
            FrameError::ChecksumMismatch { expected, received } => LinError::ChecksumMismatch {
                id: id.value(),
                data: field[..field.len() - 1].to_vec(),
                expected,
                received,
            },
            other => LinError::Frame(other),
        })?;

        debug!("RX {}: {:02X?}", id, frame.payload);
        Ok(frame)
    }

    /// Poll `id` until a valid frame arrives or `attempts` polls failed.
    ///
    /// Used to wait for a sensor to come out of sleep after power-up.
    pub fn wait_for_frame(&mut self, id: FrameId, attempts: u32, timeout_ms: u64, gap_ms: u64) -> bool {
        for attempt in 1..=attempts {
            match self.recv(id, timeout_ms) {
                Ok(_) => {
                    debug!("Frame {} answered after {} poll(s)", id, attempt);
                    return true;
                }
                Err(e) => debug!("Wake poll {} on {}: {}", attempt, id, e),
            }
            self.clock.sleep_ms(gap_ms);
        }
        false
    }
}

/// Locate the echoed PID in a captured stream.
///
/// Prefers the sync + PID pair so a PID equal to 0x55 (frame 0x15) is not
/// confused with the sync byte; falls back to the first PID byte.
fn find_pid(raw: &[u8], pid: u8) -> Option<usize> {
    raw.windows(2)
        .position(|w| w[0] == SYNC_BYTE && w[1] == pid)
        .map(|i| i + 1)
        .or_else(|| raw.iter().position(|&b| b == pid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::testing::{Reply, ScriptedTransceiver};

    fn bus() -> LinBus<ScriptedTransceiver, VirtualClock> {
        let clock = VirtualClock::new();
        LinBus::new(
            ScriptedTransceiver::new(clock.clone()),
            clock,
            LinConfig::default(),
        )
    }

    #[test]
    fn test_send_master_frame_layout() {
        let mut bus = bus();
        bus.send(FrameId::MASTER_COMMAND, &[0x81, 0x04, 0x02], ChecksumKind::Enhanced)
            .unwrap();

        let tx = &bus.transceiver().transmissions()[0];
        assert_eq!(tx.id, FrameId::MASTER_COMMAND);
        assert_eq!(tx.bytes[..3], [0x81, 0x04, 0x02]);
        assert_eq!(
            tx.bytes[3],
            crate::frame::checksum(&[0x81, 0x04, 0x02], Some(0x20))
        );
        assert_eq!(bus.transceiver().purges(), 1);
        assert_eq!(bus.clock().now(), Duration::from_micros(300));
    }

    #[test]
    fn test_classic_checksum_on_request() {
        let mut bus = bus();
        let data = [0x02, 0x02, 0x21, 0x01, 0xFF, 0xFF, 0xFF, 0xFF];
        bus.send(FrameId::DIAG_REQUEST, &data, ChecksumKind::Classic).unwrap();

        let tx = &bus.transceiver().transmissions()[0];
        assert_eq!(tx.bytes[8], crate::frame::checksum(&data, None));
    }

    #[test]
    fn test_recv_skips_echoed_header() {
        let mut bus = bus();
        let payload = [0x01, 0x00, 0x00, 0x00, 0x10, 0xEC, 0x00, 0x00];
        bus.transceiver_mut().push(
            FrameId::LIGHT,
            Reply::frame(&payload, ChecksumKind::Enhanced),
        );

        assert_eq!(bus.recv(FrameId::LIGHT, 50).unwrap(), payload);
    }

    #[test]
    fn test_recv_timeout() {
        let mut bus = bus();
        let err = bus.recv(FrameId::LIGHT, 50).unwrap_err();
        assert!(matches!(err, LinError::BusTimeout { id: 0x23, timeout_ms: 50 }));
        assert!(err.is_no_response());
        assert_eq!(bus.clock().now(), Duration::from_millis(50));
    }

    #[test]
    fn test_recv_checksum_mismatch_keeps_data() {
        let mut bus = bus();
        bus.transceiver_mut()
            .push(FrameId::LIGHT, Reply::frame(&[0x10, 0x20], ChecksumKind::Classic));

        match bus.recv(FrameId::LIGHT, 50) {
            Err(LinError::ChecksumMismatch { data, .. }) => assert_eq!(data, vec![0x10, 0x20]),
            other => panic!("expected checksum mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_recv_without_pid_marker() {
        let mut bus = bus();
        bus.transceiver_mut().set_echo(false);
        bus.transceiver_mut()
            .push(FrameId::LIGHT, Reply::Raw(vec![0x01, 0x02, 0x03, 0x04]));

        assert!(matches!(
            bus.recv(FrameId::LIGHT, 50),
            Err(LinError::MissingPid { pid: 0xA3, .. })
        ));
    }

    #[test]
    fn test_recv_short_payload() {
        let mut bus = bus();
        bus.transceiver_mut().push(FrameId::LIGHT, Reply::Raw(vec![0x5C]));

        assert!(matches!(
            bus.recv(FrameId::LIGHT, 50),
            Err(LinError::ShortResponse { len: 1 })
        ));
    }

    #[test]
    fn test_pid_equal_to_sync_byte() {
        let id = FrameId::masked(0x15);
        assert_eq!(id.pid(), SYNC_BYTE);

        let mut bus = bus();
        bus.transceiver_mut()
            .push(id, Reply::frame(&[0x55, 0x01], ChecksumKind::Enhanced));
        assert_eq!(bus.recv(id, 50).unwrap(), vec![0x55, 0x01]);
    }

    #[test]
    fn test_wait_for_frame() {
        let mut bus = bus();
        bus.transceiver_mut().push(FrameId::LIGHT, Reply::Silence);
        bus.transceiver_mut().push(FrameId::LIGHT, Reply::Silence);
        bus.transceiver_mut()
            .push(FrameId::LIGHT, Reply::frame(&[0; 8], ChecksumKind::Enhanced));

        assert!(bus.wait_for_frame(FrameId::LIGHT, 10, 80, 50));
        assert_eq!(bus.transceiver().transmissions().len(), 3);

        assert!(!bus.wait_for_frame(FrameId::LIGHT, 2, 80, 50));
    }
}
