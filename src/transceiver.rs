//! Physical LIN transceiver interface
//!
//! The protocol stack only needs a break + sync + PID header, single byte
//! transmission and a bounded read. How the waveform reaches the wire (UART
//! break, FTDI bit control, a simulated node) is up to the implementation.

use crate::error::TransceiverError;
use crate::frame::FrameId;
use std::time::Duration;

pub trait BusTransceiver {
    /// Drop anything sitting in the receive buffer
    fn purge_rx(&mut self) -> Result<(), TransceiverError>;

    /// Emit break (>= 13 dominant bit times), break delimiter, sync 0x55 and
    /// the protected identifier of `id`. Returns the PID sent.
    fn send_break_sync_id(&mut self, id: FrameId) -> Result<u8, TransceiverError>;

    fn send_byte(&mut self, byte: u8) -> Result<(), TransceiverError>;

    /// Read up to `max_len` bytes, returning whatever arrived before `timeout`.
    ///
    /// The half-duplex bus echoes the master's own header, so the returned
    /// stream normally starts with sync and PID.
    fn read_bytes(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransceiverError>;
}

impl<T: BusTransceiver + ?Sized> BusTransceiver for Box<T> {
    fn purge_rx(&mut self) -> Result<(), TransceiverError> {
        (**self).purge_rx()
    }

    fn send_break_sync_id(&mut self, id: FrameId) -> Result<u8, TransceiverError> {
        (**self).send_break_sync_id(id)
    }

    fn send_byte(&mut self, byte: u8) -> Result<(), TransceiverError> {
        (**self).send_byte(byte)
    }

    fn read_bytes(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransceiverError> {
        (**self).read_bytes(max_len, timeout)
    }
}

/// Break length in bit times; LIN requires at least 13
pub const BREAK_BIT_TIMES: u32 = 13;

/// Duration of `bits` bit times at `baud`
pub fn bit_times(bits: u32, baud: u32) -> Duration {
    Duration::from_micros(u64::from(bits) * 1_000_000 / u64::from(baud.max(1)))
}

/// What a raw-mode UART or FTDI chip reports for our own break: 0x00 with a framing error
pub(crate) const BREAK_BYTE: u8 = 0x00;

/// Capture buffer for one poll.
///
/// Break bytes ahead of the echoed sync are dropped so they neither shift the
/// frame nor take a slot the checksum needs.
pub(crate) struct RxBuffer {
    bytes: Vec<u8>,
    max_len: usize,
}

impl RxBuffer {
    pub(crate) fn new(max_len: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(max_len),
            max_len,
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.max_len - self.bytes.len()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.bytes.len() >= self.max_len
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) {
        for &byte in chunk {
            if self.bytes.is_empty() && byte == BREAK_BYTE {
                continue;
            }
            if self.is_full() {
                break;
            }
            self.bytes.push(byte);
        }
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ChecksumKind, Frame, SYNC_BYTE};

    #[test]
    fn test_break_length_at_19200_baud() {
        // 13 bits at 19200 baud = 677us
        assert_eq!(bit_times(BREAK_BIT_TIMES, 19_200), Duration::from_micros(677));
    }

    fn light_stream() -> Vec<u8> {
        let payload = [0x01, 0x00, 0x00, 0x00, 0x10, 0xEC, 0x00, 0x00];
        let mut stream = vec![BREAK_BYTE, SYNC_BYTE, FrameId::LIGHT.pid()];
        stream.extend_from_slice(&payload);
        stream.push(ChecksumKind::Enhanced.compute(FrameId::LIGHT, &payload));
        stream
    }

    #[test]
    fn test_break_byte_before_echo_dropped() {
        let stream = light_stream();
        let mut rx = RxBuffer::new(11);
        // arrives in pieces, break first
        rx.push(&stream[..1]);
        rx.push(&stream[1..5]);
        rx.push(&stream[5..]);
        assert!(rx.is_full());

        let bytes = rx.into_bytes();
        assert_eq!(bytes, stream[1..]);
        let frame = Frame::decode(FrameId::LIGHT, &bytes[2..], ChecksumKind::Enhanced.into()).unwrap();
        assert_eq!(frame.payload[4..6], [0x10, 0xEC]);
    }

    #[test]
    fn test_zero_data_bytes_kept_after_sync() {
        let mut rx = RxBuffer::new(11);
        rx.push(&[BREAK_BYTE, BREAK_BYTE, SYNC_BYTE, 0x3C, 0x00, 0x00]);
        assert_eq!(rx.into_bytes(), vec![SYNC_BYTE, 0x3C, 0x00, 0x00]);
    }

    #[test]
    fn test_capacity_respected() {
        let mut rx = RxBuffer::new(3);
        rx.push(&[SYNC_BYTE, 0x3C, 0x01, 0x02]);
        assert_eq!(rx.remaining(), 0);
        assert_eq!(rx.into_bytes(), vec![SYNC_BYTE, 0x3C, 0x01]);
    }
}
