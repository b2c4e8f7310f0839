//! LIN Frame Codec
//!
//! Protected identifier computation, classic/enhanced checksums and the
//! data + checksum byte layout of a LIN frame response field.

use crate::error::FrameError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sync byte sent after every break
pub const SYNC_BYTE: u8 = 0x55;

/// Maximum LIN payload length
pub const MAX_PAYLOAD: usize = 8;

/// 6-bit LIN frame identifier (0-63)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct FrameId(u8);

impl FrameId {
    /// Master command frame of the BCM schedule
    pub const MASTER_COMMAND: FrameId = FrameId(0x20);
    /// Forward light sensor + rolling counter
    pub const LIGHT: FrameId = FrameId(0x23);
    /// Temperature, humidity, solar
    pub const ENVIRONMENT: FrameId = FrameId(0x29);
    /// FIR rain detection
    pub const RAIN: FrameId = FrameId(0x30);
    /// Diagnostic master request
    pub const DIAG_REQUEST: FrameId = FrameId(0x3C);
    /// Diagnostic slave response
    pub const DIAG_RESPONSE: FrameId = FrameId(0x3D);

    /// Build an id from any byte, keeping only the low 6 bits
    pub const fn masked(raw: u8) -> Self {
        Self(raw & 0x3F)
    }

    pub const fn value(self) -> u8 {
        self.0
    }

    /// Protected identifier of this frame id
    pub const fn pid(self) -> u8 {
        protected_id(self)
    }
}

impl TryFrom<u8> for FrameId {
    type Error = FrameError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        if raw > 0x3F {
            Err(FrameError::InvalidId(raw))
        } else {
            Ok(Self(raw))
        }
    }
}

impl From<FrameId> for u8 {
    fn from(id: FrameId) -> u8 {
        id.0
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

/// Protected Identifier: id | P0 << 6 | P1 << 7
///
/// P0 = b0 ^ b1 ^ b2 ^ b4, P1 = !(b1 ^ b3 ^ b4 ^ b5)
pub const fn protected_id(id: FrameId) -> u8 {
    let id = id.0;
    let p0 = (id ^ (id >> 1) ^ (id >> 2) ^ (id >> 4)) & 1;
    let p1 = !((id >> 1) ^ (id >> 3) ^ (id >> 4) ^ (id >> 5)) & 1;
    id | (p0 << 6) | (p1 << 7)
}

/// LIN checksum with end-around carry.
///
/// The running sum is folded by subtracting 255 whenever it exceeds 255
/// (not reduced modulo 256), then inverted. Seed is the PID for the enhanced
/// checksum and zero for the classic one.
pub fn checksum(data: &[u8], pid: Option<u8>) -> u8 {
    let mut sum = pid.map_or(0u16, u16::from);
    for &byte in data {
        sum += u16::from(byte);
        if sum > 255 {
            sum -= 255;
        }
    }
    !(sum as u8)
}

/// Checksum model of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumKind {
    /// LIN 1.x: data bytes only (diagnostic frames 0x3C/0x3D)
    Classic,
    /// LIN 2.x: PID + data bytes
    Enhanced,
}

impl ChecksumKind {
    pub fn compute(self, id: FrameId, data: &[u8]) -> u8 {
        match self {
            ChecksumKind::Classic => checksum(data, None),
            ChecksumKind::Enhanced => checksum(data, Some(id.pid())),
        }
    }
}

/// Which checksum a received frame must carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumRule {
    /// Accept only this kind
    Only(ChecksumKind),
    /// Try classic first, then enhanced
    Detect,
}

impl From<ChecksumKind> for ChecksumRule {
    fn from(kind: ChecksumKind) -> Self {
        ChecksumRule::Only(kind)
    }
}

/// A LIN frame: identifier, up to 8 data bytes and its checksum model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: FrameId,
    pub payload: Vec<u8>,
    pub checksum: ChecksumKind,
}

impl Frame {
    pub fn new(id: FrameId, payload: &[u8], checksum: ChecksumKind) -> Result<Self, FrameError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLong(payload.len()));
        }
        Ok(Self {
            id,
            payload: payload.to_vec(),
            checksum,
        })
    }

    pub fn pid(&self) -> u8 {
        self.id.pid()
    }

    pub fn checksum_byte(&self) -> u8 {
        self.checksum.compute(self.id, &self.payload)
    }

    /// Response field on the wire: data bytes followed by the checksum
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.payload.len() + 1);
        bytes.extend_from_slice(&self.payload);
        bytes.push(self.checksum_byte());
        bytes
    }

    /// Parse a response field (data + checksum) received for `id`
    pub fn decode(id: FrameId, bytes: &[u8], rule: ChecksumRule) -> Result<Self, FrameError> {
        let Some((&received, data)) = bytes.split_last() else {
            return Err(FrameError::TooShort(bytes.len()));
        };
        if data.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLong(data.len()));
        }

        let candidates: &[ChecksumKind] = match rule {
            ChecksumRule::Only(ChecksumKind::Classic) => &[ChecksumKind::Classic],
            ChecksumRule::Only(ChecksumKind::Enhanced) => &[ChecksumKind::Enhanced],
            ChecksumRule::Detect => &[ChecksumKind::Classic, ChecksumKind::Enhanced],
        };

        for &kind in candidates {
            if kind.compute(id, data) == received {
                return Ok(Self {
                    id,
                    payload: data.to_vec(),
                    checksum: kind,
                });
            }
        }

        Err(FrameError::ChecksumMismatch {
            expected: candidates[candidates.len() - 1].compute(id, data),
            received,
        })
    }
}

/// Format bytes as a space separated hex string
pub fn hex_str(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_of_diagnostic_frames() {
        assert_eq!(FrameId::DIAG_REQUEST.pid(), 0x3C);
        assert_eq!(FrameId::DIAG_RESPONSE.pid(), 0x7D);
    }

    #[test]
    fn test_pid_of_schedule_frames() {
        assert_eq!(FrameId::MASTER_COMMAND.pid(), 0x20);
        assert_eq!(FrameId::LIGHT.pid(), 0xA3);
        assert_eq!(FrameId::ENVIRONMENT.pid(), 0xE9);
        assert_eq!(FrameId::RAIN.pid(), 0xF0);
        assert_eq!(FrameId::masked(0x00).pid(), 0x80);
        assert_eq!(FrameId::masked(0x3F).pid(), 0xBF);
    }

    #[test]
    fn test_pid_keeps_id_bits_for_every_id() {
        for raw in 0..=0x3F {
            let id = FrameId::try_from(raw).unwrap();
            assert_eq!(id.pid() & 0x3F, raw);
        }
    }

    #[test]
    fn test_frame_id_range() {
        assert!(FrameId::try_from(0x3F).is_ok());
        assert_eq!(FrameId::try_from(0x40), Err(FrameError::InvalidId(0x40)));
        assert_eq!(FrameId::masked(0x7D), FrameId::DIAG_RESPONSE);
    }

    #[test]
    fn test_classic_checksum() {
        assert_eq!(checksum(&[0x01, 0x02, 0x03], None), 0xF9);
        assert_eq!(checksum(&[], None), 0xFF);
    }

    #[test]
    fn test_enhanced_checksum() {
        // seed 0x3C + 6 = 0x42, inverted
        assert_eq!(checksum(&[0x01, 0x02, 0x03], Some(0x3C)), 0xBD);
    }

    #[test]
    fn test_checksum_end_around_carry() {
        // 0xFF + 0x02 = 0x101 -> 0x02, not 0x01 as modulo 256 would give
        assert_eq!(checksum(&[0xFF, 0x02], None), !0x02u8);
        // LIN 2.x worked example
        assert_eq!(checksum(&[0x4A, 0x55, 0x93, 0xE5], None), 0xE6);
    }

    #[test]
    fn test_frame_round_trip() {
        let payloads: [&[u8]; 3] = [&[], &[0x80, 0x04, 0x02], &[0xFF; 8]];
        for payload in payloads {
            for kind in [ChecksumKind::Classic, ChecksumKind::Enhanced] {
                let frame = Frame::new(FrameId::LIGHT, payload, kind).unwrap();
                let wire = frame.encode();
                assert_eq!(wire.len(), payload.len() + 1);

                let decoded = Frame::decode(FrameId::LIGHT, &wire, kind.into()).unwrap();
                assert_eq!(decoded.payload, payload);
            }
        }
    }

    #[test]
    fn test_decode_detects_checksum_kind() {
        let frame = Frame::new(FrameId::LIGHT, &[0x10, 0x20], ChecksumKind::Enhanced).unwrap();
        let decoded = Frame::decode(FrameId::LIGHT, &frame.encode(), ChecksumRule::Detect).unwrap();
        assert_eq!(decoded.checksum, ChecksumKind::Enhanced);

        let frame = Frame::new(FrameId::LIGHT, &[0x10, 0x20], ChecksumKind::Classic).unwrap();
        let decoded = Frame::decode(FrameId::LIGHT, &frame.encode(), ChecksumRule::Detect).unwrap();
        assert_eq!(decoded.checksum, ChecksumKind::Classic);
    }

    #[test]
    fn test_diagnostic_frame_rejects_enhanced_checksum() {
        let frame =
            Frame::new(FrameId::DIAG_RESPONSE, &[0x02, 0x01, 0x7E], ChecksumKind::Enhanced).unwrap();
        let result = Frame::decode(
            FrameId::DIAG_RESPONSE,
            &frame.encode(),
            ChecksumKind::Classic.into(),
        );
        assert!(matches!(result, Err(FrameError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_frame_limits() {
        assert_eq!(
            Frame::new(FrameId::LIGHT, &[0; 9], ChecksumKind::Classic),
            Err(FrameError::PayloadTooLong(9))
        );
        assert_eq!(
            Frame::decode(FrameId::LIGHT, &[], ChecksumRule::Detect),
            Err(FrameError::TooShort(0))
        );
    }

    #[test]
    fn test_hex_str() {
        assert_eq!(hex_str(&[0x02, 0x00, 0x5D]), "02 00 5D");
        assert_eq!(hex_str(&[]), "");
    }
}
