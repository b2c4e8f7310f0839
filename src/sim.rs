//! Simulated rain/light sensor
//!
//! A [`BusTransceiver`] that behaves like the sensor on the other end of the
//! wire: it echoes the master's bytes, answers the schedule frames and
//! serves diagnostic requests (measuring blocks, DIDs, coding) with single
//! or segmented responses. Lets the daemon run without hardware.

use crate::clock::Clock;
use crate::coding::{CODING_DID, DEFAULT_CODING};
use crate::error::TransceiverError;
use crate::frame::{ChecksumKind, FrameId, SYNC_BYTE};
use crate::kwp2000::services;
use crate::transceiver::BusTransceiver;
use crate::transport::{segment_response, ReassemblyStrategy, DEFAULT_NAD, FLOW_CONTROL_CTS};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

/// Broadcast NAD accepted by every node
const BROADCAST_NAD: u8 = 0x7F;

/// How the simulated forward light evolves over time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LightProfile {
    Constant { light: u16 },
    /// Triangle wave between `low` and `high`
    Ramp { low: u16, high: u16, period_ms: u64 },
}

impl LightProfile {
    pub fn day() -> Self {
        LightProfile::Constant { light: 0xEE00 }
    }

    pub fn night() -> Self {
        LightProfile::Constant { light: 0xE800 }
    }

    /// Slow day/night swing crossing both DRL thresholds
    pub fn dusk() -> Self {
        LightProfile::Ramp {
            low: 0xE800,
            high: 0xEE00,
            period_ms: 40_000,
        }
    }

    pub fn light_at(&self, now: Duration) -> u16 {
        match *self {
            LightProfile::Constant { light } => light,
            LightProfile::Ramp {
                low,
                high,
                period_ms,
            } => {
                let half = (period_ms / 2).max(1);
                let phase = (now.as_millis() as u64) % (half * 2);
                let span = u64::from(high.saturating_sub(low));
                let offset = if phase < half {
                    span * phase / half
                } else {
                    span * (2 * half - phase) / half
                };
                low.saturating_add(offset as u16)
            }
        }
    }
}

impl Default for LightProfile {
    fn default() -> Self {
        Self::day()
    }
}

/// Identification strings served on the ident DIDs
const IDENT: [(u16, &[u8]); 5] = [
    (0x0641, b"81A955555A"),
    (0x06A1, b"RLS-SIM-01"),
    (0x06D1, b"H03"),
    (0x0701, b"RLFSS 81A955555A SIM"),
    (0x0731, b"G397_RLFSS"),
];

pub struct SimulatedSensor<C> {
    clock: C,
    nad: u8,
    strategy: ReassemblyStrategy,
    profile: LightProfile,
    counter: u8,
    temp_raw: u8,
    temp2_raw: u8,
    solar: u8,
    rain_intensity: u8,
    wiper_active: bool,
    coding: [u8; 3],
    header: Option<FrameId>,
    master_bytes: Vec<u8>,
    rx: Vec<u8>,
    responses: VecDeque<[u8; 8]>,
    held_frames: Vec<[u8; 8]>,
    drop_polls: u32,
}

impl<C: Clock> SimulatedSensor<C> {
    pub fn new(clock: C, profile: LightProfile, strategy: ReassemblyStrategy) -> Self {
        Self {
            clock,
            nad: DEFAULT_NAD,
            strategy,
            profile,
            counter: 0,
            temp_raw: 0x6E,
            temp2_raw: 0x5A,
            solar: 0x40,
            rain_intensity: 0,
            wiper_active: false,
            coding: DEFAULT_CODING,
            header: None,
            master_bytes: Vec::new(),
            rx: Vec::new(),
            responses: VecDeque::new(),
            held_frames: Vec::new(),
            drop_polls: 0,
        }
    }

    /// Rain intensity reported while the wiper bit is set
    pub fn set_rain(&mut self, intensity: u8) {
        self.rain_intensity = intensity;
    }

    /// Stay silent on the next `polls` slave frames
    pub fn drop_next_polls(&mut self, polls: u32) {
        self.drop_polls = polls;
    }

    pub fn coding(&self) -> [u8; 3] {
        self.coding
    }

    fn light(&self) -> u16 {
        self.profile.light_at(self.clock.now())
    }

    /// Slave response for a schedule frame
    fn slave_payload(&mut self, id: FrameId) -> Option<Vec<u8>> {
        match id {
            FrameId::LIGHT => {
                self.counter = (self.counter + 1) & 0x0F;
                let [lo, hi] = self.light().to_le_bytes();
                Some(vec![0x10 | self.counter, 0x00, 0x00, 0x00, lo, hi, 0x00, 0x00])
            }
            FrameId::ENVIRONMENT => Some(vec![
                self.solar,
                0x00,
                self.temp_raw,
                0x00,
                0x00,
                self.temp2_raw,
                0x00,
                0x00,
            ]),
            FrameId::RAIN => {
                let rain = if self.wiper_active { self.rain_intensity } else { 0 };
                let flags = if rain > 0 { 0x01 } else { 0x00 };
                Some(vec![rain, flags, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00])
            }
            FrameId::DIAG_RESPONSE => self.responses.pop_front().map(|f| f.to_vec()),
            _ => None,
        }
    }

    fn handle_master_frame(&mut self, id: FrameId) {
        let Some((&checksum, data)) = self.master_bytes.split_last() else {
            return;
        };
        let kind = if id == FrameId::DIAG_REQUEST {
            ChecksumKind::Classic
        } else {
            ChecksumKind::Enhanced
        };
        if kind.compute(id, data) != checksum {
            debug!("SIM: bad checksum on {}", id);
            return;
        }
        let data = data.to_vec();

        match id {
            FrameId::MASTER_COMMAND => self.wiper_active = data[0] & 0x01 != 0,
            FrameId::DIAG_REQUEST => self.handle_diag(&data),
            _ => {}
        }
    }

    fn handle_diag(&mut self, frame: &[u8]) {
        if frame[0] != self.nad && frame[0] != BROADCAST_NAD {
            return;
        }

        if frame[1] == FLOW_CONTROL_CTS {
            self.responses.extend(self.held_frames.drain(..));
            return;
        }

        let len = usize::from(frame[1] & 0x0F);
        if frame[1] >> 4 != 0 || len == 0 || len > 6 {
            return;
        }
        let sid = frame[2];
        let data = &frame[3..2 + len];

        let message = self.service(sid, data);
        let mut frames = segment_response(self.nad, &message).into_iter();

        self.responses.clear();
        self.held_frames.clear();
        if let Some(first) = frames.next() {
            self.responses.push_back(first);
        }
        match self.strategy {
            ReassemblyStrategy::AutoStream => self.responses.extend(frames),
            ReassemblyStrategy::FlowControl { .. } => self.held_frames.extend(frames),
        }
    }

    fn service(&mut self, sid: u8, data: &[u8]) -> Vec<u8> {
        let negative = |nrc: u8| vec![services::NEGATIVE_RESPONSE, sid, nrc];
        let positive = sid.wrapping_add(services::POSITIVE_OFFSET);

        match (sid, data) {
            (services::READ_DATA_BY_LOCAL_ID, &[lid]) if lid < 0x20 => {
                let mut response = vec![positive, lid];
                response.extend(self.measuring_block(lid));
                response
            }
            (services::READ_DATA_BY_LOCAL_ID, &[_]) => negative(0x31),
            (services::READ_DATA_BY_ID, &[hi, lo]) => {
                let did = u16::from_be_bytes([hi, lo]);
                let value = if did == CODING_DID {
                    Some(self.coding.to_vec())
                } else {
                    IDENT
                        .iter()
                        .find(|(d, _)| *d == did)
                        .map(|(_, text)| text.to_vec())
                };
                match value {
                    Some(value) => {
                        let mut response = vec![positive, hi, lo];
                        response.extend(value);
                        response
                    }
                    None => negative(0x31),
                }
            }
            (services::WRITE_DATA_BY_ID, &[hi, lo, ref value @ ..]) => {
                if u16::from_be_bytes([hi, lo]) != CODING_DID {
                    negative(0x31)
                } else if let Ok(coding) = <[u8; 3]>::try_from(value) {
                    self.coding = coding;
                    vec![positive, hi, lo]
                } else {
                    negative(0x13)
                }
            }
            (services::DIAGNOSTIC_SESSION_CONTROL, &[session]) => vec![positive, session],
            (services::TESTER_PRESENT, _) => vec![positive],
            (services::READ_DATA_BY_LOCAL_ID | services::READ_DATA_BY_ID, _) => negative(0x13),
            _ => negative(0x11),
        }
    }

    /// Four `[0x87, hi, lo]` channels
    fn measuring_block(&self, lid: u8) -> Vec<u8> {
        // forward light mapped onto a 10-bit scale
        let level = (self.light().saturating_sub(0xE000) >> 2).min(1023);
        let (a, b) = match lid {
            0x02 | 0x08 => (level, level),
            0x07 => (1023 - level, 1023 - level),
            _ => {
                let v = u16::from(lid) << 4 | u16::from(self.counter);
                (v, v.wrapping_add(1))
            }
        };

        let mut block = Vec::with_capacity(12);
        for value in [a >> 8, a & 0xFF, b >> 8, b & 0xFF] {
            block.extend_from_slice(&[0x87, 0x00, value as u8]);
        }
        block
    }
}

impl<C: Clock> BusTransceiver for SimulatedSensor<C> {
    fn purge_rx(&mut self) -> Result<(), TransceiverError> {
        self.rx.clear();
        Ok(())
    }

    fn send_break_sync_id(&mut self, id: FrameId) -> Result<u8, TransceiverError> {
        let pid = id.pid();
        self.header = Some(id);
        self.master_bytes.clear();
        self.rx.extend_from_slice(&[SYNC_BYTE, pid]);
        Ok(pid)
    }

    fn send_byte(&mut self, byte: u8) -> Result<(), TransceiverError> {
        self.rx.push(byte);
        self.master_bytes.push(byte);

        let expected = match self.header {
            Some(FrameId::DIAG_REQUEST) | Some(FrameId::MASTER_COMMAND) => 9,
            _ => return Ok(()),
        };
        if self.master_bytes.len() == expected {
            if let Some(id) = self.header {
                self.handle_master_frame(id);
            }
        }
        Ok(())
    }

    fn read_bytes(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransceiverError> {
        let answer = match self.header {
            Some(_) if self.drop_polls > 0 => {
                self.drop_polls -= 1;
                None
            }
            Some(id) => self.slave_payload(id).map(|payload| {
                let checksum = if id == FrameId::DIAG_RESPONSE {
                    ChecksumKind::Classic
                } else {
                    ChecksumKind::Enhanced
                };
                let mut bytes = payload.clone();
                bytes.push(checksum.compute(id, &payload));
                bytes
            }),
            None => None,
        };

        match answer {
            Some(bytes) => self.rx.extend(bytes),
            None => self.clock.sleep(timeout),
        }

        let mut out = std::mem::take(&mut self.rx);
        out.truncate(max_len);
        Ok(out)
    }
}
