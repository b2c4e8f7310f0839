//! Rain/light sensor signals
//!
//! Decoding of the three slave-response frames into a [`SensorSnapshot`] and
//! the BCM master command that keeps the sensor active.

use crate::frame::FrameId;
use serde::{Deserialize, Serialize};

/// Light reading mapped to 0 %
pub const LIGHT_PCT_LOW: u16 = 0xEC00;
/// Light reading mapped to 100 %
pub const LIGHT_PCT_HIGH: u16 = 0xEFFF;

/// Last known decoded values of every sensor frame.
///
/// Only successful receipts update it; a failed poll leaves the previous
/// values in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SensorSnapshot {
    /// 4-bit rolling counter of the light frame
    pub counter: u8,
    /// 16-bit forward light (little endian, bytes 4..5)
    pub light: u16,
    /// Solar / ambient intensity, raw
    pub solar: u8,
    pub temp_raw: u8,
    /// Secondary temperature (dew point), raw
    pub temp2_raw: u8,
    pub rain0: u8,
    pub rain1: u8,
    /// FIR LEDs active
    pub fir: bool,
    pub light_ok: bool,
    pub env_ok: bool,
    pub rain_ok: bool,
}

impl SensorSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a validated frame payload. Returns whether it was used.
    pub fn feed(&mut self, id: FrameId, data: &[u8]) -> bool {
        match id {
            FrameId::LIGHT if data.len() >= 6 => {
                self.counter = data[0] & 0x0F;
                self.light = u16::from_le_bytes([data[4], data[5]]);
                self.light_ok = true;
            }
            FrameId::ENVIRONMENT if data.len() >= 6 => {
                self.solar = data[0];
                self.temp_raw = data[2];
                self.temp2_raw = data[5];
                self.env_ok = true;
            }
            FrameId::RAIN if data.len() >= 2 => {
                self.rain0 = data[0];
                self.rain1 = data[1];
                self.fir = data[0] != 0 || data[1] != 0;
                self.rain_ok = true;
            }
            _ => return false,
        }
        true
    }

    /// Temperature in °C
    pub fn temperature(&self) -> f32 {
        raw_to_celsius(self.temp_raw)
    }

    /// Dew point in °C
    pub fn dew_point(&self) -> f32 {
        raw_to_celsius(self.temp2_raw)
    }

    pub fn light_pct(&self) -> u8 {
        light_pct(self.light)
    }

    /// One-line status summary
    pub fn line(&self) -> String {
        let mut parts = Vec::new();

        if self.light_ok {
            let pct = self.light_pct();
            let filled = usize::from(pct / 10);
            parts.push(format!(
                "Light {:3}% [{}{}] 0x{:04X}",
                pct,
                "#".repeat(filled),
                "-".repeat(10 - filled),
                self.light
            ));
        }
        if self.env_ok {
            parts.push(format!(
                "{:.1}C  Dew {:.1}C",
                self.temperature(),
                self.dew_point()
            ));
        }
        if self.rain_ok {
            if self.fir {
                parts.push(format!("Rain: ACTIVE({:02X},{:02X})", self.rain0, self.rain1));
            } else {
                parts.push("Rain: dry".to_string());
            }
        }

        if parts.is_empty() {
            "no data".to_string()
        } else {
            parts.join(" | ")
        }
    }
}

/// Temperature-like channel: raw * 0.5 - 40
pub fn raw_to_celsius(raw: u8) -> f32 {
    f32::from(raw) * 0.5 - 40.0
}

/// Light reading as 0..=100 between [`LIGHT_PCT_LOW`] and [`LIGHT_PCT_HIGH`]
pub fn light_pct(light: u16) -> u8 {
    if light <= LIGHT_PCT_LOW {
        return 0;
    }
    if light >= LIGHT_PCT_HIGH {
        return 100;
    }
    let span = u32::from(LIGHT_PCT_HIGH - LIGHT_PCT_LOW);
    (u32::from(light - LIGHT_PCT_LOW) * 100 / span) as u8
}

/// Wiper mode byte of the master command
fn wiper_mode(wiper: u8) -> u8 {
    match wiper {
        0 => 0x00,
        1 => 0x04,
        2 => 0x08,
        3 => 0x0C,
        _ => 0x04,
    }
}

/// BCM master command published on frame 0x20
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterCommand {
    /// Terminal 15 (ignition on)
    pub ignition: bool,
    /// Wiper stage 0..3; nonzero also sets the wiper-active bit
    pub wiper: u8,
    /// Rain sensitivity, clamped to 0..7
    pub sensitivity: u8,
}

impl Default for MasterCommand {
    fn default() -> Self {
        Self {
            ignition: true,
            wiper: 1,
            sensitivity: 2,
        }
    }
}

impl MasterCommand {
    pub fn new(ignition: bool, wiper: u8, sensitivity: u8) -> Self {
        Self {
            ignition,
            wiper,
            sensitivity,
        }
    }

    /// Command used to keep the sensor awake during diagnostics
    pub fn keepalive() -> [u8; 8] {
        [0x80, 0x04, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00]
    }

    pub fn payload(&self) -> [u8; 8] {
        let mut b0 = if self.ignition { 0x80 } else { 0x00 };
        if self.wiper != 0 {
            b0 |= 0x01;
        }
        [
            b0,
            wiper_mode(self.wiper),
            self.sensitivity.min(7),
            0x00,
            0x00,
            0x00,
            0x00,
            0x00,
        ]
    }
}
