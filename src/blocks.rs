//! Measuring blocks (local identifiers)
//!
//! A LID response carries four channels of `[formula, high, low]`. Channel
//! pairs split a 16-bit value across their low bytes:
//! `A = ch0.lo << 8 | ch1.lo`, `B = ch2.lo << 8 | ch3.lo`.

use crate::clock::Clock;
use crate::frame::{ChecksumKind, FrameId};
use crate::kwp2000::{DiagnosticService, ServiceOutcome};
use crate::sensor::MasterCommand;
use crate::transceiver::BusTransceiver;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Ambient light, decoded as (A + B) / 2
pub const AMBIENT_LID: u8 = 0x02;
/// Forward light, inverted: 1023 - (A + B) / 2
pub const FRONT_LID: u8 = 0x07;
/// Solar intensity, decoded as (A + B) / 2
pub const SOLAR_LID: u8 = 0x08;

/// LIDs whose raw channels move with the environment
pub const DYNAMIC_LIDS: [u8; 9] = [0x05, 0x09, 0x0A, 0x10, 0x11, 0x12, 0x13, 0x14, 0x15];

/// One measuring-block channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Channel {
    pub formula: u8,
    pub value: u16,
}

/// Split a LID payload into `[formula, hi, lo]` channels; a trailing partial
/// group is ignored
pub fn decode_channels(data: &[u8]) -> Vec<Channel> {
    data.chunks_exact(3)
        .map(|c| Channel {
            formula: c[0],
            value: u16::from_be_bytes([c[1], c[2]]),
        })
        .collect()
}

/// Combined values A and B of a four-channel block
pub fn combined_values(channels: &[Channel]) -> Option<(u16, u16)> {
    if channels.len() < 4 {
        return None;
    }
    let join = |hi: &Channel, lo: &Channel| (hi.value & 0xFF) << 8 | (lo.value & 0xFF);
    Some((join(&channels[0], &channels[1]), join(&channels[2], &channels[3])))
}

fn average(channels: &[Channel]) -> Option<u16> {
    combined_values(channels).map(|(a, b)| ((u32::from(a) + u32::from(b)) / 2) as u16)
}

/// Decoded value of the ambient, front or solar LID
pub fn decode_light(lid: u8, channels: &[Channel]) -> Option<i32> {
    let avg = i32::from(average(channels)?);
    match lid {
        AMBIENT_LID | SOLAR_LID => Some(avg),
        FRONT_LID => Some(1023 - avg),
        _ => None,
    }
}

/// Current value with its observed range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Tracked<V> {
    pub value: V,
    pub min: V,
    pub max: V,
}

impl<V: Copy + Ord> Tracked<V> {
    pub fn new(value: V) -> Self {
        Self {
            value,
            min: value,
            max: value,
        }
    }

    pub fn update(&mut self, value: V) {
        self.value = value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }
}

/// Raw channels of one LID across sweeps
#[derive(Debug, Clone, Serialize)]
pub struct ChannelTrack {
    pub channels: Vec<Tracked<u16>>,
    #[serde(skip)]
    previous: Option<Vec<u16>>,
}

impl ChannelTrack {
    fn new(values: &[u16]) -> Self {
        Self {
            channels: values.iter().copied().map(Tracked::new).collect(),
            previous: None,
        }
    }

    fn update(&mut self, values: &[u16]) {
        self.previous = Some(self.channels.iter().map(|t| t.value).collect());
        for (i, &v) in values.iter().enumerate() {
            match self.channels.get_mut(i) {
                Some(track) => track.update(v),
                None => self.channels.push(Tracked::new(v)),
            }
        }
    }

    /// Channel `index` differs from the previous sweep
    pub fn changed(&self, index: usize) -> bool {
        match (&self.previous, self.channels.get(index)) {
            (Some(prev), Some(track)) => prev.get(index).is_some_and(|&p| p != track.value),
            _ => false,
        }
    }
}

/// Live measuring-block sweep with min/max and change tracking
#[derive(Debug, Clone, Serialize)]
pub struct LidMonitor {
    lids: Vec<u8>,
    pub sweeps: u64,
    pub ambient: Option<Tracked<i32>>,
    pub front: Option<Tracked<i32>>,
    pub solar: Option<Tracked<i32>>,
    pub tracks: BTreeMap<u8, ChannelTrack>,
    #[serde(skip)]
    keepalive_settle_ms: u64,
    #[serde(skip)]
    lid_gap_ms: u64,
}

impl LidMonitor {
    /// Monitor `lids` (raw channels) plus the three decoded light LIDs
    pub fn new(lids: &[u8]) -> Self {
        Self {
            lids: lids.to_vec(),
            sweeps: 0,
            ambient: None,
            front: None,
            solar: None,
            tracks: BTreeMap::new(),
            keepalive_settle_ms: 5,
            lid_gap_ms: 2,
        }
    }

    /// Every LID 0x00..=0x1F
    pub fn full() -> Self {
        Self::new(&(0x00..0x20).collect::<Vec<u8>>())
    }

    pub fn lids(&self) -> &[u8] {
        &self.lids
    }

    /// Order of reads in one sweep: decoded LIDs first, then the rest
    fn read_order(&self) -> Vec<u8> {
        let mut order = vec![AMBIENT_LID, FRONT_LID, SOLAR_LID];
        for &lid in &self.lids {
            if !order.contains(&lid) {
                order.push(lid);
            }
        }
        order
    }

    /// Record one LID response
    pub fn record(&mut self, lid: u8, data: &[u8]) {
        let channels = decode_channels(data);

        if let Some(value) = decode_light(lid, &channels) {
            let slot = match lid {
                AMBIENT_LID => &mut self.ambient,
                FRONT_LID => &mut self.front,
                _ => &mut self.solar,
            };
            slot.get_or_insert_with(|| Tracked::new(value)).update(value);
        }

        if self.lids.contains(&lid) {
            let values: Vec<u16> = channels.iter().map(|c| c.value).collect();
            self.tracks
                .entry(lid)
                .and_modify(|t| t.update(&values))
                .or_insert_with(|| ChannelTrack::new(&values));
        }
    }

    /// Keep the sensor awake, then read every LID once
    pub fn sweep<T: BusTransceiver, C: Clock>(&mut self, service: &mut DiagnosticService<T, C>) {
        self.sweeps += 1;

        let bus = service.transport_mut().bus_mut();
        if let Err(e) = bus.send(
            FrameId::MASTER_COMMAND,
            &MasterCommand::keepalive(),
            ChecksumKind::Enhanced,
        ) {
            warn!("Keep-alive failed: {}", e);
        }
        bus.clock().sleep_ms(self.keepalive_settle_ms);

        for lid in self.read_order() {
            match service.read_local_id(lid) {
                ServiceOutcome::Positive(data) => self.record(lid, &data),
                other => debug!("LID 0x{:02X}: {}", lid, other),
            }
            service
                .transport()
                .bus()
                .clock()
                .sleep_ms(self.lid_gap_ms);
        }
    }
}

/// Read each LID once with `gap_ms` between reads.
///
/// `stop` is checked before every read so a scan of a silent sensor can be
/// cancelled. Returns how many LIDs were read.
pub fn scan_lids<T, C, F>(
    service: &mut DiagnosticService<T, C>,
    lids: &[u8],
    gap_ms: u64,
    stop: &AtomicBool,
    mut on_result: F,
) -> usize
where
    T: BusTransceiver,
    C: Clock,
    F: FnMut(u8, ServiceOutcome),
{
    let mut read = 0;
    for &lid in lids {
        if stop.load(Ordering::Relaxed) {
            debug!("LID scan stopped after {} reads", read);
            break;
        }
        let outcome = service.read_local_id(lid);
        read += 1;
        on_result(lid, outcome);
        service.transport().bus().clock().sleep_ms(gap_ms);
    }
    read
}

#[cfg(test)]
mod tests {
    use super::*;

    // ch0..ch3 = 0x0001, 0x00F4, 0x0001, 0x00FC
    const BLOCK: [u8; 12] = [
        0x87, 0x00, 0x01, 0x87, 0x00, 0xF4, 0x87, 0x00, 0x01, 0x87, 0x00, 0xFC,
    ];

    #[test]
    fn test_decode_channels() {
        let channels = decode_channels(&BLOCK);
        assert_eq!(channels.len(), 4);
        assert_eq!(channels[1], Channel { formula: 0x87, value: 0x00F4 });

        // trailing partial group dropped
        assert_eq!(decode_channels(&BLOCK[..8]).len(), 2);
    }

    #[test]
    fn test_combined_values() {
        let channels = decode_channels(&BLOCK);
        assert_eq!(combined_values(&channels), Some((0x01F4, 0x01FC)));
        assert_eq!(combined_values(&channels[..3]), None);
    }

    #[test]
    fn test_decode_light_lids() {
        let channels = decode_channels(&BLOCK);
        // (500 + 508) / 2 = 504
        assert_eq!(decode_light(AMBIENT_LID, &channels), Some(504));
        assert_eq!(decode_light(SOLAR_LID, &channels), Some(504));
        assert_eq!(decode_light(FRONT_LID, &channels), Some(1023 - 504));
        assert_eq!(decode_light(0x05, &channels), None);
    }

    #[test]
    fn test_monitor_tracks_range_and_changes() {
        let mut monitor = LidMonitor::new(&[0x05]);
        monitor.record(0x05, &[0x87, 0x00, 0x10, 0x87, 0x00, 0x20]);
        monitor.record(0x05, &[0x87, 0x00, 0x08, 0x87, 0x00, 0x20]);

        let track = &monitor.tracks[&0x05];
        assert_eq!(track.channels[0], Tracked { value: 0x08, min: 0x08, max: 0x10 });
        assert!(track.changed(0));
        assert!(!track.changed(1));
    }

    #[test]
    fn test_monitor_decodes_light_without_tracking_raw() {
        let mut monitor = LidMonitor::new(&DYNAMIC_LIDS);
        monitor.record(AMBIENT_LID, &BLOCK);
        assert_eq!(monitor.ambient.map(|t| t.value), Some(504));
        assert!(monitor.tracks.is_empty());
    }

    #[test]
    fn test_read_order() {
        let monitor = LidMonitor::new(&[0x07, 0x05]);
        assert_eq!(monitor.read_order(), vec![0x02, 0x07, 0x08, 0x05]);
        assert_eq!(LidMonitor::full().lids().len(), 32);
    }
}
