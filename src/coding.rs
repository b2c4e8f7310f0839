//! Sensor coding and identification
//!
//! Coding lives in DID 0x0611 as three bytes. Identification strings are
//! spread over five DIDs.

use crate::clock::Clock;
use crate::frame::hex_str;
use crate::kwp2000::{DiagnosticService, ServiceOutcome};
use crate::transceiver::BusTransceiver;
use serde::Serialize;
use tracing::{info, warn};

pub const CODING_DID: u16 = 0x0611;

/// Factory coding
pub const DEFAULT_CODING: [u8; 3] = [0x02, 0x00, 0x5D];

/// Identification DIDs with their meaning
pub const IDENT_DIDS: [(u16, &str); 5] = [
    (0x0641, "part number"),
    (0x06A1, "internal part"),
    (0x06D1, "hardware version"),
    (0x0701, "ident string"),
    (0x0731, "type"),
];

/// Printable ASCII, anything else shown as '.'
pub fn ascii(data: &[u8]) -> String {
    data.iter()
        .map(|&b| if (0x20..=0x7E).contains(&b) { b as char } else { '.' })
        .collect()
}

pub fn read_coding<T: BusTransceiver, C: Clock>(
    service: &mut DiagnosticService<T, C>,
) -> ServiceOutcome {
    let outcome = service.read_by_id(CODING_DID);
    if let ServiceOutcome::Positive(data) = &outcome {
        info!("Coding: [{}]", hex_str(data));
    }
    outcome
}

pub fn write_coding<T: BusTransceiver, C: Clock>(
    service: &mut DiagnosticService<T, C>,
    coding: [u8; 3],
) -> ServiceOutcome {
    let outcome = service.write_by_id(CODING_DID, &coding);
    match &outcome {
        ServiceOutcome::Positive(_) => info!("Coding written: [{}]", hex_str(&coding)),
        other => warn!("Coding write failed: {}", other),
    }
    outcome
}

pub fn restore_coding<T: BusTransceiver, C: Clock>(
    service: &mut DiagnosticService<T, C>,
) -> ServiceOutcome {
    write_coding(service, DEFAULT_CODING)
}

/// Parse a coding string like "02 00 5D" or "02005D"
pub fn parse_coding(text: &str) -> Option<[u8; 3]> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() != 6 {
        return None;
    }
    let mut coding = [0u8; 3];
    for (i, byte) in coding.iter_mut().enumerate() {
        *byte = u8::from_str_radix(digits.get(i * 2..i * 2 + 2)?, 16).ok()?;
    }
    Some(coding)
}

/// One identification DID as read from the sensor
#[derive(Debug, Clone, Serialize)]
pub struct IdentEntry {
    pub did: u16,
    pub label: &'static str,
    pub data: Option<Vec<u8>>,
}

impl IdentEntry {
    pub fn text(&self) -> Option<String> {
        self.data.as_deref().map(ascii)
    }
}

/// Identification DIDs plus the current coding
#[derive(Debug, Clone, Serialize)]
pub struct Identification {
    pub entries: Vec<IdentEntry>,
    pub coding: Option<Vec<u8>>,
}

pub fn read_identification<T: BusTransceiver, C: Clock>(
    service: &mut DiagnosticService<T, C>,
) -> Identification {
    let entries = IDENT_DIDS
        .iter()
        .map(|&(did, label)| IdentEntry {
            did,
            label,
            data: match service.read_by_id(did) {
                ServiceOutcome::Positive(data) => Some(data),
                other => {
                    warn!("DID 0x{:04X} ({}): {}", did, label, other);
                    None
                }
            },
        })
        .collect();

    let coding = match read_coding(service) {
        ServiceOutcome::Positive(data) => Some(data),
        _ => None,
    };

    Identification { entries, coding }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_rendering() {
        assert_eq!(ascii(b"81A955555A"), "81A955555A");
        assert_eq!(ascii(&[0x41, 0x00, 0x7F, 0x42]), "A..B");
    }

    #[test]
    fn test_parse_coding() {
        assert_eq!(parse_coding("02 00 5D"), Some([0x02, 0x00, 0x5D]));
        assert_eq!(parse_coding("02005d"), Some([0x02, 0x00, 0x5D]));
        assert_eq!(parse_coding("02 00"), None);
        assert_eq!(parse_coding("0G 00 5D"), None);
    }
}
