//! LIN master and KWP2000-over-LIN diagnostics for rain/light sensors
//!
//! Layers, bottom up: frame codec, physical transceiver, LIN bus
//! transactions, diagnostic transport (SF/FF/CF), KWP2000 services, and the
//! BCM schedule with its DRL decision.

pub mod blocks;
pub mod clock;
pub mod coding;
pub mod config;
pub mod drl;
pub mod error;
pub mod frame;
#[cfg(feature = "ftdi")]
pub mod ftdi;
pub mod kwp2000;
pub mod lin;
pub mod scheduler;
pub mod sensor;
pub mod serial;
pub mod sim;
pub mod transceiver;
pub mod transport;
pub mod websocket;

#[cfg(test)]
mod testing;


pub use clock::{Clock, SystemClock};
pub use error::{LinError, TransportError};
pub use frame::{ChecksumKind, Frame, FrameId};
pub use kwp2000::{DiagnosticService, Nrc, ServiceOutcome};
pub use lin::LinBus;
pub use scheduler::{CycleReport, Scheduler, SnapshotObserver};
pub use transceiver::BusTransceiver;
pub use transport::{DiagnosticTransport, ReassemblyStrategy};
