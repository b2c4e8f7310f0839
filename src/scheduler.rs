//! BCM master schedule
//!
//! Each cycle publishes the master command, polls the light and rain frames,
//! polls the environment frame every Nth cycle, then feeds the light value
//! into the DRL state machine. Cycles start on a fixed period measured from
//! deadlines, not from the end of the previous cycle.

use crate::clock::Clock;
use crate::drl::{Drl, DrlConfig, DrlState};
use crate::frame::{ChecksumKind, FrameId};
use crate::lin::LinBus;
use crate::sensor::{MasterCommand, SensorSnapshot};
use crate::transceiver::BusTransceiver;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub command_id: FrameId,
    pub light_id: FrameId,
    pub rain_id: FrameId,
    pub env_id: FrameId,
    pub command: MasterCommand,
    /// Target cycle period
    pub period_ms: u64,
    /// Environment frame polled on every Nth cycle
    pub env_divisor: u64,
    /// Pause between master command and first poll
    pub command_settle_ms: u64,
    /// Pause between slave polls
    pub poll_gap_ms: u64,
    pub frame_timeout_ms: u64,
    /// Sensor wake-up: light frame polls before giving up
    pub wake_attempts: u32,
    pub wake_timeout_ms: u64,
    pub wake_gap_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            command_id: FrameId::MASTER_COMMAND,
            light_id: FrameId::LIGHT,
            rain_id: FrameId::RAIN,
            env_id: FrameId::ENVIRONMENT,
            command: MasterCommand::default(),
            period_ms: 50,
            env_divisor: 5,
            command_settle_ms: 5,
            poll_gap_ms: 2,
            frame_timeout_ms: 50,
            wake_attempts: 10,
            wake_timeout_ms: 80,
            wake_gap_ms: 50,
        }
    }
}

/// Read-only view of one completed cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
    pub snapshot: SensorSnapshot,
    /// `None` until a light frame has been received
    pub drl: Option<DrlState>,
    pub drl_pending: Option<DrlState>,
    pub light_pct: u8,
    pub temperature: f32,
    pub dew_point: f32,
    /// Frames that answered in this cycle
    pub received: Vec<FrameId>,
    pub status: String,
}

impl CycleReport {
    /// Console line: `[STATE] status`
    pub fn line(&self) -> String {
        let state = self
            .drl
            .map_or_else(|| "???".to_string(), |s| s.to_string());
        format!("[{:<5}] {}", state, self.status)
    }
}

/// Consumer of cycle reports (console, websocket bridge, tests)
pub trait SnapshotObserver {
    fn on_cycle(&mut self, report: &CycleReport);
}

impl<F: FnMut(&CycleReport)> SnapshotObserver for F {
    fn on_cycle(&mut self, report: &CycleReport) {
        self(report)
    }
}

pub struct Scheduler<T, C> {
    bus: LinBus<T, C>,
    config: SchedulerConfig,
    snapshot: SensorSnapshot,
    drl: Drl,
    cycle: u64,
}

impl<T: BusTransceiver, C: Clock> Scheduler<T, C> {
    pub fn new(bus: LinBus<T, C>, config: SchedulerConfig, drl: DrlConfig) -> Self {
        Self {
            bus,
            config,
            snapshot: SensorSnapshot::new(),
            drl: Drl::new(drl),
            cycle: 0,
        }
    }

    pub fn snapshot(&self) -> &SensorSnapshot {
        &self.snapshot
    }

    pub fn drl(&self) -> &Drl {
        &self.drl
    }

    pub fn cycles(&self) -> u64 {
        self.cycle
    }

    pub fn bus(&self) -> &LinBus<T, C> {
        &self.bus
    }

    /// Poll the light frame until the sensor answers
    pub fn wake(&mut self) -> bool {
        let awake = self.bus.wait_for_frame(
            self.config.light_id,
            self.config.wake_attempts,
            self.config.wake_timeout_ms,
            self.config.wake_gap_ms,
        );
        if awake {
            info!("Sensor awake");
        } else {
            warn!(
                "Sensor did not answer {} after {} polls",
                self.config.light_id, self.config.wake_attempts
            );
        }
        awake
    }

    fn poll(&mut self, id: FrameId, received: &mut Vec<FrameId>) {
        match self.bus.recv(id, self.config.frame_timeout_ms) {
            Ok(data) => {
                if self.snapshot.feed(id, &data) {
                    received.push(id);
                }
            }
            Err(e) if e.is_no_response() => debug!("Poll {}: {}", id, e),
            Err(e) => warn!("Poll {}: {}", id, e),
        }
    }

    /// Run one schedule cycle without waiting for the period
    pub fn run_cycle(&mut self) -> CycleReport {
        let command = self.config.command.payload();
        if let Err(e) = self
            .bus
            .send(self.config.command_id, &command, ChecksumKind::Enhanced)
        {
            warn!("Master command failed: {}", e);
        }
        self.bus.clock().sleep_ms(self.config.command_settle_ms);

        let mut received = Vec::new();
        for id in [self.config.light_id, self.config.rain_id] {
            self.poll(id, &mut received);
            self.bus.clock().sleep_ms(self.config.poll_gap_ms);
        }

        if self.config.env_divisor > 0 && self.cycle % self.config.env_divisor == 0 {
            self.poll(self.config.env_id, &mut received);
        }

        let drl = if self.snapshot.light_ok {
            self.drl.update(self.snapshot.light, self.bus.clock().now());
            Some(self.drl.state())
        } else {
            None
        };

        let report = CycleReport {
            cycle: self.cycle,
            timestamp: Utc::now(),
            snapshot: self.snapshot.clone(),
            drl,
            drl_pending: self.drl.pending().map(|p| p.target),
            light_pct: self.snapshot.light_pct(),
            temperature: self.snapshot.temperature(),
            dew_point: self.snapshot.dew_point(),
            received,
            status: self.snapshot.line(),
        };

        self.cycle += 1;
        report
    }

    /// Run cycles on the configured period until `stop` is set.
    ///
    /// Returns the number of cycles run. The snapshot stays intact.
    pub fn run(&mut self, stop: &AtomicBool, observer: &mut dyn SnapshotObserver) -> u64 {
        let period = Duration::from_millis(self.config.period_ms);
        let start_cycle = self.cycle;
        let mut deadline = self.bus.clock().now();

        info!(
            "Schedule running: command {} [{:02X?}], period {}ms",
            self.config.command_id,
            self.config.command.payload(),
            self.config.period_ms
        );

        while !stop.load(Ordering::Relaxed) {
            deadline += period;

            let report = self.run_cycle();
            observer.on_cycle(&report);

            let clock = self.bus.clock();
            let remaining = clock.remaining(deadline);
            if remaining.is_zero() {
                debug!("Cycle {} overran its period", report.cycle);
                deadline = clock.now();
            } else {
                clock.sleep(remaining);
            }
        }

        let ran = self.cycle - start_cycle;
        info!("Stopped after {} cycles", ran);
        ran
    }
}
