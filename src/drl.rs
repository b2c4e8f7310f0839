//! Daytime running light decision
//!
//! Day/Night state machine on the forward light reading with separate
//! thresholds and dwell times in each direction.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrlConfig {
    /// Below this the light counts as dark
    pub dark: u16,
    /// Above this the light counts as bright
    pub bright: u16,
    /// Dark must persist this long before switching to Night
    pub night_dwell_ms: u64,
    /// Bright must persist this long before switching back to Day
    pub day_dwell_ms: u64,
}

impl Default for DrlConfig {
    fn default() -> Self {
        Self {
            dark: 0xEA00,
            bright: 0xEC00,
            night_dwell_ms: 3000,
            day_dwell_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DrlState {
    Day,
    Night,
}

impl fmt::Display for DrlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrlState::Day => write!(f, "DAY"),
            DrlState::Night => write!(f, "NIGHT"),
        }
    }
}

/// Transition waiting for its dwell time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PendingTransition {
    pub target: DrlState,
    /// Clock time of the first observation
    #[serde(skip)]
    pub since: Duration,
}

/// A completed state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: DrlState,
    pub to: DrlState,
}

#[derive(Debug, Clone)]
pub struct Drl {
    config: DrlConfig,
    state: DrlState,
    pending: Option<PendingTransition>,
}

impl Drl {
    pub fn new(config: DrlConfig) -> Self {
        Self {
            config,
            state: DrlState::Day,
            pending: None,
        }
    }

    pub fn state(&self) -> DrlState {
        self.state
    }

    pub fn pending(&self) -> Option<PendingTransition> {
        self.pending
    }

    /// Feed a light reading taken at `now`.
    ///
    /// The first reading past a threshold starts the dwell timer; a later
    /// reading at least one dwell after it commits the switch. A reading back
    /// on the current side cancels the pending switch.
    pub fn update(&mut self, light: u16, now: Duration) -> Option<Transition> {
        let wanted = match self.state {
            DrlState::Day if light < self.config.dark => {
                Some((DrlState::Night, self.config.night_dwell_ms))
            }
            DrlState::Night if light > self.config.bright => {
                Some((DrlState::Day, self.config.day_dwell_ms))
            }
            _ => None,
        };

        let Some((target, dwell_ms)) = wanted else {
            self.pending = None;
            return None;
        };

        match self.pending {
            Some(pending) if pending.target == target => {
                if now.saturating_sub(pending.since) >= Duration::from_millis(dwell_ms) {
                    let transition = Transition {
                        from: self.state,
                        to: target,
                    };
                    self.state = target;
                    self.pending = None;
                    info!(">>> DRL: {} -> {} <<<", transition.from, transition.to);
                    Some(transition)
                } else {
                    None
                }
            }
            _ => {
                self.pending = Some(PendingTransition { target, since: now });
                None
            }
        }
    }
}

impl Default for Drl {
    fn default() -> Self {
        Self::new(DrlConfig::default())
    }
}
