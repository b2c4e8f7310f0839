//! Time source for bus timing, dwell timers and the cycle deadline
//!
//! Every wait in the stack goes through [`Clock`], so tests can run the
//! scheduler and the transport against a [`VirtualClock`] without real delays.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub trait Clock {
    /// Monotonic time since the clock was created
    fn now(&self) -> Duration;

    /// Block for `duration`
    fn sleep(&self, duration: Duration);

    fn sleep_ms(&self, ms: u64) {
        self.sleep(Duration::from_millis(ms));
    }

    fn sleep_us(&self, us: u64) {
        self.sleep(Duration::from_micros(us));
    }

    /// Deadline `timeout` from now
    fn deadline(&self, timeout: Duration) -> Duration {
        self.now() + timeout
    }

    /// Time left until `deadline`, zero once it has passed
    fn remaining(&self, deadline: Duration) -> Duration {
        deadline.saturating_sub(self.now())
    }
}

/// Wall clock with sleep-then-spin delays for sub-millisecond precision
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Sleep for the bulk of the delay, spin-wait only for the final stretch.
    /// Linux sleep is accurate to roughly a millisecond.
    #[cfg(not(target_os = "windows"))]
    fn precise_delay(duration: Duration) {
        let start = Instant::now();
        if duration > Duration::from_millis(2) {
            std::thread::sleep(duration - Duration::from_millis(1));
        }
        while start.elapsed() < duration {
            std::hint::spin_loop();
        }
    }

    /// Windows has ~15.6ms timer resolution, so short delays are pure spin
    #[cfg(target_os = "windows")]
    fn precise_delay(duration: Duration) {
        let start = Instant::now();
        if duration >= Duration::from_millis(20) {
            std::thread::sleep(duration - Duration::from_millis(5));
        }
        while start.elapsed() < duration {
            std::hint::spin_loop();
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            Self::precise_delay(duration);
        }
    }
}

/// Manually advanced clock; `sleep` moves time forward instantly.
///
/// Clones share the same time line.
#[derive(Debug, Clone, Default)]
pub struct VirtualClock {
    now: Rc<Cell<Duration>>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Duration {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Duration {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }
}
