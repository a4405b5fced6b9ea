// Time source for the polling loops (readiness probe, exit wait)
use std::fmt;
use std::time::{Duration, Instant};

/// Where polling loops read the time and wait between attempts
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Block the calling thread between two polls
    fn sleep(&self, duration: Duration);
}

impl fmt::Debug for dyn Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Clock")
    }
}

/// Wall-clock time and real `thread::sleep`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
