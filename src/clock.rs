//! Sample timestamps
//!
//! Producer and consumers must agree on one seconds-scaled monotonic clock so
//! timestamps stay comparable for downstream synchronization.

use std::fmt;
use std::sync::OnceLock;
use std::time::Instant;

pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in seconds
    fn now(&self) -> f64;
}

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Seconds since a process-wide monotonic epoch, fixed on first use
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> f64 {
        EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_clock_never_goes_backwards() {
        let clock = LocalClock;
        let mut last = clock.now();
        for _ in 0..1000 {
            let now = clock.now();
            assert!(now >= last);
            last = now;
        }
    }
}
