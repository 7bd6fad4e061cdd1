//! Process-wide monotonic version clock.
//!
//! Every `Write` carries a `version`, a strictly monotonic 64-bit timestamp
//! (spec §3 invariant 1). The clock combines wall-clock microseconds with a
//! tie-breaking counter so that concurrent callers never observe the same
//! version twice, while the returned values still track real time closely
//! enough to be useful as "as of" timestamps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Generates globally unique, ascending version numbers.
///
/// One `Clock` is shared process-wide (spec §9: "the process-wide clock" is
/// a legitimate global), typically held behind an `Arc` or `once_cell`.
#[derive(Debug, Default)]
pub struct Clock {
    last: AtomicU64,
}

impl Clock {
    /// Create a new clock.
    pub fn new() -> Self {
        Clock {
            last: AtomicU64::new(0),
        }
    }

    /// Return the next version, guaranteed strictly greater than any
    /// previously returned value from this clock.
    pub fn tick(&self) -> u64 {
        let now = micros_since_epoch();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = if now > prev { now } else { prev + 1 };
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    /// The highest version issued so far (0 if none).
    pub fn current(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

fn micros_since_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn ticks_are_strictly_increasing() {
        let clock = Clock::new();
        let mut last = 0;
        for _ in 0..1000 {
            let v = clock.tick();
            assert!(v > last);
            last = v;
        }
    }

    #[test]
    fn concurrent_ticks_are_unique() {
        let clock = Arc::new(Clock::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let clock = Arc::clone(&clock);
            handles.push(thread::spawn(move || {
                (0..2000).map(|_| clock.tick()).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let n = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), n, "every version must be unique");
    }
}
