//! Global sequence numbers and clock

use hfetch_common::HTime;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic counter shared by all servers
#[derive(Debug, Default)]
pub struct GlobalSequence {
    next: AtomicU64,
}

impl GlobalSequence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Next value; the first call returns 1
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Microsecond clock shared by all servers
#[derive(Debug)]
pub struct GlobalClock {
    epoch: Instant,
}

impl GlobalClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Microseconds since the clock was created
    #[must_use]
    pub fn now(&self) -> HTime {
        u64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}

impl Default for GlobalClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_sequence_unique_across_threads() {
        let seq = Arc::new(GlobalSequence::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let seq = Arc::clone(&seq);
                thread::spawn(move || (0..250).map(|_| seq.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for v in handle.join().unwrap() {
                assert!(seen.insert(v));
            }
        }
        assert_eq!(seen.len(), 1000);
        assert!(!seen.contains(&0));
    }

    #[test]
    fn test_clock_monotonic() {
        let clock = GlobalClock::new();
        let a = clock.now();
        thread::sleep(std::time::Duration::from_millis(2));
        let b = clock.now();
        assert!(b > a);
    }
}
