//! Reusable barrier with a deadline

use hfetch_common::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Round {
    arrived: usize,
    generation: u64,
}

/// Barrier for a fixed number of parties.
///
/// A party that gives up after its deadline withdraws from the current
/// round, so a round that never completes leaves nobody blocked.
#[derive(Debug)]
pub struct Rendezvous {
    parties: usize,
    round: Mutex<Round>,
    released: Condvar,
}

impl Rendezvous {
    #[must_use]
    pub fn new(parties: usize) -> Self {
        Self {
            parties: parties.max(1),
            round: Mutex::new(Round::default()),
            released: Condvar::new(),
        }
    }

    #[must_use]
    pub const fn parties(&self) -> usize {
        self.parties
    }

    /// Block until every party arrived or `timeout` elapsed.
    ///
    /// Fails with [`Error::Timeout`] when the round did not complete in
    /// time.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let mut round = self.round.lock();
        let generation = round.generation;
        round.arrived += 1;
        if round.arrived == self.parties {
            round.arrived = 0;
            round.generation += 1;
            self.released.notify_all();
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        while round.generation == generation {
            if self.released.wait_until(&mut round, deadline).timed_out()
                && round.generation == generation
            {
                round.arrived -= 1;
                return Err(Error::Timeout);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_releases_all_parties_every_round() {
        let rendezvous = Arc::new(Rendezvous::new(3));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let rendezvous = Arc::clone(&rendezvous);
                thread::spawn(move || {
                    for _ in 0..5 {
                        rendezvous.wait(Duration::from_secs(10)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_missing_party_times_out_and_withdraws() {
        let rendezvous = Rendezvous::new(2);
        let err = rendezvous.wait(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, Error::Timeout));

        // The withdrawn party does not count towards the next round.
        let rendezvous = Arc::new(rendezvous);
        let peer = {
            let rendezvous = Arc::clone(&rendezvous);
            thread::spawn(move || rendezvous.wait(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!peer.is_finished());
        rendezvous.wait(Duration::from_secs(10)).unwrap();
        peer.join().unwrap().unwrap();
    }

    #[test]
    fn test_single_party_never_blocks() {
        Rendezvous::new(1).wait(Duration::ZERO).unwrap();
    }
}
