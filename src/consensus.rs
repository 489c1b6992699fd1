use std::sync::Mutex;

use crate::transport::{Barrier, BarrierWait, BARRIERFLAG_ANONYMOUS};

/// A synchronization point minted for one collective's IN or OUT
/// phase.
pub(crate) type ConsensusId = u32;

/// The consensus layer: sequences every team-wide synchronization
/// through the external split-phase barrier.
///
/// Each minted id owns two steps of the `current` counter: the even
/// step issues the notify, the odd step polls the wait. An id has
/// been reached once `current` has moved more than one step past the
/// doubled id; the signed-difference comparison keeps the predicate
/// correct across counter wrap.
pub(crate) struct Consensus {
    inner: Mutex<Counters>,
}

struct Counters {
    issued: u32,
    current: u32,
}

impl Consensus {
    pub fn new() -> Consensus {
        Consensus {
            inner: Mutex::new(Counters {
                issued: 0,
                current: 0,
            }),
        }
    }

    /// Mints the next synchronization point.
    pub fn create(&self) -> ConsensusId {
        let mut c = self.inner.lock().unwrap();
        let id = c.issued;
        c.issued = c.issued.wrapping_add(1);
        id
    }

    /// Advances the barrier pipeline on behalf of `id`; returns true
    /// once `id`'s barrier has completed. Debug builds run named
    /// (value-checked) barriers so a user-level ordering mismatch is
    /// caught; release builds run anonymous ones.
    pub fn try_reach(&self, id: ConsensusId, barrier: &dyn Barrier) -> bool {
        let mut c = self.inner.lock().unwrap();

        // Low bit of `current` is the barrier phase (notify vs wait).
        let tmp = id.wrapping_shl(1);
        let flags = if cfg!(debug_assertions) {
            0
        } else {
            BARRIERFLAG_ANONYMOUS
        };

        if tmp == c.current {
            // Exact match: notify and advance.
            c.current = c.current.wrapping_add(1);
            crate::engine::safe(barrier.notify(c.current, flags));
        }

        if c.current & 1 == 1 {
            // At a wait stage, so try the barrier.
            match barrier.try_wait(c.current, flags) {
                BarrierWait::Ready => c.current = c.current.wrapping_add(1),
                BarrierWait::Mismatch => {
                    panic!("named barrier mismatch detected in collectives")
                }
                BarrierWait::NotReady => {}
            }
        }

        (c.current.wrapping_sub(tmp) as i32) > 1
    }

    /// Count of synchronization points minted so far.
    #[cfg(any(test, feature = "stats"))]
    pub fn issued(&self) -> u32 {
        self.inner.lock().unwrap().issued
    }

    #[cfg(test)]
    pub fn preset(&self, issued: u32, current: u32) {
        let mut c = self.inner.lock().unwrap();
        c.issued = issued;
        c.current = current;
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Mutex;

    use super::*;
    use crate::transport::{Barrier, BarrierWait};

    /// A single-rank barrier: every notify completes on the next try.
    struct SoloBarrier {
        notified: Mutex<Vec<u32>>,
    }

    impl SoloBarrier {
        fn new() -> SoloBarrier {
            SoloBarrier {
                notified: Mutex::new(Vec::new()),
            }
        }
    }

    impl Barrier for SoloBarrier {
        fn notify(&self, value: u32, _flags: u32) -> io::Result<()> {
            self.notified.lock().unwrap().push(value);
            Ok(())
        }

        fn try_wait(&self, _value: u32, _flags: u32) -> BarrierWait {
            BarrierWait::Ready
        }

        fn wait(&self, _value: u32, _flags: u32) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn ids_reach_in_order() {
        let consensus = Consensus::new();
        let barrier = SoloBarrier::new();

        let a = consensus.create();
        let b = consensus.create();
        assert_ne!(a, b);

        // `b` cannot be reached before `a` has gone through.
        assert!(!consensus.try_reach(b, &barrier));
        assert!(consensus.try_reach(a, &barrier));
        assert!(consensus.try_reach(b, &barrier));

        // Reached ids stay reached.
        assert!(consensus.try_reach(a, &barrier));
        assert_eq!(consensus.issued(), 2);
        // Each reached id notified the external barrier exactly once.
        assert_eq!(barrier.notified.lock().unwrap().len(), 2);
    }

    #[test]
    fn wrap_around_does_not_falsely_match() {
        let consensus = Consensus::new();
        let barrier = SoloBarrier::new();

        // Counters parked just before the 2^31 id wrap point.
        consensus.preset(u32::MAX / 2, u32::MAX - 1);
        let id = consensus.create();
        assert_eq!(id, u32::MAX / 2);

        // A stale id from half a counter-space ago must not read as
        // reached.
        let stale = id.wrapping_add(1 << 30);
        assert!(!consensus.try_reach(stale, &barrier));

        assert!(consensus.try_reach(id, &barrier));
        let next = consensus.create();
        assert!(consensus.try_reach(next, &barrier));
    }
}
