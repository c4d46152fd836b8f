//! Per-replica logical timestamp vector.
//!
//! One slot per replica in the cluster. A replica bumps only its own slot
//! when accepting a client write; all other slots advance monotonically as
//! writes from those origins are learned through anti-entropy.

use std::fmt;

use crate::server::ReplicaId;
use crate::utils::BayouError;

use get_size::GetSize;

use serde::{Deserialize, Serialize};

/// Logical timestamp type (value of one version vector slot).
pub type LogicalTime = u64;

/// Version vector over all replicas in the cluster.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub struct VectorClock(Vec<LogicalTime>);

impl VectorClock {
    /// Creates a new all-zeros vector clock of given size.
    pub fn new(size: u8) -> Self {
        VectorClock(vec![0; size as usize])
    }

    /// Returns the number of slots.
    #[inline]
    pub fn size(&self) -> u8 {
        self.0.len() as u8
    }

    /// Gets the timestamp at given slot.
    pub fn get(&self, idx: ReplicaId) -> Result<LogicalTime, BayouError> {
        if idx as usize >= self.0.len() {
            return Err(BayouError(format!("slot {} out of bound", idx)));
        }
        Ok(self.0[idx as usize])
    }

    /// Increments the timestamp at given slot, returning the new value.
    pub fn inc(&mut self, idx: ReplicaId) -> Result<LogicalTime, BayouError> {
        if idx as usize >= self.0.len() {
            return Err(BayouError(format!("slot {} out of bound", idx)));
        }
        self.0[idx as usize] += 1;
        Ok(self.0[idx as usize])
    }

    /// Sets the timestamp at given slot. Fails if the new timestamp is
    /// smaller than what is currently stored; time never rewinds, so a buggy
    /// anti-entropy round cannot silently lose information.
    pub fn set(
        &mut self,
        idx: ReplicaId,
        time: LogicalTime,
    ) -> Result<(), BayouError> {
        if idx as usize >= self.0.len() {
            return Err(BayouError(format!("slot {} out of bound", idx)));
        }
        if time < self.0[idx as usize] {
            return Err(BayouError(format!(
                "clock rewind on slot {}: {} < {}",
                idx, time, self.0[idx as usize]
            )));
        }
        self.0[idx as usize] = time;
        Ok(())
    }

    /// Folds in another clock by pointwise maximum. The other clock is not
    /// modified.
    pub fn max(&mut self, other: &VectorClock) -> Result<(), BayouError> {
        if other.0.len() != self.0.len() {
            return Err(BayouError(format!(
                "size mismatch: {} != {}",
                other.0.len(),
                self.0.len()
            )));
        }
        for (slot, &time) in self.0.iter_mut().zip(other.0.iter()) {
            if time > *slot {
                *slot = time;
            }
        }
        Ok(())
    }

    /// True iff every slot of mine is >= the corresponding slot of the other
    /// clock. False on size mismatch.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        self.0.len() == other.0.len()
            && self.0.iter().zip(other.0.iter()).all(|(s, o)| s >= o)
    }

    /// True iff the other clock dominates mine and the two are not equal.
    /// False on size mismatch.
    pub fn strictly_less(&self, other: &VectorClock) -> bool {
        other.dominates(self) && self != other
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<")?;
        for (idx, time) in self.0.iter().enumerate() {
            if idx > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", time)?;
        }
        write!(f, ">")
    }
}

#[cfg(test)]
mod clock_tests {
    use super::*;

    fn from_slice(times: &[LogicalTime]) -> VectorClock {
        VectorClock(times.to_vec())
    }

    #[test]
    fn clock_inc() -> Result<(), BayouError> {
        let mut vc = VectorClock::new(4);
        assert_eq!(vc, from_slice(&[0, 0, 0, 0]));
        vc.inc(1)?;
        vc.inc(3)?;
        assert_eq!(vc.inc(3)?, 2);
        assert_eq!(vc, from_slice(&[0, 1, 0, 2]));
        assert!(vc.inc(4).is_err());
        Ok(())
    }

    #[test]
    fn clock_set() -> Result<(), BayouError> {
        let mut vc = from_slice(&[0, 1, 0, 2]);
        vc.set(0, 6)?;
        vc.set(1, 4)?;
        vc.set(2, 0)?;
        assert_eq!(vc, from_slice(&[6, 4, 0, 2]));
        // setting a smaller time must fail and leave the clock unchanged
        assert!(vc.set(1, 3).is_err());
        assert_eq!(vc, from_slice(&[6, 4, 0, 2]));
        Ok(())
    }

    #[test]
    fn clock_max() -> Result<(), BayouError> {
        let mut vc = from_slice(&[6, 4, 0, 2]);
        let other = from_slice(&[5, 5, 2, 2]);
        vc.max(&other)?;
        assert_eq!(vc, from_slice(&[6, 5, 2, 2]));
        // other must not be affected
        assert_eq!(other, from_slice(&[5, 5, 2, 2]));
        assert!(vc.max(&from_slice(&[1, 2, 3])).is_err());
        Ok(())
    }

    #[test]
    fn clock_ordering() {
        let vc = from_slice(&[6, 4, 0, 2]);
        let wrong_size = from_slice(&[0, 0, 0]);
        let greater = from_slice(&[6, 5, 0, 2]);
        let equal = from_slice(&[6, 4, 0, 2]);
        let less = from_slice(&[6, 3, 0, 2]);

        assert!(!wrong_size.strictly_less(&vc));
        assert!(!greater.strictly_less(&vc));
        assert!(!equal.strictly_less(&vc));
        assert!(less.strictly_less(&vc));

        assert!(vc.dominates(&less));
        assert!(vc.dominates(&equal));
        assert!(!vc.dominates(&greater));
        assert!(!vc.dominates(&wrong_size));
    }

    #[test]
    fn slots_nondecreasing() -> Result<(), BayouError> {
        // random valid inc/set/max sequences never decrease any slot
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let mut vc = VectorClock::new(5);
        for _ in 0..1000 {
            let before = vc.clone();
            match rng.gen_range(0..3) {
                0 => {
                    vc.inc(rng.gen_range(0..5))?;
                }
                1 => {
                    let idx = rng.gen_range(0..5);
                    let time = rng.gen_range(0..50);
                    let res = vc.set(idx, time);
                    if time < before.get(idx)? {
                        assert!(res.is_err());
                    }
                }
                _ => {
                    let mut other = VectorClock::new(5);
                    for idx in 0..5 {
                        other.set(idx, rng.gen_range(0..50))?;
                    }
                    vc.max(&other)?;
                }
            }
            assert!(vc.dominates(&before));
        }
        Ok(())
    }
}
