//! Booleans bitmap over replica IDs, used e.g. for tracking the set of
//! currently connected peers.

use std::fmt;

use crate::server::ReplicaId;
use crate::utils::BayouError;

/// Compact booleans bitmap indexed by replica ID.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Bitmap {
    size: u8,
    flags: Vec<bool>,
}

impl Bitmap {
    /// Creates a new bitmap of given size, with all flags set to `ones`.
    pub fn new(size: u8, ones: bool) -> Self {
        if size == 0 {
            panic!("invalid bitmap size {}", size);
        }
        Bitmap {
            size,
            flags: vec![ones; size as usize],
        }
    }

    /// Sets the flag at given index.
    pub fn set(&mut self, idx: ReplicaId, flag: bool) -> Result<(), BayouError> {
        if idx >= self.size {
            return Err(BayouError(format!("index {} out of bound", idx)));
        }
        self.flags[idx as usize] = flag;
        Ok(())
    }

    /// Gets the flag at given index.
    pub fn get(&self, idx: ReplicaId) -> Result<bool, BayouError> {
        if idx >= self.size {
            return Err(BayouError(format!("index {} out of bound", idx)));
        }
        Ok(self.flags[idx as usize])
    }

    /// Returns the size of the bitmap.
    #[inline]
    pub fn size(&self) -> u8 {
        self.size
    }

    /// Returns the number of flags currently set true.
    #[inline]
    pub fn count(&self) -> u8 {
        self.flags.iter().filter(|&&f| f).count() as u8
    }

    /// Iterates over the IDs whose flag is set true.
    pub fn iter_ones(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.flags
            .iter()
            .enumerate()
            .filter(|(_, &f)| f)
            .map(|(i, _)| i as ReplicaId)
    }
}

impl fmt::Display for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}; [", self.size)?;
        let mut first = true;
        for id in self.iter_ones() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}", id)?;
            first = false;
        }
        write!(f, "]}}")
    }
}

#[cfg(test)]
mod bitmap_tests {
    use super::*;

    #[test]
    #[should_panic]
    fn bitmap_new_empty() {
        Bitmap::new(0, true);
    }

    #[test]
    fn bitmap_set_get() -> Result<(), BayouError> {
        let mut map = Bitmap::new(7, false);
        map.set(0, true)?;
        map.set(1, true)?;
        map.set(2, true)?;
        map.set(1, false)?;
        assert!(map.set(7, true).is_err());
        assert!(map.get(0)?);
        assert!(!map.get(1)?);
        assert!(map.get(2)?);
        assert!(!map.get(3)?);
        assert!(map.get(8).is_err());
        Ok(())
    }

    #[test]
    fn bitmap_count() -> Result<(), BayouError> {
        let mut map = Bitmap::new(7, false);
        assert_eq!(map.count(), 0);
        map.set(0, true)?;
        map.set(2, true)?;
        map.set(3, true)?;
        assert_eq!(map.count(), 3);
        Ok(())
    }

    #[test]
    fn bitmap_iter() -> Result<(), BayouError> {
        let ref_map = [true, true, false, true, true];
        let mut map = Bitmap::new(5, true);
        map.set(2, false)?;
        for id in map.iter_ones() {
            assert!(ref_map[id as usize]);
        }
        Ok(())
    }
}
