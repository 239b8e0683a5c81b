//! Harmonic sets.
//!
//! A [`HarmonicSet`] is a bitmask over `1..=MAX_HARMONIC`. Iteration is always
//! in ascending order, which also defines the storage slot of each harmonic
//! inside the component accumulators.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Highest harmonic a Q-vector can carry.
pub const MAX_HARMONIC: u32 = 15;

/// Set of harmonics, stored as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<u32>", into = "Vec<u32>")]
pub struct HarmonicSet {
    mask: u32,
}

impl HarmonicSet {
    /// Empty set.
    pub const fn empty() -> Self {
        Self { mask: 0 }
    }

    /// Build a set from a list of harmonics. Duplicates are ignored.
    pub fn new(harmonics: &[u32]) -> Result<Self> {
        let mut set = Self::empty();
        for &h in harmonics {
            set.insert(h)?;
        }
        Ok(set)
    }

    /// Add one harmonic.
    pub fn insert(&mut self, h: u32) -> Result<()> {
        if h == 0 || h > MAX_HARMONIC {
            return Err(Error::Structural(format!(
                "harmonic {h} outside the supported range 1..={MAX_HARMONIC}"
            )));
        }
        self.mask |= 1 << h;
        Ok(())
    }

    /// Whether `h` belongs to the set.
    pub fn contains(&self, h: u32) -> bool {
        h <= MAX_HARMONIC && self.mask & (1 << h) != 0
    }

    /// Number of harmonics in the set.
    pub fn len(&self) -> usize {
        self.mask.count_ones() as usize
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.mask == 0
    }

    /// Highest harmonic in the set.
    pub fn max(&self) -> Option<u32> {
        if self.is_empty() { None } else { Some(31 - self.mask.leading_zeros()) }
    }

    /// Position of `h` in ascending order, used as storage slot.
    pub fn position(&self, h: u32) -> Option<usize> {
        if !self.contains(h) {
            return None;
        }
        Some((self.mask & ((1 << h) - 1)).count_ones() as usize)
    }

    /// Harmonics in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (1..=MAX_HARMONIC).filter(move |&h| self.contains(h))
    }

    /// Union of two sets.
    pub fn union(&self, other: &HarmonicSet) -> HarmonicSet {
        HarmonicSet { mask: self.mask | other.mask }
    }

    /// Whether every harmonic of `other` is also in `self`.
    pub fn is_superset(&self, other: &HarmonicSet) -> bool {
        self.mask & other.mask == other.mask
    }

    /// The set `{2h : h ∈ self}`. Fails when a doubled harmonic exceeds the maximum.
    pub fn doubled(&self) -> Result<HarmonicSet> {
        let mut out = HarmonicSet::empty();
        for h in self.iter() {
            out.insert(2 * h)?;
        }
        Ok(out)
    }

    /// Raw bitmask (bit `h` set for harmonic `h`).
    pub fn mask(&self) -> u32 {
        self.mask
    }
}

impl TryFrom<Vec<u32>> for HarmonicSet {
    type Error = Error;

    fn try_from(value: Vec<u32>) -> Result<Self> {
        HarmonicSet::new(&value)
    }
}

impl From<HarmonicSet> for Vec<u32> {
    fn from(set: HarmonicSet) -> Self {
        set.iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positions_follow_ascending_order() {
        let set = HarmonicSet::new(&[4, 1, 2]).unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![1, 2, 4]);
        assert_eq!(set.position(1), Some(0));
        assert_eq!(set.position(2), Some(1));
        assert_eq!(set.position(4), Some(2));
        assert_eq!(set.position(3), None);
        assert_eq!(set.max(), Some(4));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_out_of_range_harmonics_rejected() {
        assert!(HarmonicSet::new(&[0]).is_err());
        assert!(HarmonicSet::new(&[MAX_HARMONIC + 1]).is_err());
        assert!(HarmonicSet::new(&[MAX_HARMONIC]).is_ok());
    }

    #[test]
    fn test_doubled() {
        let set = HarmonicSet::new(&[1, 3]).unwrap();
        let d = set.doubled().unwrap();
        assert_eq!(d.iter().collect::<Vec<_>>(), vec![2, 6]);
        assert!(HarmonicSet::new(&[8]).unwrap().doubled().is_err());
    }

    #[test]
    fn test_serde_as_list() {
        let set = HarmonicSet::new(&[2, 3]).unwrap();
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, "[2,3]");
        let back: HarmonicSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
        assert!(serde_json::from_str::<HarmonicSet>("[0]").is_err());
    }
}
