//! Selections over the per-event variable array.
//!
//! A [`Cut`] reads one variable by its external id and applies a [`CutKind`].
//! A [`CutSet`] is the logical AND of an ordered list of cuts, evaluated with
//! short-circuit on the first rejection. An empty set accepts everything.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Highest bit number a [`CutKind::BitSet`] cut can test.
pub const MAX_CUT_BIT: u32 = 31;

/// Predicate applied to a single variable value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CutKind {
    /// `value > threshold`
    Above {
        /// Exclusive lower threshold.
        threshold: f64,
    },
    /// `value < threshold`
    Below {
        /// Exclusive upper threshold.
        threshold: f64,
    },
    /// `min < value < max`
    Within {
        /// Exclusive lower limit.
        min: f64,
        /// Exclusive upper limit.
        max: f64,
    },
    /// `value < min || value > max`
    Outside {
        /// Lower limit.
        min: f64,
        /// Upper limit.
        max: f64,
    },
    /// `value == value`
    Value {
        /// Required value.
        value: f64,
    },
    /// Bit `bit` of the value (read as an unsigned integer) equals `expected`.
    BitSet {
        /// Bit number, `0..=31`.
        bit: u32,
        /// Required bit state.
        expected: bool,
    },
}

/// A predicate on one external variable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cut {
    variable: usize,
    #[serde(flatten)]
    kind: CutKind,
}

impl Cut {
    /// Build a cut, validating its parameters.
    pub fn new(variable: usize, kind: CutKind) -> Result<Self> {
        match kind {
            CutKind::BitSet { bit, .. } if bit > MAX_CUT_BIT => {
                return Err(Error::Structural(format!(
                    "bit cut on variable {variable}: bit number {bit} out of range 0..={MAX_CUT_BIT}"
                )));
            }
            CutKind::Within { min, max } | CutKind::Outside { min, max } if !(min < max) => {
                return Err(Error::Validation(format!(
                    "range cut on variable {variable}: expected min < max, got ({min}, {max})"
                )));
            }
            _ => {}
        }
        Ok(Self { variable, kind })
    }

    /// `value > threshold`
    pub fn above(variable: usize, threshold: f64) -> Self {
        Self { variable, kind: CutKind::Above { threshold } }
    }

    /// `value < threshold`
    pub fn below(variable: usize, threshold: f64) -> Self {
        Self { variable, kind: CutKind::Below { threshold } }
    }

    /// `min < value < max`
    pub fn within(variable: usize, min: f64, max: f64) -> Result<Self> {
        Self::new(variable, CutKind::Within { min, max })
    }

    /// `value < min || value > max`
    pub fn outside(variable: usize, min: f64, max: f64) -> Result<Self> {
        Self::new(variable, CutKind::Outside { min, max })
    }

    /// `value == value`
    pub fn value(variable: usize, value: f64) -> Self {
        Self { variable, kind: CutKind::Value { value } }
    }

    /// Bit `bit` of the value must be `expected`.
    pub fn bit_set(variable: usize, bit: u32, expected: bool) -> Result<Self> {
        Self::new(variable, CutKind::BitSet { bit, expected })
    }

    /// External id of the variable this cut reads.
    pub fn variable(&self) -> usize {
        self.variable
    }

    /// Predicate kind.
    pub fn kind(&self) -> &CutKind {
        &self.kind
    }

    /// Whether the current event passes. A variable missing from `values` or
    /// holding NaN is rejected.
    pub fn accept(&self, values: &[f64]) -> bool {
        let Some(&x) = values.get(self.variable) else {
            return false;
        };
        if x.is_nan() {
            return false;
        }
        match self.kind {
            CutKind::Above { threshold } => x > threshold,
            CutKind::Below { threshold } => x < threshold,
            CutKind::Within { min, max } => min < x && x < max,
            CutKind::Outside { min, max } => x < min || x > max,
            CutKind::Value { value } => x == value,
            CutKind::BitSet { bit, expected } => {
                if !x.is_finite() || x < 0.0 || x > u32::MAX as f64 {
                    return false;
                }
                let word = x as u32;
                word.checked_shr(bit).is_some_and(|w| w & 1 == 1) == expected
            }
        }
    }
}

/// Conjunction of cuts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CutSet {
    cuts: Vec<Cut>,
}

impl CutSet {
    /// Empty set (accepts everything).
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a cut.
    pub fn push(&mut self, cut: Cut) {
        self.cuts.push(cut);
    }

    /// Builder-style append.
    pub fn with(mut self, cut: Cut) -> Self {
        self.cuts.push(cut);
        self
    }

    /// Number of cuts.
    pub fn len(&self) -> usize {
        self.cuts.len()
    }

    /// Whether the set has no cuts.
    pub fn is_empty(&self) -> bool {
        self.cuts.is_empty()
    }

    /// Cuts in evaluation order.
    pub fn iter(&self) -> impl Iterator<Item = &Cut> {
        self.cuts.iter()
    }

    /// AND of every cut, stopping at the first rejection.
    pub fn accept(&self, values: &[f64]) -> bool {
        self.cuts.iter().all(|c| c.accept(values))
    }
}

impl FromIterator<Cut> for CutSet {
    fn from_iter<I: IntoIterator<Item = Cut>>(iter: I) -> Self {
        Self { cuts: iter.into_iter().collect() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLAGS: usize = 0;
    const PT: usize = 1;
    const ETA: usize = 2;
    const VTX: usize = 3;
    const DCA: usize = 4;
    const CHARGE: usize = 5;

    fn combined() -> CutSet {
        CutSet::new()
            .with(Cut::bit_set(FLAGS, 3, true).unwrap())
            .with(Cut::bit_set(FLAGS, 7, false).unwrap())
            .with(Cut::above(PT, 0.2))
            .with(Cut::below(DCA, 3.0))
            .with(Cut::within(ETA, -0.8, 0.8).unwrap())
            .with(Cut::outside(VTX, -1.0, 1.0).unwrap())
            .with(Cut::value(CHARGE, 1.0))
    }

    fn accepted_event() -> Vec<f64> {
        // bit 3 set, bit 7 clear
        let mut v = vec![0.0; 6];
        v[FLAGS] = ((1u32 << 3) | (1u32 << 1)) as f64;
        v[PT] = 1.0;
        v[ETA] = 0.1;
        v[VTX] = 2.0;
        v[DCA] = 1.0;
        v[CHARGE] = 1.0;
        v
    }

    #[test]
    fn test_each_cut_individually() {
        let ev = accepted_event();
        assert!(Cut::above(PT, 0.2).accept(&ev));
        assert!(!Cut::above(PT, 1.0).accept(&ev));
        assert!(Cut::below(DCA, 3.0).accept(&ev));
        assert!(!Cut::below(DCA, 1.0).accept(&ev));
        assert!(Cut::within(ETA, -0.8, 0.8).unwrap().accept(&ev));
        assert!(!Cut::within(ETA, 0.1, 0.8).unwrap().accept(&ev));
        assert!(Cut::outside(VTX, -1.0, 1.0).unwrap().accept(&ev));
        assert!(!Cut::outside(VTX, -3.0, 3.0).unwrap().accept(&ev));
        assert!(Cut::value(CHARGE, 1.0).accept(&ev));
        assert!(!Cut::value(CHARGE, -1.0).accept(&ev));
        assert!(Cut::bit_set(FLAGS, 3, true).unwrap().accept(&ev));
        assert!(Cut::bit_set(FLAGS, 7, false).unwrap().accept(&ev));
        assert!(!Cut::bit_set(FLAGS, 1, false).unwrap().accept(&ev));
    }

    #[test]
    fn test_combined_set_rejects_on_any_failure() {
        let cuts = combined();
        assert!(cuts.accept(&accepted_event()));

        let failures: [(usize, f64); 7] = [
            (FLAGS, (1u32 << 1) as f64),
            (FLAGS, ((1u32 << 3) | (1u32 << 7)) as f64),
            (PT, 0.1),
            (DCA, 5.0),
            (ETA, 0.9),
            (VTX, 0.5),
            (CHARGE, -1.0),
        ];
        for (var, value) in failures {
            let mut ev = accepted_event();
            ev[var] = value;
            assert!(!cuts.accept(&ev), "variable {var} = {value} should be rejected");
        }
    }

    #[test]
    fn test_bit_out_of_range_is_structural() {
        let err = Cut::bit_set(FLAGS, 32, true).unwrap_err();
        assert!(matches!(err, Error::Structural(_)));
    }

    #[test]
    fn test_missing_or_nan_variable_rejected() {
        assert!(!Cut::above(9, 0.0).accept(&[1.0]));
        assert!(!Cut::below(0, 10.0).accept(&[f64::NAN]));
        assert!(CutSet::new().accept(&[]));
    }

    #[test]
    fn test_serde_flattened_kind() {
        let cut: Cut =
            serde_json::from_str(r#"{"variable": 4, "kind": "within", "min": -1.0, "max": 2.0}"#)
                .unwrap();
        assert_eq!(cut, Cut::within(4, -1.0, 2.0).unwrap());
    }
}
