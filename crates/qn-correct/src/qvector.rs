//! Q-vectors.
//!
//! A [`QnVector`] holds, for each harmonic of its [`HarmonicSet`], the `(Qx, Qy)`
//! pair together with the sum of weights and number of contributions that
//! produced it. [`QnVectorBuild`] is the incremental form used while an event's
//! contributions are being added.

use qn_core::{HarmonicSet, MAX_HARMONIC, SIGNIFICANCE_THRESHOLD};
use serde::{Deserialize, Serialize};

const N_SLOTS: usize = MAX_HARMONIC as usize + 1;

/// Normalization applied once all contributions have been added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// Leave the sums as they are.
    #[default]
    None,
    /// Divide by the sum of weights.
    QOverM,
    /// Divide by the square root of the sum of weights.
    QOverSqrtM,
    /// Divide each harmonic by its own length.
    QOverLength,
}

/// Per-harmonic flow vector of one event.
#[derive(Debug, Clone, PartialEq)]
pub struct QnVector {
    harmonics: HarmonicSet,
    qx: [f64; N_SLOTS],
    qy: [f64; N_SLOTS],
    sum_of_weights: f64,
    n: usize,
    good: bool,
    normalization: Normalization,
}

impl QnVector {
    /// Empty (bad quality) Q-vector carrying `harmonics`.
    pub fn new(harmonics: HarmonicSet) -> Self {
        Self {
            harmonics,
            qx: [0.0; N_SLOTS],
            qy: [0.0; N_SLOTS],
            sum_of_weights: 0.0,
            n: 0,
            good: false,
            normalization: Normalization::None,
        }
    }

    /// Harmonics carried.
    pub fn harmonics(&self) -> HarmonicSet {
        self.harmonics
    }

    /// X component of harmonic `h` (0 for undeclared harmonics).
    pub fn qx(&self, h: u32) -> f64 {
        if self.harmonics.contains(h) { self.qx[h as usize] } else { 0.0 }
    }

    /// Y component of harmonic `h` (0 for undeclared harmonics).
    pub fn qy(&self, h: u32) -> f64 {
        if self.harmonics.contains(h) { self.qy[h as usize] } else { 0.0 }
    }

    /// Set both components of a declared harmonic. Undeclared harmonics are ignored.
    pub fn set(&mut self, h: u32, qx: f64, qy: f64) {
        if self.harmonics.contains(h) {
            self.qx[h as usize] = qx;
            self.qy[h as usize] = qy;
        }
    }

    /// Sum of contribution weights.
    pub fn sum_of_weights(&self) -> f64 {
        self.sum_of_weights
    }

    /// Number of contributions.
    pub fn n(&self) -> usize {
        self.n
    }

    /// Whether the Q-vector can be consumed downstream.
    pub fn is_good(&self) -> bool {
        self.good
    }

    /// Override the quality flag.
    pub fn set_good(&mut self, good: bool) {
        self.good = good;
    }

    /// Normalization that has been applied.
    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    /// Event-plane angle `atan2(Qy, Qx) / h`; 0 for a bad Q-vector.
    pub fn event_plane(&self, h: u32) -> f64 {
        if !self.good || !self.harmonics.contains(h) {
            return 0.0;
        }
        self.qy(h).atan2(self.qx(h)) / h as f64
    }

    /// `sqrt(Qx² + Qy²)` of harmonic `h`.
    pub fn length(&self, h: u32) -> f64 {
        self.qx(h).hypot(self.qy(h))
    }

    /// Copy of this Q-vector carrying only the harmonics in `harmonics`.
    pub fn restricted(&self, harmonics: HarmonicSet) -> QnVector {
        let mut out = self.clone();
        out.harmonics = HarmonicSet::empty();
        for h in self.harmonics.iter().filter(|&h| harmonics.contains(h)) {
            // insert cannot fail: h is already a valid harmonic
            let _ = out.harmonics.insert(h);
        }
        for h in 0..N_SLOTS {
            if !out.harmonics.contains(h as u32) {
                out.qx[h] = 0.0;
                out.qy[h] = 0.0;
            }
        }
        out
    }

    /// Reset to an empty, bad-quality Q-vector.
    pub fn reset(&mut self) {
        self.qx = [0.0; N_SLOTS];
        self.qy = [0.0; N_SLOTS];
        self.sum_of_weights = 0.0;
        self.n = 0;
        self.good = false;
        self.normalization = Normalization::None;
    }
}

/// Q-vector under construction.
#[derive(Debug, Clone, PartialEq)]
pub struct QnVectorBuild {
    qn: QnVector,
}

impl QnVectorBuild {
    /// Empty build for `harmonics`.
    pub fn new(harmonics: HarmonicSet) -> Self {
        Self { qn: QnVector::new(harmonics) }
    }

    /// Add a contribution at azimuth `phi` with `weight`.
    pub fn add(&mut self, phi: f64, weight: f64) {
        for h in self.qn.harmonics.iter() {
            let angle = h as f64 * phi;
            self.qn.qx[h as usize] += weight * angle.cos();
            self.qn.qy[h as usize] += weight * angle.sin();
        }
        self.qn.sum_of_weights += weight;
        self.qn.n += 1;
    }

    /// Add another build's sums (harmonics not carried here are ignored).
    pub fn add_q(&mut self, other: &QnVectorBuild) {
        for h in self.qn.harmonics.iter() {
            self.qn.qx[h as usize] += other.qn.qx(h);
            self.qn.qy[h as usize] += other.qn.qy(h);
        }
        self.qn.sum_of_weights += other.qn.sum_of_weights;
        self.qn.n += other.qn.n;
    }

    /// Mark the Q-vector good iff it has at least `min_contributions` (and at
    /// least one) contribution.
    pub fn check_quality(&mut self, min_contributions: usize) {
        self.qn.good = self.qn.n > 0 && self.qn.n >= min_contributions;
    }

    /// Apply `method`. Divisions by a quantity below the significance
    /// threshold are skipped.
    pub fn normalize(&mut self, method: Normalization) {
        let divisor = match method {
            Normalization::None => None,
            Normalization::QOverM => Some(self.qn.sum_of_weights),
            Normalization::QOverSqrtM => {
                Some(if self.qn.sum_of_weights > 0.0 { self.qn.sum_of_weights.sqrt() } else { 0.0 })
            }
            Normalization::QOverLength => {
                for h in self.qn.harmonics.iter() {
                    let len = self.qn.length(h);
                    if len >= SIGNIFICANCE_THRESHOLD {
                        self.qn.qx[h as usize] /= len;
                        self.qn.qy[h as usize] /= len;
                    }
                }
                None
            }
        };
        if let Some(d) = divisor
            && d.abs() >= SIGNIFICANCE_THRESHOLD
        {
            for h in self.qn.harmonics.iter() {
                self.qn.qx[h as usize] /= d;
                self.qn.qy[h as usize] /= d;
            }
        }
        self.qn.normalization = method;
    }

    /// Current state of the Q-vector.
    pub fn qn(&self) -> &QnVector {
        &self.qn
    }

    /// Finish the build.
    pub fn into_qn(self) -> QnVector {
        self.qn
    }

    /// Reset to an empty build.
    pub fn reset(&mut self) {
        self.qn.reset();
    }
}

/// Serializable view of a Q-vector for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QnVectorRecord {
    /// Harmonics carried.
    pub harmonics: Vec<u32>,
    /// X components, one per harmonic.
    pub qx: Vec<f64>,
    /// Y components, one per harmonic.
    pub qy: Vec<f64>,
    /// Sum of contribution weights.
    pub sum_of_weights: f64,
    /// Number of contributions.
    pub n: usize,
    /// Quality flag.
    pub good: bool,
}

impl From<&QnVector> for QnVectorRecord {
    fn from(q: &QnVector) -> Self {
        let harmonics: Vec<u32> = q.harmonics().iter().collect();
        Self {
            qx: harmonics.iter().map(|&h| q.qx(h)).collect(),
            qy: harmonics.iter().map(|&h| q.qy(h)).collect(),
            harmonics,
            sum_of_weights: q.sum_of_weights(),
            n: q.n(),
            good: q.is_good(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::PI;

    fn harmonics() -> HarmonicSet {
        HarmonicSet::new(&[1, 2]).unwrap()
    }

    #[test]
    fn test_build_sums_cos_sin() {
        let mut b = QnVectorBuild::new(harmonics());
        b.add(0.0, 1.0);
        b.add(PI / 2.0, 2.0);
        b.check_quality(1);
        let q = b.qn();
        assert!(q.is_good());
        assert_eq!(q.n(), 2);
        assert_abs_diff_eq!(q.sum_of_weights(), 3.0);
        assert_abs_diff_eq!(q.qx(1), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(q.qy(1), 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(q.qx(2), -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(q.qy(2), 0.0, epsilon = 1e-12);
        assert_eq!(q.qx(3), 0.0);
    }

    #[test]
    fn test_empty_build_is_bad() {
        let mut b = QnVectorBuild::new(harmonics());
        b.check_quality(1);
        assert!(!b.qn().is_good());
        b.add(0.3, 1.0);
        b.check_quality(2);
        assert!(!b.qn().is_good());
    }

    #[test]
    fn test_normalizations() {
        let make = || {
            let mut b = QnVectorBuild::new(harmonics());
            b.add(0.0, 2.0);
            b.add(0.0, 2.0);
            b
        };
        let mut m = make();
        m.normalize(Normalization::QOverM);
        assert_abs_diff_eq!(m.qn().qx(1), 1.0, epsilon = 1e-12);

        let mut sqrt_m = make();
        sqrt_m.normalize(Normalization::QOverSqrtM);
        assert_abs_diff_eq!(sqrt_m.qn().qx(1), 2.0, epsilon = 1e-12);

        let mut len = QnVectorBuild::new(harmonics());
        len.add(0.7, 3.0);
        len.normalize(Normalization::QOverLength);
        assert_abs_diff_eq!(len.qn().length(1), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(len.qn().length(2), 1.0, epsilon = 1e-12);

        let mut none = make();
        none.normalize(Normalization::None);
        assert_abs_diff_eq!(none.qn().qx(1), 4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_q_over_m_guarded() {
        let mut b = QnVectorBuild::new(harmonics());
        b.add(0.0, 1e-9);
        b.normalize(Normalization::QOverM);
        assert_abs_diff_eq!(b.qn().qx(1), 1e-9, epsilon = 1e-15);
    }

    #[test]
    fn test_event_plane_and_restriction() {
        let mut b = QnVectorBuild::new(harmonics());
        b.add(0.4, 1.0);
        b.check_quality(1);
        let q = b.into_qn();
        assert_abs_diff_eq!(q.event_plane(1), 0.4, epsilon = 1e-12);
        assert_abs_diff_eq!(q.event_plane(2), 0.4, epsilon = 1e-12);

        let only_two = q.restricted(HarmonicSet::new(&[2]).unwrap());
        assert_eq!(only_two.harmonics().iter().collect::<Vec<_>>(), vec![2]);
        assert_eq!(only_two.qx(1), 0.0);
        assert_abs_diff_eq!(only_two.qx(2), q.qx(2));
    }
}
