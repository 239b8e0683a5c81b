//! Alignment: rotate the Q-vector so its event plane lines up with the one of
//! a reference configuration.

use super::{
    SkipCounter, Snapshot, StepInput, StepOutcome, StepSetup, StepState,
    default_validation_threshold, is_meaningful, not_initialized,
};
use crate::calibration::CalibrationInput;
use crate::qvector::QnVector;
use qn_core::{Error, EventClassVariableSet, HarmonicSet, Result, SIGNIFICANCE_THRESHOLD};
use qn_hist::{AccumulatorStorage, CorrelationProfile};
use serde::{Deserialize, Serialize};

/// Chain key.
pub const ALIGNMENT_KEY: &str = "EEEE";
/// Step and stage name.
pub const ALIGNMENT_NAME: &str = "align";

/// Alignment options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlignmentSettings {
    /// Configuration to align to.
    pub reference: String,
    /// Harmonic the offset angle is measured at.
    pub harmonic: u32,
    /// Minimum entries per bin.
    #[serde(default = "default_validation_threshold")]
    pub validation_threshold: u64,
    /// Keep collecting once calibration input is attached.
    #[serde(default)]
    pub collect_while_applying: bool,
}

impl AlignmentSettings {
    /// Align to `reference` at `harmonic` with default thresholds.
    pub fn new(reference: impl Into<String>, harmonic: u32) -> Self {
        Self {
            reference: reference.into(),
            harmonic,
            validation_threshold: default_validation_threshold(),
            collect_while_applying: false,
        }
    }
}

/// Alignment step.
#[derive(Debug, Clone)]
pub struct Alignment {
    settings: AlignmentSettings,
    configuration: String,
    accumulator: String,
    event_classes: EventClassVariableSet,
    harmonics: HarmonicSet,
    alignment_harmonic: HarmonicSet,
    state: StepState,
    output: Option<CorrelationProfile>,
    input: Option<CorrelationProfile>,
    qa: SkipCounter,
}

impl Alignment {
    /// Alignment of the configuration in `setup`. The alignment harmonic must
    /// be declared by the configuration.
    pub fn new(setup: &StepSetup<'_>, settings: AlignmentSettings) -> Result<Self> {
        if !setup.harmonics.contains(settings.harmonic) {
            return Err(Error::Structural(format!(
                "alignment of '{}' at harmonic {} which the configuration does not declare",
                setup.configuration, settings.harmonic
            )));
        }
        if settings.reference == setup.configuration {
            return Err(Error::Structural(format!(
                "configuration '{}' cannot be aligned to itself",
                setup.configuration
            )));
        }
        Ok(Self {
            alignment_harmonic: HarmonicSet::new(&[settings.harmonic])?,
            settings,
            configuration: setup.configuration.to_string(),
            accumulator: setup.accumulator_name(ALIGNMENT_NAME),
            event_classes: setup.event_classes.clone(),
            harmonics: setup.harmonics,
            state: StepState::Calibrating,
            output: None,
            input: None,
            qa: SkipCounter::new(setup.event_classes.n_cells()),
        })
    }

    /// Step name.
    pub fn name(&self) -> &'static str {
        ALIGNMENT_NAME
    }

    /// Current state.
    pub fn state(&self) -> StepState {
        self.state
    }

    /// Options.
    pub fn settings(&self) -> &AlignmentSettings {
        &self.settings
    }

    /// Name of the calibration accumulator.
    pub fn accumulator_name(&self) -> &str {
        &self.accumulator
    }

    /// The reference configuration and the harmonic read from it.
    pub fn references(&self) -> Vec<(&str, HarmonicSet)> {
        vec![(self.settings.reference.as_str(), self.alignment_harmonic)]
    }

    fn profile(&self) -> Result<CorrelationProfile> {
        Ok(CorrelationProfile::new(&self.accumulator, &self.event_classes, self.alignment_harmonic)?
            .with_validation_threshold(self.settings.validation_threshold))
    }

    /// Attach the previous period's correlations.
    pub fn attach_input(&mut self, input: &CalibrationInput<'_>) -> Result<bool> {
        let Some(storage) = input.find(&self.accumulator) else {
            log::warn!(
                "{}: no calibration input '{}', collecting only",
                self.configuration,
                self.accumulator
            );
            return Ok(false);
        };
        let mut profile = self.profile()?;
        profile.attach(storage)?;
        self.input = Some(profile);
        self.state.advance(StepState::attached(self.settings.collect_while_applying));
        log::debug!(
            "{}: alignment attached '{}', now {:?}",
            self.configuration,
            self.accumulator,
            self.state
        );
        Ok(true)
    }

    /// Allocate the output accumulator if the state collects.
    pub fn create_output(&mut self) -> Result<()> {
        self.output = None;
        if self.state.collects() {
            let mut profile = self.profile()?;
            profile.create_storage()?;
            self.output = Some(profile);
        }
        Ok(())
    }

    /// Collect and/or apply on the current Q-vector.
    pub fn process(&mut self, qn: &QnVector, input: &StepInput<'_>) -> Result<StepOutcome> {
        if self.state.collects() {
            let reference = input.peers.get(&self.settings.reference).ok_or_else(|| {
                Error::NotFound(format!(
                    "alignment of '{}' references unknown configuration '{}'",
                    self.configuration, self.settings.reference
                ))
            })?;
            let output = self
                .output
                .as_mut()
                .ok_or_else(|| not_initialized(ALIGNMENT_NAME, &self.configuration))?;
            if qn.is_good() && reference.is_good() {
                let h = self.settings.harmonic;
                output.fill_pair(
                    input.variables,
                    h,
                    (qn.qx(h), qn.qy(h)),
                    (reference.qx(h), reference.qy(h)),
                )?;
            }
        }
        match self.state {
            StepState::Calibrating => Ok(StepOutcome::NotApplied),
            StepState::ApplyAndCollect | StepState::Applying => {
                let corrected = self.apply(qn, input.variables)?;
                Ok(StepOutcome::Applied(vec![Snapshot::new(ALIGNMENT_NAME, corrected)]))
            }
        }
    }

    fn apply(&mut self, qn: &QnVector, variables: &[f64]) -> Result<QnVector> {
        let mut corrected = qn.clone();
        if !qn.is_good() {
            return Ok(corrected);
        }
        let calibration = self
            .input
            .as_ref()
            .ok_or_else(|| not_initialized(ALIGNMENT_NAME, &self.configuration))?;
        let Some(bin) = calibration.bin_index(variables) else {
            self.qa.record_unbinned();
            return Ok(corrected);
        };
        let h_align = self.settings.harmonic;
        if !calibration.is_validated(bin, h_align)? {
            self.qa.record(bin);
            return Ok(corrected);
        }
        let xx = calibration.xx_content(bin, h_align)?;
        let xy = calibration.xy_content(bin, h_align)?;
        let yx = calibration.yx_content(bin, h_align)?;
        let yy = calibration.yy_content(bin, h_align)?;
        let (num, den) = (xy - yx, xx + yy);
        if num.abs() < SIGNIFICANCE_THRESHOLD && den.abs() < SIGNIFICANCE_THRESHOLD {
            self.qa.record(bin);
            return Ok(corrected);
        }
        let delta = -num.atan2(den) / h_align as f64;
        if !is_meaningful(delta) {
            self.qa.record(bin);
            return Ok(corrected);
        }
        for h in self.harmonics.iter() {
            let (sin, cos) = (h as f64 * delta).sin_cos();
            let (x, y) = (qn.qx(h), qn.qy(h));
            corrected.set(h, x * cos + y * sin, y * cos - x * sin);
        }
        Ok(corrected)
    }

    /// Collected output accumulator, if any.
    pub fn calibration_output(&self) -> Vec<AccumulatorStorage> {
        self.output.as_ref().and_then(|p| p.storage()).cloned().into_iter().collect()
    }

    /// Skip counters.
    pub fn qa(&self) -> &SkipCounter {
        &self.qa
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correction::PeerQnVectors;
    use crate::qvector::QnVectorBuild;
    use approx::assert_abs_diff_eq;
    use qn_core::EventClassVariable;
    use qn_hist::AccumulatorList;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::f64::consts::PI;

    fn classes() -> EventClassVariableSet {
        EventClassVariableSet::with_variables(
            "cent",
            vec![EventClassVariable::uniform(0, "centrality", 1, 0.0, 100.0).unwrap()],
        )
    }

    fn unit(harmonics: &[u32], psi: f64) -> QnVector {
        let mut b = QnVectorBuild::new(HarmonicSet::new(harmonics).unwrap());
        b.add(psi, 1.0);
        b.check_quality(1);
        b.into_qn()
    }

    fn step() -> Alignment {
        let classes = classes();
        let setup = StepSetup {
            configuration: "FMD",
            event_classes: &classes,
            harmonics: HarmonicSet::new(&[1, 2]).unwrap(),
        };
        Alignment::new(&setup, AlignmentSettings::new("TPC", 2)).unwrap()
    }

    #[test]
    fn test_rotation_removes_calibrated_offset() {
        let offset = 0.3;
        let mut rng = StdRng::seed_from_u64(7);
        let mut calib = step();
        calib.create_output().unwrap();
        for _ in 0..200 {
            let psi = rng.gen_range(-PI..PI);
            let mut peers = PeerQnVectors::new();
            peers.insert("TPC", unit(&[2], psi));
            let own = unit(&[1, 2], psi + offset);
            let input = StepInput { variables: &[5.0], plain: &own, peers: &peers };
            assert_eq!(calib.process(&own, &input).unwrap(), StepOutcome::NotApplied);
        }
        let list: AccumulatorList = calib.calibration_output().into_iter().collect();

        let mut s = step();
        assert!(s.attach_input(&CalibrationInput::from_list(&list)).unwrap());
        let own = unit(&[1, 2], 1.0 + offset);
        let mut peers = PeerQnVectors::new();
        peers.insert("TPC", unit(&[2], 1.0));
        let input = StepInput { variables: &[5.0], plain: &own, peers: &peers };
        let StepOutcome::Applied(snaps) = s.process(&own, &input).unwrap() else {
            panic!("alignment not applied");
        };
        assert_eq!(snaps[0].stage, "align");
        assert_abs_diff_eq!(snaps[0].qn.event_plane(1), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(snaps[0].qn.length(2), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_undeclared_alignment_harmonic_rejected() {
        let classes = classes();
        let setup = StepSetup {
            configuration: "FMD",
            event_classes: &classes,
            harmonics: HarmonicSet::new(&[1]).unwrap(),
        };
        assert!(matches!(
            Alignment::new(&setup, AlignmentSettings::new("TPC", 2)),
            Err(Error::Structural(_))
        ));
    }

    #[test]
    fn test_missing_reference_is_not_found() {
        let mut s = step();
        s.create_output().unwrap();
        let own = unit(&[1, 2], 0.0);
        let peers = PeerQnVectors::new();
        let input = StepInput { variables: &[5.0], plain: &own, peers: &peers };
        assert!(matches!(s.process(&own, &input), Err(Error::NotFound(_))));
    }
}
