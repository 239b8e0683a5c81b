//! Recentering: subtract the per-bin mean Q-vector, optionally dividing by
//! its spread (width equalization).

use super::{
    SkipCounter, Snapshot, StepInput, StepOutcome, StepSetup, StepState,
    default_validation_threshold, is_meaningful, not_initialized,
};
use crate::calibration::CalibrationInput;
use crate::qvector::QnVector;
use qn_core::{Error, EventClassVariableSet, HarmonicSet, Result, SIGNIFICANCE_THRESHOLD};
use qn_hist::{AccumulatorStorage, ComponentsProfile, ErrorMode};
use serde::{Deserialize, Serialize};

/// Chain key.
pub const RECENTERING_KEY: &str = "DDDD";
/// Step and stage name.
pub const RECENTERING_NAME: &str = "rec";

/// Recentering options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecenteringSettings {
    /// Divide by the calibrated spread of each component.
    #[serde(default)]
    pub width_equalization: bool,
    /// Minimum entries per bin.
    #[serde(default = "default_validation_threshold")]
    pub validation_threshold: u64,
    /// Keep collecting once calibration input is attached.
    #[serde(default)]
    pub collect_while_applying: bool,
}

impl Default for RecenteringSettings {
    fn default() -> Self {
        Self {
            width_equalization: false,
            validation_threshold: default_validation_threshold(),
            collect_while_applying: false,
        }
    }
}

/// Recentering step.
#[derive(Debug, Clone)]
pub struct Recentering {
    settings: RecenteringSettings,
    configuration: String,
    accumulator: String,
    event_classes: EventClassVariableSet,
    harmonics: HarmonicSet,
    state: StepState,
    output: Option<ComponentsProfile>,
    input: Option<ComponentsProfile>,
    qa: SkipCounter,
}

impl Recentering {
    /// Recentering over the declared harmonics of `setup`.
    pub fn new(setup: &StepSetup<'_>, settings: RecenteringSettings) -> Result<Self> {
        if setup.harmonics.is_empty() {
            return Err(Error::Structural(format!(
                "recentering of '{}' needs at least one harmonic",
                setup.configuration
            )));
        }
        Ok(Self {
            settings,
            configuration: setup.configuration.to_string(),
            accumulator: setup.accumulator_name(RECENTERING_NAME),
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
        RECENTERING_NAME
    }

    /// Current state.
    pub fn state(&self) -> StepState {
        self.state
    }

    /// Options.
    pub fn settings(&self) -> &RecenteringSettings {
        &self.settings
    }

    /// Name of the calibration accumulator.
    pub fn accumulator_name(&self) -> &str {
        &self.accumulator
    }

    fn profile(&self) -> Result<ComponentsProfile> {
        let mode =
            if self.settings.width_equalization { ErrorMode::Spread } else { ErrorMode::Mean };
        Ok(ComponentsProfile::new(&self.accumulator, &self.event_classes, self.harmonics)?
            .with_error_mode(mode)
            .with_validation_threshold(self.settings.validation_threshold))
    }

    /// Attach the previous period's means.
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
            "{}: recentering attached '{}', now {:?}",
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
        if self.state.collects() && qn.is_good() {
            let output = self
                .output
                .as_mut()
                .ok_or_else(|| not_initialized(RECENTERING_NAME, &self.configuration))?;
            for h in self.harmonics.iter() {
                output.fill_xy(input.variables, h, qn.qx(h), qn.qy(h))?;
            }
        }
        match self.state {
            StepState::Calibrating => Ok(StepOutcome::NotApplied),
            StepState::ApplyAndCollect | StepState::Applying => {
                let corrected = self.apply(qn, input.variables)?;
                Ok(StepOutcome::Applied(vec![Snapshot::new(RECENTERING_NAME, corrected)]))
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
            .ok_or_else(|| not_initialized(RECENTERING_NAME, &self.configuration))?;
        let Some(bin) = calibration.bin_index(variables) else {
            self.qa.record_unbinned();
            return Ok(corrected);
        };
        for h in self.harmonics.iter() {
            if !calibration.is_validated(bin, h)? {
                self.qa.record(bin);
                continue;
            }
            let (mean_x, mean_y) = (calibration.x_content(bin, h)?, calibration.y_content(bin, h)?);
            let (width_x, width_y) = if self.settings.width_equalization {
                (calibration.x_error(bin, h)?, calibration.y_error(bin, h)?)
            } else {
                (1.0, 1.0)
            };
            if width_x < SIGNIFICANCE_THRESHOLD || width_y < SIGNIFICANCE_THRESHOLD {
                self.qa.record(bin);
                continue;
            }
            let (fx, fy) = (1.0 / width_x, 1.0 / width_y);
            if !is_meaningful(fx) || !is_meaningful(fy) {
                self.qa.record(bin);
                continue;
            }
            corrected.set(h, (qn.qx(h) - mean_x) * fx, (qn.qy(h) - mean_y) * fy);
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
