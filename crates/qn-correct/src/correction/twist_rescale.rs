//! Twist and rescale: remove the correlated shear and the anisotropic scale
//! of the Q-vector.
//!
//! Factors come either from the doubled-harmonic mean of the configuration's
//! own plain Q-vector, or from the pairwise correlations of three
//! configurations (this one, `b` and `c`).

use super::{
    SkipCounter, Snapshot, StepInput, StepOutcome, StepSetup, StepState,
    default_validation_threshold, is_meaningful, not_initialized,
};
use crate::calibration::CalibrationInput;
use crate::qvector::QnVector;
use qn_core::{Error, EventClassVariableSet, HarmonicSet, Result, SIGNIFICANCE_THRESHOLD};
use qn_hist::{AccumulatorStorage, ComponentsProfile, CorrelationProfile};
use serde::{Deserialize, Serialize};

/// Chain key.
pub const TWIST_AND_RESCALE_KEY: &str = "FFFF";
/// Stage name of the twisted Q-vector.
pub const TWIST_STAGE: &str = "twist";
/// Stage name of the rescaled Q-vector.
pub const RESCALE_STAGE: &str = "rescale";

const STEP_NAME: &str = "twist_and_rescale";

/// Source of the twist and rescale factors.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TwistMethod {
    /// Means of the plain Q-vector at twice each harmonic.
    #[default]
    DoubleHarmonic,
    /// Correlations with two other configurations.
    Correlations {
        /// Second configuration.
        b: String,
        /// Third configuration.
        c: String,
    },
}

/// Twist and rescale options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TwistAndRescaleSettings {
    /// Factor source.
    #[serde(default)]
    pub method: TwistMethod,
    /// Apply the twist.
    #[serde(default = "enabled")]
    pub apply_twist: bool,
    /// Apply the rescale.
    #[serde(default = "enabled")]
    pub apply_rescale: bool,
    /// Minimum entries per bin.
    #[serde(default = "default_validation_threshold")]
    pub validation_threshold: u64,
    /// Keep collecting once calibration input is attached.
    #[serde(default)]
    pub collect_while_applying: bool,
}

fn enabled() -> bool {
    true
}

impl Default for TwistAndRescaleSettings {
    fn default() -> Self {
        Self {
            method: TwistMethod::DoubleHarmonic,
            apply_twist: true,
            apply_rescale: true,
            validation_threshold: default_validation_threshold(),
            collect_while_applying: false,
        }
    }
}

/// Twist and rescale factors of one harmonic in one bin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct TwistFactors {
    a_plus: f64,
    a_minus: f64,
    lambda_plus: f64,
    lambda_minus: f64,
}

impl TwistFactors {
    /// From the mean doubled-harmonic components.
    pub(crate) fn from_double_harmonic(x2: f64, y2: f64) -> Self {
        let a_plus = 1.0 + x2;
        let a_minus = 1.0 - x2;
        Self { a_plus, a_minus, lambda_plus: y2 / a_plus, lambda_minus: y2 / a_minus }
    }

    /// From the three-configuration correlations; `None` when a radicand or
    /// denominator is not positive.
    pub(crate) fn from_correlations(c: &Correlations) -> Option<Self> {
        let scale = 2.0 * c.xa_xc;
        let norm = c.xa_xb * c.xb_xc + c.xa_yb * c.xb_yc;
        if scale <= 0.0 || norm <= 0.0 || c.xa_xb.abs() < SIGNIFICANCE_THRESHOLD {
            return None;
        }
        if c.ya_yb.abs() < SIGNIFICANCE_THRESHOLD {
            return None;
        }
        let ratio = scale.sqrt() / norm.sqrt();
        Some(Self {
            a_plus: ratio * c.xa_xb,
            a_minus: ratio * c.ya_yb,
            lambda_plus: c.xa_yb / c.xa_xb,
            lambda_minus: c.xa_yb / c.ya_yb,
        })
    }

    fn determinant(&self) -> f64 {
        1.0 - self.lambda_minus * self.lambda_plus
    }

    fn is_meaningful(&self) -> bool {
        let det = self.determinant();
        [self.a_plus, self.a_minus, self.lambda_plus, self.lambda_minus]
            .into_iter()
            .all(is_meaningful)
            && det.abs() >= SIGNIFICANCE_THRESHOLD
            && self.a_plus.abs() >= SIGNIFICANCE_THRESHOLD
            && self.a_minus.abs() >= SIGNIFICANCE_THRESHOLD
            && is_meaningful(1.0 / det)
            && is_meaningful(1.0 / self.a_plus)
            && is_meaningful(1.0 / self.a_minus)
    }

    fn twist(&self, qx: f64, qy: f64) -> (f64, f64) {
        let det = self.determinant();
        ((qx - self.lambda_minus * qy) / det, (qy - self.lambda_plus * qx) / det)
    }

    fn rescale(&self, qx: f64, qy: f64) -> (f64, f64) {
        (qx / self.a_plus, qy / self.a_minus)
    }
}

/// Mean pairwise products of the A, B and C Q-vectors at one harmonic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Correlations {
    pub(crate) xa_xb: f64,
    pub(crate) ya_yb: f64,
    pub(crate) xa_yb: f64,
    pub(crate) xa_xc: f64,
    pub(crate) xb_xc: f64,
    pub(crate) xb_yc: f64,
}

#[derive(Debug, Clone)]
enum Accumulators {
    DoubleHarmonic(ComponentsProfile),
    Correlations { ab: CorrelationProfile, ac: CorrelationProfile, bc: CorrelationProfile },
}

impl Accumulators {
    fn create_storage(&mut self) -> Result<()> {
        match self {
            Self::DoubleHarmonic(p) => p.create_storage(),
            Self::Correlations { ab, ac, bc } => {
                ab.create_storage()?;
                ac.create_storage()?;
                bc.create_storage()
            }
        }
    }

    fn bin_index(&self, variables: &[f64]) -> Option<usize> {
        match self {
            Self::DoubleHarmonic(p) => p.bin_index(variables),
            Self::Correlations { ab, .. } => ab.bin_index(variables),
        }
    }

    fn factors(&self, bin: usize, h: u32) -> Result<Option<TwistFactors>> {
        match self {
            Self::DoubleHarmonic(p) => {
                if !p.is_validated(bin, h)? {
                    return Ok(None);
                }
                let (x, y) = (p.x_content(bin, h)?, p.y_content(bin, h)?);
                Ok(Some(TwistFactors::from_double_harmonic(x, y)))
            }
            Self::Correlations { ab, ac, bc } => {
                if !(ab.is_validated(bin, h)?
                    && ac.is_validated(bin, h)?
                    && bc.is_validated(bin, h)?)
                {
                    return Ok(None);
                }
                let c = Correlations {
                    xa_xb: ab.xx_content(bin, h)?,
                    ya_yb: ab.yy_content(bin, h)?,
                    xa_yb: ab.xy_content(bin, h)?,
                    xa_xc: ac.xx_content(bin, h)?,
                    xb_xc: bc.xx_content(bin, h)?,
                    xb_yc: bc.xy_content(bin, h)?,
                };
                Ok(TwistFactors::from_correlations(&c))
            }
        }
    }

    fn storages(&self) -> Vec<AccumulatorStorage> {
        match self {
            Self::DoubleHarmonic(p) => p.storage().cloned().into_iter().collect(),
            Self::Correlations { ab, ac, bc } => {
                [ab, ac, bc].into_iter().filter_map(|p| p.storage().cloned()).collect()
            }
        }
    }
}

/// Twist and rescale step.
#[derive(Debug, Clone)]
pub struct TwistAndRescale {
    settings: TwistAndRescaleSettings,
    configuration: String,
    accumulator: String,
    event_classes: EventClassVariableSet,
    harmonics: HarmonicSet,
    state: StepState,
    output: Option<Accumulators>,
    input: Option<Accumulators>,
    qa: SkipCounter,
}

impl TwistAndRescale {
    /// Twist and rescale over the declared harmonics of `setup`.
    pub fn new(setup: &StepSetup<'_>, settings: TwistAndRescaleSettings) -> Result<Self> {
        if !settings.apply_twist && !settings.apply_rescale {
            return Err(Error::Validation(format!(
                "twist and rescale of '{}' has both twist and rescale disabled",
                setup.configuration
            )));
        }
        if setup.harmonics.is_empty() {
            return Err(Error::Structural(format!(
                "twist and rescale of '{}' needs at least one harmonic",
                setup.configuration
            )));
        }
        if let TwistMethod::DoubleHarmonic = settings.method {
            setup.harmonics.doubled().map_err(|e| {
                Error::Structural(format!(
                    "twist and rescale of '{}': doubled harmonics unavailable: {e}",
                    setup.configuration
                ))
            })?;
        }
        Ok(Self {
            settings,
            configuration: setup.configuration.to_string(),
            accumulator: setup.accumulator_name(TWIST_STAGE),
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
        STEP_NAME
    }

    /// Current state.
    pub fn state(&self) -> StepState {
        self.state
    }

    /// Options.
    pub fn settings(&self) -> &TwistAndRescaleSettings {
        &self.settings
    }

    /// Names of the calibration accumulators.
    pub fn accumulator_names(&self) -> Vec<String> {
        match &self.settings.method {
            TwistMethod::DoubleHarmonic => vec![self.accumulator.clone()],
            TwistMethod::Correlations { .. } => ["AB", "AC", "BC"]
                .iter()
                .map(|pair| format!("{}_{pair}", self.accumulator))
                .collect(),
        }
    }

    /// Doubled harmonics read from the plain Q-vector.
    pub fn required_harmonics(&self) -> HarmonicSet {
        match self.settings.method {
            TwistMethod::DoubleHarmonic => self.harmonics.doubled().unwrap_or_default(),
            TwistMethod::Correlations { .. } => HarmonicSet::empty(),
        }
    }

    /// Configurations `b` and `c` for the correlations method.
    pub fn references(&self) -> Vec<(&str, HarmonicSet)> {
        match &self.settings.method {
            TwistMethod::DoubleHarmonic => Vec::new(),
            TwistMethod::Correlations { b, c } => {
                vec![(b.as_str(), self.harmonics), (c.as_str(), self.harmonics)]
            }
        }
    }

    fn accumulators(&self) -> Result<Accumulators> {
        let names = self.accumulator_names();
        let threshold = self.settings.validation_threshold;
        Ok(match self.settings.method {
            TwistMethod::DoubleHarmonic => Accumulators::DoubleHarmonic(
                ComponentsProfile::new(&names[0], &self.event_classes, self.harmonics)?
                    .with_validation_threshold(threshold),
            ),
            TwistMethod::Correlations { .. } => {
                let make = |name: &String| -> Result<CorrelationProfile> {
                    Ok(CorrelationProfile::new(name, &self.event_classes, self.harmonics)?
                        .with_validation_threshold(threshold))
                };
                Accumulators::Correlations {
                    ab: make(&names[0])?,
                    ac: make(&names[1])?,
                    bc: make(&names[2])?,
                }
            }
        })
    }

    /// Attach the previous period's accumulators; all of them must be present.
    pub fn attach_input(&mut self, input: &CalibrationInput<'_>) -> Result<bool> {
        let names = self.accumulator_names();
        let Some(storages) = names.iter().map(|n| input.find(n)).collect::<Option<Vec<_>>>() else {
            log::warn!(
                "{}: twist and rescale input incomplete, collecting only",
                self.configuration
            );
            return Ok(false);
        };
        let mut accumulators = self.accumulators()?;
        match &mut accumulators {
            Accumulators::DoubleHarmonic(p) => p.attach(storages[0])?,
            Accumulators::Correlations { ab, ac, bc } => {
                ab.attach(storages[0])?;
                ac.attach(storages[1])?;
                bc.attach(storages[2])?;
            }
        }
        self.input = Some(accumulators);
        self.state.advance(StepState::attached(self.settings.collect_while_applying));
        log::debug!("{}: twist and rescale attached, now {:?}", self.configuration, self.state);
        Ok(true)
    }

    /// Allocate the output accumulators if the state collects.
    pub fn create_output(&mut self) -> Result<()> {
        self.output = None;
        if self.state.collects() {
            let mut accumulators = self.accumulators()?;
            accumulators.create_storage()?;
            self.output = Some(accumulators);
        }
        Ok(())
    }

    fn collect(&mut self, qn: &QnVector, input: &StepInput<'_>) -> Result<()> {
        let output =
            self.output.as_mut().ok_or_else(|| not_initialized(STEP_NAME, &self.configuration))?;
        match (output, &self.settings.method) {
            (Accumulators::DoubleHarmonic(p), _) => {
                if !input.plain.is_good() {
                    return Ok(());
                }
                for h in self.harmonics.iter() {
                    p.fill_xy(input.variables, h, input.plain.qx(2 * h), input.plain.qy(2 * h))?;
                }
            }
            (Accumulators::Correlations { ab, ac, bc }, TwistMethod::Correlations { b, c }) => {
                let (Some(qb), Some(qc)) = (input.peers.get(b), input.peers.get(c)) else {
                    return Err(Error::NotFound(format!(
                        "twist and rescale of '{}' references unknown configurations '{b}', '{c}'",
                        self.configuration
                    )));
                };
                if !(qn.is_good() && qb.is_good() && qc.is_good()) {
                    return Ok(());
                }
                for h in self.harmonics.iter() {
                    let (a, b, c) =
                        ((qn.qx(h), qn.qy(h)), (qb.qx(h), qb.qy(h)), (qc.qx(h), qc.qy(h)));
                    ab.fill_pair(input.variables, h, a, b)?;
                    ac.fill_pair(input.variables, h, a, c)?;
                    bc.fill_pair(input.variables, h, b, c)?;
                }
            }
            (Accumulators::Correlations { .. }, TwistMethod::DoubleHarmonic) => {
                return Err(not_initialized(STEP_NAME, &self.configuration));
            }
        }
        Ok(())
    }

    /// Collect and/or apply on the current Q-vector.
    pub fn process(&mut self, qn: &QnVector, input: &StepInput<'_>) -> Result<StepOutcome> {
        if self.state.collects() {
            self.collect(qn, input)?;
        }
        match self.state {
            StepState::Calibrating => Ok(StepOutcome::NotApplied),
            StepState::ApplyAndCollect | StepState::Applying => self.apply(qn, input.variables),
        }
    }

    fn apply(&mut self, qn: &QnVector, variables: &[f64]) -> Result<StepOutcome> {
        let mut twisted = qn.clone();
        let mut rescaled = qn.clone();
        if qn.is_good() {
            let calibration =
                self.input.as_ref().ok_or_else(|| not_initialized(STEP_NAME, &self.configuration))?;
            match calibration.bin_index(variables) {
                None => self.qa.record_unbinned(),
                Some(bin) => {
                    for h in self.harmonics.iter() {
                        let factors = match calibration.factors(bin, h)? {
                            Some(f) if f.is_meaningful() => f,
                            _ => {
                                self.qa.record(bin);
                                continue;
                            }
                        };
                        let (mut x, mut y) = (qn.qx(h), qn.qy(h));
                        if self.settings.apply_twist {
                            (x, y) = factors.twist(x, y);
                            twisted.set(h, x, y);
                        }
                        if self.settings.apply_rescale {
                            (x, y) = factors.rescale(x, y);
                            rescaled.set(h, x, y);
                        }
                    }
                }
            }
        }
        let mut snapshots = Vec::with_capacity(2);
        if self.settings.apply_twist {
            snapshots.push(Snapshot::new(TWIST_STAGE, twisted));
        }
        if self.settings.apply_rescale {
            snapshots.push(Snapshot::new(RESCALE_STAGE, rescaled));
        }
        Ok(StepOutcome::Applied(snapshots))
    }

    /// Collected output accumulators.
    pub fn calibration_output(&self) -> Vec<AccumulatorStorage> {
        self.output.as_ref().map(Accumulators::storages).unwrap_or_default()
    }

    /// Skip counters.
    pub fn qa(&self) -> &SkipCounter {
        &self.qa
    }
}
