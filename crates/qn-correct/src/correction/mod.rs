//! Correction steps and their ordered chains.
//!
//! Every step runs through the same three-state machine ([`StepState`]) and
//! reports through a typed [`StepOutcome`]. Steps are kept in a
//! [`CorrectionChain`] sorted by key; when a step reports
//! [`StepOutcome::NotApplied`] the rest of the chain is skipped for that event.

mod alignment;
mod gain_equalization;
mod recentering;
mod twist_rescale;

pub use alignment::{ALIGNMENT_KEY, ALIGNMENT_NAME, Alignment, AlignmentSettings};
pub use gain_equalization::{
    GAIN_EQUALIZATION_KEY, GAIN_EQUALIZATION_NAME, GainEqualization, GainEqualizationMethod,
    GainEqualizationSettings,
};
pub use recentering::{RECENTERING_KEY, RECENTERING_NAME, Recentering, RecenteringSettings};
pub use twist_rescale::{
    RESCALE_STAGE, TWIST_AND_RESCALE_KEY, TWIST_STAGE, TwistAndRescale, TwistAndRescaleSettings,
    TwistMethod,
};

use crate::calibration::CalibrationInput;
use crate::detector::{ChannelSetup, DataVector};
use crate::qvector::QnVector;
use qn_core::{
    DEFAULT_VALIDATION_THRESHOLD, Error, EventClassVariableSet, HarmonicSet,
    MEANINGLESS_THRESHOLD, Result,
};
use qn_hist::AccumulatorStorage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Phase of a correction step. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// Only collecting calibration statistics.
    Calibrating,
    /// Applying attached calibration and collecting for the next period.
    ApplyAndCollect,
    /// Applying attached calibration only.
    Applying,
}

impl StepState {
    /// Whether the step fills its output accumulators in this state.
    pub fn collects(self) -> bool {
        matches!(self, StepState::Calibrating | StepState::ApplyAndCollect)
    }

    /// Whether the step transforms its input in this state.
    pub fn applies(self) -> bool {
        matches!(self, StepState::ApplyAndCollect | StepState::Applying)
    }

    /// State entered once calibration input is attached.
    pub(crate) fn attached(collect_while_applying: bool) -> Self {
        if collect_while_applying { StepState::ApplyAndCollect } else { StepState::Applying }
    }

    /// Move to `next` if it is later than the current state.
    pub(crate) fn advance(&mut self, next: StepState) -> bool {
        if next > *self {
            *self = next;
            true
        } else {
            false
        }
    }
}

/// Q-vector produced by a step under a stage name.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Stage name (`"rec"`, `"twist"`, ...).
    pub stage: &'static str,
    /// Corrected Q-vector.
    pub qn: QnVector,
}

impl Snapshot {
    pub(crate) fn new(stage: &'static str, qn: QnVector) -> Self {
        Self { stage, qn }
    }
}

/// Result of running one step on one event.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Still calibrating: nothing downstream of this step runs for the event.
    NotApplied,
    /// Transform applied; Q-vector steps report their snapshots in order.
    Applied(Vec<Snapshot>),
}

impl StepOutcome {
    /// Whether the step applied its transform.
    pub fn is_applied(&self) -> bool {
        matches!(self, StepOutcome::Applied(_))
    }
}

/// Ordering token of a chain element.
pub trait Keyed {
    /// Key compared lexicographically to order the chain.
    fn key(&self) -> &str;
}

/// Steps sorted by key.
#[derive(Debug, Clone)]
pub struct CorrectionChain<S> {
    steps: Vec<S>,
}

impl<S> Default for CorrectionChain<S> {
    fn default() -> Self {
        Self { steps: Vec::new() }
    }
}

impl<S: Keyed> CorrectionChain<S> {
    /// Empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `step` before the first step whose key sorts after it.
    /// A key already present is a structural error.
    pub fn insert(&mut self, step: S) -> Result<()> {
        if self.steps.iter().any(|s| s.key() == step.key()) {
            return Err(Error::Structural(format!(
                "correction step with key '{}' is already in the chain",
                step.key()
            )));
        }
        let at = self.steps.iter().position(|s| step.key() < s.key()).unwrap_or(self.steps.len());
        self.steps.insert(at, step);
        Ok(())
    }

    /// Steps in execution order.
    pub fn iter(&self) -> std::slice::Iter<'_, S> {
        self.steps.iter()
    }

    /// Mutable steps in execution order.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, S> {
        self.steps.iter_mut()
    }

    /// Step with `key`.
    pub fn get(&self, key: &str) -> Option<&S> {
        self.steps.iter().find(|s| s.key() == key)
    }

    /// Mutable step with `key`.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut S> {
        self.steps.iter_mut().find(|s| s.key() == key)
    }

    /// Keys in execution order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.key())
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Per-bin count of skipped corrections.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SkipCounter {
    per_bin: Vec<u64>,
    unbinned: u64,
}

impl SkipCounter {
    /// Counter over `n_bins` bins.
    pub fn new(n_bins: usize) -> Self {
        Self { per_bin: vec![0; n_bins], unbinned: 0 }
    }

    /// Record a skip in `bin`.
    pub fn record(&mut self, bin: usize) {
        match self.per_bin.get_mut(bin) {
            Some(c) => *c += 1,
            None => self.unbinned += 1,
        }
    }

    /// Record an event that fell outside the event-class space.
    pub fn record_unbinned(&mut self) {
        self.unbinned += 1;
    }

    /// Skips per bin.
    pub fn per_bin(&self) -> &[u64] {
        &self.per_bin
    }

    /// Events without a bin.
    pub fn unbinned(&self) -> u64 {
        self.unbinned
    }

    /// Total skips in binned events.
    pub fn total(&self) -> u64 {
        self.per_bin.iter().sum()
    }
}

/// QA summary of one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepQa {
    /// Owning detector configuration.
    pub configuration: String,
    /// Step name.
    pub step: String,
    /// Step key.
    pub key: String,
    /// State at report time.
    pub state: StepState,
    /// Skipped corrections summed over bins.
    pub skipped: u64,
    /// Events without an event-class bin.
    pub unbinned: u64,
    /// Skipped corrections per bin.
    pub skipped_per_bin: Vec<u64>,
}

impl StepQa {
    pub(crate) fn new(
        configuration: &str,
        step: &str,
        key: &str,
        state: StepState,
        qa: &SkipCounter,
    ) -> Self {
        Self {
            configuration: configuration.to_string(),
            step: step.to_string(),
            key: key.to_string(),
            state,
            skipped: qa.total(),
            unbinned: qa.unbinned(),
            skipped_per_bin: qa.per_bin().to_vec(),
        }
    }
}

/// What a step needs to know about the configuration that owns it.
#[derive(Debug, Clone, Copy)]
pub struct StepSetup<'a> {
    /// Owning configuration name, prefix of every accumulator name.
    pub configuration: &'a str,
    /// Event classes the calibration is binned in.
    pub event_classes: &'a EventClassVariableSet,
    /// Harmonics declared by the configuration.
    pub harmonics: HarmonicSet,
}

impl StepSetup<'_> {
    pub(crate) fn accumulator_name(&self, suffix: &str) -> String {
        format!("{}_{suffix}", self.configuration)
    }
}

/// Latest Q-vectors of every configuration, keyed by configuration name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerQnVectors {
    vectors: BTreeMap<String, QnVector>,
}

impl PeerQnVectors {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the Q-vector of `configuration`.
    pub fn insert(&mut self, configuration: impl Into<String>, qn: QnVector) {
        self.vectors.insert(configuration.into(), qn);
    }

    /// Q-vector of `configuration`.
    pub fn get(&self, configuration: &str) -> Option<&QnVector> {
        self.vectors.get(configuration)
    }
}

/// Per-event input of a Q-vector step.
#[derive(Debug, Clone, Copy)]
pub struct StepInput<'a> {
    /// Current event variables.
    pub variables: &'a [f64],
    /// Plain Q-vector of the owning configuration, carrying every built harmonic.
    pub plain: &'a QnVector,
    /// Other configurations as corrected before the current stage.
    pub peers: &'a PeerQnVectors,
}

pub(crate) fn default_validation_threshold() -> u64 {
    DEFAULT_VALIDATION_THRESHOLD
}

/// Finite and not above the meaningless-result threshold.
pub(crate) fn is_meaningful(factor: f64) -> bool {
    factor.is_finite() && factor.abs() <= MEANINGLESS_THRESHOLD
}

pub(crate) fn not_initialized(step: &str, configuration: &str) -> Error {
    Error::Structural(format!(
        "correction step '{step}' of configuration '{configuration}' used before initialization"
    ))
}

/// Settings of a Q-vector correction step, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QnCorrectionSettings {
    /// Recentering.
    Recentering(RecenteringSettings),
    /// Twist and rescale.
    TwistAndRescale(TwistAndRescaleSettings),
    /// Alignment to a reference configuration.
    Alignment(AlignmentSettings),
}

/// Settings of an input-data correction step, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputCorrectionSettings {
    /// Gain equalization.
    GainEqualization(GainEqualizationSettings),
}

/// Q-vector correction step.
#[derive(Debug, Clone)]
pub enum QnCorrection {
    /// Recentering.
    Recentering(Recentering),
    /// Twist and rescale.
    TwistAndRescale(TwistAndRescale),
    /// Alignment.
    Alignment(Alignment),
}

impl QnCorrection {
    /// Build a step for the configuration described by `setup`.
    pub fn new(setup: &StepSetup<'_>, settings: QnCorrectionSettings) -> Result<Self> {
        Ok(match settings {
            QnCorrectionSettings::Recentering(s) => Self::Recentering(Recentering::new(setup, s)?),
            QnCorrectionSettings::TwistAndRescale(s) => {
                Self::TwistAndRescale(TwistAndRescale::new(setup, s)?)
            }
            QnCorrectionSettings::Alignment(s) => Self::Alignment(Alignment::new(setup, s)?),
        })
    }

    /// Step name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Recentering(s) => s.name(),
            Self::TwistAndRescale(s) => s.name(),
            Self::Alignment(s) => s.name(),
        }
    }

    /// Current state.
    pub fn state(&self) -> StepState {
        match self {
            Self::Recentering(s) => s.state(),
            Self::TwistAndRescale(s) => s.state(),
            Self::Alignment(s) => s.state(),
        }
    }

    /// Harmonics the plain Q-vector must carry beyond the declared ones.
    pub fn required_harmonics(&self) -> HarmonicSet {
        match self {
            Self::TwistAndRescale(s) => s.required_harmonics(),
            Self::Recentering(_) | Self::Alignment(_) => HarmonicSet::empty(),
        }
    }

    /// Other configurations read by the step, with the harmonics read from each.
    pub fn references(&self) -> Vec<(&str, HarmonicSet)> {
        match self {
            Self::Recentering(_) => Vec::new(),
            Self::TwistAndRescale(s) => s.references(),
            Self::Alignment(s) => s.references(),
        }
    }

    /// Try to attach calibration input; `Ok(false)` keeps the step calibrating.
    pub fn attach_input(&mut self, input: &CalibrationInput<'_>) -> Result<bool> {
        match self {
            Self::Recentering(s) => s.attach_input(input),
            Self::TwistAndRescale(s) => s.attach_input(input),
            Self::Alignment(s) => s.attach_input(input),
        }
    }

    /// Allocate output accumulators if the state collects.
    pub fn create_output(&mut self) -> Result<()> {
        match self {
            Self::Recentering(s) => s.create_output(),
            Self::TwistAndRescale(s) => s.create_output(),
            Self::Alignment(s) => s.create_output(),
        }
    }

    /// Run on the current Q-vector.
    pub fn process(&mut self, qn: &QnVector, input: &StepInput<'_>) -> Result<StepOutcome> {
        match self {
            Self::Recentering(s) => s.process(qn, input),
            Self::TwistAndRescale(s) => s.process(qn, input),
            Self::Alignment(s) => s.process(qn, input),
        }
    }

    /// Collected output accumulators.
    pub fn calibration_output(&self) -> Vec<AccumulatorStorage> {
        match self {
            Self::Recentering(s) => s.calibration_output(),
            Self::TwistAndRescale(s) => s.calibration_output(),
            Self::Alignment(s) => s.calibration_output(),
        }
    }

    /// Skip counters.
    pub fn qa(&self) -> &SkipCounter {
        match self {
            Self::Recentering(s) => s.qa(),
            Self::TwistAndRescale(s) => s.qa(),
            Self::Alignment(s) => s.qa(),
        }
    }
}

impl Keyed for QnCorrection {
    fn key(&self) -> &str {
        match self {
            Self::Recentering(_) => RECENTERING_KEY,
            Self::TwistAndRescale(_) => TWIST_AND_RESCALE_KEY,
            Self::Alignment(_) => ALIGNMENT_KEY,
        }
    }
}

/// Input-data correction step (channels configurations only).
#[derive(Debug, Clone)]
pub enum InputCorrection {
    /// Gain equalization.
    GainEqualization(GainEqualization),
}

impl InputCorrection {
    /// Build a step for a channels configuration.
    pub fn new(
        setup: &StepSetup<'_>,
        channels: &ChannelSetup,
        settings: InputCorrectionSettings,
    ) -> Result<Self> {
        Ok(match settings {
            InputCorrectionSettings::GainEqualization(s) => {
                Self::GainEqualization(GainEqualization::new(setup, channels, s)?)
            }
        })
    }

    /// Step name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::GainEqualization(s) => s.name(),
        }
    }

    /// Current state.
    pub fn state(&self) -> StepState {
        match self {
            Self::GainEqualization(s) => s.state(),
        }
    }

    /// Try to attach calibration input; `Ok(false)` keeps the step calibrating.
    pub fn attach_input(&mut self, input: &CalibrationInput<'_>) -> Result<bool> {
        match self {
            Self::GainEqualization(s) => s.attach_input(input),
        }
    }

    /// Allocate output accumulators if the state collects.
    pub fn create_output(&mut self) -> Result<()> {
        match self {
            Self::GainEqualization(s) => s.create_output(),
        }
    }

    /// Run on the buffered data vectors of the event.
    pub fn process(&mut self, variables: &[f64], data: &mut [DataVector]) -> Result<StepOutcome> {
        match self {
            Self::GainEqualization(s) => s.process(variables, data),
        }
    }

    /// Collected output accumulators.
    pub fn calibration_output(&self) -> Vec<AccumulatorStorage> {
        match self {
            Self::GainEqualization(s) => s.calibration_output(),
        }
    }

    /// Skip counters.
    pub fn qa(&self) -> &SkipCounter {
        match self {
            Self::GainEqualization(s) => s.qa(),
        }
    }
}

impl Keyed for InputCorrection {
    fn key(&self) -> &str {
        match self {
            Self::GainEqualization(_) => GAIN_EQUALIZATION_KEY,
        }
    }
}
