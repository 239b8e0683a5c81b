//! Detectors and detector configurations.
//!
//! A [`DetectorConfiguration`] buffers the event's data vectors, builds the
//! plain Q-vector from them and runs its correction chains. It comes in two
//! flavors: tracks (unit weights, no channel) and channels (per-channel raw
//! weights that the input-data chain equalizes before the Q-vector is built).
//! A [`Detector`] groups the configurations fed by the same data stream.

use crate::calibration::CalibrationInput;
use crate::correction::{
    CorrectionChain, InputCorrection, InputCorrectionSettings, Keyed, PeerQnVectors, QnCorrection,
    QnCorrectionSettings, StepInput, StepOutcome, StepQa, StepSetup,
};
use crate::qvector::{Normalization, QnVector, QnVectorBuild};
use qn_core::{CutSet, Error, EventClassVariableSet, HarmonicSet, Result};
use qn_hist::AccumulatorStorage;

/// Stage name of the Q-vector built from raw channel weights.
pub const RAW_STAGE: &str = "raw";
/// Stage name of the Q-vector entering the correction chain.
pub const PLAIN_STAGE: &str = "plain";
/// Alias of the last produced stage.
pub const LATEST_STAGE: &str = "latest";

/// One contribution of the event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataVector {
    phi: f64,
    weight: f64,
    equalized_weight: f64,
    channel: Option<usize>,
}

impl DataVector {
    /// Contribution at azimuth `phi`. The equalized weight starts as `weight`.
    pub fn new(phi: f64, weight: f64, channel: Option<usize>) -> Self {
        Self { phi, weight, equalized_weight: weight, channel }
    }

    /// Azimuthal angle.
    pub fn phi(&self) -> f64 {
        self.phi
    }

    /// Raw weight.
    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Weight after the input-data corrections.
    pub fn equalized_weight(&self) -> f64 {
        self.equalized_weight
    }

    pub(crate) fn set_equalized_weight(&mut self, weight: f64) {
        self.equalized_weight = weight;
    }

    /// Detector channel, if any.
    pub fn channel(&self) -> Option<usize> {
        self.channel
    }
}

/// Channel structure of a channels configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSetup {
    n_channels: usize,
    used: Option<Vec<bool>>,
    groups: Option<Vec<usize>>,
    group_weights: Option<Vec<f64>>,
}

impl ChannelSetup {
    /// `n_channels` channels, all used, no groups.
    pub fn new(n_channels: usize) -> Self {
        Self { n_channels, used: None, groups: None, group_weights: None }
    }

    /// Restrict to the channels flagged in `used`.
    pub fn with_used_channels(mut self, used: Vec<bool>) -> Result<Self> {
        if used.len() != self.n_channels {
            return Err(Error::Structural(format!(
                "used-channel mask has {} entries, expected {}",
                used.len(),
                self.n_channels
            )));
        }
        self.used = Some(used);
        Ok(self)
    }

    /// Assign every channel to a group.
    pub fn with_groups(mut self, groups: Vec<usize>) -> Result<Self> {
        if groups.len() != self.n_channels {
            return Err(Error::Structural(format!(
                "channel-group assignment has {} entries, expected {}",
                groups.len(),
                self.n_channels
            )));
        }
        self.groups = Some(groups);
        Ok(self)
    }

    /// Hard-coded weight per group. Groups must be assigned first.
    pub fn with_group_weights(mut self, weights: Vec<f64>) -> Result<Self> {
        let n_groups = self.n_groups().ok_or_else(|| {
            Error::Structural("group weights given without a channel-group assignment".into())
        })?;
        if weights.len() != n_groups {
            return Err(Error::Structural(format!(
                "{} group weights given for {n_groups} channel groups",
                weights.len()
            )));
        }
        self.group_weights = Some(weights);
        Ok(self)
    }

    /// Number of channels.
    pub fn n_channels(&self) -> usize {
        self.n_channels
    }

    /// Used-channel mask, if restricted.
    pub fn used(&self) -> Option<&[bool]> {
        self.used.as_deref()
    }

    /// Whether `channel` exists and is used.
    pub fn is_used(&self, channel: usize) -> bool {
        channel < self.n_channels && self.used.as_ref().is_none_or(|u| u[channel])
    }

    /// Group of each channel, if assigned.
    pub fn groups(&self) -> Option<&[usize]> {
        self.groups.as_deref()
    }

    /// Group of `channel`.
    pub fn group_of(&self, channel: usize) -> Option<usize> {
        self.groups.as_ref()?.get(channel).copied()
    }

    /// Number of groups (highest group index + 1).
    pub fn n_groups(&self) -> Option<usize> {
        self.groups.as_ref().map(|g| g.iter().max().map_or(0, |m| m + 1))
    }

    /// Hard-coded group weights.
    pub fn group_weights(&self) -> Option<&[f64]> {
        self.group_weights.as_deref()
    }
}

/// Flavor of a detector configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigurationKind {
    /// One unit-weight contribution per track.
    Tracks,
    /// Weighted contributions per detector channel.
    Channels(ChannelSetup),
}

/// Q-vector definition of one detector: cuts, harmonics, normalization and
/// correction chains.
#[derive(Debug, Clone)]
pub struct DetectorConfiguration {
    name: String,
    kind: ConfigurationKind,
    event_classes: EventClassVariableSet,
    harmonics: HarmonicSet,
    normalization: Normalization,
    min_contributions: usize,
    cuts: CutSet,
    input_corrections: CorrectionChain<InputCorrection>,
    qn_corrections: CorrectionChain<QnCorrection>,
    data: Vec<DataVector>,
    built_harmonics: HarmonicSet,
    plain: QnVector,
    stages: Vec<(String, QnVector)>,
    chain_open: bool,
    initialized: bool,
}

impl DetectorConfiguration {
    fn with_kind(
        name: impl Into<String>,
        kind: ConfigurationKind,
        event_classes: EventClassVariableSet,
        harmonics: HarmonicSet,
    ) -> Result<Self> {
        let name = name.into();
        if harmonics.is_empty() {
            return Err(Error::Structural(format!("configuration '{name}' declares no harmonic")));
        }
        if event_classes.is_empty() {
            return Err(Error::Structural(format!(
                "configuration '{name}' has no event-class variable"
            )));
        }
        Ok(Self {
            name,
            kind,
            event_classes,
            harmonics,
            normalization: Normalization::None,
            min_contributions: 1,
            cuts: CutSet::new(),
            input_corrections: CorrectionChain::new(),
            qn_corrections: CorrectionChain::new(),
            data: Vec::new(),
            built_harmonics: harmonics,
            plain: QnVector::new(harmonics),
            stages: Vec::new(),
            chain_open: false,
            initialized: false,
        })
    }

    /// Tracks configuration.
    pub fn tracks(
        name: impl Into<String>,
        event_classes: EventClassVariableSet,
        harmonics: HarmonicSet,
    ) -> Result<Self> {
        Self::with_kind(name, ConfigurationKind::Tracks, event_classes, harmonics)
    }

    /// Channels configuration.
    pub fn channels(
        name: impl Into<String>,
        event_classes: EventClassVariableSet,
        harmonics: HarmonicSet,
        channels: ChannelSetup,
    ) -> Result<Self> {
        if channels.n_channels() == 0 {
            return Err(Error::Structural("channels configuration without channels".into()));
        }
        Self::with_kind(name, ConfigurationKind::Channels(channels), event_classes, harmonics)
    }

    /// Set the normalization method.
    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = normalization;
        self
    }

    /// Set the contribution cuts.
    pub fn with_cuts(mut self, cuts: CutSet) -> Self {
        self.cuts = cuts;
        self
    }

    /// Set the minimum number of contributions for a good Q-vector.
    pub fn with_min_contributions(mut self, n: usize) -> Self {
        self.min_contributions = n;
        self
    }

    fn setup(&self) -> StepSetup<'_> {
        StepSetup {
            configuration: &self.name,
            event_classes: &self.event_classes,
            harmonics: self.harmonics,
        }
    }

    /// Add a Q-vector correction step.
    pub fn add_correction(&mut self, settings: QnCorrectionSettings) -> Result<()> {
        let step = QnCorrection::new(&self.setup(), settings)?;
        self.qn_corrections.insert(step)
    }

    /// Add an input-data correction step (channels configurations only).
    pub fn add_input_correction(&mut self, settings: InputCorrectionSettings) -> Result<()> {
        let ConfigurationKind::Channels(channels) = &self.kind else {
            return Err(Error::Structural(format!(
                "input-data corrections need a channels configuration, '{}' is tracks",
                self.name
            )));
        };
        let step = InputCorrection::new(&self.setup(), channels, settings)?;
        self.input_corrections.insert(step)
    }

    /// Configuration name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Flavor.
    pub fn kind(&self) -> &ConfigurationKind {
        &self.kind
    }

    /// Declared harmonics.
    pub fn harmonics(&self) -> HarmonicSet {
        self.harmonics
    }

    /// Harmonics built into the plain Q-vector (declared plus required by steps).
    pub fn built_harmonics(&self) -> HarmonicSet {
        self.built_harmonics
    }

    /// Event classes.
    pub fn event_classes(&self) -> &EventClassVariableSet {
        &self.event_classes
    }

    /// Normalization method.
    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    /// Contribution cuts.
    pub fn cuts(&self) -> &CutSet {
        &self.cuts
    }

    /// Q-vector correction steps in execution order.
    pub fn qn_corrections(&self) -> &CorrectionChain<QnCorrection> {
        &self.qn_corrections
    }

    /// Input-data correction steps in execution order.
    pub fn input_corrections(&self) -> &CorrectionChain<InputCorrection> {
        &self.input_corrections
    }

    /// Keys of the Q-vector correction steps.
    pub fn correction_keys(&self) -> Vec<String> {
        self.qn_corrections.keys().map(str::to_string).collect()
    }

    /// Other configurations read by the steps, with the harmonics they must carry.
    pub fn references(&self) -> Vec<(&str, HarmonicSet)> {
        self.qn_corrections.iter().flat_map(QnCorrection::references).collect()
    }

    /// Allocate every output accumulator and attach calibration input.
    pub fn initialize(&mut self, input: &CalibrationInput<'_>) -> Result<()> {
        let mut built = self.harmonics;
        for step in self.qn_corrections.iter() {
            built = built.union(&step.required_harmonics());
        }
        self.built_harmonics = built;

        for step in self.input_corrections.iter_mut() {
            step.attach_input(input)?;
            step.create_output()?;
        }
        for step in self.qn_corrections.iter_mut() {
            step.attach_input(input)?;
            step.create_output()?;
        }
        self.initialized = true;
        self.clear();
        log::debug!(
            "{}: initialized with {} input and {} Q-vector corrections",
            self.name,
            self.input_corrections.len(),
            self.qn_corrections.len()
        );
        Ok(())
    }

    /// Whether [`initialize`](Self::initialize) has run.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Buffer one contribution if the event passes the cuts. Returns whether it was kept.
    pub fn add_data_vector(
        &mut self,
        variables: &[f64],
        phi: f64,
        weight: f64,
        channel: Option<usize>,
    ) -> Result<bool> {
        if !self.cuts.accept(variables) {
            return Ok(false);
        }
        let data = match &self.kind {
            ConfigurationKind::Tracks => DataVector::new(phi, 1.0, None),
            ConfigurationKind::Channels(setup) => {
                let Some(ch) = channel else {
                    return Err(Error::Structural(format!(
                        "configuration '{}' needs a channel for every data vector",
                        self.name
                    )));
                };
                if ch >= setup.n_channels() {
                    return Err(Error::Validation(format!(
                        "channel {ch} out of range for configuration '{}' with {} channels",
                        self.name,
                        setup.n_channels()
                    )));
                }
                if !setup.is_used(ch) {
                    return Ok(false);
                }
                DataVector::new(phi, weight, Some(ch))
            }
        };
        self.data.push(data);
        Ok(true)
    }

    /// Buffered contributions of the event.
    pub fn data(&self) -> &[DataVector] {
        &self.data
    }

    fn build(&self, equalized: bool) -> QnVector {
        let mut build = QnVectorBuild::new(self.built_harmonics);
        for d in &self.data {
            build.add(d.phi(), if equalized { d.equalized_weight() } else { d.weight() });
        }
        build.check_quality(self.min_contributions);
        build.normalize(self.normalization);
        build.into_qn()
    }

    /// Build the raw and plain Q-vectors, running the input-data chain in
    /// between. Opens the Q-vector chain for the event unless an input step
    /// did not apply.
    pub fn build_qn_vectors(&mut self, variables: &[f64]) -> Result<()> {
        if !self.initialized {
            return Err(Error::Structural(format!(
                "configuration '{}' processed before initialization",
                self.name
            )));
        }
        self.stages.clear();
        let mut input_applied = true;
        if let ConfigurationKind::Channels(_) = self.kind {
            let raw = self.build(false);
            self.stages.push((RAW_STAGE.to_string(), raw.restricted(self.harmonics)));
            for step in self.input_corrections.iter_mut() {
                if let StepOutcome::NotApplied = step.process(variables, &mut self.data)? {
                    input_applied = false;
                    break;
                }
            }
        }
        self.plain = self.build(true);
        self.stages.push((PLAIN_STAGE.to_string(), self.plain.restricted(self.harmonics)));
        // Q-vector steps never see weights the input chain has not finished with
        self.chain_open = input_applied;
        Ok(())
    }

    /// Run the Q-vector step with `key`, if the configuration has one and no
    /// earlier step stopped the chain for this event.
    pub fn process_stage(
        &mut self,
        key: &str,
        variables: &[f64],
        peers: &PeerQnVectors,
    ) -> Result<()> {
        if !self.chain_open {
            return Ok(());
        }
        let Some(step) = self.qn_corrections.get_mut(key) else {
            return Ok(());
        };
        let Some((_, current)) = self.stages.last() else {
            return Ok(());
        };
        let current = current.clone();
        let input = StepInput { variables, plain: &self.plain, peers };
        match step.process(&current, &input)? {
            StepOutcome::NotApplied => self.chain_open = false,
            StepOutcome::Applied(snapshots) => {
                for s in snapshots {
                    self.stages.push((s.stage.to_string(), s.qn));
                }
            }
        }
        Ok(())
    }

    /// Build the Q-vectors and run the whole Q-vector chain. Steps reading
    /// other configurations see them as given in `peers`.
    pub fn process_corrections(&mut self, variables: &[f64], peers: &PeerQnVectors) -> Result<()> {
        self.build_qn_vectors(variables)?;
        for key in self.correction_keys() {
            self.process_stage(&key, variables, peers)?;
        }
        Ok(())
    }

    /// Q-vector at `stage` (`"raw"`, `"plain"`, a step stage name, a step key, or `"latest"`).
    pub fn qn_vector(&self, stage: &str) -> Option<&QnVector> {
        if stage == LATEST_STAGE {
            return self.latest();
        }
        if let Some((_, q)) = self.stages.iter().rev().find(|(s, _)| s == stage) {
            return Some(q);
        }
        // a step key resolves to the last snapshot that step produced
        let names: Vec<&str> = match self.qn_corrections.get(stage)? {
            QnCorrection::TwistAndRescale(_) => vec![
                crate::correction::RESCALE_STAGE,
                crate::correction::TWIST_STAGE,
            ],
            step => vec![step.name()],
        };
        names.iter().find_map(|n| self.stages.iter().rev().find(|(s, _)| s == n).map(|(_, q)| q))
    }

    /// Last produced Q-vector of the event.
    pub fn latest(&self) -> Option<&QnVector> {
        self.stages.last().map(|(_, q)| q)
    }

    /// Stage names produced in this event, in order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|(s, _)| s.as_str()).collect()
    }

    /// Reset the per-event state.
    pub fn clear(&mut self) {
        self.data.clear();
        self.plain = QnVector::new(self.built_harmonics);
        self.stages.clear();
        self.chain_open = false;
    }

    /// Output accumulators of every step.
    pub fn calibration_output(&self) -> Vec<AccumulatorStorage> {
        let input = self.input_corrections.iter().flat_map(InputCorrection::calibration_output);
        let qn = self.qn_corrections.iter().flat_map(QnCorrection::calibration_output);
        input.chain(qn).collect()
    }

    /// QA summary of every step.
    pub fn qa(&self) -> Vec<StepQa> {
        let input = self
            .input_corrections
            .iter()
            .map(|s| StepQa::new(&self.name, s.name(), s.key(), s.state(), s.qa()));
        let qn = self
            .qn_corrections
            .iter()
            .map(|s| StepQa::new(&self.name, s.name(), s.key(), s.state(), s.qa()));
        input.chain(qn).collect()
    }
}

/// Detector: an id, a name and the configurations its data stream feeds.
#[derive(Debug, Clone)]
pub struct Detector {
    id: usize,
    name: String,
    configurations: Vec<DetectorConfiguration>,
}

impl Detector {
    /// Detector without configurations.
    pub fn new(id: usize, name: impl Into<String>) -> Self {
        Self { id, name: name.into(), configurations: Vec::new() }
    }

    /// Add a configuration; duplicate names are structural errors.
    pub fn add_configuration(&mut self, configuration: DetectorConfiguration) -> Result<()> {
        if self.configuration(configuration.name()).is_some() {
            return Err(Error::Structural(format!(
                "detector '{}' already has a configuration '{}'",
                self.name,
                configuration.name()
            )));
        }
        self.configurations.push(configuration);
        Ok(())
    }

    /// Builder form of [`add_configuration`](Self::add_configuration).
    pub fn with_configuration(mut self, configuration: DetectorConfiguration) -> Result<Self> {
        self.add_configuration(configuration)?;
        Ok(self)
    }

    /// Detector id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Detector name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configurations.
    pub fn configurations(&self) -> &[DetectorConfiguration] {
        &self.configurations
    }

    /// Mutable configurations.
    pub fn configurations_mut(&mut self) -> &mut [DetectorConfiguration] {
        &mut self.configurations
    }

    /// Configuration by name.
    pub fn configuration(&self, name: &str) -> Option<&DetectorConfiguration> {
        self.configurations.iter().find(|c| c.name() == name)
    }

    /// Route one contribution to every configuration; returns how many kept it.
    pub fn add_data_vector(
        &mut self,
        variables: &[f64],
        phi: f64,
        weight: f64,
        channel: Option<usize>,
    ) -> Result<usize> {
        let mut kept = 0;
        for c in &mut self.configurations {
            if c.add_data_vector(variables, phi, weight, channel)? {
                kept += 1;
            }
        }
        Ok(kept)
    }

    /// Reset the per-event state of every configuration.
    pub fn clear(&mut self) {
        self.configurations.iter_mut().for_each(DetectorConfiguration::clear);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correction::{
        GainEqualizationMethod, GainEqualizationSettings, RecenteringSettings,
        TwistAndRescaleSettings,
    };
    use approx::assert_abs_diff_eq;
    use qn_core::{Cut, EventClassVariable};

    fn classes() -> EventClassVariableSet {
        EventClassVariableSet::with_variables(
            "cent",
            vec![EventClassVariable::uniform(0, "centrality", 4, 0.0, 100.0).unwrap()],
        )
    }

    fn harmonics(h: &[u32]) -> HarmonicSet {
        HarmonicSet::new(h).unwrap()
    }

    #[test]
    fn test_tracks_ignore_weight_and_apply_cuts() {
        let cuts = CutSet::new().with(Cut::above(1, 0.2));
        let mut c = DetectorConfiguration::tracks("TPC", classes(), harmonics(&[2]))
            .unwrap()
            .with_cuts(cuts);
        c.initialize(&CalibrationInput::empty()).unwrap();
        assert!(c.add_data_vector(&[10.0, 0.5], 0.0, 7.0, None).unwrap());
        assert!(!c.add_data_vector(&[10.0, 0.1], 1.0, 1.0, None).unwrap());
        assert_eq!(c.data().len(), 1);
        assert_eq!(c.data()[0].weight(), 1.0);

        c.process_corrections(&[10.0, 0.5], &PeerQnVectors::new()).unwrap();
        let plain = c.qn_vector("plain").unwrap();
        assert!(plain.is_good());
        assert_abs_diff_eq!(plain.qx(2), 1.0, epsilon = 1e-12);
        assert!(c.qn_vector("raw").is_none());
        assert_eq!(c.stage_names(), vec!["plain"]);
    }

    #[test]
    fn test_calibrating_step_stops_chain() {
        let mut c = DetectorConfiguration::tracks("TPC", classes(), harmonics(&[1])).unwrap();
        c.add_correction(QnCorrectionSettings::TwistAndRescale(TwistAndRescaleSettings::default()))
            .unwrap();
        c.add_correction(QnCorrectionSettings::Recentering(RecenteringSettings::default()))
            .unwrap();
        assert_eq!(c.correction_keys(), vec!["DDDD", "FFFF"]);
        c.initialize(&CalibrationInput::empty()).unwrap();
        assert!(c.built_harmonics().contains(2));
        assert!(!c.harmonics().contains(2));

        c.add_data_vector(&[10.0], 0.3, 1.0, None).unwrap();
        c.process_corrections(&[10.0], &PeerQnVectors::new()).unwrap();
        assert_eq!(c.stage_names(), vec!["plain"]);
        assert_eq!(c.latest(), c.qn_vector("plain"));
        assert!(!c.latest().unwrap().harmonics().contains(2));

        // only recentering collected, twist never ran
        let out = c.calibration_output();
        let rec = out.iter().find(|s| s.name() == "TPC_rec").unwrap();
        let twist = out.iter().find(|s| s.name() == "TPC_twist").unwrap();
        assert_eq!(rec.total_entries(), 1);
        assert_eq!(twist.total_entries(), 0);
    }

    #[test]
    fn test_channels_raw_and_equalized() {
        let setup = ChannelSetup::new(4).with_used_channels(vec![true, true, false, true]).unwrap();
        let mut c = DetectorConfiguration::channels("V0", classes(), harmonics(&[1]), setup)
            .unwrap()
            .with_normalization(Normalization::QOverM);
        c.add_input_correction(InputCorrectionSettings::GainEqualization(
            GainEqualizationSettings { method: GainEqualizationMethod::None, ..Default::default() },
        ))
        .unwrap();
        c.initialize(&CalibrationInput::empty()).unwrap();

        assert!(c.add_data_vector(&[10.0], 0.0, 3.0, Some(0)).unwrap());
        assert!(!c.add_data_vector(&[10.0], 0.0, 3.0, Some(2)).unwrap());
        assert!(matches!(c.add_data_vector(&[10.0], 0.0, 1.0, Some(9)), Err(Error::Validation(_))));
        assert!(matches!(c.add_data_vector(&[10.0], 0.0, 1.0, None), Err(Error::Structural(_))));

        c.build_qn_vectors(&[10.0]).unwrap();
        assert_eq!(c.stage_names(), vec!["raw", "plain"]);
        assert_abs_diff_eq!(c.qn_vector("raw").unwrap().qx(1), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(c.qn_vector("raw").unwrap().sum_of_weights(), 3.0);

        c.clear();
        assert!(c.data().is_empty());
        assert!(c.latest().is_none());
    }

    #[test]
    fn test_calibrating_input_step_stops_qn_chain() {
        let mut c =
            DetectorConfiguration::channels("V0", classes(), harmonics(&[1]), ChannelSetup::new(2))
                .unwrap();
        c.add_input_correction(InputCorrectionSettings::GainEqualization(
            GainEqualizationSettings::default(),
        ))
        .unwrap();
        c.add_correction(QnCorrectionSettings::Recentering(RecenteringSettings::default()))
            .unwrap();
        c.initialize(&CalibrationInput::empty()).unwrap();

        c.add_data_vector(&[10.0], 0.0, 2.0, Some(0)).unwrap();
        c.add_data_vector(&[10.0], 1.0, 5.0, Some(1)).unwrap();
        c.process_corrections(&[10.0], &PeerQnVectors::new()).unwrap();
        assert_eq!(c.stage_names(), vec!["raw", "plain"]);

        let out = c.calibration_output();
        let gain = out.iter().find(|s| s.name() == "V0_GainEqualization").unwrap();
        let rec = out.iter().find(|s| s.name() == "V0_rec").unwrap();
        assert_eq!(gain.total_entries(), 2);
        assert_eq!(rec.total_entries(), 0);
    }

    #[test]
    fn test_input_corrections_need_channels() {
        let mut c = DetectorConfiguration::tracks("TPC", classes(), harmonics(&[1])).unwrap();
        let err = c.add_input_correction(InputCorrectionSettings::GainEqualization(
            GainEqualizationSettings::default(),
        ));
        assert!(matches!(err, Err(Error::Structural(_))));
    }

    #[test]
    fn test_processing_before_initialize_fails() {
        let mut c = DetectorConfiguration::tracks("TPC", classes(), harmonics(&[1])).unwrap();
        assert!(c.build_qn_vectors(&[10.0]).is_err());
    }

    #[test]
    fn test_detector_rejects_duplicate_configuration() {
        let mut d = Detector::new(0, "TPC");
        let tpc = DetectorConfiguration::tracks("TPC", classes(), harmonics(&[1])).unwrap();
        d.add_configuration(tpc).unwrap();
        let dup = DetectorConfiguration::tracks("TPC", classes(), harmonics(&[2])).unwrap();
        assert!(matches!(d.add_configuration(dup), Err(Error::Structural(_))));
    }

    #[test]
    fn test_channel_setup_validation() {
        assert!(ChannelSetup::new(3).with_groups(vec![0, 1]).is_err());
        assert!(ChannelSetup::new(3).with_group_weights(vec![1.0]).is_err());
        let s = ChannelSetup::new(3).with_groups(vec![0, 1, 1]).unwrap();
        assert_eq!(s.n_groups(), Some(2));
        assert!(s.clone().with_group_weights(vec![1.0]).is_err());
        assert!(s.with_group_weights(vec![1.0, 2.0]).is_ok());
    }
}
