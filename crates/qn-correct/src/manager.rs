//! Run orchestration.
//!
//! The [`Manager`] owns the per-event variable bank and every detector. Per
//! event the driver refreshes the variables, feeds data vectors, calls
//! [`Manager::process_event`], reads the Q-vectors and clears the event.
//!
//! Q-vector corrections run stage by stage: every configuration first builds
//! its plain Q-vector, then for each step key (in global key order) the
//! latest Q-vectors of all configurations are snapshotted and every
//! configuration having a step with that key runs it. A step that reads
//! another configuration therefore sees it corrected up to, but excluding,
//! the current stage.

use crate::calibration::{ALL_PROCESSES, CalibrationStore};
use crate::correction::{PeerQnVectors, StepQa};
use crate::detector::{Detector, DetectorConfiguration};
use crate::qvector::QnVector;
use qn_core::{Error, EventClassVariableSet, Result, VariableBank};
use qn_hist::AccumulatorList;
use serde::Serialize;
use std::collections::BTreeSet;

/// QA summary of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QaReport {
    /// Process label the run collected for.
    pub process: String,
    /// Events processed.
    pub events: u64,
    /// One entry per correction step.
    pub steps: Vec<StepQa>,
}

/// Owner of the detectors, the variable bank and the calibration context.
#[derive(Debug, Clone)]
pub struct Manager {
    variables: VariableBank,
    event_class_sets: Vec<EventClassVariableSet>,
    detectors: Vec<Detector>,
    calibration_input: CalibrationStore,
    process: String,
    initialized: bool,
    events: u64,
}

impl Manager {
    /// Manager with a variable bank of `n_variables` slots.
    pub fn new(n_variables: usize) -> Self {
        Self {
            variables: VariableBank::new(n_variables),
            event_class_sets: Vec::new(),
            detectors: Vec::new(),
            calibration_input: CalibrationStore::new(),
            process: ALL_PROCESSES.to_string(),
            initialized: false,
            events: 0,
        }
    }

    /// Register a named event-class variable set.
    pub fn add_event_class_variable_set(&mut self, set: EventClassVariableSet) -> Result<()> {
        if self.event_class_variable_set(set.name()).is_some() {
            return Err(Error::Structural(format!(
                "event-class variable set '{}' already registered",
                set.name()
            )));
        }
        if let Some(v) = set.variables().iter().find(|v| v.id() >= self.variables.len()) {
            return Err(Error::Structural(format!(
                "event-class variable '{}' has id {} outside the {}-slot variable bank",
                v.label(),
                v.id(),
                self.variables.len()
            )));
        }
        self.event_class_sets.push(set);
        Ok(())
    }

    /// Registered event-class variable set by name.
    pub fn event_class_variable_set(&self, name: &str) -> Option<&EventClassVariableSet> {
        self.event_class_sets.iter().find(|s| s.name() == name)
    }

    /// Add a detector. Duplicate ids, detector names or configuration names are structural errors.
    pub fn add_detector(&mut self, detector: Detector) -> Result<()> {
        if self.initialized {
            return Err(Error::Structural(format!(
                "detector '{}' added after initialization",
                detector.name()
            )));
        }
        if self.detectors.iter().any(|d| d.id() == detector.id() || d.name() == detector.name()) {
            return Err(Error::Structural(format!(
                "detector id {} or name '{}' already in use",
                detector.id(),
                detector.name()
            )));
        }
        for c in detector.configurations() {
            if self.configuration(c.name()).is_some() {
                return Err(Error::Structural(format!(
                    "configuration name '{}' already used by another detector",
                    c.name()
                )));
            }
        }
        self.detectors.push(detector);
        Ok(())
    }

    /// Detectors in insertion order.
    pub fn detectors(&self) -> &[Detector] {
        &self.detectors
    }

    /// Detector by id.
    pub fn detector(&self, id: usize) -> Option<&Detector> {
        self.detectors.iter().find(|d| d.id() == id)
    }

    /// Configuration by name, across detectors.
    pub fn configuration(&self, name: &str) -> Option<&DetectorConfiguration> {
        self.configurations().find(|c| c.name() == name)
    }

    /// All configurations, detector by detector.
    pub fn configurations(&self) -> impl Iterator<Item = &DetectorConfiguration> {
        self.detectors.iter().flat_map(|d| d.configurations().iter())
    }

    fn configurations_mut(&mut self) -> impl Iterator<Item = &mut DetectorConfiguration> {
        self.detectors.iter_mut().flat_map(|d| d.configurations_mut().iter_mut())
    }

    /// Set the calibration input of the run.
    pub fn set_calibration_input(&mut self, store: CalibrationStore) {
        self.calibration_input = store;
    }

    /// Calibration input of the run.
    pub fn calibration_input(&self) -> &CalibrationStore {
        &self.calibration_input
    }

    /// Set the label of the process being run.
    pub fn set_current_process(&mut self, process: impl Into<String>) {
        self.process = process.into();
    }

    /// Label of the process being run.
    pub fn current_process(&self) -> &str {
        &self.process
    }

    fn check_references(&self) -> Result<()> {
        for c in self.configurations() {
            for (name, harmonics) in c.references() {
                let Some(peer) = self.configuration(name) else {
                    return Err(Error::NotFound(format!(
                        "configuration '{}' references unknown configuration '{name}'",
                        c.name()
                    )));
                };
                if !peer.harmonics().is_superset(&harmonics) {
                    return Err(Error::Structural(format!(
                        "configuration '{}' reads harmonics {:?} of '{name}', which declares {:?}",
                        c.name(),
                        harmonics.iter().collect::<Vec<_>>(),
                        peer.harmonics().iter().collect::<Vec<_>>()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Validate cross-configuration references, create every output
    /// accumulator and attach the calibration input of the current process.
    pub fn initialize(&mut self) -> Result<()> {
        self.check_references()?;
        let store = &self.calibration_input;
        let input = store.input_for(&self.process);
        for detector in &mut self.detectors {
            for c in detector.configurations_mut() {
                c.initialize(&input)?;
            }
        }
        self.initialized = true;
        self.events = 0;
        log::debug!(
            "initialized {} detectors for process '{}'",
            self.detectors.len(),
            self.process
        );
        Ok(())
    }

    /// Per-event variables.
    pub fn variables(&self) -> &VariableBank {
        &self.variables
    }

    /// Per-event variables, for the refresh at the start of each event.
    pub fn variables_mut(&mut self) -> &mut VariableBank {
        &mut self.variables
    }

    /// Feed one contribution to every configuration of detector `detector_id`.
    /// Returns how many configurations kept it.
    pub fn add_data_vector(
        &mut self,
        detector_id: usize,
        phi: f64,
        weight: f64,
        channel: Option<usize>,
    ) -> Result<usize> {
        let variables = self.variables.values();
        let detector = self
            .detectors
            .iter_mut()
            .find(|d| d.id() == detector_id)
            .ok_or_else(|| Error::NotFound(format!("detector id {detector_id}")))?;
        detector.add_data_vector(variables, phi, weight, channel)
    }

    fn peers(&self) -> PeerQnVectors {
        let mut peers = PeerQnVectors::new();
        for c in self.configurations() {
            if let Some(q) = c.latest() {
                peers.insert(c.name(), q.clone());
            }
        }
        peers
    }

    /// Build and correct the Q-vectors of every configuration for the current event.
    pub fn process_event(&mut self) -> Result<()> {
        if !self.initialized {
            return Err(Error::Structural("manager used before initialization".into()));
        }
        let keys: BTreeSet<String> =
            self.configurations().flat_map(|c| c.correction_keys()).collect();
        {
            let variables = self.variables.values();
            for detector in &mut self.detectors {
                for c in detector.configurations_mut() {
                    c.build_qn_vectors(variables)?;
                }
            }
        }
        for key in &keys {
            let peers = self.peers();
            let variables = self.variables.values();
            for detector in &mut self.detectors {
                for c in detector.configurations_mut() {
                    c.process_stage(key, variables, &peers)?;
                }
            }
        }
        self.events += 1;
        Ok(())
    }

    /// Q-vector of configuration `configuration` at `stage`.
    pub fn qn_vector(&self, configuration: &str, stage: &str) -> Option<&QnVector> {
        self.configuration(configuration)?.qn_vector(stage)
    }

    /// Reset every configuration and the variable bank for the next event.
    pub fn clear_event(&mut self) {
        self.configurations_mut().for_each(DetectorConfiguration::clear);
        self.variables.reset();
    }

    /// Number of processed events since initialization.
    pub fn events(&self) -> u64 {
        self.events
    }

    /// Collected calibration under the current process label, plus the
    /// merged list under [`ALL_PROCESSES`].
    pub fn calibration_output(&self) -> Result<CalibrationStore> {
        let list: AccumulatorList =
            self.configurations().flat_map(DetectorConfiguration::calibration_output).collect();
        let mut store = CalibrationStore::new();
        store.insert(self.process.clone(), list);
        if self.process != ALL_PROCESSES {
            store.rebuild_merged()?;
        }
        Ok(store)
    }

    /// Per-step skip counters.
    pub fn qa_report(&self) -> QaReport {
        QaReport {
            process: self.process.clone(),
            events: self.events,
            steps: self.configurations().flat_map(DetectorConfiguration::qa).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correction::{AlignmentSettings, QnCorrectionSettings, RecenteringSettings};
    use qn_core::{EventClassVariable, HarmonicSet};

    fn classes() -> EventClassVariableSet {
        EventClassVariableSet::with_variables(
            "cent",
            vec![EventClassVariable::uniform(0, "centrality", 2, 0.0, 100.0).unwrap()],
        )
    }

    fn tracks(name: &str, h: &[u32]) -> DetectorConfiguration {
        DetectorConfiguration::tracks(name, classes(), HarmonicSet::new(h).unwrap()).unwrap()
    }

    #[test]
    fn test_duplicate_detectors_rejected() {
        let mut m = Manager::new(4);
        m.add_detector(Detector::new(0, "TPC").with_configuration(tracks("TPC", &[2])).unwrap())
            .unwrap();
        assert!(matches!(m.add_detector(Detector::new(0, "FMD")), Err(Error::Structural(_))));
        assert!(matches!(m.add_detector(Detector::new(1, "TPC")), Err(Error::Structural(_))));
        let clash = Detector::new(2, "FMD").with_configuration(tracks("TPC", &[2])).unwrap();
        assert!(matches!(m.add_detector(clash), Err(Error::Structural(_))));
    }

    #[test]
    fn test_unknown_reference_fails_initialize() {
        let mut m = Manager::new(4);
        let mut fmd = tracks("FMD", &[2]);
        fmd.add_correction(QnCorrectionSettings::Alignment(AlignmentSettings::new("TPC", 2)))
            .unwrap();
        m.add_detector(Detector::new(0, "FMD").with_configuration(fmd).unwrap()).unwrap();
        assert!(matches!(m.initialize(), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_reference_must_carry_harmonic() {
        let mut m = Manager::new(4);
        let mut fmd = tracks("FMD", &[2]);
        fmd.add_correction(QnCorrectionSettings::Alignment(AlignmentSettings::new("TPC", 2)))
            .unwrap();
        m.add_detector(Detector::new(0, "FMD").with_configuration(fmd).unwrap()).unwrap();
        m.add_detector(Detector::new(1, "TPC").with_configuration(tracks("TPC", &[1])).unwrap())
            .unwrap();
        assert!(matches!(m.initialize(), Err(Error::Structural(_))));
    }

    #[test]
    fn test_event_cycle() {
        let mut m = Manager::new(4);
        let mut tpc = tracks("TPC", &[2]);
        tpc.add_correction(QnCorrectionSettings::Recentering(RecenteringSettings::default()))
            .unwrap();
        m.add_detector(Detector::new(0, "TPC").with_configuration(tpc).unwrap()).unwrap();
        m.set_current_process("run1");
        assert!(m.process_event().is_err());
        m.initialize().unwrap();

        m.variables_mut().set(0, 30.0).unwrap();
        assert_eq!(m.add_data_vector(0, 0.1, 1.0, None).unwrap(), 1);
        assert!(matches!(m.add_data_vector(5, 0.1, 1.0, None), Err(Error::NotFound(_))));
        m.process_event().unwrap();
        assert!(m.qn_vector("TPC", "plain").unwrap().is_good());
        assert!(m.qn_vector("TPC", "rec").is_none());
        assert_eq!(m.qn_vector("TPC", "latest"), m.qn_vector("TPC", "plain"));
        m.clear_event();
        assert!(m.qn_vector("TPC", "latest").is_none());
        assert!(m.variables().get(0).unwrap().is_nan());

        let store = m.calibration_output().unwrap();
        assert_eq!(store.list("run1").unwrap().get("TPC_rec").unwrap().total_entries(), 1);
        assert_eq!(store.list("all").unwrap().get("TPC_rec").unwrap().total_entries(), 1);

        let qa = m.qa_report();
        assert_eq!(qa.events, 1);
        assert_eq!(qa.steps.len(), 1);
        assert_eq!(qa.steps[0].step, "rec");
    }
}
