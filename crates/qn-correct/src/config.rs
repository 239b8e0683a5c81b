//! Declarative run configuration.
//!
//! A [`ManagerConfig`] describes the variable bank size, named event-class
//! variable sets and every detector with its configurations and correction
//! steps. It is read from YAML (JSON is accepted too) and turned into a ready
//! [`Manager`] by [`ManagerConfig::build`].
//!
//! ```yaml
//! n_variables: 8
//! event_classes:
//!   centrality:
//!     - { id: 0, label: centrality, bins: 10, min: 0.0, max: 100.0 }
//! detectors:
//!   - id: 0
//!     name: TPC
//!     configurations:
//!       - name: TPC
//!         event_classes: centrality
//!         harmonics: [1, 2]
//!         normalization: q_over_m
//!         cuts:
//!           - { variable: 3, kind: within, min: -0.8, max: 0.8 }
//!         corrections:
//!           - { type: recentering }
//!           - { type: twist_and_rescale }
//! ```

use crate::correction::{InputCorrectionSettings, QnCorrectionSettings};
use crate::detector::{ChannelSetup, Detector, DetectorConfiguration};
use crate::manager::Manager;
use crate::qvector::Normalization;
use qn_core::{
    Cut, CutKind, CutSet, Error, EventClassVariable, EventClassVariableSet, HarmonicSet, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Whole-run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagerConfig {
    /// Size of the per-event variable bank.
    pub n_variables: usize,
    /// Named event-class variable sets.
    #[serde(default)]
    pub event_classes: BTreeMap<String, Vec<EventClassVariableConfig>>,
    /// Detectors.
    pub detectors: Vec<DetectorConfig>,
}

/// Binning of one event-class variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BinningConfig {
    /// Explicit edges.
    Edges {
        /// Strictly increasing edges.
        edges: Vec<f64>,
    },
    /// Equal-width bins.
    Uniform {
        /// Number of bins.
        bins: usize,
        /// Lower limit.
        min: f64,
        /// Upper limit.
        max: f64,
    },
    /// Coarse sections split into fine bins.
    Sections {
        /// `(lower_edge, n_fine)` pairs.
        sections: Vec<(f64, usize)>,
    },
}

/// One event-class variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventClassVariableConfig {
    /// External variable id.
    pub id: usize,
    /// Axis label.
    pub label: String,
    /// Binning.
    #[serde(flatten)]
    pub binning: BinningConfig,
}

impl EventClassVariableConfig {
    fn build(&self) -> Result<EventClassVariable> {
        match &self.binning {
            BinningConfig::Edges { edges } => {
                EventClassVariable::from_edges(self.id, &self.label, edges.clone())
            }
            BinningConfig::Uniform { bins, min, max } => {
                EventClassVariable::uniform(self.id, &self.label, *bins, *min, *max)
            }
            BinningConfig::Sections { sections } => {
                EventClassVariable::from_sections(self.id, &self.label, sections)
            }
        }
    }
}

/// One detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectorConfig {
    /// Detector id used by the data stream.
    pub id: usize,
    /// Detector name.
    pub name: String,
    /// Configurations fed by the detector.
    pub configurations: Vec<ConfigurationConfig>,
}

/// A cut on one variable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CutConfig {
    /// External variable id.
    pub variable: usize,
    /// Predicate.
    #[serde(flatten)]
    pub kind: CutKind,
}

/// Channel structure of a channels configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelsConfig {
    /// Number of channels.
    pub n_channels: usize,
    /// Used-channel mask.
    #[serde(default)]
    pub used: Option<Vec<bool>>,
    /// Group of each channel.
    #[serde(default)]
    pub groups: Option<Vec<usize>>,
    /// Hard-coded weight per group.
    #[serde(default)]
    pub group_weights: Option<Vec<f64>>,
}

impl ChannelsConfig {
    fn build(&self) -> Result<ChannelSetup> {
        let mut setup = ChannelSetup::new(self.n_channels);
        if let Some(used) = &self.used {
            setup = setup.with_used_channels(used.clone())?;
        }
        if let Some(groups) = &self.groups {
            setup = setup.with_groups(groups.clone())?;
        }
        if let Some(weights) = &self.group_weights {
            setup = setup.with_group_weights(weights.clone())?;
        }
        Ok(setup)
    }
}

fn one() -> usize {
    1
}

/// One detector configuration. Giving `channels` makes it a channels configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigurationConfig {
    /// Configuration name, unique across the run.
    pub name: String,
    /// Name of the event-class variable set.
    pub event_classes: String,
    /// Declared harmonics.
    pub harmonics: HarmonicSet,
    /// Normalization.
    #[serde(default)]
    pub normalization: Normalization,
    /// Minimum contributions for a good Q-vector.
    #[serde(default = "one")]
    pub min_contributions: usize,
    /// Contribution cuts.
    #[serde(default)]
    pub cuts: Vec<CutConfig>,
    /// Channel structure.
    #[serde(default)]
    pub channels: Option<ChannelsConfig>,
    /// Input-data corrections.
    #[serde(default)]
    pub input_corrections: Vec<InputCorrectionSettings>,
    /// Q-vector corrections.
    #[serde(default)]
    pub corrections: Vec<QnCorrectionSettings>,
}

impl ConfigurationConfig {
    fn build(&self, event_classes: &EventClassVariableSet) -> Result<DetectorConfiguration> {
        let cuts = self
            .cuts
            .iter()
            .map(|c| Cut::new(c.variable, c.kind))
            .collect::<Result<CutSet>>()?;
        let configuration = match &self.channels {
            None => {
                DetectorConfiguration::tracks(&self.name, event_classes.clone(), self.harmonics)?
            }
            Some(channels) => DetectorConfiguration::channels(
                &self.name,
                event_classes.clone(),
                self.harmonics,
                channels.build()?,
            )?,
        };
        let mut configuration = configuration
            .with_normalization(self.normalization)
            .with_cuts(cuts)
            .with_min_contributions(self.min_contributions);
        for settings in &self.input_corrections {
            configuration.add_input_correction(settings.clone())?;
        }
        for settings in &self.corrections {
            configuration.add_correction(settings.clone())?;
        }
        Ok(configuration)
    }
}

impl ManagerConfig {
    /// Parse YAML (or JSON).
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        serde_yaml_ng::from_str(s).map_err(|e| Error::Validation(format!("configuration: {e}")))
    }

    /// Read and parse a configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Build the manager. It still has to be initialized.
    pub fn build(&self) -> Result<Manager> {
        let mut manager = Manager::new(self.n_variables);
        for (name, variables) in &self.event_classes {
            let variables =
                variables.iter().map(EventClassVariableConfig::build).collect::<Result<_>>()?;
            manager.add_event_class_variable_set(EventClassVariableSet::with_variables(
                name, variables,
            ))?;
        }
        for d in &self.detectors {
            let mut detector = Detector::new(d.id, &d.name);
            for c in &d.configurations {
                let event_classes =
                    manager.event_class_variable_set(&c.event_classes).ok_or_else(|| {
                        Error::NotFound(format!(
                            "event-class variable set '{}' of configuration '{}'",
                            c.event_classes, c.name
                        ))
                    })?;
                detector.add_configuration(c.build(event_classes)?)?;
            }
            manager.add_detector(detector)?;
        }
        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correction::{GainEqualizationMethod, TwistMethod};
    use crate::detector::ConfigurationKind;

    const YAML: &str = r#"
n_variables: 8
event_classes:
  default:
    - { id: 0, label: centrality, bins: 10, min: 0.0, max: 100.0 }
    - { id: 1, label: vz, sections: [[-10.0, 4], [-7.0, 1], [7.0, 8], [10.0, 1]] }
detectors:
  - id: 0
    name: TPC
    configurations:
      - name: TPC
        event_classes: default
        harmonics: [1, 2, 3]
        normalization: q_over_m
        cuts:
          - { variable: 3, kind: within, min: -0.8, max: 0.8 }
          - { variable: 4, kind: bit_set, bit: 3, expected: true }
        corrections:
          - { type: twist_and_rescale, apply_rescale: false }
          - { type: recentering, width_equalization: true }
  - id: 1
    name: V0
    configurations:
      - name: V0A
        event_classes: default
        harmonics: [2]
        channels: { n_channels: 4, groups: [0, 0, 1, 1] }
        input_corrections:
          - { type: gain_equalization, method: width, use_channel_groups: true }
        corrections:
          - { type: recentering }
          - { type: alignment, reference: TPC, harmonic: 2 }
          - type: twist_and_rescale
            method: { correlations: { b: TPC, c: V0C } }
      - name: V0C
        event_classes: default
        harmonics: [2]
        channels: { n_channels: 4 }
"#;

    #[test]
    fn test_yaml_builds_manager() {
        let config = ManagerConfig::from_yaml_str(YAML).unwrap();
        let v0 = &config.detectors[1].configurations[0];
        assert!(matches!(
            &v0.corrections[2],
            QnCorrectionSettings::TwistAndRescale(s)
                if s.method == TwistMethod::Correlations { b: "TPC".into(), c: "V0C".into() }
        ));
        let InputCorrectionSettings::GainEqualization(gain) = &v0.input_corrections[0];
        assert_eq!(gain.method, GainEqualizationMethod::Width);
        assert_eq!(gain.b, 0.1);

        let mut manager = config.build().unwrap();
        let set = manager.event_class_variable_set("default").unwrap();
        assert_eq!(set.shape(), vec![10, 14]);

        let tpc = manager.configuration("TPC").unwrap();
        assert_eq!(tpc.correction_keys(), vec!["DDDD", "FFFF"]);
        assert_eq!(tpc.cuts().len(), 2);
        assert_eq!(tpc.normalization(), Normalization::QOverM);
        let v0a = manager.configuration("V0A").unwrap();
        assert!(matches!(v0a.kind(), ConfigurationKind::Channels(_)));
        assert_eq!(v0a.correction_keys(), vec!["DDDD", "EEEE", "FFFF"]);
        assert_eq!(v0a.input_corrections().len(), 1);

        manager.initialize().unwrap();
    }

    #[test]
    fn test_normalization_names() {
        for (name, expected) in [
            ("none", Normalization::None),
            ("q_over_m", Normalization::QOverM),
            ("q_over_sqrt_m", Normalization::QOverSqrtM),
            ("q_over_length", Normalization::QOverLength),
        ] {
            let parsed: Normalization = serde_yaml_ng::from_str(name).unwrap();
            assert_eq!(parsed, expected);
        }
        assert!(serde_yaml_ng::from_str::<Normalization>("qover_m").is_err());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let bad = YAML.replace("normalization: q_over_m", "normalisation: q_over_m");
        assert!(matches!(ManagerConfig::from_yaml_str(&bad), Err(Error::Validation(_))));
    }

    #[test]
    fn test_invalid_cut_rejected_on_build() {
        let bad = YAML.replace("bit: 3", "bit: 40");
        let config = ManagerConfig::from_yaml_str(&bad).unwrap();
        assert!(matches!(config.build(), Err(Error::Structural(_))));
    }

    #[test]
    fn test_unknown_event_class_set() {
        let bad = YAML.replace(
            "event_classes: default\n        harmonics: [2]\n        channels: { n_channels: 4 }",
            "event_classes: other\n        harmonics: [2]\n        channels: { n_channels: 4 }",
        );
        let config = ManagerConfig::from_yaml_str(&bad).unwrap();
        assert!(matches!(config.build(), Err(Error::NotFound(_))));
    }
}
