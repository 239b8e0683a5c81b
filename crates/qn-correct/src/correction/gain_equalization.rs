//! Gain equalization: normalize each channel's raw weight by its calibrated
//! response before the Q-vector is rebuilt.

use super::{
    SkipCounter, StepOutcome, StepSetup, StepState, default_validation_threshold, not_initialized,
};
use crate::calibration::CalibrationInput;
use crate::detector::{ChannelSetup, DataVector};
use qn_core::{Error, EventClassVariableSet, Result, SIGNIFICANCE_THRESHOLD};
use qn_hist::{AccumulatorStorage, ChannelGroups, ChannelizedIngress, ChannelizedProfile, ErrorMode};
use serde::{Deserialize, Serialize};

/// Chain key.
pub const GAIN_EQUALIZATION_KEY: &str = "CCCC";
/// Step name.
pub const GAIN_EQUALIZATION_NAME: &str = "GainEqualization";

/// Equalization method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GainEqualizationMethod {
    /// Leave the weight unchanged.
    None,
    /// `M' = (M / <M>) g`.
    #[default]
    Average,
    /// `M' = (A + B (M - <M>) / σ) g`.
    Width,
}

fn default_a() -> f64 {
    1.0
}

fn default_b() -> f64 {
    0.1
}

/// Gain equalization options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GainEqualizationSettings {
    /// Method.
    #[serde(default)]
    pub method: GainEqualizationMethod,
    /// Offset of the width method.
    #[serde(default = "default_a")]
    pub a: f64,
    /// Slope of the width method.
    #[serde(default = "default_b")]
    pub b: f64,
    /// Scale by the channel-group weight.
    #[serde(default)]
    pub use_channel_groups: bool,
    /// Minimum entries per channel bin.
    #[serde(default = "default_validation_threshold")]
    pub validation_threshold: u64,
    /// Keep collecting once calibration input is attached.
    #[serde(default)]
    pub collect_while_applying: bool,
}

impl Default for GainEqualizationSettings {
    fn default() -> Self {
        Self {
            method: GainEqualizationMethod::Average,
            a: default_a(),
            b: default_b(),
            use_channel_groups: false,
            validation_threshold: default_validation_threshold(),
            collect_while_applying: false,
        }
    }
}

/// Gain equalization step.
#[derive(Debug, Clone)]
pub struct GainEqualization {
    settings: GainEqualizationSettings,
    configuration: String,
    accumulator: String,
    event_classes: EventClassVariableSet,
    channels: ChannelSetup,
    state: StepState,
    output: Option<ChannelizedProfile>,
    input: Option<ChannelizedIngress>,
    qa: SkipCounter,
}

impl GainEqualization {
    /// Gain equalization of the channels described by `channels`.
    pub fn new(
        setup: &StepSetup<'_>,
        channels: &ChannelSetup,
        settings: GainEqualizationSettings,
    ) -> Result<Self> {
        if settings.use_channel_groups && channels.groups().is_none() {
            return Err(Error::Structural(format!(
                "gain equalization of '{}' uses channel groups but none are configured",
                setup.configuration
            )));
        }
        let n_used = (0..channels.n_channels()).filter(|&c| channels.is_used(c)).count();
        Ok(Self {
            settings,
            configuration: setup.configuration.to_string(),
            accumulator: setup.accumulator_name(GAIN_EQUALIZATION_NAME),
            event_classes: setup.event_classes.clone(),
            channels: channels.clone(),
            state: StepState::Calibrating,
            output: None,
            input: None,
            qa: SkipCounter::new(setup.event_classes.n_cells() * n_used),
        })
    }

    /// Step name.
    pub fn name(&self) -> &'static str {
        GAIN_EQUALIZATION_NAME
    }

    /// Current state.
    pub fn state(&self) -> StepState {
        self.state
    }

    /// Options.
    pub fn settings(&self) -> &GainEqualizationSettings {
        &self.settings
    }

    /// Name of the calibration accumulator.
    pub fn accumulator_name(&self) -> &str {
        &self.accumulator
    }

    /// Attach the previous period's channel responses.
    pub fn attach_input(&mut self, input: &CalibrationInput<'_>) -> Result<bool> {
        let Some(storage) = input.find(&self.accumulator) else {
            log::warn!(
                "{}: no calibration input '{}', collecting only",
                self.configuration,
                self.accumulator
            );
            return Ok(false);
        };
        let groups = self.channels.groups().map(|g| ChannelGroups::new(g.to_vec())).transpose()?;
        let mut ingress = ChannelizedIngress::new(
            &self.accumulator,
            &self.event_classes,
            self.channels.n_channels(),
            self.channels.used(),
            groups,
        )?
        .with_error_mode(ErrorMode::Spread)
        .with_validation_threshold(self.settings.validation_threshold);
        ingress.attach(storage)?;
        self.input = Some(ingress);
        self.state.advance(StepState::attached(self.settings.collect_while_applying));
        log::debug!(
            "{}: gain equalization attached '{}', now {:?}",
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
            let mut profile = ChannelizedProfile::new(
                &self.accumulator,
                &self.event_classes,
                self.channels.n_channels(),
                self.channels.used(),
            )?
            .with_error_mode(ErrorMode::Spread)
            .with_validation_threshold(self.settings.validation_threshold);
            profile.create_storage()?;
            self.output = Some(profile);
        }
        Ok(())
    }

    /// Collect the raw weights and/or rewrite the equalized weights.
    pub fn process(&mut self, variables: &[f64], data: &mut [DataVector]) -> Result<StepOutcome> {
        if self.state.collects() {
            let output = self
                .output
                .as_mut()
                .ok_or_else(|| not_initialized(GAIN_EQUALIZATION_NAME, &self.configuration))?;
            for d in data.iter() {
                output.fill(variables, channel_of(d, &self.configuration)?, d.weight())?;
            }
        }
        match self.state {
            StepState::Calibrating => Ok(StepOutcome::NotApplied),
            StepState::ApplyAndCollect | StepState::Applying => {
                for d in data.iter_mut() {
                    let channel = channel_of(d, &self.configuration)?;
                    let equalized = self.equalize(variables, channel, d.weight())?;
                    d.set_equalized_weight(equalized);
                }
                Ok(StepOutcome::Applied(Vec::new()))
            }
        }
    }

    fn equalize(&mut self, variables: &[f64], channel: usize, weight: f64) -> Result<f64> {
        if self.settings.method == GainEqualizationMethod::None {
            return Ok(weight);
        }
        let calibration = self
            .input
            .as_ref()
            .ok_or_else(|| not_initialized(GAIN_EQUALIZATION_NAME, &self.configuration))?;
        let Some(bin) = calibration.bin_index(variables, channel) else {
            self.qa.record_unbinned();
            return Ok(weight);
        };
        let mean = calibration.content(bin);
        if mean < SIGNIFICANCE_THRESHOLD {
            self.qa.record(bin);
            return Ok(0.0);
        }
        let group = self.group_weight(calibration, variables, channel);
        Ok(match self.settings.method {
            GainEqualizationMethod::None => weight,
            GainEqualizationMethod::Average => weight / mean * group,
            GainEqualizationMethod::Width => {
                let width = calibration.error(bin);
                if width < SIGNIFICANCE_THRESHOLD {
                    self.qa.record(bin);
                    return Ok(0.0);
                }
                (self.settings.a + self.settings.b * (weight - mean) / width) * group
            }
        })
    }

    fn group_weight(
        &self,
        calibration: &ChannelizedIngress,
        variables: &[f64],
        channel: usize,
    ) -> f64 {
        if !self.settings.use_channel_groups {
            return 1.0;
        }
        if let (Some(weights), Some(group)) =
            (self.channels.group_weights(), self.channels.group_of(channel))
        {
            return weights.get(group).copied().unwrap_or(1.0);
        }
        match calibration.group_bin_index(variables, channel) {
            Some(g) if calibration.is_group_validated(g) => calibration.group_content(g),
            _ => 1.0,
        }
    }

    /// Collected output accumulator, if any.
    pub fn calibration_output(&self) -> Vec<AccumulatorStorage> {
        self.output.as_ref().and_then(|p| p.storage()).cloned().into_iter().collect()
    }

    /// Skip counters, one bin per event class and used channel.
    pub fn qa(&self) -> &SkipCounter {
        &self.qa
    }
}

fn channel_of(d: &DataVector, configuration: &str) -> Result<usize> {
    d.channel().ok_or_else(|| {
        Error::Structural(format!(
            "data vector without channel in channels configuration '{configuration}'"
        ))
    })
}
