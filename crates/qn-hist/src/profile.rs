//! Plain profiles: one value per event-class cell, optionally per channel.

use crate::binned::Binned;
use crate::storage::{AccumulatorStorage, Component, ErrorMode, SlotScheme, StorageLayout};
use qn_core::{Error, EventClassVariableSet, HarmonicSet, Result};

/// Mean of a single quantity per event-class cell.
#[derive(Debug, Clone)]
pub struct Profile {
    inner: Binned,
}

impl Profile {
    /// Profile over the cells of `event_classes`. Storage is not allocated yet.
    pub fn new(name: impl Into<String>, event_classes: &EventClassVariableSet) -> Self {
        let layout = StorageLayout {
            scheme: SlotScheme::Plain,
            axes: event_classes.shape(),
            channels: None,
            harmonics: HarmonicSet::empty(),
        };
        Self { inner: Binned::new(name.into(), event_classes, layout) }
    }

    /// Set the error mode.
    pub fn with_error_mode(mut self, mode: ErrorMode) -> Self {
        self.inner.set_error_mode(mode);
        self
    }

    /// Set the minimum entries for a bin to be validated.
    pub fn with_validation_threshold(mut self, threshold: u64) -> Self {
        self.inner.set_validation_threshold(threshold);
        self
    }

    /// Accumulator name.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Expected storage structure.
    pub fn layout(&self) -> &StorageLayout {
        self.inner.layout()
    }

    /// Allocate zeroed storage. Must be called exactly once before filling.
    pub fn create_storage(&mut self) -> Result<()> {
        self.inner.create_storage()
    }

    /// Bind to persisted storage for read-only use.
    pub fn attach(&mut self, storage: &AccumulatorStorage) -> Result<()> {
        self.inner.attach(storage)
    }

    /// Bin of the current event, if it falls inside every axis.
    pub fn bin_index(&self, values: &[f64]) -> Option<usize> {
        self.inner.cell(values)
    }

    /// Fill `value` with unit weight. Returns `false` if the event has no bin.
    pub fn fill(&mut self, values: &[f64], value: f64) -> Result<bool> {
        self.fill_weighted(values, value, 1.0)
    }

    /// Fill `value * weight`. Returns `false` if the event has no bin.
    pub fn fill_weighted(&mut self, values: &[f64], value: f64, weight: f64) -> Result<bool> {
        let cell = self.inner.cell(values);
        let storage = self.inner.storage_for_fill()?;
        let Some(bin) = cell else {
            return Ok(false);
        };
        storage.add_value(bin, Component::Value, value * weight)?;
        storage.add_entry(bin);
        Ok(true)
    }

    /// Mean of the bin, 0 if not validated.
    pub fn content(&self, bin: usize) -> f64 {
        self.inner.statistics(bin, None, Component::Value).map(|s| s.0).unwrap_or(0.0)
    }

    /// Error of the bin per the error mode, 0 if not validated.
    pub fn error(&self, bin: usize) -> f64 {
        self.inner.statistics(bin, None, Component::Value).map(|s| s.1).unwrap_or(0.0)
    }

    /// Entries of the bin.
    pub fn entries(&self, bin: usize) -> u64 {
        self.inner.entries(bin, None).unwrap_or(0)
    }

    /// Whether the bin has enough entries.
    pub fn is_validated(&self, bin: usize) -> bool {
        self.inner.is_validated(bin, None).unwrap_or(false)
    }

    /// Backing storage, if created or attached.
    pub fn storage(&self) -> Option<&AccumulatorStorage> {
        self.inner.storage()
    }
}

/// Maps raw channel numbers onto the compact axis of used channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    slots: Vec<Option<usize>>,
    n_used: usize,
}

impl ChannelMap {
    /// `n_channels` raw channels, with an optional used-channel mask.
    pub fn new(n_channels: usize, used: Option<&[bool]>) -> Result<Self> {
        if n_channels == 0 {
            return Err(Error::Structural("channel map needs at least one channel".into()));
        }
        if let Some(mask) = used
            && mask.len() != n_channels
        {
            return Err(Error::Structural(format!(
                "used-channel mask has {} entries, expected {n_channels}",
                mask.len()
            )));
        }
        let mut n_used = 0;
        let slots = (0..n_channels)
            .map(|ch| {
                if used.is_none_or(|m| m[ch]) {
                    n_used += 1;
                    Some(n_used - 1)
                } else {
                    None
                }
            })
            .collect();
        if n_used == 0 {
            return Err(Error::Structural("used-channel mask disables every channel".into()));
        }
        Ok(Self { slots, n_used })
    }

    /// Number of raw channels.
    pub fn n_channels(&self) -> usize {
        self.slots.len()
    }

    /// Number of used channels (size of the channel axis).
    pub fn n_used(&self) -> usize {
        self.n_used
    }

    /// Axis slot of a raw channel; `None` if unused or out of range.
    pub fn slot(&self, channel: usize) -> Option<usize> {
        self.slots.get(channel).copied().flatten()
    }

    /// Whether a raw channel is used.
    pub fn is_used(&self, channel: usize) -> bool {
        self.slot(channel).is_some()
    }
}

/// Plain profile with an extra channel axis.
#[derive(Debug, Clone)]
pub struct ChannelizedProfile {
    inner: Binned,
    channels: ChannelMap,
}

impl ChannelizedProfile {
    /// Profile over event-class cells × used channels.
    pub fn new(
        name: impl Into<String>,
        event_classes: &EventClassVariableSet,
        n_channels: usize,
        used: Option<&[bool]>,
    ) -> Result<Self> {
        let channels = ChannelMap::new(n_channels, used)?;
        let layout = StorageLayout {
            scheme: SlotScheme::Plain,
            axes: event_classes.shape(),
            channels: Some(channels.n_used()),
            harmonics: HarmonicSet::empty(),
        };
        Ok(Self { inner: Binned::new(name.into(), event_classes, layout), channels })
    }

    /// Set the error mode.
    pub fn with_error_mode(mut self, mode: ErrorMode) -> Self {
        self.inner.set_error_mode(mode);
        self
    }

    /// Set the minimum entries for a bin to be validated.
    pub fn with_validation_threshold(mut self, threshold: u64) -> Self {
        self.inner.set_validation_threshold(threshold);
        self
    }

    /// Accumulator name.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Expected storage structure.
    pub fn layout(&self) -> &StorageLayout {
        self.inner.layout()
    }

    /// Channel mapping.
    pub fn channels(&self) -> &ChannelMap {
        &self.channels
    }

    /// Allocate zeroed storage. Must be called exactly once before filling.
    pub fn create_storage(&mut self) -> Result<()> {
        self.inner.create_storage()
    }

    /// Bind to persisted storage for read-only use.
    pub fn attach(&mut self, storage: &AccumulatorStorage) -> Result<()> {
        self.inner.attach(storage)
    }

    /// Bin of the current event and raw channel.
    pub fn bin_index(&self, values: &[f64], channel: usize) -> Option<usize> {
        let slot = self.channels.slot(channel)?;
        Some(self.inner.cell(values)? * self.channels.n_used() + slot)
    }

    /// Fill `value` for a raw channel with unit weight.
    pub fn fill(&mut self, values: &[f64], channel: usize, value: f64) -> Result<bool> {
        self.fill_weighted(values, channel, value, 1.0)
    }

    /// Fill `value * weight` for a raw channel. Returns `false` if the event
    /// has no bin. Filling an unused or unknown channel is a structural error.
    pub fn fill_weighted(
        &mut self,
        values: &[f64],
        channel: usize,
        value: f64,
        weight: f64,
    ) -> Result<bool> {
        if !self.channels.is_used(channel) {
            return Err(Error::Structural(format!(
                "channel {channel} is not an active channel of accumulator '{}'",
                self.inner.name()
            )));
        }
        let bin = self.bin_index(values, channel);
        let storage = self.inner.storage_for_fill()?;
        let Some(bin) = bin else {
            return Ok(false);
        };
        storage.add_value(bin, Component::Value, value * weight)?;
        storage.add_entry(bin);
        Ok(true)
    }

    /// Mean of the bin, 0 if not validated.
    pub fn content(&self, bin: usize) -> f64 {
        self.inner.statistics(bin, None, Component::Value).map(|s| s.0).unwrap_or(0.0)
    }

    /// Error of the bin per the error mode, 0 if not validated.
    pub fn error(&self, bin: usize) -> f64 {
        self.inner.statistics(bin, None, Component::Value).map(|s| s.1).unwrap_or(0.0)
    }

    /// Entries of the bin.
    pub fn entries(&self, bin: usize) -> u64 {
        self.inner.entries(bin, None).unwrap_or(0)
    }

    /// Whether the bin has enough entries.
    pub fn is_validated(&self, bin: usize) -> bool {
        self.inner.is_validated(bin, None).unwrap_or(false)
    }

    /// Backing storage, if created or attached.
    pub fn storage(&self) -> Option<&AccumulatorStorage> {
        self.inner.storage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use qn_core::EventClassVariable;

    fn centrality() -> EventClassVariableSet {
        EventClassVariableSet::with_variables(
            "cent",
            vec![EventClassVariable::uniform(0, "centrality", 4, 0.0, 100.0).unwrap()],
        )
    }

    #[test]
    fn test_unit_fills_reproduce_value() {
        let mut p = Profile::new("p", &centrality());
        p.create_storage().unwrap();
        for _ in 0..10 {
            assert!(p.fill(&[30.0], 4.5).unwrap());
        }
        let bin = p.bin_index(&[30.0]).unwrap();
        assert_eq!(bin, 1);
        assert_eq!(p.entries(bin), 10);
        assert_abs_diff_eq!(p.content(bin), 4.5, epsilon = 1e-12);
        assert_abs_diff_eq!(p.error(bin), 0.0, epsilon = 1e-7);
    }

    #[test]
    fn test_weighted_fill_accumulates_product() {
        let mut p = Profile::new("p", &centrality()).with_error_mode(ErrorMode::Spread);
        p.create_storage().unwrap();
        p.fill_weighted(&[10.0], 1.0, 2.0).unwrap();
        p.fill_weighted(&[10.0], 3.0, 2.0).unwrap();
        assert_abs_diff_eq!(p.content(0), 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(p.error(0), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_out_of_range_event_dropped() {
        let mut p = Profile::new("p", &centrality());
        p.create_storage().unwrap();
        assert!(!p.fill(&[120.0], 1.0).unwrap());
        assert!(!p.fill(&[f64::NAN], 1.0).unwrap());
        assert_eq!(p.storage().unwrap().total_entries(), 0);
    }

    #[test]
    fn test_lifecycle_errors() {
        let mut p = Profile::new("p", &centrality());
        assert!(matches!(p.fill(&[10.0], 1.0), Err(Error::Structural(_))));
        p.create_storage().unwrap();
        assert!(p.create_storage().is_err());

        let stored = p.storage().unwrap().clone();
        let mut reader = Profile::new("p", &centrality());
        reader.attach(&stored).unwrap();
        assert!(matches!(reader.fill(&[10.0], 1.0), Err(Error::Structural(_))));
    }

    #[test]
    fn test_channel_map_and_bins() {
        let used = [true, false, true, true];
        let mut p = ChannelizedProfile::new("m", &centrality(), 4, Some(&used)).unwrap();
        assert_eq!(p.channels().n_used(), 3);
        p.create_storage().unwrap();
        assert_eq!(p.bin_index(&[60.0], 3), Some(2 * 3 + 2));
        assert_eq!(p.bin_index(&[60.0], 1), None);
        assert!(p.fill(&[60.0], 1, 1.0).is_err());
        p.fill(&[60.0], 3, 5.0).unwrap();
        p.fill(&[60.0], 3, 7.0).unwrap();
        assert_abs_diff_eq!(p.content(8), 6.0, epsilon = 1e-12);
    }

    #[test]
    fn test_attach_channel_mismatch() {
        let mut writer = ChannelizedProfile::new("m", &centrality(), 4, None).unwrap();
        writer.create_storage().unwrap();
        let stored = writer.storage().unwrap().clone();
        let mut reader = ChannelizedProfile::new("m", &centrality(), 8, None).unwrap();
        assert!(matches!(reader.attach(&stored), Err(Error::Structural(_))));
    }
}
