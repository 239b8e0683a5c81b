//! Read-only channelized profile with channel-group aggregation.
//!
//! Calibration input for per-channel corrections is attached once and then
//! only read. When channels are organised in groups, a coarser group-level
//! view is derived at attach time: for every event-class cell, the sums and
//! entries of all channels of a group are added together, and the group is
//! read like any other bin.

use crate::binned::Binned;
use crate::profile::ChannelMap;
use crate::storage::{AccumulatorStorage, Component, ErrorMode, SlotScheme, StorageLayout};
use qn_core::{Error, EventClassVariableSet, HarmonicSet, Result};

/// Channel → group assignment over the raw channel numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelGroups {
    group_of: Vec<usize>,
    n_groups: usize,
}

impl ChannelGroups {
    /// `group_of[channel]` is the group of each raw channel.
    pub fn new(group_of: Vec<usize>) -> Result<Self> {
        let n_groups = group_of.iter().max().map(|g| g + 1).ok_or_else(|| {
            Error::Structural("channel group assignment must cover at least one channel".into())
        })?;
        Ok(Self { group_of, n_groups })
    }

    /// Group of a raw channel.
    pub fn group(&self, channel: usize) -> Option<usize> {
        self.group_of.get(channel).copied()
    }

    /// Number of groups.
    pub fn n_groups(&self) -> usize {
        self.n_groups
    }

    /// Number of raw channels covered.
    pub fn n_channels(&self) -> usize {
        self.group_of.len()
    }
}

/// Attached per-channel calibration input, optionally aggregated per group.
#[derive(Debug, Clone)]
pub struct ChannelizedIngress {
    inner: Binned,
    channels: ChannelMap,
    groups: Option<ChannelGroups>,
    group_view: Option<AccumulatorStorage>,
}

impl ChannelizedIngress {
    /// Expect a channelized plain storage over `event_classes` × used channels.
    pub fn new(
        name: impl Into<String>,
        event_classes: &EventClassVariableSet,
        n_channels: usize,
        used: Option<&[bool]>,
        groups: Option<ChannelGroups>,
    ) -> Result<Self> {
        let name = name.into();
        let channels = ChannelMap::new(n_channels, used)?;
        if let Some(g) = &groups
            && g.n_channels() != n_channels
        {
            return Err(Error::Structural(format!(
                "accumulator '{name}': channel groups cover {} channels, expected {n_channels}",
                g.n_channels()
            )));
        }
        let layout = StorageLayout {
            scheme: SlotScheme::Plain,
            axes: event_classes.shape(),
            channels: Some(channels.n_used()),
            harmonics: HarmonicSet::empty(),
        };
        Ok(Self {
            inner: Binned::new(name, event_classes, layout),
            channels,
            groups,
            group_view: None,
        })
    }

    /// Set the error mode used when reading.
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

    /// Whether storage has been attached.
    pub fn is_attached(&self) -> bool {
        self.inner.is_attached()
    }

    /// Attach persisted storage and derive the group view.
    pub fn attach(&mut self, storage: &AccumulatorStorage) -> Result<()> {
        self.inner.attach(storage)?;
        self.group_view = self.build_group_view()?;
        Ok(())
    }

    fn build_group_view(&self) -> Result<Option<AccumulatorStorage>> {
        let (Some(groups), Some(stored)) = (&self.groups, self.inner.storage()) else {
            return Ok(None);
        };
        let layout = StorageLayout {
            channels: Some(groups.n_groups()),
            ..self.inner.layout().clone()
        };
        let name = format!("{}_groups", self.name());
        let mut view = AccumulatorStorage::new(name, layout, self.inner.error_mode())?;
        let n_groups = groups.n_groups();
        for cell in 0..self.inner.layout().n_cells() {
            for channel in 0..self.channels.n_channels() {
                let (Some(slot), Some(group)) = (self.channels.slot(channel), groups.group(channel))
                else {
                    continue;
                };
                let channel_bin = cell * self.channels.n_used() + slot;
                view.add_slot(cell * n_groups + group, stored, channel_bin)?;
            }
        }
        Ok(Some(view))
    }

    fn group_statistics(&self, group_bin: usize) -> (f64, f64) {
        self.group_view
            .as_ref()
            .and_then(|v| {
                v.statistics(
                    group_bin,
                    Component::Value,
                    self.inner.validation_threshold(),
                    self.inner.error_mode(),
                )
                .ok()
            })
            .unwrap_or((0.0, 0.0))
    }

    /// Channel mapping.
    pub fn channels(&self) -> &ChannelMap {
        &self.channels
    }

    /// Channel groups, if configured.
    pub fn groups(&self) -> Option<&ChannelGroups> {
        self.groups.as_ref()
    }

    /// Bin of the current event and raw channel.
    pub fn bin_index(&self, values: &[f64], channel: usize) -> Option<usize> {
        let slot = self.channels.slot(channel)?;
        Some(self.inner.cell(values)? * self.channels.n_used() + slot)
    }

    /// Group bin of the current event and raw channel.
    pub fn group_bin_index(&self, values: &[f64], channel: usize) -> Option<usize> {
        let groups = self.groups.as_ref()?;
        self.channels.slot(channel)?;
        let group = groups.group(channel)?;
        Some(self.inner.cell(values)? * groups.n_groups() + group)
    }

    /// Channel mean, 0 if not validated.
    pub fn content(&self, bin: usize) -> f64 {
        self.inner.statistics(bin, None, Component::Value).map(|s| s.0).unwrap_or(0.0)
    }

    /// Channel error per the error mode, 0 if not validated.
    pub fn error(&self, bin: usize) -> f64 {
        self.inner.statistics(bin, None, Component::Value).map(|s| s.1).unwrap_or(0.0)
    }

    /// Whether a channel bin has enough entries.
    pub fn is_validated(&self, bin: usize) -> bool {
        self.inner.is_validated(bin, None).unwrap_or(false)
    }

    /// Mean of the summed group histogram, 0 if not validated.
    pub fn group_content(&self, group_bin: usize) -> f64 {
        self.group_statistics(group_bin).0
    }

    /// Error of the summed group histogram per the error mode, 0 if not validated.
    pub fn group_error(&self, group_bin: usize) -> f64 {
        self.group_statistics(group_bin).1
    }

    /// Whether the summed group bin has enough entries.
    pub fn is_group_validated(&self, group_bin: usize) -> bool {
        let n = self.group_view.as_ref().map_or(0, |v| v.entries(group_bin));
        n > 0 && n >= self.inner.validation_threshold()
    }
}
