//! Persistable backing storage shared by every accumulator shape.
//!
//! Storage is a flat set of `(sum, sum of squares, entries)` arrays. The
//! addressable bin is `cell * n_channels + channel` (or just `cell` when there
//! is no channel axis); component accumulators add one entry slot per declared
//! harmonic and one value slot per component inside each entry slot.

use qn_core::{Error, HarmonicSet, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How the error of a bin is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMode {
    /// Standard error of the mean: `sqrt(|σ²|) / sqrt(n)`.
    #[default]
    Mean,
    /// Standard deviation: `sqrt(|σ²|)`.
    Spread,
}

/// Component slots tracked per bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotScheme {
    /// A single value per bin.
    Plain,
    /// X and Y per harmonic.
    Components,
    /// XX, XY, YX and YY per harmonic.
    CorrelationComponents,
}

impl SlotScheme {
    /// Number of value slots per entry slot.
    pub fn n_components(&self) -> usize {
        match self {
            SlotScheme::Plain => 1,
            SlotScheme::Components => 2,
            SlotScheme::CorrelationComponents => 4,
        }
    }
}

/// A single value slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    /// The value of a plain profile.
    Value,
    /// Q-vector X component.
    X,
    /// Q-vector Y component.
    Y,
    /// `Xa·Xb`
    XX,
    /// `Xa·Yb`
    XY,
    /// `Ya·Xb`
    YX,
    /// `Ya·Yb`
    YY,
}

impl Component {
    /// Scheme this component belongs to.
    pub fn scheme(&self) -> SlotScheme {
        match self {
            Component::Value => SlotScheme::Plain,
            Component::X | Component::Y => SlotScheme::Components,
            _ => SlotScheme::CorrelationComponents,
        }
    }

    /// Index inside the scheme.
    pub fn index(&self) -> usize {
        match self {
            Component::Value | Component::X | Component::XX => 0,
            Component::Y | Component::XY => 1,
            Component::YX => 2,
            Component::YY => 3,
        }
    }

    /// Bit used in fill masks.
    pub(crate) fn bit(&self) -> u8 {
        1 << self.index()
    }
}

/// Structural description of a storage, compared on attach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLayout {
    /// Slot scheme.
    pub scheme: SlotScheme,
    /// Number of bins on each event-class axis.
    pub axes: Vec<usize>,
    /// Size of the channel (or group) axis, if any.
    pub channels: Option<usize>,
    /// Declared harmonics. Empty for [`SlotScheme::Plain`].
    pub harmonics: HarmonicSet,
}

impl StorageLayout {
    /// Number of event-class cells.
    pub fn n_cells(&self) -> usize {
        self.axes.iter().product()
    }

    /// Number of addressable bins (cells × channels).
    pub fn n_bins(&self) -> usize {
        self.n_cells() * self.channels.unwrap_or(1)
    }

    fn n_harmonic_slots(&self) -> usize {
        match self.scheme {
            SlotScheme::Plain => 1,
            _ => self.harmonics.len(),
        }
    }

    fn n_entry_slots(&self) -> usize {
        self.n_bins() * self.n_harmonic_slots()
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.axes.contains(&0) {
            return Err(Error::Structural(format!("accumulator '{name}' has an empty axis")));
        }
        if self.channels == Some(0) {
            return Err(Error::Structural(format!(
                "accumulator '{name}' has an empty channel axis"
            )));
        }
        match (self.scheme, self.harmonics.is_empty()) {
            (SlotScheme::Plain, false) => Err(Error::Structural(format!(
                "plain accumulator '{name}' cannot declare harmonics"
            ))),
            (SlotScheme::Components | SlotScheme::CorrelationComponents, true) => Err(
                Error::Structural(format!("component accumulator '{name}' declares no harmonics")),
            ),
            _ => Ok(()),
        }
    }
}

/// Backing storage of one accumulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccumulatorStorage {
    name: String,
    layout: StorageLayout,
    error_mode: ErrorMode,
    sum: Vec<f64>,
    sum2: Vec<f64>,
    entries: Vec<u64>,
}

impl AccumulatorStorage {
    /// Allocate zeroed storage.
    pub fn new(
        name: impl Into<String>,
        layout: StorageLayout,
        error_mode: ErrorMode,
    ) -> Result<Self> {
        let name = name.into();
        layout.validate(&name)?;
        let n_entries = layout.n_entry_slots();
        let n_values = n_entries * layout.scheme.n_components();
        Ok(Self {
            name,
            layout,
            error_mode,
            sum: vec![0.0; n_values],
            sum2: vec![0.0; n_values],
            entries: vec![0; n_entries],
        })
    }

    /// Accumulator name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Structural description.
    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Error mode recorded when the storage was created.
    pub fn error_mode(&self) -> ErrorMode {
        self.error_mode
    }

    /// Sum of entries over all slots.
    pub fn total_entries(&self) -> u64 {
        self.entries.iter().sum()
    }

    /// Fail unless this storage has exactly the `expected` structure.
    pub fn check_layout(&self, expected: &StorageLayout) -> Result<()> {
        if &self.layout != expected {
            return Err(Error::Structural(format!(
                "accumulator '{}' does not match the expected structure: stored {:?}, expected {:?}",
                self.name, self.layout, expected
            )));
        }
        let n_entries = expected.n_entry_slots();
        let n_values = n_entries * expected.scheme.n_components();
        if self.entries.len() != n_entries
            || self.sum.len() != n_values
            || self.sum2.len() != n_values
        {
            return Err(Error::Structural(format!(
                "accumulator '{}' is corrupt: array sizes do not match its layout",
                self.name
            )));
        }
        Ok(())
    }

    /// Entry slot of `bin` (and `harmonic` for component schemes).
    pub fn entry_slot(&self, bin: usize, harmonic: Option<u32>) -> Result<usize> {
        if bin >= self.layout.n_bins() {
            return Err(Error::Validation(format!(
                "bin {bin} outside accumulator '{}' ({} bins)",
                self.name,
                self.layout.n_bins()
            )));
        }
        match (self.layout.scheme, harmonic) {
            (SlotScheme::Plain, None) => Ok(bin),
            (SlotScheme::Plain, Some(h)) => Err(Error::Structural(format!(
                "plain accumulator '{}' has no harmonic {h}",
                self.name
            ))),
            (_, Some(h)) => {
                let pos = self.layout.harmonics.position(h).ok_or_else(|| {
                    Error::Structural(format!(
                        "harmonic {h} not declared for accumulator '{}' (declared {:?})",
                        self.name,
                        Vec::<u32>::from(self.layout.harmonics)
                    ))
                })?;
                Ok(bin * self.layout.harmonics.len() + pos)
            }
            (_, None) => Err(Error::Structural(format!(
                "component accumulator '{}' needs a harmonic",
                self.name
            ))),
        }
    }

    fn value_slot(&self, entry_slot: usize, component: Component) -> Result<usize> {
        if component.scheme() != self.layout.scheme {
            return Err(Error::Structural(format!(
                "component {component:?} does not exist in accumulator '{}' ({:?})",
                self.name, self.layout.scheme
            )));
        }
        Ok(entry_slot * self.layout.scheme.n_components() + component.index())
    }

    /// Accumulate `value` into one component of an entry slot.
    pub fn add_value(&mut self, entry_slot: usize, component: Component, value: f64) -> Result<()> {
        let idx = self.value_slot(entry_slot, component)?;
        self.sum[idx] += value;
        self.sum2[idx] += value * value;
        Ok(())
    }

    /// Count one logical entry in an entry slot.
    pub fn add_entry(&mut self, entry_slot: usize) {
        self.entries[entry_slot] += 1;
    }

    /// Add sums and entries of `other`'s slot into `entry_slot`. Both
    /// storages must use the same slot scheme.
    pub(crate) fn add_slot(
        &mut self,
        entry_slot: usize,
        other: &AccumulatorStorage,
        other_slot: usize,
    ) -> Result<()> {
        if other.layout.scheme != self.layout.scheme {
            return Err(Error::Structural(format!(
                "cannot add slots of '{}' ({:?}) into '{}' ({:?})",
                other.name, other.layout.scheme, self.name, self.layout.scheme
            )));
        }
        let n = self.layout.scheme.n_components();
        if entry_slot >= self.entries.len() || other_slot >= other.entries.len() {
            return Err(Error::Validation(format!(
                "slot out of range adding '{}' into '{}'",
                other.name, self.name
            )));
        }
        for k in 0..n {
            self.sum[entry_slot * n + k] += other.sum[other_slot * n + k];
            self.sum2[entry_slot * n + k] += other.sum2[other_slot * n + k];
        }
        self.entries[entry_slot] += other.entries[other_slot];
        Ok(())
    }

    /// Entries recorded in an entry slot.
    pub fn entries(&self, entry_slot: usize) -> u64 {
        self.entries.get(entry_slot).copied().unwrap_or(0)
    }

    /// `(content, error)` of one component, zero unless the slot has at least
    /// `threshold` entries.
    pub fn statistics(
        &self,
        entry_slot: usize,
        component: Component,
        threshold: u64,
        mode: ErrorMode,
    ) -> Result<(f64, f64)> {
        let idx = self.value_slot(entry_slot, component)?;
        let n = self.entries(entry_slot);
        if n == 0 || n < threshold {
            return Ok((0.0, 0.0));
        }
        let n = n as f64;
        let mean = self.sum[idx] / n;
        let variance = self.sum2[idx] / n - mean * mean;
        let spread = variance.abs().sqrt();
        let error = match mode {
            ErrorMode::Mean => spread / n.sqrt(),
            ErrorMode::Spread => spread,
        };
        Ok((mean, error))
    }

    /// Add another storage of identical structure.
    pub fn merge(&mut self, other: &AccumulatorStorage) -> Result<()> {
        other.check_layout(&self.layout)?;
        for (a, b) in self.sum.iter_mut().zip(&other.sum) {
            *a += b;
        }
        for (a, b) in self.sum2.iter_mut().zip(&other.sum2) {
            *a += b;
        }
        for (a, b) in self.entries.iter_mut().zip(&other.entries) {
            *a += b;
        }
        Ok(())
    }
}

/// Named collection of accumulator storages, the unit exchanged with the
/// persistence collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccumulatorList {
    items: BTreeMap<String, AccumulatorStorage>,
}

impl AccumulatorList {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a storage under its own name, returning the one it replaces.
    pub fn insert(&mut self, storage: AccumulatorStorage) -> Option<AccumulatorStorage> {
        self.items.insert(storage.name().to_string(), storage)
    }

    /// Find a storage by name.
    pub fn get(&self, name: &str) -> Option<&AccumulatorStorage> {
        self.items.get(name)
    }

    /// Whether a storage with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.items.contains_key(name)
    }

    /// Storages in name order.
    pub fn iter(&self) -> impl Iterator<Item = &AccumulatorStorage> {
        self.items.values()
    }

    /// Number of storages.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Sum `other` into this list: storages with the same name are merged,
    /// new names are copied.
    pub fn merge(&mut self, other: &AccumulatorList) -> Result<()> {
        for storage in other.iter() {
            match self.items.get_mut(storage.name()) {
                Some(existing) => existing.merge(storage)?,
                None => {
                    self.items.insert(storage.name().to_string(), storage.clone());
                }
            }
        }
        Ok(())
    }
}

impl FromIterator<AccumulatorStorage> for AccumulatorList {
    fn from_iter<I: IntoIterator<Item = AccumulatorStorage>>(iter: I) -> Self {
        let mut list = AccumulatorList::new();
        for storage in iter {
            list.insert(storage);
        }
        list
    }
}
