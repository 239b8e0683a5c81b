//! Event-class binning axes.
//!
//! An [`EventClassVariable`] is one axis: an external variable id plus a strictly
//! increasing list of bin edges. An [`EventClassVariableSet`] is the ordered list
//! of axes a calibration accumulator is binned in; its cells are linearised in
//! row-major order (first axis slowest).

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// One binning axis over an external per-event variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventClassVariable {
    id: usize,
    label: String,
    edges: Vec<f64>,
}

impl EventClassVariable {
    /// Axis with explicit bin edges (length = n_bins + 1, strictly increasing).
    pub fn from_edges(id: usize, label: impl Into<String>, edges: Vec<f64>) -> Result<Self> {
        let label = label.into();
        if edges.len() < 2 {
            return Err(Error::Validation(format!(
                "event class variable '{label}' needs at least two bin edges, got {}",
                edges.len()
            )));
        }
        if edges.iter().any(|e| !e.is_finite()) {
            return Err(Error::Validation(format!(
                "event class variable '{label}' has non-finite bin edges"
            )));
        }
        if edges.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::Validation(format!(
                "bin edges of event class variable '{label}' must be strictly increasing"
            )));
        }
        Ok(Self { id, label, edges })
    }

    /// Axis with `n_bins` equal-width bins over `[min, max)`.
    pub fn uniform(
        id: usize,
        label: impl Into<String>,
        n_bins: usize,
        min: f64,
        max: f64,
    ) -> Result<Self> {
        let label = label.into();
        if n_bins == 0 || !(min < max) {
            return Err(Error::Validation(format!(
                "event class variable '{label}': expected n_bins > 0 and min < max, got \
                 n_bins={n_bins}, min={min}, max={max}"
            )));
        }
        let width = (max - min) / n_bins as f64;
        let mut edges: Vec<f64> = (0..n_bins).map(|i| min + i as f64 * width).collect();
        edges.push(max);
        Self::from_edges(id, label, edges)
    }

    /// Axis made of coarse sections, each split into equal fine bins.
    ///
    /// `sections` lists `(lower_edge, n_fine)` pairs. Consecutive lower edges
    /// delimit the sections and each section is split into the fine count of its
    /// lower pair. The last pair closes the axis: its edge is the upper limit and
    /// its fine count adds further subdivisions to the last section.
    pub fn from_sections(
        id: usize,
        label: impl Into<String>,
        sections: &[(f64, usize)],
    ) -> Result<Self> {
        let label = label.into();
        if sections.len() < 2 {
            return Err(Error::Validation(format!(
                "event class variable '{label}' needs at least two sections, got {}",
                sections.len()
            )));
        }
        let n_sections = sections.len() - 1;
        let closing = sections[n_sections].1;
        let mut edges = Vec::new();
        for (i, pair) in sections.windows(2).enumerate() {
            let (lo, n_fine) = pair[0];
            let hi = pair[1].0;
            let n_fine = if i + 1 == n_sections { n_fine + closing } else { n_fine };
            if n_fine == 0 {
                return Err(Error::Validation(format!(
                    "section [{lo}, {hi}) of event class variable '{label}' has no fine bins"
                )));
            }
            let width = (hi - lo) / n_fine as f64;
            edges.extend((0..n_fine).map(|j| lo + j as f64 * width));
        }
        edges.push(sections[n_sections].0);
        Self::from_edges(id, label, edges)
    }

    /// External variable id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Human readable label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Bin edges.
    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    /// Number of bins.
    pub fn n_bins(&self) -> usize {
        self.edges.len() - 1
    }

    /// Lower edge of the first bin.
    pub fn min(&self) -> f64 {
        self.edges[0]
    }

    /// Upper edge of the last bin.
    pub fn max(&self) -> f64 {
        self.edges[self.edges.len() - 1]
    }

    /// Bin containing `value`, half-open `[lo, hi)`. `None` outside the axis or for NaN.
    pub fn find_bin(&self, value: f64) -> Option<usize> {
        if !(value >= self.min() && value < self.max()) {
            return None;
        }
        let upper = self.edges.partition_point(|&e| e <= value);
        Some(upper - 1)
    }

    /// Centre of bin `bin`.
    pub fn bin_center(&self, bin: usize) -> Option<f64> {
        let lo = self.edges.get(bin)?;
        let hi = self.edges.get(bin + 1)?;
        Some(0.5 * (lo + hi))
    }
}

/// Ordered set of event-class axes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventClassVariableSet {
    name: String,
    variables: Vec<EventClassVariable>,
}

impl EventClassVariableSet {
    /// Empty set.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), variables: Vec::new() }
    }

    /// Set built from a list of axes.
    pub fn with_variables(name: impl Into<String>, variables: Vec<EventClassVariable>) -> Self {
        Self { name: name.into(), variables }
    }

    /// Append an axis.
    pub fn push(&mut self, variable: EventClassVariable) {
        self.variables.push(variable);
    }

    /// Set name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Axes in order.
    pub fn variables(&self) -> &[EventClassVariable] {
        &self.variables
    }

    /// Number of axes.
    pub fn len(&self) -> usize {
        self.variables.len()
    }

    /// Whether the set has no axes.
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Number of bins on each axis.
    pub fn shape(&self) -> Vec<usize> {
        self.variables.iter().map(|v| v.n_bins()).collect()
    }

    /// Total number of event-class cells. An empty set has a single cell.
    pub fn n_cells(&self) -> usize {
        self.variables.iter().map(|v| v.n_bins()).product()
    }

    /// Per-axis bin indices for the current event, or `None` if any value is
    /// outside its axis (or its variable id is not present in `values`).
    pub fn bin_coordinates(&self, values: &[f64]) -> Option<Vec<usize>> {
        self.variables.iter().map(|v| values.get(v.id()).and_then(|&x| v.find_bin(x))).collect()
    }

    /// Linear cell index for the current event.
    pub fn cell_index(&self, values: &[f64]) -> Option<usize> {
        let mut index = 0usize;
        for v in &self.variables {
            let bin = values.get(v.id()).and_then(|&x| v.find_bin(x))?;
            index = index * v.n_bins() + bin;
        }
        Some(index)
    }

    /// Linearise per-axis coordinates.
    pub fn linear_index(&self, coordinates: &[usize]) -> Option<usize> {
        if coordinates.len() != self.variables.len() {
            return None;
        }
        let mut index = 0usize;
        for (v, &c) in self.variables.iter().zip(coordinates) {
            if c >= v.n_bins() {
                return None;
            }
            index = index * v.n_bins() + c;
        }
        Some(index)
    }

    /// Per-axis coordinates of a linear cell index.
    pub fn coordinates(&self, mut cell: usize) -> Option<Vec<usize>> {
        if cell >= self.n_cells() {
            return None;
        }
        let mut coords = vec![0; self.variables.len()];
        for (slot, v) in coords.iter_mut().zip(&self.variables).rev() {
            *slot = cell % v.n_bins();
            cell /= v.n_bins();
        }
        Some(coords)
    }
}
