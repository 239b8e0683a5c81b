//! # qn-core
//!
//! Shared building blocks for Q-vector calibration:
//! - [`Error`]/[`Result`] used by every crate in the workspace
//! - [`HarmonicSet`], the bitmask of harmonics a Q-vector carries
//! - [`VariableBank`], the dense per-event variable container
//! - [`EventClassVariable`]/[`EventClassVariableSet`], the binning axes
//!   every calibration accumulator is built against
//! - [`Cut`]/[`CutSet`], selections over the per-event variables

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cuts;
pub mod error;
pub mod event_class;
pub mod harmonics;
pub mod variables;

pub use cuts::{Cut, CutKind, CutSet};
pub use error::{Error, Result};
pub use event_class::{EventClassVariable, EventClassVariableSet};
pub use harmonics::{HarmonicSet, MAX_HARMONIC};
pub use variables::VariableBank;

/// Below this magnitude a sum of weights, a mean or a width is treated as zero.
pub const SIGNIFICANCE_THRESHOLD: f64 = 1e-6;

/// Correction factors above this magnitude are considered meaningless.
pub const MEANINGLESS_THRESHOLD: f64 = 1e8;

/// Minimum number of entries a bin needs before its content is trusted.
pub const DEFAULT_VALIDATION_THRESHOLD: u64 = 2;
