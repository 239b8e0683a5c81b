//! Per-event variable container.

use crate::{Error, Result};

/// Dense array of per-event values indexed by a stable external variable id.
///
/// The driver refreshes the bank once per event before any cut, binning or
/// fill call reads it. [`VariableBank::reset`] fills it with NaN so a variable
/// that was not refreshed never lands in a bin or passes a cut.
#[derive(Debug, Clone)]
pub struct VariableBank {
    values: Vec<f64>,
}

impl VariableBank {
    /// Create a bank holding `size` variables, all unset.
    pub fn new(size: usize) -> Self {
        Self { values: vec![f64::NAN; size] }
    }

    /// Number of variable slots.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the bank has no slots.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Set variable `id`.
    pub fn set(&mut self, id: usize, value: f64) -> Result<()> {
        let n = self.values.len();
        let slot = self.values.get_mut(id).ok_or_else(|| {
            Error::Validation(format!("variable id {id} outside the bank (size {n})"))
        })?;
        *slot = value;
        Ok(())
    }

    /// Read variable `id`.
    pub fn get(&self, id: usize) -> Result<f64> {
        self.values.get(id).copied().ok_or_else(|| {
            Error::Validation(format!(
                "variable id {id} outside the bank (size {})",
                self.values.len()
            ))
        })
    }

    /// All values, indexed by variable id.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Mark every variable as unset.
    pub fn reset(&mut self) {
        self.values.fill(f64::NAN);
    }
}
