//! Per-harmonic component profiles.
//!
//! [`ComponentsProfile`] tracks the X and Y components of a Q-vector and
//! [`CorrelationProfile`] the XX, XY, YX and YY products of two Q-vectors, both
//! per event-class cell and per declared harmonic. All components of one
//! harmonic share a single entries counter, which only advances once every
//! component has been filled for the current logical entry.

use crate::binned::Binned;
use crate::storage::{AccumulatorStorage, Component, ErrorMode, SlotScheme, StorageLayout};
use qn_core::{Error, EventClassVariableSet, HarmonicSet, Result};

/// Which components of each harmonic have been filled since the last entry.
#[derive(Debug, Clone)]
struct FillMask {
    pending: Vec<u8>,
    full: u8,
}

impl FillMask {
    fn new(n_harmonics: usize, n_components: usize) -> Self {
        Self { pending: vec![0; n_harmonics], full: ((1u16 << n_components) - 1) as u8 }
    }

    /// Mark `component` of harmonic slot `slot`; returns `true` when the set is
    /// complete (and clears it).
    fn mark(
        &mut self,
        name: &str,
        harmonic: u32,
        slot: usize,
        component: Component,
    ) -> Result<bool> {
        let bit = component.bit();
        let pending = &mut self.pending[slot];
        if *pending & bit != 0 {
            return Err(Error::Structural(format!(
                "component {component:?} of harmonic {harmonic} filled twice in accumulator \
                 '{name}' before the remaining components"
            )));
        }
        *pending |= bit;
        if *pending == self.full {
            *pending = 0;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Shared implementation of the two component shapes.
#[derive(Debug, Clone)]
struct ComponentAccumulator {
    inner: Binned,
    mask: FillMask,
}

impl ComponentAccumulator {
    fn new(
        name: String,
        event_classes: &EventClassVariableSet,
        harmonics: HarmonicSet,
        scheme: SlotScheme,
    ) -> Result<Self> {
        if harmonics.is_empty() {
            return Err(Error::Structural(format!("accumulator '{name}' declares no harmonics")));
        }
        let layout =
            StorageLayout { scheme, axes: event_classes.shape(), channels: None, harmonics };
        Ok(Self {
            inner: Binned::new(name, event_classes, layout),
            mask: FillMask::new(harmonics.len(), scheme.n_components()),
        })
    }

    fn harmonics(&self) -> HarmonicSet {
        self.inner.layout().harmonics
    }

    fn fill(
        &mut self,
        values: &[f64],
        harmonic: u32,
        component: Component,
        value: f64,
        weight: f64,
    ) -> Result<bool> {
        let slot = self.harmonics().position(harmonic).ok_or_else(|| {
            Error::Structural(format!(
                "harmonic {harmonic} not declared for accumulator '{}'",
                self.inner.name()
            ))
        })?;
        let cell = self.inner.cell(values);
        self.inner.storage_for_fill()?;
        let Some(bin) = cell else {
            return Ok(false);
        };
        let complete = self.mask.mark(self.inner.name(), harmonic, slot, component)?;
        let storage = self.inner.storage_for_fill()?;
        let entry = storage.entry_slot(bin, Some(harmonic))?;
        storage.add_value(entry, component, value * weight)?;
        if complete {
            storage.add_entry(entry);
        }
        Ok(true)
    }

    fn check_harmonic(&self, harmonic: u32) -> Result<()> {
        if !self.harmonics().contains(harmonic) {
            return Err(Error::Structural(format!(
                "harmonic {harmonic} not declared for accumulator '{}'",
                self.inner.name()
            )));
        }
        Ok(())
    }

    fn content(&self, bin: usize, harmonic: u32, component: Component) -> Result<f64> {
        self.check_harmonic(harmonic)?;
        Ok(self.inner.statistics(bin, Some(harmonic), component)?.0)
    }

    fn error(&self, bin: usize, harmonic: u32, component: Component) -> Result<f64> {
        self.check_harmonic(harmonic)?;
        Ok(self.inner.statistics(bin, Some(harmonic), component)?.1)
    }

    fn entries(&self, bin: usize, harmonic: u32) -> Result<u64> {
        self.check_harmonic(harmonic)?;
        self.inner.entries(bin, Some(harmonic))
    }

    fn is_validated(&self, bin: usize, harmonic: u32) -> Result<bool> {
        self.check_harmonic(harmonic)?;
        self.inner.is_validated(bin, Some(harmonic))
    }
}

/// X/Y means of a Q-vector per event-class cell and harmonic.
#[derive(Debug, Clone)]
pub struct ComponentsProfile {
    acc: ComponentAccumulator,
}

impl ComponentsProfile {
    /// Profile over the cells of `event_classes` for the given harmonics.
    pub fn new(
        name: impl Into<String>,
        event_classes: &EventClassVariableSet,
        harmonics: HarmonicSet,
    ) -> Result<Self> {
        let acc = ComponentAccumulator::new(
            name.into(),
            event_classes,
            harmonics,
            SlotScheme::Components,
        )?;
        Ok(Self { acc })
    }

    /// Set the error mode.
    pub fn with_error_mode(mut self, mode: ErrorMode) -> Self {
        self.acc.inner.set_error_mode(mode);
        self
    }

    /// Set the minimum entries for a bin to be validated.
    pub fn with_validation_threshold(mut self, threshold: u64) -> Self {
        self.acc.inner.set_validation_threshold(threshold);
        self
    }

    /// Accumulator name.
    pub fn name(&self) -> &str {
        self.acc.inner.name()
    }

    /// Declared harmonics.
    pub fn harmonics(&self) -> HarmonicSet {
        self.acc.harmonics()
    }

    /// Expected storage structure.
    pub fn layout(&self) -> &StorageLayout {
        self.acc.inner.layout()
    }

    /// Allocate zeroed storage. Must be called exactly once before filling.
    pub fn create_storage(&mut self) -> Result<()> {
        self.acc.inner.create_storage()
    }

    /// Bind to persisted storage for read-only use.
    pub fn attach(&mut self, storage: &AccumulatorStorage) -> Result<()> {
        self.acc.inner.attach(storage)
    }

    /// Whether the profile reads attached storage.
    pub fn is_attached(&self) -> bool {
        self.acc.inner.is_attached()
    }

    /// Bin of the current event.
    pub fn bin_index(&self, values: &[f64]) -> Option<usize> {
        self.acc.inner.cell(values)
    }

    /// Fill the X component of `harmonic`.
    pub fn fill_x(&mut self, values: &[f64], harmonic: u32, value: f64) -> Result<bool> {
        self.acc.fill(values, harmonic, Component::X, value, 1.0)
    }

    /// Fill the Y component of `harmonic`.
    pub fn fill_y(&mut self, values: &[f64], harmonic: u32, value: f64) -> Result<bool> {
        self.acc.fill(values, harmonic, Component::Y, value, 1.0)
    }

    /// Fill both components of `harmonic` as one entry.
    pub fn fill_xy(&mut self, values: &[f64], harmonic: u32, x: f64, y: f64) -> Result<bool> {
        let filled = self.acc.fill(values, harmonic, Component::X, x, 1.0)?;
        self.acc.fill(values, harmonic, Component::Y, y, 1.0)?;
        Ok(filled)
    }

    /// Fill one component with an explicit weight.
    pub fn fill_component(
        &mut self,
        values: &[f64],
        harmonic: u32,
        component: Component,
        value: f64,
        weight: f64,
    ) -> Result<bool> {
        self.acc.fill(values, harmonic, component, value, weight)
    }

    /// Mean X of the bin, 0 if not validated.
    pub fn x_content(&self, bin: usize, harmonic: u32) -> Result<f64> {
        self.acc.content(bin, harmonic, Component::X)
    }

    /// Mean Y of the bin, 0 if not validated.
    pub fn y_content(&self, bin: usize, harmonic: u32) -> Result<f64> {
        self.acc.content(bin, harmonic, Component::Y)
    }

    /// X error per the error mode, 0 if not validated.
    pub fn x_error(&self, bin: usize, harmonic: u32) -> Result<f64> {
        self.acc.error(bin, harmonic, Component::X)
    }

    /// Y error per the error mode, 0 if not validated.
    pub fn y_error(&self, bin: usize, harmonic: u32) -> Result<f64> {
        self.acc.error(bin, harmonic, Component::Y)
    }

    /// Entries of the bin for `harmonic`.
    pub fn entries(&self, bin: usize, harmonic: u32) -> Result<u64> {
        self.acc.entries(bin, harmonic)
    }

    /// Whether the bin has enough entries for `harmonic`.
    pub fn is_validated(&self, bin: usize, harmonic: u32) -> Result<bool> {
        self.acc.is_validated(bin, harmonic)
    }

    /// Backing storage, if created or attached.
    pub fn storage(&self) -> Option<&AccumulatorStorage> {
        self.acc.inner.storage()
    }

    /// Give up the backing storage.
    pub fn take_storage(&mut self) -> Option<AccumulatorStorage> {
        self.acc.inner.take_storage()
    }
}

/// Means of the XX, XY, YX, YY products of two Q-vectors per cell and harmonic.
#[derive(Debug, Clone)]
pub struct CorrelationProfile {
    acc: ComponentAccumulator,
}

impl CorrelationProfile {
    /// Profile over the cells of `event_classes` for the given harmonics.
    pub fn new(
        name: impl Into<String>,
        event_classes: &EventClassVariableSet,
        harmonics: HarmonicSet,
    ) -> Result<Self> {
        let acc = ComponentAccumulator::new(
            name.into(),
            event_classes,
            harmonics,
            SlotScheme::CorrelationComponents,
        )?;
        Ok(Self { acc })
    }

    /// Set the error mode.
    pub fn with_error_mode(mut self, mode: ErrorMode) -> Self {
        self.acc.inner.set_error_mode(mode);
        self
    }

    /// Set the minimum entries for a bin to be validated.
    pub fn with_validation_threshold(mut self, threshold: u64) -> Self {
        self.acc.inner.set_validation_threshold(threshold);
        self
    }

    /// Accumulator name.
    pub fn name(&self) -> &str {
        self.acc.inner.name()
    }

    /// Declared harmonics.
    pub fn harmonics(&self) -> HarmonicSet {
        self.acc.harmonics()
    }

    /// Expected storage structure.
    pub fn layout(&self) -> &StorageLayout {
        self.acc.inner.layout()
    }

    /// Allocate zeroed storage. Must be called exactly once before filling.
    pub fn create_storage(&mut self) -> Result<()> {
        self.acc.inner.create_storage()
    }

    /// Bind to persisted storage for read-only use.
    pub fn attach(&mut self, storage: &AccumulatorStorage) -> Result<()> {
        self.acc.inner.attach(storage)
    }

    /// Bin of the current event.
    pub fn bin_index(&self, values: &[f64]) -> Option<usize> {
        self.acc.inner.cell(values)
    }

    /// Fill one product component.
    pub fn fill_component(
        &mut self,
        values: &[f64],
        harmonic: u32,
        component: Component,
        value: f64,
    ) -> Result<bool> {
        self.acc.fill(values, harmonic, component, value, 1.0)
    }

    /// Fill all four products of `(xa, ya)` and `(xb, yb)` as one entry.
    pub fn fill_pair(
        &mut self,
        values: &[f64],
        harmonic: u32,
        a: (f64, f64),
        b: (f64, f64),
    ) -> Result<bool> {
        let filled = self.acc.fill(values, harmonic, Component::XX, a.0 * b.0, 1.0)?;
        self.acc.fill(values, harmonic, Component::XY, a.0 * b.1, 1.0)?;
        self.acc.fill(values, harmonic, Component::YX, a.1 * b.0, 1.0)?;
        self.acc.fill(values, harmonic, Component::YY, a.1 * b.1, 1.0)?;
        Ok(filled)
    }

    /// Mean of one product, 0 if not validated.
    pub fn content(&self, bin: usize, harmonic: u32, component: Component) -> Result<f64> {
        self.acc.content(bin, harmonic, component)
    }

    /// Error of one product per the error mode, 0 if not validated.
    pub fn error(&self, bin: usize, harmonic: u32, component: Component) -> Result<f64> {
        self.acc.error(bin, harmonic, component)
    }

    /// `⟨Xa·Xb⟩`
    pub fn xx_content(&self, bin: usize, harmonic: u32) -> Result<f64> {
        self.content(bin, harmonic, Component::XX)
    }

    /// `⟨Xa·Yb⟩`
    pub fn xy_content(&self, bin: usize, harmonic: u32) -> Result<f64> {
        self.content(bin, harmonic, Component::XY)
    }

    /// `⟨Ya·Xb⟩`
    pub fn yx_content(&self, bin: usize, harmonic: u32) -> Result<f64> {
        self.content(bin, harmonic, Component::YX)
    }

    /// `⟨Ya·Yb⟩`
    pub fn yy_content(&self, bin: usize, harmonic: u32) -> Result<f64> {
        self.content(bin, harmonic, Component::YY)
    }

    /// Entries of the bin for `harmonic`.
    pub fn entries(&self, bin: usize, harmonic: u32) -> Result<u64> {
        self.acc.entries(bin, harmonic)
    }

    /// Whether the bin has enough entries for `harmonic`.
    pub fn is_validated(&self, bin: usize, harmonic: u32) -> Result<bool> {
        self.acc.is_validated(bin, harmonic)
    }

    /// Backing storage, if created or attached.
    pub fn storage(&self) -> Option<&AccumulatorStorage> {
        self.acc.inner.storage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use qn_core::EventClassVariable;

    fn vertex() -> EventClassVariableSet {
        EventClassVariableSet::with_variables(
            "vtx",
            vec![EventClassVariable::uniform(3, "vz", 2, -10.0, 10.0).unwrap()],
        )
    }

    fn values(vz: f64) -> Vec<f64> {
        let mut v = vec![0.0; 4];
        v[3] = vz;
        v
    }

    #[test]
    fn test_x_then_y_counts_one_entry() {
        let mut p = ComponentsProfile::new("rec", &vertex(), HarmonicSet::new(&[2]).unwrap())
            .unwrap();
        p.create_storage().unwrap();
        let xs = [0.1, 0.3, -0.2, 0.6, 0.2];
        let ys = [0.0, -0.1, 0.4, 0.2, 0.5];
        let ev = values(5.0);
        for (x, y) in xs.iter().zip(&ys) {
            p.fill_x(&ev, 2, *x).unwrap();
            p.fill_y(&ev, 2, *y).unwrap();
        }
        let bin = p.bin_index(&ev).unwrap();
        assert_eq!(p.entries(bin, 2).unwrap(), 5);
        assert_abs_diff_eq!(p.x_content(bin, 2).unwrap(), 0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(p.y_content(bin, 2).unwrap(), 0.2, epsilon = 1e-12);
    }

    #[test]
    fn test_double_fill_is_structural() {
        let mut p = ComponentsProfile::new("rec", &vertex(), HarmonicSet::new(&[2]).unwrap())
            .unwrap();
        p.create_storage().unwrap();
        let ev = values(1.0);
        p.fill_x(&ev, 2, 1.0).unwrap();
        assert!(matches!(p.fill_x(&ev, 2, 1.0), Err(Error::Structural(_))));
    }

    #[test]
    fn test_undeclared_harmonic() {
        let mut p = ComponentsProfile::new("rec", &vertex(), HarmonicSet::new(&[2]).unwrap())
            .unwrap();
        p.create_storage().unwrap();
        assert!(matches!(p.fill_x(&values(1.0), 3, 1.0), Err(Error::Structural(_))));
        assert!(p.x_content(0, 3).is_err());
    }

    #[test]
    fn test_not_validated_reads_zero() {
        let mut p = ComponentsProfile::new("rec", &vertex(), HarmonicSet::new(&[1]).unwrap())
            .unwrap()
            .with_validation_threshold(3);
        p.create_storage().unwrap();
        let ev = values(-5.0);
        p.fill_xy(&ev, 1, 0.5, 0.5).unwrap();
        p.fill_xy(&ev, 1, 0.5, 0.5).unwrap();
        assert!(!p.is_validated(0, 1).unwrap());
        assert_eq!(p.x_content(0, 1).unwrap(), 0.0);
        assert_eq!(p.x_error(0, 1).unwrap(), 0.0);
        p.fill_xy(&ev, 1, 0.5, 0.5).unwrap();
        assert_abs_diff_eq!(p.x_content(0, 1).unwrap(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_correlation_pair() {
        let mut p =
            CorrelationProfile::new("corr", &vertex(), HarmonicSet::new(&[2]).unwrap()).unwrap();
        p.create_storage().unwrap();
        let ev = values(2.0);
        p.fill_pair(&ev, 2, (1.0, 2.0), (3.0, 4.0)).unwrap();
        p.fill_pair(&ev, 2, (1.0, 2.0), (3.0, 4.0)).unwrap();
        let bin = p.bin_index(&ev).unwrap();
        assert_eq!(p.entries(bin, 2).unwrap(), 2);
        assert_abs_diff_eq!(p.xx_content(bin, 2).unwrap(), 3.0);
        assert_abs_diff_eq!(p.xy_content(bin, 2).unwrap(), 4.0);
        assert_abs_diff_eq!(p.yx_content(bin, 2).unwrap(), 6.0);
        assert_abs_diff_eq!(p.yy_content(bin, 2).unwrap(), 8.0);
    }
}
