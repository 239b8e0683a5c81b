//! State shared by every accumulator shape: naming, event-class binning,
//! validation threshold, error mode and the create/attach lifecycle.

use crate::storage::{AccumulatorStorage, Component, ErrorMode, StorageLayout};
use qn_core::{DEFAULT_VALIDATION_THRESHOLD, Error, EventClassVariableSet, Result};

#[derive(Debug, Clone)]
pub(crate) struct Binned {
    name: String,
    event_classes: EventClassVariableSet,
    layout: StorageLayout,
    error_mode: ErrorMode,
    validation_threshold: u64,
    storage: Option<AccumulatorStorage>,
    attached: bool,
}

impl Binned {
    pub(crate) fn new(
        name: String,
        event_classes: &EventClassVariableSet,
        layout: StorageLayout,
    ) -> Self {
        Self {
            name,
            event_classes: event_classes.clone(),
            layout,
            error_mode: ErrorMode::Mean,
            validation_threshold: DEFAULT_VALIDATION_THRESHOLD,
            storage: None,
            attached: false,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub(crate) fn error_mode(&self) -> ErrorMode {
        self.error_mode
    }

    pub(crate) fn validation_threshold(&self) -> u64 {
        self.validation_threshold
    }

    pub(crate) fn set_error_mode(&mut self, mode: ErrorMode) {
        self.error_mode = mode;
    }

    pub(crate) fn set_validation_threshold(&mut self, threshold: u64) {
        self.validation_threshold = threshold;
    }

    pub(crate) fn create_storage(&mut self) -> Result<()> {
        if self.storage.is_some() {
            return Err(Error::Structural(format!(
                "storage of accumulator '{}' already created",
                self.name
            )));
        }
        self.storage =
            Some(AccumulatorStorage::new(self.name.clone(), self.layout.clone(), self.error_mode)?);
        Ok(())
    }

    /// Bind to previously persisted storage for read-only use.
    pub(crate) fn attach(&mut self, storage: &AccumulatorStorage) -> Result<()> {
        if self.storage.is_some() && !self.attached {
            return Err(Error::Structural(format!(
                "accumulator '{}' owns freshly created storage and cannot attach '{}'",
                self.name,
                storage.name()
            )));
        }
        storage.check_layout(&self.layout)?;
        self.storage = Some(storage.clone());
        self.attached = true;
        log::debug!("accumulator '{}' attached to stored '{}'", self.name, storage.name());
        Ok(())
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.attached
    }

    pub(crate) fn storage(&self) -> Option<&AccumulatorStorage> {
        self.storage.as_ref()
    }

    pub(crate) fn take_storage(&mut self) -> Option<AccumulatorStorage> {
        self.attached = false;
        self.storage.take()
    }

    pub(crate) fn storage_for_fill(&mut self) -> Result<&mut AccumulatorStorage> {
        if self.attached {
            return Err(Error::Structural(format!(
                "accumulator '{}' is attached read-only and cannot be filled",
                self.name
            )));
        }
        let name = &self.name;
        self.storage.as_mut().ok_or_else(|| {
            Error::Structural(format!("accumulator '{name}' filled before its storage was created"))
        })
    }

    pub(crate) fn cell(&self, values: &[f64]) -> Option<usize> {
        self.event_classes.cell_index(values)
    }

    pub(crate) fn entries(&self, bin: usize, harmonic: Option<u32>) -> Result<u64> {
        match &self.storage {
            Some(s) => Ok(s.entries(s.entry_slot(bin, harmonic)?)),
            None => Ok(0),
        }
    }

    pub(crate) fn statistics(
        &self,
        bin: usize,
        harmonic: Option<u32>,
        component: Component,
    ) -> Result<(f64, f64)> {
        match &self.storage {
            Some(s) => {
                let slot = s.entry_slot(bin, harmonic)?;
                s.statistics(slot, component, self.validation_threshold, self.error_mode)
            }
            None => Ok((0.0, 0.0)),
        }
    }

    pub(crate) fn is_validated(&self, bin: usize, harmonic: Option<u32>) -> Result<bool> {
        let n = self.entries(bin, harmonic)?;
        Ok(n > 0 && n >= self.validation_threshold)
    }
}
