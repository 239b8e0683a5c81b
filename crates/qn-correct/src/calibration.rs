//! Calibration input/output context.
//!
//! Calibration accumulators are kept per analysis process: a
//! [`CalibrationStore`] maps a process label to the [`AccumulatorList`]
//! collected (or to be attached) for that process. The combined sum of every
//! process is kept under [`ALL_PROCESSES`] and serves as the fallback when the
//! current process has no accumulator of a given name.

use qn_core::{Error, Result};
use qn_hist::{AccumulatorList, AccumulatorStorage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label of the merged list over all processes.
pub const ALL_PROCESSES: &str = "all";

/// Process label → accumulator list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CalibrationStore {
    processes: BTreeMap<String, AccumulatorList>,
}

impl CalibrationStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the list of `process`, returning the previous one.
    pub fn insert(
        &mut self,
        process: impl Into<String>,
        list: AccumulatorList,
    ) -> Option<AccumulatorList> {
        self.processes.insert(process.into(), list)
    }

    /// List of `process`, if present.
    pub fn list(&self, process: &str) -> Option<&AccumulatorList> {
        self.processes.get(process)
    }

    /// Iterate over `(process, list)` in label order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AccumulatorList)> {
        self.processes.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of process lists (including [`ALL_PROCESSES`] if present).
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    /// Whether the store holds no list.
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Add `list` into the list of `process`, creating it if needed.
    pub fn merge_process(&mut self, process: &str, list: &AccumulatorList) -> Result<()> {
        match self.processes.get_mut(process) {
            Some(existing) => existing.merge(list),
            None => {
                self.processes.insert(process.to_string(), list.clone());
                Ok(())
            }
        }
    }

    /// Recompute the [`ALL_PROCESSES`] list as the sum of every other process.
    pub fn rebuild_merged(&mut self) -> Result<()> {
        let mut merged = AccumulatorList::new();
        for (label, list) in &self.processes {
            if label != ALL_PROCESSES {
                merged.merge(list)?;
            }
        }
        self.processes.insert(ALL_PROCESSES.to_string(), merged);
        Ok(())
    }

    /// Lookup context for `process`, falling back to [`ALL_PROCESSES`].
    pub fn input_for(&self, process: &str) -> CalibrationInput<'_> {
        let mut lists = Vec::with_capacity(2);
        if let Some(list) = self.processes.get(process) {
            lists.push(list);
        }
        if process != ALL_PROCESSES
            && let Some(list) = self.processes.get(ALL_PROCESSES)
        {
            lists.push(list);
        }
        CalibrationInput { lists }
    }

    /// Parse a store from JSON.
    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(Error::from)
    }

    /// Serialize the store to pretty JSON.
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(Error::from)
    }
}

/// Read-only accumulator lookup handed to correction steps at initialization.
#[derive(Debug, Clone, Default)]
pub struct CalibrationInput<'a> {
    lists: Vec<&'a AccumulatorList>,
}

impl<'a> CalibrationInput<'a> {
    /// Lookup over no list at all; every step stays calibrating.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Lookup over a single list.
    pub fn from_list(list: &'a AccumulatorList) -> Self {
        Self { lists: vec![list] }
    }

    /// First accumulator named `name` holding at least one entry, searching
    /// the process list before the merged one.
    pub fn find(&self, name: &str) -> Option<&'a AccumulatorStorage> {
        self.lists.iter().filter_map(|l| l.get(name)).find(|s| s.total_entries() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qn_core::HarmonicSet;
    use qn_hist::{ErrorMode, SlotScheme, StorageLayout};

    fn storage(name: &str, entries: usize) -> AccumulatorStorage {
        let layout = StorageLayout {
            scheme: SlotScheme::Plain,
            axes: vec![2],
            channels: None,
            harmonics: HarmonicSet::empty(),
        };
        let mut s = AccumulatorStorage::new(name, layout, ErrorMode::Mean).unwrap();
        for _ in 0..entries {
            s.add_value(0, qn_hist::Component::Value, 1.0).unwrap();
            s.add_entry(0);
        }
        s
    }

    #[test]
    fn test_lookup_falls_back_to_all() {
        let mut store = CalibrationStore::new();
        store.insert("run1", [storage("TPC_rec", 3)].into_iter().collect());
        store.insert("run2", [storage("TPC_rec", 5), storage("V0_rec", 1)].into_iter().collect());
        store.rebuild_merged().unwrap();

        let merged = store.list(ALL_PROCESSES).unwrap();
        assert_eq!(merged.get("TPC_rec").unwrap().total_entries(), 8);

        let input = store.input_for("run1");
        assert_eq!(input.find("TPC_rec").unwrap().total_entries(), 3);
        assert_eq!(input.find("V0_rec").unwrap().total_entries(), 1);
        assert!(input.find("FMD_rec").is_none());

        let unknown = store.input_for("run9");
        assert_eq!(unknown.find("TPC_rec").unwrap().total_entries(), 8);
    }

    #[test]
    fn test_empty_accumulator_is_not_input() {
        let mut store = CalibrationStore::new();
        store.insert("run1", [storage("TPC_rec", 0)].into_iter().collect());
        assert!(store.input_for("run1").find("TPC_rec").is_none());
        store.insert(ALL_PROCESSES, [storage("TPC_rec", 4)].into_iter().collect());
        assert_eq!(store.input_for("run1").find("TPC_rec").unwrap().total_entries(), 4);
    }

    #[test]
    fn test_merge_process_accumulates() {
        let mut store = CalibrationStore::new();
        let list: AccumulatorList = [storage("a", 2)].into_iter().collect();
        store.merge_process("p", &list).unwrap();
        store.merge_process("p", &list).unwrap();
        assert_eq!(store.list("p").unwrap().get("a").unwrap().total_entries(), 4);
    }

    #[test]
    fn test_store_survives_json() {
        let mut store = CalibrationStore::new();
        store.insert("p", [storage("a", 2)].into_iter().collect());
        let back = CalibrationStore::from_json_str(&store.to_json_string().unwrap()).unwrap();
        assert_eq!(back, store);
        assert!(CalibrationInput::empty().find("a").is_none());
    }
}
