//! `qncorr inspect`: summarize a calibration file.

use anyhow::{Context, Result};
use qn_correct::CalibrationStore;
use std::path::Path;

pub fn cmd_inspect(path: &Path) -> Result<()> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let store = CalibrationStore::from_json_str(&text)?;
    for (process, list) in store.iter() {
        println!("[{process}] {} accumulators", list.len());
        for s in list.iter() {
            let layout = s.layout();
            let harmonics: Vec<u32> = layout.harmonics.iter().collect();
            println!(
                "  {:<32} {:?} axes={:?} channels={} harmonics={:?} bins={} entries={}",
                s.name(),
                layout.scheme,
                layout.axes,
                layout.channels.map_or_else(|| "-".to_string(), |c| c.to_string()),
                harmonics,
                layout.n_bins(),
                s.total_entries()
            );
        }
    }
    Ok(())
}
