//! `qncorr run`: drive a [`Manager`] over a JSON-lines event stream.

use anyhow::{Context, Result};
use qn_correct::{CalibrationStore, Manager, ManagerConfig, QnVectorRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub struct RunArgs {
    pub config: PathBuf,
    pub events: PathBuf,
    pub calibration: Option<PathBuf>,
    pub process: String,
    pub output: Option<PathBuf>,
    pub calibration_out: Option<PathBuf>,
    pub qa: Option<PathBuf>,
    pub stage: String,
}

/// One line of the event stream.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EventRecord {
    #[serde(default)]
    variables: BTreeMap<usize, f64>,
    #[serde(default)]
    data: Vec<DataRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DataRecord {
    detector: usize,
    phi: f64,
    #[serde(default = "unit_weight")]
    weight: f64,
    #[serde(default)]
    channel: Option<usize>,
}

fn unit_weight() -> f64 {
    1.0
}

/// One line of the output stream.
#[derive(Debug, Serialize)]
struct EventOutput {
    event: u64,
    qn: BTreeMap<String, Option<QnVectorRecord>>,
}

fn load_calibration(path: &Path) -> Result<CalibrationStore> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading calibration {}", path.display()))?;
    Ok(CalibrationStore::from_json_str(&text)
        .with_context(|| format!("parsing calibration {}", path.display()))?)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)?;
    Ok(())
}

fn feed_event(manager: &mut Manager, record: &EventRecord) -> Result<()> {
    for (&id, &value) in &record.variables {
        manager.variables_mut().set(id, value)?;
    }
    for d in &record.data {
        manager.add_data_vector(d.detector, d.phi, d.weight, d.channel)?;
    }
    manager.process_event()?;
    Ok(())
}

pub fn cmd_run(args: &RunArgs) -> Result<()> {
    let config = ManagerConfig::from_path(&args.config)
        .with_context(|| format!("loading configuration {}", args.config.display()))?;
    let mut manager = config.build()?;
    if let Some(path) = &args.calibration {
        manager.set_calibration_input(load_calibration(path)?);
    }
    manager.set_current_process(args.process.clone());
    manager.initialize()?;
    let names: Vec<String> = manager.configurations().map(|c| c.name().to_string()).collect();
    tracing::info!(configurations = names.len(), process = %args.process, "initialized");

    let reader = BufReader::new(
        File::open(&args.events).with_context(|| format!("opening {}", args.events.display()))?,
    );
    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => Box::new(std::io::stdout().lock()),
    };

    let mut n_events = 0u64;
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: EventRecord = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: bad event", args.events.display(), line_no + 1))?;
        feed_event(&mut manager, &record)
            .with_context(|| format!("{}:{}", args.events.display(), line_no + 1))?;

        let qn = names
            .iter()
            .map(|n| (n.clone(), manager.qn_vector(n, &args.stage).map(QnVectorRecord::from)))
            .collect();
        serde_json::to_writer(&mut out, &EventOutput { event: n_events, qn })?;
        writeln!(out)?;
        manager.clear_event();
        n_events += 1;
    }
    out.flush()?;
    tracing::info!(events = n_events, "processed");

    if let Some(path) = &args.calibration_out {
        let store = manager.calibration_output()?;
        write_json(path, &store)?;
        tracing::info!(path = %path.display(), "calibration written");
    }
    if let Some(path) = &args.qa {
        write_json(path, &manager.qa_report())?;
    }
    Ok(())
}
